use crate::context::Context;
use crate::error::ProvisionError;
use crate::setup::SetupStep;
use crate::setup::utils::{
	cfssl::{self, CaConfig, CfsslOutput, Identity},
	inventory::{NodeRole, PlannedNode},
	layout::write_atomic,
};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

pub struct Certificates;

impl Certificates {
	pub const NAME: &str = "certificates";
	/// Client identities that do not depend on any node address.
	const CLIENTS: [fn() -> Identity; 5] = [
		Identity::admin,
		Identity::controller_manager,
		Identity::kube_proxy,
		Identity::scheduler,
		Identity::service_account,
	];

	fn expected(ctx: &Context) -> Vec<String> {
		let mut names = vec![cfssl::CA.to_owned(), Identity::api_server(Vec::new()).name];
		names.extend(Certificates::CLIENTS.iter().map(|identity| identity().name));
		names.extend(ctx.inventory.topology().workers().iter().map(|node| node.name.clone()));
		names
	}

	/// Certificates and keys each node needs in its home directory.
	pub fn files_for(ctx: &Context, node: &PlannedNode) -> Vec<PathBuf> {
		let layout = &ctx.layout;
		match node.role {
			NodeRole::Controller => vec![
				layout.cert(cfssl::CA),
				layout.cert_key(cfssl::CA),
				layout.cert("kubernetes"),
				layout.cert_key("kubernetes"),
				layout.cert("service-account"),
				layout.cert_key("service-account"),
			],
			NodeRole::Worker => vec![
				layout.cert(cfssl::CA),
				layout.cert(&node.name),
				layout.cert_key(&node.name),
			],
		}
	}
}

async fn issue(ctx: &Context, identity: &Identity) -> Result<(), ProvisionError> {
	let cert = ctx.layout.cert(&identity.name);
	let key = ctx.layout.cert_key(&identity.name);
	if !ctx.force && cert.exists() && key.exists() {
		debug!("Certificate {} already exists.", cert.display());
		return Ok(());
	}
	let csr = identity.csr(&ctx.config.subject);
	let spec = if identity.name == cfssl::CA {
		cfssl::init_ca(&csr)?
	} else {
		cfssl::gencert(&ctx.layout, identity, &csr)?
	};
	let output = ctx.executor.execute(&spec).await?;
	CfsslOutput::parse(&output.stdout)?.write(&ctx.layout, &identity.name)?;
	info!("Issued certificate for {}.", identity.common_name);
	Ok(())
}

#[async_trait]
impl SetupStep for Certificates {
	fn name(&self) -> &'static str {
		Certificates::NAME
	}

	fn description(&self) -> &'static str {
		"issue the CA and every component certificate, then copy them to the nodes"
	}

	async fn check(&self, ctx: &Context) -> Result<bool, ProvisionError> {
		Ok(Certificates::expected(ctx).iter().all(|name| {
			ctx.layout.cert(name).exists() && ctx.layout.cert_key(name).exists()
		}))
	}

	async fn set(&self, ctx: &Context) -> Result<(), ProvisionError> {
		ctx.layout.ensure()?;
		let ca_config = CaConfig::new(&ctx.config.subject.expiry);
		write_atomic(
			&CaConfig::path(&ctx.layout),
			&serde_json::to_vec_pretty(&ca_config)?,
		)?;
		issue(ctx, &Identity::ca()).await?;
		for identity in Certificates::CLIENTS {
			issue(ctx, &identity()).await?;
		}
		for worker in ctx.inventory.workers().await? {
			let hostnames = vec![
				worker.name.clone(),
				worker.external_ip.to_string(),
				worker.internal_ip.to_string(),
			];
			issue(ctx, &Identity::worker(&worker.name, hostnames)).await?;
		}
		let service_ip = ctx.config.service_cidr()?.host(1).ok_or_else(|| {
			ProvisionError::Config(
				"service CIDR has no room for the API service address".to_owned(),
			)
		})?;
		let mut hostnames = vec![service_ip.to_string()];
		hostnames.extend(
			ctx.inventory
				.controllers()
				.await?
				.iter()
				.map(|node| node.internal_ip.to_string()),
		);
		hostnames.push(ctx.inventory.public_address().await?.to_string());
		hostnames.push("127.0.0.1".to_owned());
		hostnames.push("kubernetes.default".to_owned());
		issue(ctx, &Identity::api_server(hostnames)).await?;

		let nodes = ctx.inventory.topology().nodes().cloned().collect::<Vec<_>>();
		ctx.for_each(
			Certificates::NAME,
			nodes,
			|node| node.name.clone(),
			|node| async move {
				ctx.executor
					.upload(&node.name, &Certificates::files_for(ctx, &node))
					.await
			},
		)
		.await
	}
}
