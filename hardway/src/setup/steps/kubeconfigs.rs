use crate::context::Context;
use crate::error::ProvisionError;
use crate::exec::Target;
use crate::setup::SetupStep;
use crate::setup::utils::{
	cfssl,
	inventory::{NodeRole, PlannedNode},
	kctl::{self, KubeconfigSpec},
};
use async_trait::async_trait;
use std::{net::Ipv4Addr, path::PathBuf};
use tracing::{debug, info};

pub struct Kubeconfigs;

/// A kubeconfig to generate: file stem, certificate stem, user and endpoint.
struct Client {
	name: String,
	user: String,
	server: String,
}

impl Kubeconfigs {
	pub const NAME: &str = "kubeconfigs";
	const LOCAL: Ipv4Addr = Ipv4Addr::LOCALHOST;

	fn clients(ctx: &Context, public: Ipv4Addr) -> Vec<Client> {
		let client = |name: &str, user: &str, address: Ipv4Addr| Client {
			name: name.to_owned(),
			user: user.to_owned(),
			server: kctl::server(address),
		};
		let mut clients = ctx
			.inventory
			.topology()
			.workers()
			.iter()
			.map(|node| client(&node.name, &format!("system:node:{}", node.name), public))
			.collect::<Vec<_>>();
		clients.push(client("kube-proxy", "system:kube-proxy", public));
		clients.push(client(
			"kube-controller-manager",
			"system:kube-controller-manager",
			Kubeconfigs::LOCAL,
		));
		clients.push(client("kube-scheduler", "system:kube-scheduler", Kubeconfigs::LOCAL));
		clients.push(client("admin", "admin", Kubeconfigs::LOCAL));
		clients
	}

	pub fn files_for(ctx: &Context, node: &PlannedNode) -> Vec<PathBuf> {
		let layout = &ctx.layout;
		match node.role {
			NodeRole::Controller => ["admin", "kube-controller-manager", "kube-scheduler"]
				.map(|name| layout.kubeconfig(name))
				.to_vec(),
			NodeRole::Worker => {
				vec![layout.kubeconfig(&node.name), layout.kubeconfig("kube-proxy")]
			}
		}
	}
}

async fn generate(ctx: &Context, client: &Client) -> Result<(), ProvisionError> {
	let layout = &ctx.layout;
	let kubeconfig = layout.kubeconfig(&client.name);
	if !ctx.force && kubeconfig.exists() {
		debug!("Kubeconfig {} already exists.", kubeconfig.display());
		return Ok(());
	}
	let (ca, cert, key) = (
		layout.cert(cfssl::CA),
		layout.cert(&client.name),
		layout.cert_key(&client.name),
	);
	for required in [&ca, &cert, &key] {
		if !required.exists() {
			return Err(ProvisionError::State(format!(
				"{} is missing; run the certificates step first",
				required.display()
			)));
		}
	}
	let spec = KubeconfigSpec {
		cluster: &ctx.config.cluster_name,
		user: &client.user,
		server: client.server.clone(),
		ca: &ca,
		cert: &cert,
		key: &key,
		kubeconfig: &kubeconfig,
	};
	for command in kctl::kubeconfig(&spec)? {
		ctx.executor.run(&Target::Local, &command).await?;
	}
	info!("Wrote {}.", kubeconfig.display());
	Ok(())
}

#[async_trait]
impl SetupStep for Kubeconfigs {
	fn name(&self) -> &'static str {
		Kubeconfigs::NAME
	}

	fn description(&self) -> &'static str {
		"generate client kubeconfigs and copy them to the nodes"
	}

	async fn check(&self, ctx: &Context) -> Result<bool, ProvisionError> {
		let public = ctx.inventory.public_address().await?;
		Ok(Kubeconfigs::clients(ctx, public)
			.iter()
			.all(|client| ctx.layout.kubeconfig(&client.name).exists()))
	}

	async fn set(&self, ctx: &Context) -> Result<(), ProvisionError> {
		let public = ctx.inventory.public_address().await?;
		for client in Kubeconfigs::clients(ctx, public) {
			generate(ctx, &client).await?;
		}
		let nodes = ctx.inventory.topology().nodes().cloned().collect::<Vec<_>>();
		ctx.for_each(
			Kubeconfigs::NAME,
			nodes,
			|node| node.name.clone(),
			|node| async move {
				ctx.executor
					.upload(&node.name, &Kubeconfigs::files_for(ctx, &node))
					.await
			},
		)
		.await
	}
}
