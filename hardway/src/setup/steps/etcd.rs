use crate::context::Context;
use crate::error::ProvisionError;
use crate::setup::SetupStep;
use crate::setup::utils::inventory::Node;
use crate::template::TemplateId;
use crate::vars;
use async_trait::async_trait;
use tracing::info;

pub struct Etcd;

impl Etcd {
	pub const NAME: &str = "etcd";
	pub const MEMBER_LIST: &str = "sudo ETCDCTL_API=3 etcdctl member list \
		--endpoints=https://127.0.0.1:2379 \
		--cacert=/etc/etcd/ca.pem \
		--cert=/etc/etcd/kubernetes.pem \
		--key=/etc/etcd/kubernetes-key.pem";

	/// `name=https://ip:2380` for every controller, the etcd bootstrap list.
	pub fn initial_cluster(controllers: &[Node]) -> String {
		controllers
			.iter()
			.map(|node| format!("{}=https://{}:2380", node.name, node.internal_ip))
			.collect::<Vec<_>>()
			.join(",")
	}

	fn install_script(version: &str) -> Vec<String> {
		let release = format!("etcd-{version}-linux-amd64");
		vec![
			format!(
				"wget -q --https-only --timestamping https://github.com/coreos/etcd/releases/download/{version}/{release}.tar.gz"
			),
			format!("tar -xf {release}.tar.gz"),
			format!("sudo mv {release}/etcd* /usr/local/bin/"),
			"sudo mkdir -p /etc/etcd /var/lib/etcd".to_owned(),
			"sudo cp ca.pem kubernetes-key.pem kubernetes.pem /etc/etcd/".to_owned(),
			"sudo mv etcd.service /etc/systemd/system/etcd.service".to_owned(),
			"sudo systemctl daemon-reload".to_owned(),
			"sudo systemctl enable etcd".to_owned(),
			"sudo systemctl start etcd".to_owned(),
		]
	}
}

async fn bootstrap(ctx: &Context, node: Node, initial_cluster: &str) -> Result<(), ProvisionError> {
	let unit = ctx.write_config(
		&node.name,
		TemplateId::EtcdService,
		&vars! {
			"etcd_name" => node.name,
			"internal_ip" => node.internal_ip,
			"initial_cluster" => initial_cluster,
		},
	)?;
	ctx.executor.upload(&node.name, &[unit]).await?;
	ctx.remote_script(&node.name, &Etcd::install_script(&ctx.config.versions.etcd))
		.await
}

#[async_trait]
impl SetupStep for Etcd {
	fn name(&self) -> &'static str {
		Etcd::NAME
	}

	fn description(&self) -> &'static str {
		"bootstrap the etcd cluster on the controllers"
	}

	async fn check(&self, ctx: &Context) -> Result<bool, ProvisionError> {
		let Some(first) = ctx.inventory.topology().controllers().first() else {
			return Ok(false);
		};
		let healthy = ctx.succeeds(&first.name, Etcd::MEMBER_LIST).await?;
		if !healthy {
			info!("etcd members are not listed on {}.", first.name);
		}
		Ok(healthy)
	}

	async fn set(&self, ctx: &Context) -> Result<(), ProvisionError> {
		let controllers = ctx.inventory.controllers().await?;
		let initial_cluster = Etcd::initial_cluster(&controllers);
		let initial_cluster = initial_cluster.as_str();
		ctx.for_each(
			Etcd::NAME,
			controllers,
			|node| node.name.clone(),
			|node| bootstrap(ctx, node, initial_cluster),
		)
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::context::testing::context;
	use crate::exec::testing::{FakeLauncher, FakeTransport, instance_json, ok};
	use std::{fs, sync::Arc};

	#[tokio::test]
	async fn every_controller_gets_its_own_unit_and_the_shared_cluster_list() {
		let dir = tempfile::tempdir().unwrap();
		let launcher = Arc::new(FakeLauncher::new(|spec| {
			let index = spec.args[3].rsplit('-').next().unwrap().to_owned();
			ok(&instance_json(&format!("10.240.0.1{index}"), "35.0.0.1", None))
		}));
		let transport = Arc::new(FakeTransport::ok());
		let ctx = context(dir.path(), launcher, transport.clone());
		Etcd.set(&ctx).await.unwrap();
		let host = ctx.layout.host_configs("controller-1");
		let unit = fs::read_to_string(host.join("etcd.service")).unwrap();
		assert!(unit.contains("--name controller-1"));
		assert!(unit.contains("--listen-peer-urls https://10.240.0.11:2380"));
		assert!(unit.contains(
			"--initial-cluster controller-0=https://10.240.0.10:2380,controller-1=https://10.240.0.11:2380,controller-2=https://10.240.0.12:2380"
		));
		let runs = transport.runs();
		assert_eq!(runs.len(), 3);
		assert!(
			runs.iter()
				.all(|(_, cmd)| cmd.starts_with("bash -c ") && cmd.contains("systemctl start etcd"))
		);
		assert!(Etcd.check(&ctx).await.unwrap());
	}
}
