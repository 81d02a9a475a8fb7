use crate::context::Context;
use crate::error::ProvisionError;
use crate::exec::{CommandSpec, Target};
use crate::setup::SetupStep;
use crate::setup::steps::Encryption;
use crate::setup::utils::{
	gcloud::FirewallRule,
	inventory::Node,
	kctl,
	validate::Cidr,
};
use crate::template::TemplateId;
use crate::vars;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use tracing::info;

pub struct ControlPlane;

impl ControlPlane {
	pub const NAME: &str = "control-plane";
	pub const BINARIES: [&str; 4] = [
		"kube-apiserver",
		"kube-controller-manager",
		"kube-scheduler",
		"kubectl",
	];
	pub const ADMIN_KUBECONFIG: &str = "admin.kubeconfig";
	pub const HEALTH_CHECK: &str = "kubernetes";
	pub const HEALTH_CHECK_HOST: &str = "kubernetes.default.svc.cluster.local";
	pub const HEALTH_CHECK_FIREWALL: &str = "kubernetes-the-hard-way-allow-health-check";
	pub const TARGET_POOL: &str = "kubernetes-target-pool";
	pub const FORWARDING_RULE: &str = "kubernetes-forwarding-rule";
	// Google's health checkers connect from these ranges.
	pub const HEALTH_CHECK_RANGES: [&str; 3] =
		["209.85.152.0/22", "209.85.204.0/22", "35.191.0.0/16"];

	pub fn etcd_servers(controllers: &[Node]) -> String {
		controllers
			.iter()
			.map(|node| format!("https://{}:2379", node.internal_ip))
			.collect::<Vec<_>>()
			.join(",")
	}

	fn install_script(version: &str) -> Vec<String> {
		let mut lines = vec!["sudo mkdir -p /etc/kubernetes/config /var/lib/kubernetes".to_owned()];
		for binary in ControlPlane::BINARIES {
			lines.push(format!(
				"wget -q --https-only --timestamping https://storage.googleapis.com/kubernetes-release/release/{version}/bin/linux/amd64/{binary}"
			));
		}
		let binaries = ControlPlane::BINARIES.join(" ");
		lines.extend([
			format!("chmod +x {binaries}"),
			format!("sudo cp {binaries} /usr/local/bin/"),
			"sudo cp ca.pem ca-key.pem kubernetes-key.pem kubernetes.pem service-account-key.pem service-account.pem encryption-config.yaml /var/lib/kubernetes/".to_owned(),
			"sudo cp kube-controller-manager.kubeconfig kube-scheduler.kubeconfig /var/lib/kubernetes/".to_owned(),
			"sudo cp kube-scheduler.yaml /etc/kubernetes/config/".to_owned(),
			"sudo cp kube-apiserver.service kube-controller-manager.service kube-scheduler.service /etc/systemd/system/".to_owned(),
			"sudo systemctl daemon-reload".to_owned(),
			"sudo systemctl enable kube-apiserver kube-controller-manager kube-scheduler".to_owned(),
			"sudo systemctl restart kube-apiserver kube-controller-manager kube-scheduler".to_owned(),
			"sudo apt-get update".to_owned(),
			"sudo apt-get install -y nginx".to_owned(),
			format!(
				"sudo cp healthz-nginx.conf /etc/nginx/sites-available/{}",
				ControlPlane::HEALTH_CHECK_HOST
			),
			format!(
				"sudo ln -sf /etc/nginx/sites-available/{0} /etc/nginx/sites-enabled/{0}",
				ControlPlane::HEALTH_CHECK_HOST
			),
			"sudo systemctl restart nginx".to_owned(),
			"sudo systemctl enable nginx".to_owned(),
		]);
		lines
	}

	fn wait_for_apiserver() -> Vec<String> {
		vec![format!(
			"timeout 120 bash -c 'until kubectl get --raw=/healthz --kubeconfig {} >/dev/null 2>&1; do sleep 2; done'",
			ControlPlane::ADMIN_KUBECONFIG
		)]
	}
}

async fn bootstrap(ctx: &Context, node: Node, etcd_servers: &str) -> Result<(), ProvisionError> {
	let config = &ctx.config;
	let mut files = vec![
		ctx.write_config(
			&node.name,
			TemplateId::KubeApiserverService,
			&vars! {
				"internal_ip" => node.internal_ip,
				"apiserver_count" => config.controllers,
				"etcd_servers" => etcd_servers,
				"service_cidr" => config.service_cidr,
			},
		)?,
		ctx.write_config(
			&node.name,
			TemplateId::KubeControllerManagerService,
			&vars! {
				"cluster_cidr" => config.cluster_cidr,
				"cluster_name" => config.cluster_name,
				"service_cidr" => config.service_cidr,
			},
		)?,
	];
	for id in [
		TemplateId::KubeSchedulerConfig,
		TemplateId::KubeSchedulerService,
		TemplateId::HealthzNginx,
	] {
		files.push(ctx.write_config(&node.name, id, &vars! {})?);
	}
	files.push(Encryption::config_file(ctx));
	ctx.executor.upload(&node.name, &files).await?;
	ctx.remote_script(
		&node.name,
		&ControlPlane::install_script(&config.versions.kubernetes),
	)
	.await
}

async fn authorize_apiserver(ctx: &Context, first: &str) -> Result<(), ProvisionError> {
	let manifest = ctx.write_config("cluster", TemplateId::ApiserverToKubeletRbac, &vars! {})?;
	ctx.executor.upload(first, &[manifest]).await?;
	ctx.remote_script(first, &ControlPlane::wait_for_apiserver()).await?;
	ctx.executor
		.run(
			&Target::Host(first.to_owned()),
			&kctl::apply(
				ControlPlane::ADMIN_KUBECONFIG,
				TemplateId::ApiserverToKubeletRbac.file_name(),
			),
		)
		.await?;
	info!("API server is authorized to reach the kubelets.");
	Ok(())
}

/// The regional load balancer in front of the API servers.
fn frontend(
	ctx: &Context,
	controllers: &[String],
	public: Ipv4Addr,
) -> Result<Vec<(&'static str, CommandSpec)>, ProvisionError> {
	let gcloud = &ctx.gcloud;
	let ranges = ControlPlane::HEALTH_CHECK_RANGES
		.iter()
		.map(|range| range.parse::<Cidr>())
		.collect::<Result<Vec<_>, _>>()?;
	Ok(vec![
		(
			"health-check",
			gcloud.create_http_health_check(
				ControlPlane::HEALTH_CHECK,
				ControlPlane::HEALTH_CHECK_HOST,
				"/healthz",
			)?,
		),
		(
			"health-check-firewall",
			gcloud.create_firewall_rule(&FirewallRule {
				name: ControlPlane::HEALTH_CHECK_FIREWALL,
				network: &ctx.config.cluster_name,
				allow: &["tcp"],
				source_ranges: &ranges,
			})?,
		),
		(
			"target-pool",
			gcloud.create_target_pool(ControlPlane::TARGET_POOL, ControlPlane::HEALTH_CHECK)?,
		),
		(
			"target-pool-instances",
			gcloud.add_target_pool_instances(ControlPlane::TARGET_POOL, controllers)?,
		),
		(
			"forwarding-rule",
			gcloud.create_forwarding_rule(
				ControlPlane::FORWARDING_RULE,
				public,
				&kctl::API_PORT.to_string(),
				ControlPlane::TARGET_POOL,
			)?,
		),
	])
}

#[async_trait]
impl SetupStep for ControlPlane {
	fn name(&self) -> &'static str {
		ControlPlane::NAME
	}

	fn description(&self) -> &'static str {
		"install the API server, controller manager and scheduler behind a load balancer"
	}

	async fn check(&self, ctx: &Context) -> Result<bool, ProvisionError> {
		let Some(first) = ctx.inventory.topology().controllers().first() else {
			return Ok(false);
		};
		let query = kctl::get_componentstatuses(ControlPlane::ADMIN_KUBECONFIG).to_shell()?;
		ctx.succeeds(&first.name, &query).await
	}

	async fn set(&self, ctx: &Context) -> Result<(), ProvisionError> {
		let controllers = ctx.inventory.controllers().await?;
		let names = controllers.iter().map(|node| node.name.clone()).collect::<Vec<_>>();
		let first = names
			.first()
			.cloned()
			.ok_or_else(|| ProvisionError::State("there are no controllers".to_owned()))?;
		let etcd_servers = ControlPlane::etcd_servers(&controllers);
		let etcd_servers = etcd_servers.as_str();
		ctx.for_each(
			ControlPlane::NAME,
			controllers,
			|node| node.name.clone(),
			|node| bootstrap(ctx, node, etcd_servers),
		)
		.await?;
		ctx.step_op(ControlPlane::NAME, "rbac", authorize_apiserver(ctx, &first))
			.await?;
		let public = ctx.inventory.public_address().await?;
		for (key, spec) in frontend(ctx, &names, public)? {
			ctx.step_op(ControlPlane::NAME, key, async {
				ctx.executor.execute(&spec).await.map(|_| ())
			})
			.await?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::context::testing::context;
	use crate::exec::testing::{FakeLauncher, FakeTransport, instance_json, ok};
	use std::{fs, sync::Arc};

	fn launcher() -> Arc<FakeLauncher> {
		Arc::new(FakeLauncher::new(|spec| {
			if spec.args.contains(&"addresses".to_owned()) {
				return ok("35.203.0.1");
			}
			if spec.args.contains(&"describe".to_owned()) {
				let index = spec.args[3].rsplit('-').next().unwrap().to_owned();
				return ok(&instance_json(&format!("10.240.0.1{index}"), "35.0.0.1", None));
			}
			ok("")
		}))
	}

	#[tokio::test]
	async fn controllers_are_configured_then_fronted_by_a_load_balancer() {
		let dir = tempfile::tempdir().unwrap();
		let launcher = launcher();
		let transport = Arc::new(FakeTransport::ok());
		let ctx = context(dir.path(), launcher.clone(), transport.clone());
		ControlPlane.set(&ctx).await.unwrap();

		let unit = fs::read_to_string(
			ctx.layout.host_configs("controller-2").join("kube-apiserver.service"),
		)
		.unwrap();
		assert!(unit.contains("--advertise-address=10.240.0.12"));
		assert!(unit.contains("--apiserver-count=3"));
		assert!(unit.contains(
			"--etcd-servers=https://10.240.0.10:2379,https://10.240.0.11:2379,https://10.240.0.12:2379"
		));

		let runs = transport.runs();
		let (host, apply) = runs.last().unwrap();
		assert_eq!(host, "controller-0");
		assert!(apply.starts_with("kubectl apply"));
		let (_, files) = transport
			.uploads()
			.into_iter()
			.find(|(host, files)| host == "controller-1" && files.len() > 1)
			.unwrap();
		let names = files
			.iter()
			.map(|file| file.file_name().unwrap().to_string_lossy().into_owned())
			.collect::<Vec<_>>();
		assert!(names.contains(&"encryption-config.yaml".to_owned()));
		assert!(names.contains(&"healthz-nginx.conf".to_owned()));

		let lines = launcher.lines();
		let lb = lines
			.iter()
			.filter(|line| !line.contains("describe"))
			.collect::<Vec<_>>();
		assert_eq!(lb.len(), 5);
		assert!(lb[3].contains("controller-0,controller-1,controller-2"));
		assert!(lb[4].contains("35.203.0.1"));
		assert!(ControlPlane.check(&ctx).await.unwrap());
	}
}
