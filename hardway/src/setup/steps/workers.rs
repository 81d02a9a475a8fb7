use crate::context::Context;
use crate::error::ProvisionError;
use crate::setup::SetupStep;
use crate::setup::steps::ControlPlane;
use crate::setup::utils::{inventory::Node, kctl, validate::Cidr};
use crate::template::TemplateId;
use crate::vars;
use async_trait::async_trait;
use tracing::info;

pub struct Workers;

impl Workers {
	pub const NAME: &str = "workers";
	pub const BINARIES: [&str; 3] = ["kubectl", "kube-proxy", "kubelet"];
	pub const PACKAGES: [&str; 3] = ["socat", "conntrack", "ipset"];

	/// `kubernetes-route-10-200-0-0-24` for `10.200.0.0/24`.
	pub fn route_name(pod_cidr: Cidr) -> String {
		format!("kubernetes-route-{}", pod_cidr.to_string().replace(['.', '/'], "-"))
	}

	fn pod_cidr(node: &Node) -> Result<Cidr, ProvisionError> {
		node.pod_cidr.ok_or_else(|| {
			ProvisionError::State(format!("{} has no pod CIDR assigned", node.name))
		})
	}

	fn install_script(ctx: &Context, host: &str) -> Vec<String> {
		let versions = &ctx.config.versions;
		let kubernetes = &versions.kubernetes;
		let crictl = format!("crictl-{}-linux-amd64.tar.gz", versions.crictl);
		let cni = format!("cni-plugins-amd64-{}.tgz", versions.cni_plugins);
		let containerd = format!("containerd-{}.linux-amd64.tar.gz", versions.containerd);
		let binaries = Workers::BINARIES.join(" ");
		let mut lines = vec![
			"sudo apt-get update".to_owned(),
			format!("sudo apt-get -y install {}", Workers::PACKAGES.join(" ")),
		];
		let mut urls = vec![
			format!(
				"https://github.com/kubernetes-incubator/cri-tools/releases/download/{}/{crictl}",
				versions.crictl
			),
			format!(
				"https://github.com/opencontainers/runc/releases/download/{}/runc.amd64",
				versions.runc
			),
			format!(
				"https://github.com/containernetworking/plugins/releases/download/{}/{cni}",
				versions.cni_plugins
			),
			format!(
				"https://github.com/containerd/containerd/releases/download/v{}/{containerd}",
				versions.containerd
			),
		];
		urls.extend(Workers::BINARIES.iter().map(|binary| {
			format!("https://storage.googleapis.com/kubernetes-release/release/{kubernetes}/bin/linux/amd64/{binary}")
		}));
		lines.extend(
			urls.into_iter()
				.map(|url| format!("wget -q --https-only --timestamping {url}")),
		);
		lines.extend([
			"sudo mkdir -p /etc/cni/net.d /opt/cni/bin /var/lib/kubelet /var/lib/kube-proxy /var/lib/kubernetes /var/run/kubernetes /etc/containerd".to_owned(),
			format!("chmod +x {binaries} runc.amd64"),
			"sudo cp runc.amd64 /usr/local/bin/runc".to_owned(),
			format!("sudo cp {binaries} /usr/local/bin/"),
			format!("sudo tar -xf {crictl} -C /usr/local/bin/"),
			format!("sudo tar -xf {cni} -C /opt/cni/bin/"),
			format!("sudo tar -xf {containerd} -C /"),
			"sudo cp 10-bridge.conf 99-loopback.conf /etc/cni/net.d/".to_owned(),
			"sudo cp containerd-config.toml /etc/containerd/config.toml".to_owned(),
			format!("sudo cp {host}-key.pem {host}.pem /var/lib/kubelet/"),
			format!("sudo cp {host}.kubeconfig /var/lib/kubelet/kubeconfig"),
			"sudo cp ca.pem /var/lib/kubernetes/".to_owned(),
			"sudo cp kubelet-config.yaml /var/lib/kubelet/".to_owned(),
			"sudo cp kube-proxy.kubeconfig /var/lib/kube-proxy/kubeconfig".to_owned(),
			"sudo cp kube-proxy-config.yaml /var/lib/kube-proxy/".to_owned(),
			"sudo cp containerd.service kubelet.service kube-proxy.service /etc/systemd/system/".to_owned(),
			"sudo systemctl daemon-reload".to_owned(),
			"sudo systemctl enable containerd kubelet kube-proxy".to_owned(),
			"sudo systemctl restart containerd kubelet kube-proxy".to_owned(),
		]);
		lines
	}
}

async fn bootstrap(ctx: &Context, node: Node) -> Result<(), ProvisionError> {
	let pod_cidr = Workers::pod_cidr(&node)?;
	let config = &ctx.config;
	let mut files = vec![
		ctx.write_config(&node.name, TemplateId::CniBridge, &vars! { "pod_cidr" => pod_cidr })?,
		ctx.write_config(
			&node.name,
			TemplateId::KubeletConfig,
			&vars! {
				"cluster_dns" => config.cluster_dns,
				"pod_cidr" => pod_cidr,
				"hostname" => node.name,
			},
		)?,
		ctx.write_config(
			&node.name,
			TemplateId::KubeProxyConfig,
			&vars! { "cluster_cidr" => config.cluster_cidr },
		)?,
	];
	for id in [
		TemplateId::CniLoopback,
		TemplateId::ContainerdConfig,
		TemplateId::ContainerdService,
		TemplateId::KubeletService,
		TemplateId::KubeProxyService,
	] {
		files.push(ctx.write_config(&node.name, id, &vars! {})?);
	}
	ctx.executor.upload(&node.name, &files).await?;
	ctx.remote_script(&node.name, &Workers::install_script(ctx, &node.name))
		.await?;
	info!("{} runs containerd, kubelet and kube-proxy.", node.name);
	Ok(())
}

#[async_trait]
impl SetupStep for Workers {
	fn name(&self) -> &'static str {
		Workers::NAME
	}

	fn description(&self) -> &'static str {
		"install the container runtime, kubelet and kube-proxy, then route pod traffic"
	}

	async fn check(&self, ctx: &Context) -> Result<bool, ProvisionError> {
		let Some(first) = ctx.inventory.topology().controllers().first() else {
			return Ok(false);
		};
		let query = kctl::get_nodes(ControlPlane::ADMIN_KUBECONFIG).to_shell()?;
		ctx.succeeds(&first.name, &query).await
	}

	async fn set(&self, ctx: &Context) -> Result<(), ProvisionError> {
		let workers = ctx.inventory.workers().await?;
		ctx.for_each(
			Workers::NAME,
			workers.clone(),
			|node| node.name.clone(),
			|node| bootstrap(ctx, node),
		)
		.await?;
		for node in &workers {
			let pod_cidr = Workers::pod_cidr(node)?;
			let name = Workers::route_name(pod_cidr);
			let route = ctx.gcloud.create_route(
				&name,
				&ctx.config.cluster_name,
				node.internal_ip,
				pod_cidr,
			)?;
			ctx.step_op(Workers::NAME, &name, async {
				ctx.executor.execute(&route).await.map(|_| ())
			})
			.await?;
		}
		Ok(())
	}
}
