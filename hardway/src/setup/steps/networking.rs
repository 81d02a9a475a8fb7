use crate::context::Context;
use crate::error::ProvisionError;
use crate::exec::CommandSpec;
use crate::setup::SetupStep;
use crate::setup::utils::{gcloud::FirewallRule, validate::Cidr};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use tracing::{info, warn};

pub struct Networking;

impl Networking {
	pub const NAME: &str = "networking";
	pub const INTERNAL_FIREWALL: &str = "kubernetes-internal-firewall";
	pub const EXTERNAL_FIREWALL: &str = "kubernetes-external-firewall";

	/// Every resource the step creates, keyed for resumption.
	fn plan(ctx: &Context) -> Result<Vec<(&'static str, CommandSpec)>, ProvisionError> {
		let config = &ctx.config;
		let network = config.cluster_name.as_str();
		let internal = [config.subnet_cidr()?, config.cluster_cidr()?];
		let anywhere = [Cidr::new(Ipv4Addr::UNSPECIFIED, 0)?];
		Ok(vec![
			("network", ctx.gcloud.create_network(network)?),
			(
				"subnet",
				ctx.gcloud
					.create_subnet(&config.subnet_name, network, config.subnet_cidr()?)?,
			),
			(
				"internal-firewall",
				ctx.gcloud.create_firewall_rule(&FirewallRule {
					name: Networking::INTERNAL_FIREWALL,
					network,
					allow: &["tcp", "udp", "icmp"],
					source_ranges: &internal,
				})?,
			),
			(
				"external-firewall",
				ctx.gcloud.create_firewall_rule(&FirewallRule {
					name: Networking::EXTERNAL_FIREWALL,
					network,
					allow: &["tcp:22", "tcp:6443", "icmp"],
					source_ranges: &anywhere,
				})?,
			),
			("public-address", ctx.gcloud.create_address(network)?),
		])
	}
}

#[async_trait]
impl SetupStep for Networking {
	fn name(&self) -> &'static str {
		Networking::NAME
	}

	fn description(&self) -> &'static str {
		"create the VPC, subnet, firewall rules and public address"
	}

	async fn check(&self, ctx: &Context) -> Result<bool, ProvisionError> {
		for rule in [Networking::INTERNAL_FIREWALL, Networking::EXTERNAL_FIREWALL] {
			match ctx.executor.execute(&ctx.gcloud.describe_firewall_rule(rule)?).await {
				Ok(_) => {}
				Err(ProvisionError::Execution { stderr, .. }) => {
					warn!("Firewall rule {rule} is missing: {stderr}");
					return Ok(false);
				}
				Err(err) => return Err(err),
			}
		}
		let address = ctx.inventory.public_address().await?;
		info!("Public address is {address}.");
		Ok(true)
	}

	async fn set(&self, ctx: &Context) -> Result<(), ProvisionError> {
		for (key, spec) in Networking::plan(ctx)? {
			ctx.step_op(Networking::NAME, key, async {
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
	use crate::exec::testing::{FakeLauncher, FakeTransport, exit, ok};
	use std::sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	};

	#[tokio::test]
	async fn creates_network_resources_in_order() {
		let dir = tempfile::tempdir().unwrap();
		let launcher = Arc::new(FakeLauncher::new(|_| ok("")));
		let ctx = context(dir.path(), launcher.clone(), Arc::new(FakeTransport::ok()));
		Networking.set(&ctx).await.unwrap();
		let calls = launcher.calls();
		assert_eq!(calls.len(), 5);
		assert_eq!(
			calls[0].args,
			["compute", "networks", "create", "kubernetes-the-hard-way", "--subnet-mode", "custom"]
		);
		let internal = calls[2].args.join(" ");
		assert!(internal.contains("--allow tcp,udp,icmp"));
		assert!(internal.contains("--source-ranges 10.240.0.0/24,10.200.0.0/16"));
		let external = calls[3].args.join(" ");
		assert!(external.contains("--allow tcp:22,tcp:6443,icmp"));
		assert!(external.contains("--source-ranges 0.0.0.0/0"));
		assert_eq!(calls[4].args[..3], ["compute", "addresses", "create"]);
	}

	#[tokio::test]
	async fn resumes_after_the_last_created_resource() {
		let dir = tempfile::tempdir().unwrap();
		let attempts = Arc::new(AtomicUsize::new(0));
		let counter = attempts.clone();
		let launcher = Arc::new(FakeLauncher::new(move |spec| {
			if spec.args.contains(&"firewall-rules".to_owned())
				&& counter.fetch_add(1, Ordering::SeqCst) == 0
			{
				exit(1, "quota exceeded")
			} else {
				ok("")
			}
		}));
		let ctx = context(dir.path(), launcher.clone(), Arc::new(FakeTransport::ok()));
		assert!(Networking.set(&ctx).await.is_err());
		assert_eq!(launcher.calls().len(), 3);
		Networking.set(&ctx).await.unwrap();
		let calls = launcher.calls();
		assert_eq!(calls.len(), 6);
		assert_eq!(calls[3].args[1], "firewall-rules");
		assert_eq!(
			calls
				.iter()
				.filter(|spec| spec.args[1] == "networks" && spec.args[2] == "create")
				.count(),
			1
		);
	}

	#[tokio::test]
	async fn check_requires_both_firewall_rules() {
		let dir = tempfile::tempdir().unwrap();
		let launcher = Arc::new(FakeLauncher::new(|spec| {
			if spec.args.contains(&"addresses".to_owned()) {
				ok("35.203.0.1\n")
			} else {
				ok(Networking::INTERNAL_FIREWALL)
			}
		}));
		let ctx = context(dir.path(), launcher.clone(), Arc::new(FakeTransport::ok()));
		assert!(Networking.check(&ctx).await.unwrap());
		let described = launcher
			.calls()
			.into_iter()
			.filter(|spec| spec.args[1] == "firewall-rules" && spec.args[2] == "describe")
			.map(|spec| spec.args[3].clone())
			.collect::<Vec<_>>();
		assert_eq!(described, [Networking::INTERNAL_FIREWALL, Networking::EXTERNAL_FIREWALL]);

		let dir = tempfile::tempdir().unwrap();
		let launcher = Arc::new(FakeLauncher::new(|spec| {
			if spec.args.contains(&Networking::EXTERNAL_FIREWALL.to_owned()) {
				exit(1, "The resource 'kubernetes-external-firewall' was not found")
			} else {
				ok("35.203.0.1\n")
			}
		}));
		let ctx = context(dir.path(), launcher.clone(), Arc::new(FakeTransport::ok()));
		assert!(!Networking.check(&ctx).await.unwrap());
		assert!(launcher.calls().iter().all(|spec| spec.args[1] != "addresses"));
	}
}
