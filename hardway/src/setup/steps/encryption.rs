use crate::context::Context;
use crate::error::ProvisionError;
use crate::setup::SetupStep;
use crate::setup::utils::inventory::allocate_encryption_key;
use crate::template::TemplateId;
use crate::vars;
use async_trait::async_trait;
use std::path::PathBuf;

pub struct Encryption;

impl Encryption {
	pub const NAME: &str = "encryption";

	pub fn config_file(ctx: &Context) -> PathBuf {
		ctx.layout
			.cluster_configs()
			.join(TemplateId::EncryptionConfig.file_name())
	}

	/// Puts the config where kube-apiserver reads it; a running API server is
	/// restarted so a rotated key takes effect.
	fn install_script() -> Vec<String> {
		let file = TemplateId::EncryptionConfig.file_name();
		vec![
			"sudo mkdir -p /var/lib/kubernetes".to_owned(),
			format!("sudo cp {file} /var/lib/kubernetes/"),
			"if systemctl is-active --quiet kube-apiserver; then sudo systemctl restart kube-apiserver; fi"
				.to_owned(),
		]
	}
}

#[async_trait]
impl SetupStep for Encryption {
	fn name(&self) -> &'static str {
		Encryption::NAME
	}

	fn description(&self) -> &'static str {
		"write the data encryption config and install it on the controllers"
	}

	async fn check(&self, ctx: &Context) -> Result<bool, ProvisionError> {
		Ok(ctx.layout.encryption_key().exists() && Encryption::config_file(ctx).exists())
	}

	async fn set(&self, ctx: &Context) -> Result<(), ProvisionError> {
		let key = allocate_encryption_key(&ctx.layout.encryption_key())?;
		let config = ctx.write_config(
			"cluster",
			TemplateId::EncryptionConfig,
			&vars! { "encryption_key" => key },
		)?;
		let controllers = ctx.inventory.topology().controllers().to_vec();
		ctx.for_each(
			Encryption::NAME,
			controllers,
			|node| node.name.clone(),
			|node| {
				let files = [config.clone()];
				async move {
					ctx.executor.upload(&node.name, &files).await?;
					ctx.remote_script(&node.name, &Encryption::install_script()).await
				}
			},
		)
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::context::testing::context;
	use crate::exec::testing::{FakeLauncher, FakeTransport, instance_json, ok};
	use crate::setup::{self, Outcome, steps::ControlPlane, utils::inventory::rotate_encryption_key};
	use std::{fs, sync::Arc};

	#[tokio::test]
	async fn key_survives_reruns_and_reaches_every_controller() {
		let dir = tempfile::tempdir().unwrap();
		let transport = Arc::new(FakeTransport::ok());
		let ctx = context(dir.path(), Arc::new(FakeLauncher::new(|_| ok(""))), transport.clone());
		Encryption.set(&ctx).await.unwrap();
		assert!(Encryption.check(&ctx).await.unwrap());
		let key = fs::read_to_string(ctx.layout.encryption_key()).unwrap();
		let config = fs::read_to_string(Encryption::config_file(&ctx)).unwrap();
		assert!(config.contains(&format!("secret: {key}")));
		ctx.state.reset(None).unwrap();
		Encryption.set(&ctx).await.unwrap();
		assert_eq!(fs::read_to_string(ctx.layout.encryption_key()).unwrap(), key);
		assert_eq!(fs::read_to_string(Encryption::config_file(&ctx)).unwrap(), config);
		let hosts = transport
			.uploads()
			.into_iter()
			.map(|(host, _)| host)
			.filter(|host| host.starts_with("controller"))
			.count();
		assert_eq!(hosts, 6);
	}

	#[tokio::test]
	async fn rotated_key_is_installed_on_running_controllers() {
		let dir = tempfile::tempdir().unwrap();
		let launcher = Arc::new(FakeLauncher::new(|spec| {
			if spec.args.contains(&"addresses".to_owned()) {
				return ok("35.203.0.1");
			}
			if spec.args.contains(&"describe".to_owned()) {
				let index = spec.args[3].rsplit('-').next().unwrap().to_owned();
				return ok(&instance_json(&format!("10.240.0.1{index}"), "35.0.0.1", None));
			}
			ok("")
		}));
		let transport = Arc::new(FakeTransport::ok());
		let ctx = context(dir.path(), launcher, transport.clone());
		let steps: &[&dyn SetupStep] = &[&Encryption, &ControlPlane];
		let report = setup::run(&ctx, steps, None, None).await.unwrap();
		assert!(matches!(report.outcome, Outcome::Completed));

		let before = transport.runs().len();
		let key = rotate_encryption_key(&ctx.layout.encryption_key()).unwrap();
		ctx.state.reset(Some(Encryption::NAME)).unwrap();
		let report = setup::run(&ctx, steps, Some(Encryption::NAME), None)
			.await
			.unwrap();
		assert!(matches!(report.outcome, Outcome::Completed));
		assert_eq!(report.executed, [Encryption::NAME]);
		assert_eq!(report.skipped, [ControlPlane::NAME]);

		let config = fs::read_to_string(Encryption::config_file(&ctx)).unwrap();
		assert!(config.contains(&format!("secret: {key}")));
		let runs = transport.runs();
		for controller in ["controller-0", "controller-1", "controller-2"] {
			let (_, script) = runs[before..]
				.iter()
				.find(|(host, _)| host == controller)
				.unwrap();
			assert!(script.contains("sudo cp encryption-config.yaml /var/lib/kubernetes/"));
			assert!(script.contains("systemctl restart kube-apiserver"));
		}
	}
}
