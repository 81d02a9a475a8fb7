use super::{Launcher, ProcessOutput};
use crate::error::ProvisionError;
use crate::setup::utils::gcloud::Gcloud;
use async_trait::async_trait;
use std::{path::PathBuf, sync::Arc};

/// Runs commands on, and copies files to, a named cluster machine.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn run(
		&self,
		host: &str,
		command: &str,
		capture: bool,
	) -> Result<ProcessOutput, ProvisionError>;

	async fn upload(&self, host: &str, files: &[PathBuf]) -> Result<ProcessOutput, ProvisionError>;
}

/// Reaches machines through `gcloud compute ssh` and `gcloud compute scp`.
pub struct GcloudTransport {
	gcloud: Gcloud,
	launcher: Arc<dyn Launcher>,
}

impl GcloudTransport {
	/// ssh and scp exit with 255 when the connection itself failed.
	pub const CONNECTION_FAILURE: i32 = 255;

	pub fn new(gcloud: Gcloud, launcher: Arc<dyn Launcher>) -> Self {
		GcloudTransport { gcloud, launcher }
	}

	fn classify(host: &str, output: ProcessOutput) -> Result<ProcessOutput, ProvisionError> {
		if output.code == Some(GcloudTransport::CONNECTION_FAILURE) {
			return Err(ProvisionError::Transport {
				host: host.to_owned(),
				message: if output.stderr.is_empty() {
					"ssh connection failed".to_owned()
				} else {
					output.stderr
				},
			});
		}
		Ok(output)
	}
}

#[async_trait]
impl Transport for GcloudTransport {
	async fn run(
		&self,
		host: &str,
		command: &str,
		capture: bool,
	) -> Result<ProcessOutput, ProvisionError> {
		let spec = self.gcloud.ssh(host, command)?;
		let output = self.launcher.launch(&spec, capture).await?;
		GcloudTransport::classify(host, output)
	}

	async fn upload(&self, host: &str, files: &[PathBuf]) -> Result<ProcessOutput, ProvisionError> {
		let spec = self.gcloud.scp(files, host)?;
		let output = self.launcher.launch(&spec, true).await?;
		GcloudTransport::classify(host, output)
	}
}
