use crate::context::Context;
use crate::error::ProvisionError;
use crate::exec::CommandSpec;
use crate::setup::SetupStep;
use crate::setup::utils::{cfssl, kctl};
use async_trait::async_trait;
use tracing::info;

pub struct Environment;

impl Environment {
	pub const NAME: &str = "environment";

	fn tools(ctx: &Context) -> [CommandSpec; 3] {
		[
			ctx.gcloud.version(),
			CommandSpec::new(cfssl::PROGRAM).arg("version"),
			kctl::client_version(),
		]
	}
}

#[async_trait]
impl SetupStep for Environment {
	fn name(&self) -> &'static str {
		Environment::NAME
	}

	fn description(&self) -> &'static str {
		"check local tools and set gcloud defaults"
	}

	async fn set(&self, ctx: &Context) -> Result<(), ProvisionError> {
		for tool in Environment::tools(ctx) {
			match ctx.executor.execute(&tool).await {
				Ok(_) => info!("Found {}.", tool.program),
				Err(ProvisionError::CommandLaunch { cmd, source }) => {
					return Err(ProvisionError::Config(format!(
						"'{cmd}' could not start ({source}); install {} and make sure it is on PATH",
						tool.program
					)));
				}
				Err(err) => return Err(err),
			}
		}
		for spec in ctx.gcloud.set_defaults() {
			ctx.executor.execute(&spec).await?;
		}
		info!(
			"gcloud defaults set to region {} and zone {}.",
			ctx.config.region, ctx.config.zone
		);
		Ok(())
	}
}
