use crate::config::Config;
use crate::context::Context;
use crate::error::ProvisionError;
use crate::setup::{
	self, Outcome, PIPELINE, steps::Encryption, utils::inventory::rotate_encryption_key,
};
use crate::template::{TemplateId, TemplateRenderer, Variables};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Kubernetes the hard way on Google Compute Engine, one resumable step at a time.
#[derive(Debug, Parser)]
#[command(name = "hardway", version, propagate_version = true)]
pub struct Cli {
	/// Configuration file; `hardway.toml` in the working directory when present.
	#[arg(short, long, global = true, env = "HARDWAY_CONFIG")]
	pub config: Option<PathBuf>,

	/// Log at debug level with source locations.
	#[arg(short, long, global = true)]
	pub verbose: bool,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
	/// Run the pipeline, skipping steps that already completed.
	Run {
		/// First step to run; every earlier step must be complete.
		#[arg(long)]
		from: Option<String>,
		/// Last step to run.
		#[arg(long)]
		to: Option<String>,
		/// Re-run completed steps and regenerate existing certificates and kubeconfigs.
		#[arg(long)]
		force: bool,
	},
	/// Show what each step recorded.
	Status,
	/// List the steps in pipeline order.
	Steps,
	/// Print the resolved node addresses as JSON.
	Inventory,
	/// Forget the record of one step, or of all of them.
	Reset { step: Option<String> },
	/// Replace the data encryption key; the next run installs it and restarts the API servers.
	RotateEncryptionKey,
	/// Render one template to stdout.
	Render {
		/// Template file name, such as `kubelet-config.yaml`.
		template: TemplateId,
		/// Template variable as `key=value`; repeatable.
		#[arg(long = "var", value_parser = parse_var)]
		vars: Vec<(String, String)>,
	},
}

fn parse_var(arg: &str) -> Result<(String, String), String> {
	let (key, value) = arg
		.split_once('=')
		.ok_or_else(|| format!("'{arg}' is not key=value"))?;
	if key.is_empty() {
		return Err(format!("'{arg}' has an empty key"));
	}
	Ok((key.to_owned(), value.to_owned()))
}

fn known_step(name: &str) -> Result<(), ProvisionError> {
	if PIPELINE.iter().any(|step| step.name() == name) {
		Ok(())
	} else {
		Err(ProvisionError::InvalidArgument(format!("unknown step '{name}'")))
	}
}

impl Command {
	pub async fn run(self, config: Config) -> anyhow::Result<ExitCode> {
		match self {
			Command::Run { from, to, force } => {
				let cancel = CancellationToken::new();
				let ctx = Context::init(config, force, cancel.clone())?;
				tokio::spawn(async move {
					if tokio::signal::ctrl_c().await.is_ok() {
						warn!("Interrupted; finishing in-flight commands.");
						cancel.cancel();
					}
				});
				let report = setup::run(&ctx, PIPELINE, from.as_deref(), to.as_deref()).await?;
				info!(
					"Executed [{}], skipped [{}].",
					report.executed.join(", "),
					report.skipped.join(", ")
				);
				match report.outcome {
					Outcome::Completed => {
						info!("Cluster bootstrap finished.");
						Ok(ExitCode::SUCCESS)
					}
					Outcome::Failed { step, error } => {
						error!("Step {step} failed: {error}");
						Ok(ExitCode::FAILURE)
					}
					Outcome::Cancelled { step } => {
						warn!("Run cancelled during {step}; rerun to resume.");
						Ok(ExitCode::FAILURE)
					}
				}
			}
			Command::Status => {
				let ctx = Context::init(config, false, CancellationToken::new())?;
				let records = ctx.state.records()?;
				for step in PIPELINE {
					let name = step.name();
					match records.get(name) {
						Some(record) => {
							println!(
								"{name:<14} {:<9} {}",
								format!("{:?}", record.status).to_lowercase(),
								record.updated_at.to_rfc3339()
							);
							if !record.completed_ops.is_empty() {
								let ops = record.completed_ops.iter().cloned().collect::<Vec<_>>();
								println!("{:<14} done: {}", "", ops.join(", "));
							}
							if let Some(error) = &record.error {
								println!("{:<14} error: {error}", "");
							}
						}
						None => println!("{name:<14} pending"),
					}
				}
				Ok(ExitCode::SUCCESS)
			}
			Command::Steps => {
				for (index, step) in PIPELINE.iter().enumerate() {
					println!("{:>2}. {:<14} {}", index + 1, step.name(), step.description());
				}
				Ok(ExitCode::SUCCESS)
			}
			Command::Inventory => {
				let ctx = Context::init(config, false, CancellationToken::new())?;
				let snapshot = ctx.inventory.load_snapshot()?;
				println!("{}", serde_json::to_string_pretty(&snapshot)?);
				Ok(ExitCode::SUCCESS)
			}
			Command::Reset { step } => {
				if let Some(step) = &step {
					known_step(step)?;
				}
				let ctx = Context::init(config, false, CancellationToken::new())?;
				ctx.state.reset(step.as_deref())?;
				Ok(ExitCode::SUCCESS)
			}
			Command::RotateEncryptionKey => {
				let ctx = Context::init(config, false, CancellationToken::new())?;
				rotate_encryption_key(&ctx.layout.encryption_key())?;
				ctx.state.reset(Some(Encryption::NAME))?;
				info!(
					"Encryption key rotated; run with --from {} to install it on the controllers.",
					Encryption::NAME
				);
				Ok(ExitCode::SUCCESS)
			}
			Command::Render { template, vars } => {
				let renderer = TemplateRenderer::new(config.template_dir.as_deref())?;
				let variables = vars.into_iter().collect::<Variables>();
				print!("{}", renderer.render(template, &variables)?);
				Ok(ExitCode::SUCCESS)
			}
		}
	}
}
