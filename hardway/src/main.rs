mod cli;
mod config;
mod context;
mod error;
mod exec;
mod logging;
mod setup;
mod template;

use clap::Parser;
use cli::Cli;
use config::Config;
use std::process::ExitCode;
use tracing::error;

async fn start(cli: Cli) -> anyhow::Result<ExitCode> {
	let config = Config::load(cli.config.as_deref())?;
	cli.command.run(config).await
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	logging::init(cli.verbose);
	match start(cli).await {
		Ok(code) => code,
		Err(err) => {
			error!("{err:#}");
			ExitCode::FAILURE
		}
	}
}
