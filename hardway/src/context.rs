use crate::config::{Config, TransportConfig};
use crate::error::ProvisionError;
use crate::exec::{
	ExecOptions, Executor, GcloudTransport, Launcher, ProcessLauncher, Transport, script,
	ssh::SshTransport,
};
use crate::setup::state::StateStore;
use crate::setup::utils::{
	gcloud::Gcloud,
	inventory::{Inventory, Topology},
	layout::{Layout, write_atomic},
};
use crate::template::{TemplateId, TemplateRenderer, Variables};
use futures::{StreamExt, stream};
use std::{future::Future, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Everything a step needs, built once per invocation and passed explicitly.
pub struct Context {
	pub config: Config,
	pub layout: Layout,
	pub gcloud: Gcloud,
	pub executor: Executor,
	pub templates: TemplateRenderer,
	pub inventory: Arc<Inventory>,
	pub state: StateStore,
	pub cancel: CancellationToken,
	pub force: bool,
}

impl Context {
	pub fn init(
		config: Config,
		force: bool,
		cancel: CancellationToken,
	) -> Result<Self, ProvisionError> {
		let layout = Layout::new(&config.state_dir);
		let launcher: Arc<dyn Launcher> = Arc::new(ProcessLauncher);
		let transport: Arc<dyn Transport> = match &config.transport {
			TransportConfig::Gcloud => Arc::new(GcloudTransport::new(
				Gcloud::from_config(&config),
				launcher.clone(),
			)),
			TransportConfig::Ssh {
				user,
				key_path,
				port,
			} => Arc::new(SshTransport::new(
				user,
				key_path,
				*port,
				&layout.inventory_file(),
			)),
		};
		let executor = Executor::new(
			launcher,
			transport,
			ExecOptions::local(&config.exec),
			ExecOptions::remote(&config.exec),
		);
		Context::with_executor(config, executor, force, cancel)
	}

	pub fn with_executor(
		config: Config,
		executor: Executor,
		force: bool,
		cancel: CancellationToken,
	) -> Result<Self, ProvisionError> {
		let layout = Layout::new(&config.state_dir);
		layout.ensure()?;
		let topology = Topology::from_config(&config)?;
		let inventory = Arc::new(Inventory::new(
			&config,
			topology,
			executor.clone(),
			layout.inventory_file(),
		));
		Ok(Context {
			gcloud: Gcloud::from_config(&config),
			templates: TemplateRenderer::new(config.template_dir.as_deref())?,
			state: StateStore::open(&layout.state_file())?,
			config,
			layout,
			executor,
			inventory,
			cancel,
			force,
		})
	}

	/// Runs `op` once per item on a bounded pool, recording each finished item
	/// under `step` so an interrupted run resumes with the remaining ones.
	///
	/// A failing item stops the pool from starting further items; items
	/// already running are left to finish.
	pub async fn for_each<T, F, Fut>(
		&self,
		step: &'static str,
		items: impl IntoIterator<Item = T>,
		key: impl Fn(&T) -> String,
		op: F,
	) -> Result<(), ProvisionError>
	where
		F: Fn(T) -> Fut,
		Fut: Future<Output = Result<(), ProvisionError>>,
	{
		let halt = self.cancel.child_token();
		let jobs = items.into_iter().map(|item| {
			let key = key(&item);
			let halt = halt.clone();
			let work = op(item);
			async move {
				if halt.is_cancelled() {
					return Err(ProvisionError::Cancelled);
				}
				if self.state.op_done(step, &key)? {
					debug!("{step}: {key} already done.");
					return Ok(());
				}
				match work.await {
					Ok(()) => {
						self.state.record_op(step, &key)?;
						info!("{step}: {key} done.");
						Ok(())
					}
					Err(err) => {
						halt.cancel();
						Err(err)
					}
				}
			}
		});
		let results = stream::iter(jobs)
			.buffer_unordered(self.config.parallelism)
			.collect::<Vec<_>>()
			.await;
		let mut cancelled = false;
		for result in results {
			match result {
				Ok(()) => {}
				Err(ProvisionError::Cancelled) => cancelled = true,
				Err(err) => return Err(err),
			}
		}
		if cancelled {
			return Err(ProvisionError::Cancelled);
		}
		Ok(())
	}

	/// One sequential operation of `step`, skipped when a previous run finished it.
	pub async fn step_op<Fut>(
		&self,
		step: &'static str,
		key: &str,
		work: Fut,
	) -> Result<(), ProvisionError>
	where
		Fut: Future<Output = Result<(), ProvisionError>>,
	{
		if self.cancel.is_cancelled() {
			return Err(ProvisionError::Cancelled);
		}
		if self.state.op_done(step, key)? {
			debug!("{step}: {key} already done.");
			return Ok(());
		}
		work.await?;
		self.state.record_op(step, key)?;
		Ok(())
	}

	/// Renders a template into the per-host config directory.
	pub fn write_config(
		&self,
		host: &str,
		id: TemplateId,
		variables: &Variables,
	) -> Result<PathBuf, ProvisionError> {
		let text = self.templates.render(id, variables)?;
		let path = self.layout.host_configs(host).join(id.file_name());
		write_atomic(&path, text.as_bytes())?;
		Ok(path)
	}

	/// Runs a strict bash script on a host.
	pub async fn remote_script(&self, host: &str, lines: &[String]) -> Result<(), ProvisionError> {
		self.executor.execute_remote(host, &script(lines)).await?;
		Ok(())
	}

	/// Whether a remote check command exits zero; connection trouble is still an error.
	pub async fn succeeds(&self, host: &str, command: &str) -> Result<bool, ProvisionError> {
		match self.executor.execute_remote(host, command).await {
			Ok(_) => Ok(true),
			Err(ProvisionError::Execution { .. }) => Ok(false),
			Err(err) => Err(err),
		}
	}
}

#[cfg(test)]
pub mod testing {
	use super::*;
	use crate::exec::testing::{FakeLauncher, FakeTransport};

	/// A context over fakes, with its state directory in `dir`.
	pub fn context(
		dir: &std::path::Path,
		launcher: Arc<FakeLauncher>,
		transport: Arc<FakeTransport>,
	) -> Context {
		let config = Config {
			state_dir: dir.to_owned(),
			..Config::default()
		};
		let opts = ExecOptions {
			capture_output: true,
			timeout: std::time::Duration::from_secs(5),
			retries: 2,
			backoff: std::time::Duration::from_millis(1),
		};
		let executor = Executor::new(launcher, transport, opts, opts);
		Context::with_executor(config, executor, false, CancellationToken::new()).unwrap()
	}
}
