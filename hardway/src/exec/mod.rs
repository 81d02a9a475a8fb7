//! Command execution for local tools and remote hosts.
//!
//! Every external call goes through [`Executor`], which applies the timeout,
//! retries connection failures with exponential backoff and turns a non-zero
//! exit into [`ProvisionError::Execution`]. Local processes are started by a
//! [`Launcher`], remote commands by a [`Transport`], so step code never cares
//! where a command ends up running.

pub mod ssh;
pub mod transport;

#[cfg(test)]
pub mod testing;

pub use transport::{GcloudTransport, Transport};

use crate::config::ExecConfig;
use crate::error::ProvisionError;
use async_trait::async_trait;
use std::{
	fmt,
	future::Future,
	path::PathBuf,
	process::Stdio,
	sync::Arc,
	time::Duration,
};
use tokio::{io::AsyncWriteExt, process::Command, time};
use tracing::{debug, warn};

/// A program invocation with its arguments kept apart, never a shell string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
	pub program: String,
	pub args: Vec<String>,
	pub stdin: Option<Vec<u8>>,
	pub env: Vec<(String, String)>,
}

impl CommandSpec {
	pub fn new(program: impl Into<String>) -> Self {
		CommandSpec {
			program: program.into(),
			..CommandSpec::default()
		}
	}

	pub fn arg(mut self, arg: impl Into<String>) -> Self {
		self.args.push(arg.into());
		self
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.args.extend(args.into_iter().map(Into::into));
		self
	}

	pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
		self.stdin = Some(bytes.into());
		self
	}

	pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.env.push((key.into(), value.into()));
		self
	}

	/// Quoted command line suitable for a remote POSIX shell.
	pub fn to_shell(&self) -> Result<String, ProvisionError> {
		if self.stdin.is_some() {
			return Err(ProvisionError::InvalidArgument(format!(
				"'{}' needs stdin, which remote execution does not forward",
				self.program
			)));
		}
		let quote = |word: &str| {
			shlex::try_quote(word)
				.map(|quoted| quoted.into_owned())
				.map_err(|err| {
					ProvisionError::InvalidArgument(format!("cannot quote '{word}': {err}"))
				})
		};
		let mut words = Vec::new();
		for (key, value) in &self.env {
			words.push(format!("{key}={}", quote(value)?));
		}
		words.push(quote(&self.program)?);
		for arg in &self.args {
			words.push(quote(arg)?);
		}
		Ok(words.join(" "))
	}
}

impl fmt::Display for CommandSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let line = shlex::try_join(
			std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)),
		)
		.unwrap_or_else(|_| format!("{} {}", self.program, self.args.join(" ")));
		f.write_str(&line)
	}
}

/// Wraps a multi-line script so it runs under strict bash on the remote side.
pub fn script(lines: &[String]) -> String {
	let body = format!("set -euo pipefail\n{}", lines.join("\n"));
	let quoted = shlex::try_quote(&body)
		.map(|quoted| quoted.into_owned())
		.unwrap_or_else(|_| format!("'{}'", body.replace('\0', "")));
	format!("bash -c {quoted}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOptions {
	pub capture_output: bool,
	pub timeout: Duration,
	pub retries: u32,
	pub backoff: Duration,
}

impl ExecOptions {
	pub fn local(config: &ExecConfig) -> Self {
		ExecOptions {
			capture_output: true,
			timeout: config.timeout(),
			retries: config.retries,
			backoff: config.backoff(),
		}
	}

	pub fn remote(config: &ExecConfig) -> Self {
		ExecOptions {
			timeout: config.remote_timeout(),
			..ExecOptions::local(config)
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
	pub code: Option<i32>,
	pub stdout: String,
	pub stderr: String,
}

impl ProcessOutput {
	pub fn success(&self) -> bool {
		self.code == Some(0)
	}
}

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
	Local,
	Host(String),
}

/// Starts local processes.
#[async_trait]
pub trait Launcher: Send + Sync {
	async fn launch(
		&self,
		spec: &CommandSpec,
		capture: bool,
	) -> Result<ProcessOutput, ProvisionError>;
}

pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
	async fn launch(
		&self,
		spec: &CommandSpec,
		capture: bool,
	) -> Result<ProcessOutput, ProvisionError> {
		let mut command = Command::new(&spec.program);
		command
			.args(&spec.args)
			.envs(spec.env.iter().map(|(key, value)| (key, value)))
			.kill_on_drop(true)
			.stdin(if spec.stdin.is_some() {
				Stdio::piped()
			} else {
				Stdio::null()
			});
		if capture {
			command.stdout(Stdio::piped()).stderr(Stdio::piped());
		} else {
			command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
		}
		let mut child = command.spawn().map_err(|source| ProvisionError::CommandLaunch {
			cmd: spec.to_string(),
			source,
		})?;
		if let (Some(bytes), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
			stdin.write_all(bytes).await?;
			stdin.shutdown().await?;
		}
		let output = child
			.wait_with_output()
			.await
			.map_err(|source| ProvisionError::CommandLaunch {
				cmd: spec.to_string(),
				source,
			})?;
		Ok(ProcessOutput {
			code: output.status.code(),
			stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
			stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
		})
	}
}

#[derive(Clone)]
pub struct Executor {
	launcher: Arc<dyn Launcher>,
	transport: Arc<dyn Transport>,
	local: ExecOptions,
	remote: ExecOptions,
}

impl Executor {
	pub fn new(
		launcher: Arc<dyn Launcher>,
		transport: Arc<dyn Transport>,
		local: ExecOptions,
		remote: ExecOptions,
	) -> Self {
		Executor {
			launcher,
			transport,
			local,
			remote,
		}
	}

	pub async fn execute(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProvisionError> {
		self.execute_with(spec, &self.local).await
	}

	pub async fn execute_with(
		&self,
		spec: &CommandSpec,
		opts: &ExecOptions,
	) -> Result<ProcessOutput, ProvisionError> {
		let cmd = spec.to_string();
		debug!("Running: {cmd}");
		self.attempt(&cmd, opts, || self.launcher.launch(spec, opts.capture_output))
			.await
	}

	pub async fn execute_remote(
		&self,
		host: &str,
		command: &str,
	) -> Result<ProcessOutput, ProvisionError> {
		self.execute_remote_with(host, command, &self.remote).await
	}

	pub async fn execute_remote_with(
		&self,
		host: &str,
		command: &str,
		opts: &ExecOptions,
	) -> Result<ProcessOutput, ProvisionError> {
		let cmd = format!("{host}: {command}");
		debug!("Running on {host}: {command}");
		self.attempt(&cmd, opts, || self.transport.run(host, command, opts.capture_output))
			.await
	}

	/// Runs the same command locally or on a host.
	pub async fn run(
		&self,
		target: &Target,
		spec: &CommandSpec,
	) -> Result<ProcessOutput, ProvisionError> {
		match target {
			Target::Local => self.execute(spec).await,
			Target::Host(host) => self.execute_remote(host, &spec.to_shell()?).await,
		}
	}

	/// Copies local files into the remote user's home directory.
	pub async fn upload(&self, host: &str, files: &[PathBuf]) -> Result<(), ProvisionError> {
		let names = files
			.iter()
			.map(|file| file.to_string_lossy())
			.collect::<Vec<_>>()
			.join(" ");
		let cmd = format!("upload {names} to {host}");
		debug!("{cmd}");
		self.attempt(&cmd, &self.remote, || self.transport.upload(host, files))
			.await?;
		Ok(())
	}

	async fn attempt<F, Fut>(
		&self,
		cmd: &str,
		opts: &ExecOptions,
		mut op: F,
	) -> Result<ProcessOutput, ProvisionError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<ProcessOutput, ProvisionError>>,
	{
		let mut attempt = 0;
		loop {
			let result = match time::timeout(opts.timeout, op()).await {
				Ok(result) => result,
				Err(_) => Err(ProvisionError::Timeout {
					cmd: cmd.to_owned(),
					after: opts.timeout,
				}),
			};
			match result {
				Ok(output) if output.success() => return Ok(output),
				Ok(output) => {
					return Err(ProvisionError::Execution {
						cmd: cmd.to_owned(),
						code: output.code,
						stderr: output.stderr,
					});
				}
				Err(err) if err.is_transient() && attempt < opts.retries => {
					let delay = opts.backoff.saturating_mul(2u32.saturating_pow(attempt));
					attempt += 1;
					warn!(
						"{err} Retrying in {delay:?} (attempt {attempt} of {}).",
						opts.retries
					);
					time::sleep(delay).await;
				}
				Err(err) => return Err(err),
			}
		}
	}
}
