use super::{ProcessOutput, Transport};
use crate::error::ProvisionError;
use crate::setup::utils::inventory::InventorySnapshot;
use async_trait::async_trait;
use russh::{
	ChannelMsg, Disconnect, Preferred,
	client::{Config, Handle, Handler, connect},
	keys::{key::PrivateKeyWithHashAlg, load_secret_key, ssh_key::PublicKey},
};
use std::{
	borrow::Cow,
	net::SocketAddr,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};
use tracing::debug;

struct SshClient {}

impl Handler for SshClient {
	type Error = russh::Error;

	async fn check_server_key(
		&mut self,
		_server_public_key: &PublicKey,
	) -> Result<bool, Self::Error> {
		Ok(true)
	}
}

/// One authenticated SSH session to a node.
pub struct Agent {
	host: String,
	session: Handle<SshClient>,
}

impl Agent {
	pub async fn connect(
		host: &str,
		addr: SocketAddr,
		user: &str,
		key_path: &Path,
	) -> Result<Self, ProvisionError> {
		let failed = |message: String| ProvisionError::Transport {
			host: host.to_owned(),
			message,
		};
		let key_pair = load_secret_key(key_path, None)
			.map_err(|err| failed(format!("cannot load key {}: {err}", key_path.display())))?;
		let config = Config {
			inactivity_timeout: Some(Duration::from_secs(30)),
			preferred: Preferred {
				kex: Cow::Owned(vec![
					russh::kex::CURVE25519_PRE_RFC_8731,
					russh::kex::EXTENSION_SUPPORT_AS_CLIENT,
				]),
				..Default::default()
			},
			..<_>::default()
		};
		let config = Arc::new(config);
		let sh = SshClient {};
		let mut session = connect(config, addr, sh)
			.await
			.map_err(|err| failed(err.to_string()))?;
		let hash_alg = session
			.best_supported_rsa_hash()
			.await
			.map_err(|err| failed(err.to_string()))?
			.flatten();
		let auth_res = session
			.authenticate_publickey(
				user,
				PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
			)
			.await
			.map_err(|err| failed(err.to_string()))?;
		if !auth_res.success() {
			return Err(failed(format!("public key authentication as {user} was rejected")));
		}
		Ok(Self {
			host: host.to_owned(),
			session,
		})
	}

	pub async fn execute(
		&mut self,
		command: &str,
		stdin: Option<&[u8]>,
	) -> Result<ProcessOutput, ProvisionError> {
		let failed = |err: russh::Error| ProvisionError::Transport {
			host: self.host.clone(),
			message: err.to_string(),
		};
		let mut channel = self.session.channel_open_session().await.map_err(failed)?;
		channel.exec(true, command).await.map_err(failed)?;
		if let Some(bytes) = stdin {
			channel.data(bytes).await.map_err(failed)?;
			channel.eof().await.map_err(failed)?;
		}
		let mut code = None;
		let mut stdout = Vec::new();
		let mut stderr = Vec::new();
		loop {
			let Some(msg) = channel.wait().await else {
				break;
			};
			match msg {
				ChannelMsg::Data { ref data } => {
					stdout.extend_from_slice(data);
				}
				ChannelMsg::ExtendedData { ref data, ext: 1 } => {
					stderr.extend_from_slice(data);
				}
				ChannelMsg::ExitStatus { exit_status } => {
					code = Some(exit_status);
				}
				_ => {}
			}
		}
		let Some(code) = code else {
			return Err(ProvisionError::Transport {
				host: self.host.clone(),
				message: format!("channel closed before '{command}' exited"),
			});
		};
		Ok(ProcessOutput {
			code: i32::try_from(code).ok(),
			stdout: String::from_utf8_lossy(&stdout).into_owned(),
			stderr: String::from_utf8_lossy(&stderr).trim().to_owned(),
		})
	}

	pub async fn close(&mut self) -> Result<(), ProvisionError> {
		self.session
			.disconnect(Disconnect::ByApplication, "Disconnected", "English")
			.await
			.map_err(|err| ProvisionError::Transport {
				host: self.host.clone(),
				message: err.to_string(),
			})
	}
}

/// Direct SSH to the external address recorded for each node.
pub struct SshTransport {
	user: String,
	key_path: PathBuf,
	port: u16,
	inventory_file: PathBuf,
}

impl SshTransport {
	pub fn new(user: &str, key_path: &Path, port: u16, inventory_file: &Path) -> Self {
		SshTransport {
			user: user.to_owned(),
			key_path: key_path.to_owned(),
			port,
			inventory_file: inventory_file.to_owned(),
		}
	}

	fn address(&self, host: &str) -> Result<SocketAddr, ProvisionError> {
		let snapshot = InventorySnapshot::load(&self.inventory_file)?;
		let node = snapshot.nodes.get(host).ok_or_else(|| {
			ProvisionError::State(format!(
				"no resolved address for '{host}'; run the compute step first"
			))
		})?;
		Ok(SocketAddr::from((node.external_ip, self.port)))
	}

	async fn open(&self, host: &str) -> Result<Agent, ProvisionError> {
		let addr = self.address(host)?;
		debug!("Opening SSH session to {host} at {addr}.");
		Agent::connect(host, addr, &self.user, &self.key_path).await
	}
}

/// `cat > NAME` writing stdin to the file's name in the remote home directory.
fn upload_command(file: &Path) -> Result<String, ProvisionError> {
	let name = file
		.file_name()
		.map(|name| name.to_string_lossy().into_owned())
		.ok_or_else(|| {
			ProvisionError::InvalidArgument(format!("{} has no file name", file.display()))
		})?;
	let quoted = shlex::try_quote(&name).map_err(|err| {
		ProvisionError::InvalidArgument(format!("cannot quote '{name}': {err}"))
	})?;
	Ok(format!("cat > {quoted}"))
}

async fn finish<T>(
	mut agent: Agent,
	result: Result<T, ProvisionError>,
) -> Result<T, ProvisionError> {
	if let Err(err) = agent.close().await {
		debug!("Ignoring SSH disconnect failure: {err}");
	}
	result
}

#[async_trait]
impl Transport for SshTransport {
	async fn run(
		&self,
		host: &str,
		command: &str,
		_capture: bool,
	) -> Result<ProcessOutput, ProvisionError> {
		let mut agent = self.open(host).await?;
		let result = agent.execute(command, None).await;
		finish(agent, result).await
	}

	async fn upload(
		&self,
		host: &str,
		files: &[PathBuf],
	) -> Result<ProcessOutput, ProvisionError> {
		let mut uploads = Vec::with_capacity(files.len());
		for file in files {
			uploads.push((upload_command(file)?, tokio::fs::read(file).await?));
		}
		let mut agent = self.open(host).await?;
		let mut result = Ok(ProcessOutput::default());
		for (command, bytes) in &uploads {
			result = agent.execute(command, Some(bytes)).await;
			if !result.as_ref().is_ok_and(ProcessOutput::success) {
				break;
			}
		}
		finish(agent, result).await
	}
}
