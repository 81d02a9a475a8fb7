use crate::error::ProvisionError;
use std::{
	fs,
	io::Write,
	path::{Path, PathBuf},
};

/// Where generated artifacts live inside the state directory.
#[derive(Debug, Clone)]
pub struct Layout {
	root: PathBuf,
}

impl Layout {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Layout { root: root.into() }
	}

	pub fn certs(&self) -> PathBuf {
		self.root.join("certs")
	}

	pub fn kubeconfigs(&self) -> PathBuf {
		self.root.join("kubeconfigs")
	}

	/// Rendered configuration files destined for one host.
	pub fn host_configs(&self, host: &str) -> PathBuf {
		self.root.join("configs").join(host)
	}

	pub fn cluster_configs(&self) -> PathBuf {
		self.host_configs("cluster")
	}

	pub fn state_file(&self) -> PathBuf {
		self.root.join("state.json")
	}

	pub fn inventory_file(&self) -> PathBuf {
		self.root.join("inventory.json")
	}

	pub fn encryption_key(&self) -> PathBuf {
		self.root.join("encryption-key")
	}

	pub fn cert(&self, identity: &str) -> PathBuf {
		self.certs().join(format!("{identity}.pem"))
	}

	pub fn cert_key(&self, identity: &str) -> PathBuf {
		self.certs().join(format!("{identity}-key.pem"))
	}

	pub fn kubeconfig(&self, identity: &str) -> PathBuf {
		self.kubeconfigs().join(format!("{identity}.kubeconfig"))
	}

	pub fn ensure(&self) -> Result<(), ProvisionError> {
		for dir in [self.root.clone(), self.certs(), self.kubeconfigs()] {
			fs::create_dir_all(dir)?;
		}
		Ok(())
	}
}

/// Replaces `path` in one rename so readers never see a half written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ProvisionError> {
	let dir = path.parent().unwrap_or_else(|| Path::new("."));
	fs::create_dir_all(dir)?;
	let mut file = tempfile::NamedTempFile::new_in(dir)?;
	file.write_all(contents)?;
	file.as_file().sync_all()?;
	file.persist(path).map_err(|err| ProvisionError::Io(err.error))?;
	Ok(())
}
