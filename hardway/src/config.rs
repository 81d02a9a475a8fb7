use crate::error::ProvisionError;
use crate::setup::utils::validate::{self, Cidr};
use serde::{Deserialize, Serialize};
use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};
use tracing::info;

pub const DEFAULT_CONFIG_FILE: &str = "hardway.toml";

/// Cluster description. Every field defaults to the values of a standard
/// three controller, three worker "hard way" cluster in us-west1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
	pub project: Option<String>,
	pub region: String,
	pub zone: String,
	/// Names the VPC network, the public address and the instance tag.
	pub cluster_name: String,
	pub subnet_name: String,
	pub subnet_cidr: String,
	pub cluster_cidr: String,
	pub service_cidr: String,
	pub cluster_dns: String,
	pub controllers: u8,
	pub workers: u8,
	pub state_dir: PathBuf,
	pub template_dir: Option<PathBuf>,
	pub parallelism: usize,
	pub machine: MachineConfig,
	pub versions: Versions,
	pub subject: CertificateSubject,
	pub exec: ExecConfig,
	pub transport: TransportConfig,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			project: None,
			region: "us-west1".to_owned(),
			zone: "us-west1-c".to_owned(),
			cluster_name: "kubernetes-the-hard-way".to_owned(),
			subnet_name: "kubernetes".to_owned(),
			subnet_cidr: "10.240.0.0/24".to_owned(),
			cluster_cidr: "10.200.0.0/16".to_owned(),
			service_cidr: "10.32.0.0/24".to_owned(),
			cluster_dns: "10.32.0.10".to_owned(),
			controllers: 3,
			workers: 3,
			state_dir: PathBuf::from(".hardway"),
			template_dir: None,
			parallelism: 3,
			machine: MachineConfig::default(),
			versions: Versions::default(),
			subject: CertificateSubject::default(),
			exec: ExecConfig::default(),
			transport: TransportConfig::default(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
	pub machine_type: String,
	pub image_family: String,
	pub image_project: String,
	pub boot_disk_size: String,
	pub scopes: Vec<String>,
}

impl Default for MachineConfig {
	fn default() -> Self {
		MachineConfig {
			machine_type: "n1-standard-1".to_owned(),
			image_family: "ubuntu-1804-lts".to_owned(),
			image_project: "ubuntu-os-cloud".to_owned(),
			boot_disk_size: "200GB".to_owned(),
			scopes: [
				"compute-rw",
				"storage-ro",
				"service-management",
				"service-control",
				"logging-write",
				"monitoring",
			]
			.into_iter()
			.map(str::to_owned)
			.collect(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Versions {
	pub kubernetes: String,
	pub etcd: String,
	pub cni_plugins: String,
	pub containerd: String,
	pub runc: String,
	pub crictl: String,
}

impl Default for Versions {
	fn default() -> Self {
		Versions {
			kubernetes: "v1.10.2".to_owned(),
			etcd: "v3.3.5".to_owned(),
			cni_plugins: "v0.6.0".to_owned(),
			containerd: "1.1.0".to_owned(),
			runc: "v1.0.0-rc5".to_owned(),
			crictl: "v1.0.0-beta.0".to_owned(),
		}
	}
}

/// Distinguished name fields shared by every certificate request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CertificateSubject {
	pub country: String,
	pub locality: String,
	pub state: String,
	pub organizational_unit: String,
	pub expiry: String,
}

impl Default for CertificateSubject {
	fn default() -> Self {
		CertificateSubject {
			country: "US".to_owned(),
			locality: "Portland".to_owned(),
			state: "Oregon".to_owned(),
			organizational_unit: "Kubernetes The Hard Way".to_owned(),
			expiry: "8760h".to_owned(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecConfig {
	pub timeout_secs: u64,
	pub remote_timeout_secs: u64,
	pub retries: u32,
	pub backoff_ms: u64,
}

impl Default for ExecConfig {
	fn default() -> Self {
		ExecConfig {
			timeout_secs: 300,
			remote_timeout_secs: 900,
			retries: 3,
			backoff_ms: 2000,
		}
	}
}

impl ExecConfig {
	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}

	pub fn remote_timeout(&self) -> Duration {
		Duration::from_secs(self.remote_timeout_secs)
	}

	pub fn backoff(&self) -> Duration {
		Duration::from_millis(self.backoff_ms)
	}
}

/// How commands reach the cluster machines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransportConfig {
	/// `gcloud compute ssh` and `gcloud compute scp`.
	#[default]
	Gcloud,
	/// Direct SSH to each node's external address.
	Ssh {
		user: String,
		key_path: PathBuf,
		#[serde(default = "default_ssh_port")]
		port: u16,
	},
}

fn default_ssh_port() -> u16 {
	22
}

impl Config {
	/// Reads the given file, or `hardway.toml` in the working directory when it
	/// exists, falling back to the defaults.
	pub fn load(path: Option<&Path>) -> Result<Self, ProvisionError> {
		let config = match path {
			Some(path) => Config::from_file(path)?,
			None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
				Config::from_file(Path::new(DEFAULT_CONFIG_FILE))?
			}
			None => {
				info!("No configuration file found, using defaults.");
				Config::default()
			}
		};
		config.validate()?;
		Ok(config)
	}

	fn from_file(path: &Path) -> Result<Self, ProvisionError> {
		info!("Loading configuration from {}.", path.display());
		let txt = fs::read_to_string(path).map_err(|err| {
			ProvisionError::Config(format!("cannot read {}: {err}", path.display()))
		})?;
		Ok(toml::from_str(&txt)?)
	}

	pub fn validate(&self) -> Result<(), ProvisionError> {
		for name in [&self.cluster_name, &self.subnet_name] {
			validate::resource_name(name).map_err(|err| ProvisionError::Config(err.to_string()))?;
		}
		if !(1..=10).contains(&self.controllers) {
			return Err(ProvisionError::Config(
				"controllers must be between 1 and 10".to_owned(),
			));
		}
		if !(1..=10).contains(&self.workers) {
			return Err(ProvisionError::Config(
				"workers must be between 1 and 10".to_owned(),
			));
		}
		if self.parallelism == 0 {
			return Err(ProvisionError::Config(
				"parallelism must be at least 1".to_owned(),
			));
		}
		let subnet = self.subnet_cidr()?;
		if subnet.host(20 + u32::from(self.workers)).is_none() {
			return Err(ProvisionError::Config(format!(
				"subnet {subnet} is too small for the node addresses"
			)));
		}
		let cluster = self.cluster_cidr()?;
		if cluster.subnet(24, u32::from(self.workers) - 1).is_none() {
			return Err(ProvisionError::Config(format!(
				"cluster CIDR {cluster} cannot hold a /24 per worker"
			)));
		}
		let service = self.service_cidr()?;
		let dns = self
			.cluster_dns
			.parse()
			.map_err(|_| {
				ProvisionError::Config(format!("'{}' is not an IPv4 address", self.cluster_dns))
			})?;
		if !service.contains(dns) {
			return Err(ProvisionError::Config(format!(
				"cluster DNS {dns} is outside the service CIDR {service}"
			)));
		}
		Ok(())
	}

	pub fn subnet_cidr(&self) -> Result<Cidr, ProvisionError> {
		parse_cidr("subnet_cidr", &self.subnet_cidr)
	}

	pub fn cluster_cidr(&self) -> Result<Cidr, ProvisionError> {
		parse_cidr("cluster_cidr", &self.cluster_cidr)
	}

	pub fn service_cidr(&self) -> Result<Cidr, ProvisionError> {
		parse_cidr("service_cidr", &self.service_cidr)
	}
}

fn parse_cidr(field: &str, value: &str) -> Result<Cidr, ProvisionError> {
	value
		.parse()
		.map_err(|err| ProvisionError::Config(format!("{field}: {err}")))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_describe_the_standard_cluster() {
		let config = Config::default();
		assert!(config.validate().is_ok());
		assert_eq!(config.region, "us-west1");
		assert_eq!(config.zone, "us-west1-c");
		assert_eq!(config.cluster_name, "kubernetes-the-hard-way");
		assert_eq!(config.subnet_cidr, "10.240.0.0/24");
		assert_eq!(config.controllers, 3);
		assert_eq!(config.workers, 3);
		assert_eq!(config.machine.machine_type, "n1-standard-1");
		assert_eq!(config.transport, TransportConfig::Gcloud);
	}

	#[test]
	fn partial_file_keeps_defaults() {
		let config: Config = toml::from_str(
			r#"
			zone = "europe-west1-b"
			workers = 2

			[versions]
			kubernetes = "v1.11.0"

			[transport]
			kind = "ssh"
			user = "ops"
			key_path = "/home/ops/.ssh/id_ed25519"
			"#,
		)
		.unwrap();
		assert!(config.validate().is_ok());
		assert_eq!(config.zone, "europe-west1-b");
		assert_eq!(config.region, "us-west1");
		assert_eq!(config.workers, 2);
		assert_eq!(config.versions.kubernetes, "v1.11.0");
		assert_eq!(config.versions.etcd, "v3.3.5");
		assert_eq!(
			config.transport,
			TransportConfig::Ssh {
				user: "ops".to_owned(),
				key_path: PathBuf::from("/home/ops/.ssh/id_ed25519"),
				port: 22,
			}
		);
	}

	#[test]
	fn unknown_fields_are_rejected() {
		assert!(toml::from_str::<Config>("zones = \"us-west1-a\"").is_err());
	}

	#[test]
	fn validation_catches_bad_networks() {
		let config = Config {
			subnet_cidr: "10.240.0.1/24".to_owned(),
			..Config::default()
		};
		assert!(matches!(config.validate(), Err(ProvisionError::Config(_))));
		let config = Config {
			cluster_dns: "10.33.0.10".to_owned(),
			..Config::default()
		};
		assert!(config.validate().is_err());
		let config = Config {
			workers: 0,
			..Config::default()
		};
		assert!(config.validate().is_err());
		let config = Config {
			cluster_name: "Kubernetes".to_owned(),
			..Config::default()
		};
		assert!(config.validate().is_err());
	}
}
