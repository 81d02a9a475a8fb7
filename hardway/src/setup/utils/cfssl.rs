use crate::config::CertificateSubject;
use crate::error::ProvisionError;
use crate::exec::CommandSpec;
use crate::setup::utils::layout::{Layout, write_atomic};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, os::unix::fs::PermissionsExt, path::Path};

pub const PROGRAM: &str = "cfssl";
pub const PROFILE: &str = "kubernetes";
pub const CA: &str = "ca";

/// A certificate identity and the subject it is issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	/// File stem of the generated `{name}.pem` and `{name}-key.pem`.
	pub name: String,
	pub common_name: String,
	pub organization: String,
	/// Subject alternative names, empty for pure client certificates.
	pub hostnames: Vec<String>,
}

impl Identity {
	fn new(name: &str, common_name: &str, organization: &str) -> Self {
		Identity {
			name: name.to_owned(),
			common_name: common_name.to_owned(),
			organization: organization.to_owned(),
			hostnames: Vec::new(),
		}
	}

	pub fn ca() -> Self {
		Identity::new(CA, "Kubernetes", "Kubernetes")
	}

	pub fn admin() -> Self {
		Identity::new("admin", "admin", "system:masters")
	}

	pub fn worker(name: &str, hostnames: Vec<String>) -> Self {
		Identity {
			hostnames,
			..Identity::new(name, &format!("system:node:{name}"), "system:nodes")
		}
	}

	pub fn controller_manager() -> Self {
		Identity::new(
			"kube-controller-manager",
			"system:kube-controller-manager",
			"system:kube-controller-manager",
		)
	}

	pub fn kube_proxy() -> Self {
		Identity::new("kube-proxy", "system:kube-proxy", "system:node-proxier")
	}

	pub fn scheduler() -> Self {
		Identity::new("kube-scheduler", "system:kube-scheduler", "system:kube-scheduler")
	}

	pub fn api_server(hostnames: Vec<String>) -> Self {
		Identity {
			hostnames,
			..Identity::new("kubernetes", "kubernetes", "Kubernetes")
		}
	}

	pub fn service_account() -> Self {
		Identity::new("service-account", "service-accounts", "Kubernetes")
	}

	pub fn csr(&self, subject: &CertificateSubject) -> CsrRequest {
		let organizational_unit = if self.name == CA {
			"CA".to_owned()
		} else {
			subject.organizational_unit.clone()
		};
		CsrRequest {
			common_name: self.common_name.clone(),
			key: KeyRequest {
				algo: "rsa".to_owned(),
				size: 2048,
			},
			names: vec![SubjectName {
				country: subject.country.clone(),
				locality: subject.locality.clone(),
				organization: self.organization.clone(),
				organizational_unit,
				state: subject.state.clone(),
			}],
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsrRequest {
	#[serde(rename = "CN")]
	pub common_name: String,
	pub key: KeyRequest,
	pub names: Vec<SubjectName>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyRequest {
	pub algo: String,
	pub size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubjectName {
	#[serde(rename = "C")]
	pub country: String,
	#[serde(rename = "L")]
	pub locality: String,
	#[serde(rename = "O")]
	pub organization: String,
	#[serde(rename = "OU")]
	pub organizational_unit: String,
	#[serde(rename = "ST")]
	pub state: String,
}

/// The `ca-config.json` signing policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaConfig {
	pub signing: Signing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signing {
	pub default: SigningProfile,
	pub profiles: BTreeMap<String, SigningProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SigningProfile {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub usages: Vec<String>,
	pub expiry: String,
}

impl CaConfig {
	pub fn new(expiry: &str) -> Self {
		let profile = SigningProfile {
			usages: ["signing", "key encipherment", "server auth", "client auth"]
				.map(str::to_owned)
				.to_vec(),
			expiry: expiry.to_owned(),
		};
		CaConfig {
			signing: Signing {
				default: SigningProfile {
					usages: Vec::new(),
					expiry: expiry.to_owned(),
				},
				profiles: BTreeMap::from([(PROFILE.to_owned(), profile)]),
			},
		}
	}

	pub fn path(layout: &Layout) -> std::path::PathBuf {
		layout.certs().join("ca-config.json")
	}
}

/// What `cfssl gencert` prints on stdout.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CfsslOutput {
	pub cert: String,
	pub key: String,
	#[serde(default)]
	pub csr: String,
}

impl CfsslOutput {
	pub fn parse(stdout: &str) -> Result<Self, ProvisionError> {
		let output: CfsslOutput = serde_json::from_str(stdout)?;
		if output.cert.is_empty() || output.key.is_empty() {
			return Err(ProvisionError::State(
				"cfssl returned an empty certificate or key".to_owned(),
			));
		}
		Ok(output)
	}

	/// Writes `{name}.pem` and an owner-only `{name}-key.pem`.
	pub fn write(&self, layout: &Layout, name: &str) -> Result<(), ProvisionError> {
		let key = layout.cert_key(name);
		write_atomic(&key, self.key.as_bytes())?;
		fs::set_permissions(&key, fs::Permissions::from_mode(0o600))?;
		write_atomic(&layout.cert(name), self.cert.as_bytes())?;
		Ok(())
	}
}

/// `cfssl gencert -initca -` with the CA request on stdin.
pub fn init_ca(csr: &CsrRequest) -> Result<CommandSpec, ProvisionError> {
	Ok(CommandSpec::new(PROGRAM)
		.args(["gencert", "-initca", "-"])
		.stdin(serde_json::to_vec(csr)?))
}

/// `cfssl gencert` signing the request on stdin with the cluster CA.
pub fn gencert(
	layout: &Layout,
	identity: &Identity,
	csr: &CsrRequest,
) -> Result<CommandSpec, ProvisionError> {
	let flag = |name: &str, path: &Path| format!("-{name}={}", path.to_string_lossy());
	let mut spec = CommandSpec::new(PROGRAM).args([
		"gencert".to_owned(),
		flag("ca", &layout.cert(CA)),
		flag("ca-key", &layout.cert_key(CA)),
		flag("config", &CaConfig::path(layout)),
	]);
	if !identity.hostnames.is_empty() {
		spec = spec.arg(format!("-hostname={}", identity.hostnames.join(",")));
	}
	Ok(spec
		.arg(format!("-profile={PROFILE}"))
		.arg("-")
		.stdin(serde_json::to_vec(csr)?))
}
