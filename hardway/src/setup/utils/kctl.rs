use crate::error::ProvisionError;
use crate::exec::CommandSpec;
use crate::setup::utils::validate;
use std::path::Path;

pub const PROGRAM: &str = "kubectl";
pub const CONTEXT: &str = "default";
pub const API_PORT: u16 = 6443;

/// Inputs for one client kubeconfig.
#[derive(Debug, Clone)]
pub struct KubeconfigSpec<'a> {
	pub cluster: &'a str,
	pub user: &'a str,
	pub server: String,
	pub ca: &'a Path,
	pub cert: &'a Path,
	pub key: &'a Path,
	pub kubeconfig: &'a Path,
}

fn path_flag(name: &str, path: &Path) -> String {
	format!("--{name}={}", path.to_string_lossy())
}

pub fn server(address: impl std::fmt::Display) -> String {
	format!("https://{address}:{API_PORT}")
}

pub fn set_cluster(spec: &KubeconfigSpec<'_>) -> Result<CommandSpec, ProvisionError> {
	let cluster = validate::resource_name(spec.cluster)?;
	Ok(CommandSpec::new(PROGRAM).args([
		"config".to_owned(),
		"set-cluster".to_owned(),
		cluster.to_owned(),
		path_flag("certificate-authority", spec.ca),
		"--embed-certs=true".to_owned(),
		format!("--server={}", spec.server),
		path_flag("kubeconfig", spec.kubeconfig),
	]))
}

pub fn set_credentials(spec: &KubeconfigSpec<'_>) -> CommandSpec {
	CommandSpec::new(PROGRAM).args([
		"config".to_owned(),
		"set-credentials".to_owned(),
		spec.user.to_owned(),
		path_flag("client-certificate", spec.cert),
		path_flag("client-key", spec.key),
		"--embed-certs=true".to_owned(),
		path_flag("kubeconfig", spec.kubeconfig),
	])
}

pub fn set_context(spec: &KubeconfigSpec<'_>) -> CommandSpec {
	CommandSpec::new(PROGRAM).args([
		"config".to_owned(),
		"set-context".to_owned(),
		CONTEXT.to_owned(),
		format!("--cluster={}", spec.cluster),
		format!("--user={}", spec.user),
		path_flag("kubeconfig", spec.kubeconfig),
	])
}

pub fn use_context(kubeconfig: &Path) -> CommandSpec {
	CommandSpec::new(PROGRAM).args([
		"config".to_owned(),
		"use-context".to_owned(),
		CONTEXT.to_owned(),
		path_flag("kubeconfig", kubeconfig),
	])
}

/// The four `kubectl config` calls that assemble a kubeconfig, in order.
pub fn kubeconfig(spec: &KubeconfigSpec<'_>) -> Result<Vec<CommandSpec>, ProvisionError> {
	Ok(vec![
		set_cluster(spec)?,
		set_credentials(spec),
		set_context(spec),
		use_context(spec.kubeconfig),
	])
}

pub fn client_version() -> CommandSpec {
	CommandSpec::new(PROGRAM).args(["version", "--client"])
}

/// Applies a manifest already present on the target, using a kubeconfig
/// relative to the target's working directory.
pub fn apply(kubeconfig: &str, manifest: &str) -> CommandSpec {
	CommandSpec::new(PROGRAM).args([
		"apply".to_owned(),
		format!("--kubeconfig={kubeconfig}"),
		"-f".to_owned(),
		manifest.to_owned(),
	])
}

fn get(resource: &str, kubeconfig: &str) -> CommandSpec {
	CommandSpec::new(PROGRAM).args([
		"get".to_owned(),
		resource.to_owned(),
		format!("--kubeconfig={kubeconfig}"),
	])
}

pub fn get_componentstatuses(kubeconfig: &str) -> CommandSpec {
	get("componentstatuses", kubeconfig)
}

pub fn get_nodes(kubeconfig: &str) -> CommandSpec {
	get("nodes", kubeconfig)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kubeconfig_is_built_from_four_config_calls() {
		let spec = KubeconfigSpec {
			cluster: "kubernetes-the-hard-way",
			user: "system:node:worker-0",
			server: server("35.1.2.3"),
			ca: Path::new("certs/ca.pem"),
			cert: Path::new("certs/worker-0.pem"),
			key: Path::new("certs/worker-0-key.pem"),
			kubeconfig: Path::new("kubeconfigs/worker-0.kubeconfig"),
		};
		let calls = kubeconfig(&spec).unwrap();
		assert_eq!(
			calls[0].args,
			[
				"config",
				"set-cluster",
				"kubernetes-the-hard-way",
				"--certificate-authority=certs/ca.pem",
				"--embed-certs=true",
				"--server=https://35.1.2.3:6443",
				"--kubeconfig=kubeconfigs/worker-0.kubeconfig",
			]
		);
		assert_eq!(calls[1].args[2], "system:node:worker-0");
		assert_eq!(
			calls[2].args[3..5],
			["--cluster=kubernetes-the-hard-way", "--user=system:node:worker-0"]
		);
		assert_eq!(
			calls[3].args,
			["config", "use-context", "default", "--kubeconfig=kubeconfigs/worker-0.kubeconfig"]
		);
	}

	#[test]
	fn cluster_names_are_validated() {
		let spec = KubeconfigSpec {
			cluster: "Bad Name",
			user: "admin",
			server: server("127.0.0.1"),
			ca: Path::new("ca.pem"),
			cert: Path::new("admin.pem"),
			key: Path::new("admin-key.pem"),
			kubeconfig: Path::new("admin.kubeconfig"),
		};
		assert!(matches!(
			kubeconfig(&spec),
			Err(ProvisionError::InvalidArgument(_))
		));
	}

	#[test]
	fn apply_uses_remote_relative_paths() {
		let spec = apply("admin.kubeconfig", "kube-apiserver-to-kubelet.yaml");
		assert_eq!(spec.program, "kubectl");
		assert_eq!(
			spec.args,
			["apply", "--kubeconfig=admin.kubeconfig", "-f", "kube-apiserver-to-kubelet.yaml"]
		);
	}

	#[test]
	fn status_queries_read_through_the_admin_kubeconfig() {
		let line = get_nodes("admin.kubeconfig").to_shell().unwrap();
		assert_eq!(
			shlex::split(&line).unwrap(),
			["kubectl", "get", "nodes", "--kubeconfig=admin.kubeconfig"]
		);
		assert_eq!(get_componentstatuses("admin.kubeconfig").args[1], "componentstatuses");
	}
}
