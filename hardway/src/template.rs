//! Configuration files rendered per host from versioned handlebars templates.
//!
//! Built-in templates are compiled into the binary. A configured template
//! directory may override any of them with a `<id>.hbs` file of the same name.

use crate::error::ProvisionError;
use handlebars::Handlebars;
use std::{collections::BTreeMap, fmt, fs, path::Path, str::FromStr};
use tracing::info;

pub type Variables = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateId {
	EncryptionConfig,
	EtcdService,
	KubeApiserverService,
	KubeControllerManagerService,
	KubeSchedulerConfig,
	KubeSchedulerService,
	ApiserverToKubeletRbac,
	HealthzNginx,
	CniBridge,
	CniLoopback,
	ContainerdConfig,
	ContainerdService,
	KubeletConfig,
	KubeletService,
	KubeProxyConfig,
	KubeProxyService,
}

impl TemplateId {
	pub const ALL: [TemplateId; 16] = [
		TemplateId::EncryptionConfig,
		TemplateId::EtcdService,
		TemplateId::KubeApiserverService,
		TemplateId::KubeControllerManagerService,
		TemplateId::KubeSchedulerConfig,
		TemplateId::KubeSchedulerService,
		TemplateId::ApiserverToKubeletRbac,
		TemplateId::HealthzNginx,
		TemplateId::CniBridge,
		TemplateId::CniLoopback,
		TemplateId::ContainerdConfig,
		TemplateId::ContainerdService,
		TemplateId::KubeletConfig,
		TemplateId::KubeletService,
		TemplateId::KubeProxyConfig,
		TemplateId::KubeProxyService,
	];

	/// Name of the rendered file, which is also the template's identifier.
	pub fn file_name(self) -> &'static str {
		match self {
			TemplateId::EncryptionConfig => "encryption-config.yaml",
			TemplateId::EtcdService => "etcd.service",
			TemplateId::KubeApiserverService => "kube-apiserver.service",
			TemplateId::KubeControllerManagerService => "kube-controller-manager.service",
			TemplateId::KubeSchedulerConfig => "kube-scheduler.yaml",
			TemplateId::KubeSchedulerService => "kube-scheduler.service",
			TemplateId::ApiserverToKubeletRbac => "kube-apiserver-to-kubelet.yaml",
			TemplateId::HealthzNginx => "healthz-nginx.conf",
			TemplateId::CniBridge => "10-bridge.conf",
			TemplateId::CniLoopback => "99-loopback.conf",
			TemplateId::ContainerdConfig => "containerd-config.toml",
			TemplateId::ContainerdService => "containerd.service",
			TemplateId::KubeletConfig => "kubelet-config.yaml",
			TemplateId::KubeletService => "kubelet.service",
			TemplateId::KubeProxyConfig => "kube-proxy-config.yaml",
			TemplateId::KubeProxyService => "kube-proxy.service",
		}
	}

	pub fn required_variables(self) -> &'static [&'static str] {
		match self {
			TemplateId::EncryptionConfig => &["encryption_key"],
			TemplateId::EtcdService => &["etcd_name", "internal_ip", "initial_cluster"],
			TemplateId::KubeApiserverService => {
				&["internal_ip", "apiserver_count", "etcd_servers", "service_cidr"]
			}
			TemplateId::KubeControllerManagerService => {
				&["cluster_cidr", "cluster_name", "service_cidr"]
			}
			TemplateId::CniBridge => &["pod_cidr"],
			TemplateId::KubeletConfig => &["cluster_dns", "pod_cidr", "hostname"],
			TemplateId::KubeProxyConfig => &["cluster_cidr"],
			TemplateId::KubeSchedulerConfig
			| TemplateId::KubeSchedulerService
			| TemplateId::ApiserverToKubeletRbac
			| TemplateId::HealthzNginx
			| TemplateId::CniLoopback
			| TemplateId::ContainerdConfig
			| TemplateId::ContainerdService
			| TemplateId::KubeletService
			| TemplateId::KubeProxyService => &[],
		}
	}

	fn builtin(self) -> &'static str {
		match self {
			TemplateId::EncryptionConfig => include_str!("../templates/encryption-config.yaml.hbs"),
			TemplateId::EtcdService => include_str!("../templates/etcd.service.hbs"),
			TemplateId::KubeApiserverService => {
				include_str!("../templates/kube-apiserver.service.hbs")
			}
			TemplateId::KubeControllerManagerService => {
				include_str!("../templates/kube-controller-manager.service.hbs")
			}
			TemplateId::KubeSchedulerConfig => include_str!("../templates/kube-scheduler.yaml.hbs"),
			TemplateId::KubeSchedulerService => {
				include_str!("../templates/kube-scheduler.service.hbs")
			}
			TemplateId::ApiserverToKubeletRbac => {
				include_str!("../templates/kube-apiserver-to-kubelet.yaml.hbs")
			}
			TemplateId::HealthzNginx => include_str!("../templates/healthz-nginx.conf.hbs"),
			TemplateId::CniBridge => include_str!("../templates/10-bridge.conf.hbs"),
			TemplateId::CniLoopback => include_str!("../templates/99-loopback.conf.hbs"),
			TemplateId::ContainerdConfig => include_str!("../templates/containerd-config.toml.hbs"),
			TemplateId::ContainerdService => include_str!("../templates/containerd.service.hbs"),
			TemplateId::KubeletConfig => include_str!("../templates/kubelet-config.yaml.hbs"),
			TemplateId::KubeletService => include_str!("../templates/kubelet.service.hbs"),
			TemplateId::KubeProxyConfig => include_str!("../templates/kube-proxy-config.yaml.hbs"),
			TemplateId::KubeProxyService => include_str!("../templates/kube-proxy.service.hbs"),
		}
	}
}

impl fmt::Display for TemplateId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.file_name())
	}
}

impl FromStr for TemplateId {
	type Err = ProvisionError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		TemplateId::ALL
			.into_iter()
			.find(|id| id.file_name() == s)
			.ok_or_else(|| ProvisionError::InvalidArgument(format!("unknown template '{s}'")))
	}
}

pub struct TemplateRenderer {
	registry: Handlebars<'static>,
}

impl TemplateRenderer {
	pub fn new(override_dir: Option<&Path>) -> Result<Self, ProvisionError> {
		let mut registry = Handlebars::new();
		registry.set_strict_mode(true);
		registry.register_escape_fn(handlebars::no_escape);
		for id in TemplateId::ALL {
			let source = match override_dir.map(|dir| dir.join(format!("{}.hbs", id.file_name()))) {
				Some(path) if path.exists() => {
					info!("Using template override {}.", path.display());
					fs::read_to_string(&path)?
				}
				_ => id.builtin().to_owned(),
			};
			registry
				.register_template_string(id.file_name(), source)
				.map_err(|err| ProvisionError::Template {
					template: id.file_name().to_owned(),
					message: err.to_string(),
				})?;
		}
		Ok(TemplateRenderer { registry })
	}

	pub fn render(&self, id: TemplateId, variables: &Variables) -> Result<String, ProvisionError> {
		if let Some(variable) = id
			.required_variables()
			.iter()
			.copied()
			.find(|variable| !variables.contains_key(*variable))
		{
			return Err(ProvisionError::MissingVariable {
				template: id.file_name(),
				variable,
			});
		}
		self.registry
			.render(id.file_name(), variables)
			.map_err(|err| ProvisionError::Template {
				template: id.file_name().to_owned(),
				message: err.to_string(),
			})
	}
}

/// Builds a [`Variables`] map from `key => value` pairs.
#[macro_export]
macro_rules! vars {
	($($key:expr => $value:expr),* $(,)?) => {{
		#[allow(unused_mut)]
		let mut variables = $crate::template::Variables::new();
		$(variables.insert($key.to_string(), $value.to_string());)*
		variables
	}};
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn every_builtin_template_renders_with_its_variables() {
		let renderer = TemplateRenderer::new(None).unwrap();
		for id in TemplateId::ALL {
			let variables = id
				.required_variables()
				.iter()
				.map(|name| (name.to_string(), format!("<{name}>")))
				.collect::<Variables>();
			let text = renderer.render(id, &variables).unwrap();
			for name in id.required_variables() {
				assert!(text.contains(&format!("<{name}>")), "{id} lost {name}");
			}
			assert!(!text.contains("{{"), "{id} left a placeholder");
		}
	}

	#[test]
	fn rendering_is_deterministic_and_unescaped() {
		let renderer = TemplateRenderer::new(None).unwrap();
		let variables = crate::vars! {
			"etcd_name" => "controller-0",
			"internal_ip" => "10.240.0.10",
			"initial_cluster" => "controller-0=https://10.240.0.10:2380,controller-1=https://10.240.0.11:2380",
		};
		let first = renderer.render(TemplateId::EtcdService, &variables).unwrap();
		let second = renderer.render(TemplateId::EtcdService, &variables).unwrap();
		assert_eq!(first, second);
		assert!(
			first.contains("--initial-cluster controller-0=https://10.240.0.10:2380,controller-1=")
		);
		assert!(first.contains("--name controller-0 \\"));
	}

	#[test]
	fn missing_variables_are_reported_by_name() {
		let renderer = TemplateRenderer::new(None).unwrap();
		let err = renderer
			.render(TemplateId::KubeletConfig, &crate::vars! { "pod_cidr" => "10.200.0.0/24" })
			.unwrap_err();
		match err {
			ProvisionError::MissingVariable { template, variable } => {
				assert_eq!(template, "kubelet-config.yaml");
				assert_eq!(variable, "cluster_dns");
			}
			other => panic!("unexpected error: {other}"),
		}
	}

	#[test]
	fn template_directory_overrides_builtins() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join("99-loopback.conf.hbs"), "loopback for {{host}}\n").unwrap();
		let renderer = TemplateRenderer::new(Some(dir.path())).unwrap();
		assert_eq!(
			renderer
				.render(TemplateId::CniLoopback, &crate::vars! { "host" => "worker-0" })
				.unwrap(),
			"loopback for worker-0\n"
		);
		// Strict mode still rejects variables nobody supplied.
		assert!(matches!(
			renderer.render(TemplateId::CniLoopback, &Variables::new()),
			Err(ProvisionError::Template { .. })
		));
		assert!(renderer
			.render(TemplateId::CniBridge, &crate::vars! { "pod_cidr" => "10.200.1.0/24" })
			.unwrap()
			.contains("\"subnet\": \"10.200.1.0/24\""));
	}

	#[test]
	fn ids_parse_from_file_names() {
		assert_eq!(
			"kube-proxy.service".parse::<TemplateId>().unwrap(),
			TemplateId::KubeProxyService
		);
		assert!("nginx.conf".parse::<TemplateId>().is_err());
	}
}
