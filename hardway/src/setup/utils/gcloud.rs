use crate::config::{Config, MachineConfig};
use crate::error::ProvisionError;
use crate::exec::CommandSpec;
use crate::setup::utils::validate::{self, Cidr};
use std::{net::Ipv4Addr, path::PathBuf};

/// Typed builders for the `gcloud` invocations used to stand up the cluster.
#[derive(Debug, Clone)]
pub struct Gcloud {
	region: String,
	zone: String,
	project: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FirewallRule<'a> {
	pub name: &'a str,
	pub network: &'a str,
	pub allow: &'a [&'a str],
	pub source_ranges: &'a [Cidr],
}

#[derive(Debug, Clone)]
pub struct InstanceSpec<'a> {
	pub name: &'a str,
	pub machine: &'a MachineConfig,
	pub subnet: &'a str,
	pub private_ip: Ipv4Addr,
	pub tags: &'a [&'a str],
	pub pod_cidr: Option<Cidr>,
}

impl Gcloud {
	pub const PROGRAM: &str = "gcloud";
	/// Keeps `gcloud compute` from stopping at interactive confirmations.
	const NO_PROMPTS: (&str, &str) = ("CLOUDSDK_CORE_DISABLE_PROMPTS", "1");

	pub fn new(region: &str, zone: &str, project: Option<&str>) -> Self {
		Gcloud {
			region: region.to_owned(),
			zone: zone.to_owned(),
			project: project.map(str::to_owned),
		}
	}

	pub fn from_config(config: &Config) -> Self {
		Gcloud::new(&config.region, &config.zone, config.project.as_deref())
	}

	fn compute(&self, args: &[&str]) -> CommandSpec {
		let (key, value) = Gcloud::NO_PROMPTS;
		let spec = CommandSpec::new(Gcloud::PROGRAM)
			.env(key, value)
			.arg("compute")
			.args(args.iter().copied());
		match &self.project {
			Some(project) => spec.arg(format!("--project={project}")),
			None => spec,
		}
	}

	pub fn config_set(&self, key: &str, value: &str) -> CommandSpec {
		CommandSpec::new(Gcloud::PROGRAM).args(["config", "set", key, value])
	}

	pub fn set_defaults(&self) -> [CommandSpec; 2] {
		[
			self.config_set("compute/region", &self.region),
			self.config_set("compute/zone", &self.zone),
		]
	}

	pub fn version(&self) -> CommandSpec {
		CommandSpec::new(Gcloud::PROGRAM).arg("version")
	}

	pub fn create_network(&self, name: &str) -> Result<CommandSpec, ProvisionError> {
		let name = validate::resource_name(name)?;
		Ok(self.compute(&["networks", "create", name, "--subnet-mode", "custom"]))
	}

	pub fn create_subnet(
		&self,
		name: &str,
		network: &str,
		range: Cidr,
	) -> Result<CommandSpec, ProvisionError> {
		let name = validate::resource_name(name)?;
		let network = validate::resource_name(network)?;
		Ok(self
			.compute(&["networks", "subnets", "create", name, "--network", network])
			.args(["--range".to_owned(), range.to_string()])
			.arg(format!("--region={}", self.region)))
	}

	pub fn create_firewall_rule(
		&self,
		rule: &FirewallRule<'_>,
	) -> Result<CommandSpec, ProvisionError> {
		let name = validate::resource_name(rule.name)?;
		let network = validate::resource_name(rule.network)?;
		if rule.allow.is_empty() || rule.source_ranges.is_empty() {
			return Err(ProvisionError::InvalidArgument(format!(
				"firewall rule {name} needs protocols and source ranges"
			)));
		}
		let allow = rule
			.allow
			.iter()
			.map(|allow| validate::firewall_allow(allow))
			.collect::<Result<Vec<_>, _>>()?
			.join(",");
		let ranges = rule
			.source_ranges
			.iter()
			.map(ToString::to_string)
			.collect::<Vec<_>>()
			.join(",");
		Ok(self
			.compute(&["firewall-rules", "create", name, "--network", network])
			.args(["--allow".to_owned(), allow, "--source-ranges".to_owned(), ranges]))
	}

	pub fn describe_firewall_rule(&self, name: &str) -> Result<CommandSpec, ProvisionError> {
		let name = validate::resource_name(name)?;
		Ok(self
			.compute(&["firewall-rules", "describe", name])
			.arg("--format=value(name)"))
	}

	pub fn create_address(&self, name: &str) -> Result<CommandSpec, ProvisionError> {
		let name = validate::resource_name(name)?;
		Ok(self
			.compute(&["addresses", "create", name])
			.arg(format!("--region={}", self.region)))
	}

	pub fn describe_address(&self, name: &str) -> Result<CommandSpec, ProvisionError> {
		let name = validate::resource_name(name)?;
		Ok(self
			.compute(&["addresses", "describe", name])
			.arg(format!("--region={}", self.region))
			.arg("--format=value(address)"))
	}

	pub fn create_instance(
		&self,
		instance: &InstanceSpec<'_>,
	) -> Result<CommandSpec, ProvisionError> {
		let name = validate::resource_name(instance.name)?;
		let subnet = validate::resource_name(instance.subnet)?;
		for tag in instance.tags {
			validate::resource_name(tag)?;
		}
		let machine = instance.machine;
		let mut spec = self
			.compute(&["instances", "create", name])
			.arg(format!("--zone={}", self.zone))
			.args(["--boot-disk-size", machine.boot_disk_size.as_str()])
			.arg("--can-ip-forward")
			.args(["--image-family", machine.image_family.as_str()])
			.args(["--image-project", machine.image_project.as_str()])
			.args(["--machine-type", machine.machine_type.as_str()]);
		if let Some(pod_cidr) = instance.pod_cidr {
			spec = spec.args(["--metadata".to_owned(), format!("pod-cidr={pod_cidr}")]);
		}
		Ok(spec
			.args(["--private-network-ip".to_owned(), instance.private_ip.to_string()])
			.args(["--scopes".to_owned(), machine.scopes.join(",")])
			.args(["--subnet", subnet])
			.args(["--tags".to_owned(), instance.tags.join(",")]))
	}

	pub fn describe_instance(&self, name: &str) -> Result<CommandSpec, ProvisionError> {
		let name = validate::resource_name(name)?;
		Ok(self
			.compute(&["instances", "describe", name])
			.arg(format!("--zone={}", self.zone))
			.arg("--format=json"))
	}

	pub fn create_http_health_check(
		&self,
		name: &str,
		host: &str,
		request_path: &str,
	) -> Result<CommandSpec, ProvisionError> {
		let name = validate::resource_name(name)?;
		Ok(self
			.compute(&["http-health-checks", "create", name])
			.args(["--description", "Kubernetes Health Check"])
			.args(["--host", host])
			.args(["--request-path", request_path]))
	}

	pub fn create_target_pool(
		&self,
		name: &str,
		health_check: &str,
	) -> Result<CommandSpec, ProvisionError> {
		let name = validate::resource_name(name)?;
		let health_check = validate::resource_name(health_check)?;
		Ok(self
			.compute(&["target-pools", "create", name])
			.args(["--http-health-check", health_check])
			.arg(format!("--region={}", self.region)))
	}

	pub fn add_target_pool_instances(
		&self,
		pool: &str,
		instances: &[String],
	) -> Result<CommandSpec, ProvisionError> {
		let pool = validate::resource_name(pool)?;
		for instance in instances {
			validate::resource_name(instance)?;
		}
		Ok(self
			.compute(&["target-pools", "add-instances", pool])
			.args(["--instances".to_owned(), instances.join(",")])
			.arg(format!("--instances-zone={}", self.zone))
			.arg(format!("--region={}", self.region)))
	}

	pub fn create_forwarding_rule(
		&self,
		name: &str,
		address: Ipv4Addr,
		ports: &str,
		target_pool: &str,
	) -> Result<CommandSpec, ProvisionError> {
		let name = validate::resource_name(name)?;
		let target_pool = validate::resource_name(target_pool)?;
		Ok(self
			.compute(&["forwarding-rules", "create", name])
			.args(["--address".to_owned(), address.to_string()])
			.args(["--ports", ports])
			.arg(format!("--region={}", self.region))
			.args(["--target-pool", target_pool]))
	}

	pub fn create_route(
		&self,
		name: &str,
		network: &str,
		next_hop: Ipv4Addr,
		destination: Cidr,
	) -> Result<CommandSpec, ProvisionError> {
		let name = validate::resource_name(name)?;
		let network = validate::resource_name(network)?;
		Ok(self
			.compute(&["routes", "create", name, "--network", network])
			.args(["--next-hop-address".to_owned(), next_hop.to_string()])
			.args(["--destination-range".to_owned(), destination.to_string()]))
	}

	pub fn ssh(&self, host: &str, command: &str) -> Result<CommandSpec, ProvisionError> {
		let host = validate::resource_name(host)?;
		Ok(self
			.compute(&["ssh", host])
			.arg(format!("--zone={}", self.zone))
			.arg("--quiet")
			.args(["--command", command]))
	}

	pub fn scp(&self, files: &[PathBuf], host: &str) -> Result<CommandSpec, ProvisionError> {
		let host = validate::resource_name(host)?;
		if files.is_empty() {
			return Err(ProvisionError::InvalidArgument(format!(
				"nothing to copy to {host}"
			)));
		}
		Ok(self
			.compute(&["scp"])
			.arg(format!("--zone={}", self.zone))
			.arg("--quiet")
			.args(files.iter().map(|file| file.to_string_lossy().into_owned()))
			.arg(format!("{host}:~/")))
	}
}
