use crate::error::ProvisionError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, net::Ipv4Addr, str::FromStr, sync::LazyLock};

// RFC 1035 label, which is what Compute Engine enforces for resource names.
static RESOURCE_NAME: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^[a-z]([-a-z0-9]{0,61}[a-z0-9])?$").expect("Resource name pattern is valid.")
});

static FIREWALL_ALLOW: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^(tcp|udp|icmp)(:[0-9]{1,5}(-[0-9]{1,5})?)?$").expect("Firewall pattern is valid.")
});

pub fn resource_name(name: &str) -> Result<&str, ProvisionError> {
	if RESOURCE_NAME.is_match(name) {
		Ok(name)
	} else {
		Err(ProvisionError::InvalidArgument(format!(
			"'{name}' is not a valid resource name"
		)))
	}
}

pub fn firewall_allow(rule: &str) -> Result<&str, ProvisionError> {
	if FIREWALL_ALLOW.is_match(rule) {
		Ok(rule)
	} else {
		Err(ProvisionError::InvalidArgument(format!(
			"'{rule}' is not a valid firewall allow rule"
		)))
	}
}

/// An IPv4 network in CIDR notation with no host bits set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
	addr: Ipv4Addr,
	prefix: u8,
}

impl Cidr {
	pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, ProvisionError> {
		if prefix > 32 {
			return Err(ProvisionError::InvalidArgument(format!(
				"prefix /{prefix} is longer than 32 bits"
			)));
		}
		if u32::from(addr) & !Cidr::mask(prefix) != 0 {
			return Err(ProvisionError::InvalidArgument(format!(
				"{addr}/{prefix} has host bits set"
			)));
		}
		Ok(Cidr { addr, prefix })
	}

	fn mask(prefix: u8) -> u32 {
		u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
	}

	pub fn addr(&self) -> Ipv4Addr {
		self.addr
	}

	pub fn prefix(&self) -> u8 {
		self.prefix
	}

	pub fn contains(&self, ip: Ipv4Addr) -> bool {
		u32::from(ip) & Cidr::mask(self.prefix) == u32::from(self.addr)
	}

	/// The address `n` places after the network address, if it is inside the network.
	pub fn host(&self, n: u32) -> Option<Ipv4Addr> {
		let ip = Ipv4Addr::from(u32::from(self.addr).checked_add(n)?);
		self.contains(ip).then_some(ip)
	}

	/// The `index`-th subnet of length `prefix` carved from this network.
	pub fn subnet(&self, prefix: u8, index: u32) -> Option<Cidr> {
		if prefix < self.prefix || prefix > 32 {
			return None;
		}
		let step = 1u64 << (32 - u32::from(prefix));
		let offset = step.checked_mul(u64::from(index))?;
		let base = u64::from(u32::from(self.addr)) + offset;
		let addr = Ipv4Addr::from(u32::try_from(base).ok()?);
		self.contains(addr).then_some(Cidr { addr, prefix })
	}
}

impl FromStr for Cidr {
	type Err = ProvisionError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let invalid = || ProvisionError::InvalidArgument(format!("'{s}' is not an IPv4 CIDR"));
		let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
		let addr = addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
		let prefix = prefix.parse::<u8>().map_err(|_| invalid())?;
		Cidr::new(addr, prefix)
	}
}

impl TryFrom<String> for Cidr {
	type Error = ProvisionError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		value.parse()
	}
}

impl From<Cidr> for String {
	fn from(value: Cidr) -> Self {
		value.to_string()
	}
}

impl fmt::Display for Cidr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.addr, self.prefix)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resource_names_follow_compute_engine_rules() {
		assert!(resource_name("controller-0").is_ok());
		assert!(resource_name("kubernetes-the-hard-way").is_ok());
		assert!(resource_name("Controller-0").is_err());
		assert!(resource_name("0-controller").is_err());
		assert!(resource_name("worker-").is_err());
		assert!(resource_name("worker; rm -rf /").is_err());
	}

	#[test]
	fn firewall_allow_rules_are_checked() {
		assert!(firewall_allow("tcp").is_ok());
		assert!(firewall_allow("tcp:6443").is_ok());
		assert!(firewall_allow("udp:30000-32767").is_ok());
		assert!(firewall_allow("icmp").is_ok());
		assert!(firewall_allow("sctp").is_err());
		assert!(firewall_allow("tcp:").is_err());
	}

	#[test]
	fn cidr_rejects_host_bits_and_bad_prefixes() {
		assert!("10.240.0.0/24".parse::<Cidr>().is_ok());
		assert!("10.240.0.1/24".parse::<Cidr>().is_err());
		assert!("10.240.0.0/33".parse::<Cidr>().is_err());
		assert!("10.240.0.0".parse::<Cidr>().is_err());
		assert!("0.0.0.0/0".parse::<Cidr>().is_ok());
	}

	#[test]
	fn cidr_hosts_and_subnets() {
		let subnet: Cidr = "10.240.0.0/24".parse().unwrap();
		assert_eq!(subnet.host(10), Some(Ipv4Addr::new(10, 240, 0, 10)));
		assert_eq!(subnet.host(256), None);
		let cluster: Cidr = "10.200.0.0/16".parse().unwrap();
		assert_eq!(cluster.subnet(24, 2).unwrap().to_string(), "10.200.2.0/24");
		assert_eq!(cluster.subnet(24, 256), None);
		assert_eq!(cluster.subnet(8, 0), None);
	}
}
