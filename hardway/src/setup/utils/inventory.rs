use crate::config::Config;
use crate::error::ProvisionError;
use crate::exec::Executor;
use crate::setup::utils::gcloud::Gcloud;
use crate::setup::utils::layout::write_atomic;
use crate::setup::utils::validate::Cidr;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use std::{
	collections::{BTreeMap, HashMap},
	fmt, fs,
	net::Ipv4Addr,
	os::unix::fs::PermissionsExt,
	path::{Path, PathBuf},
	sync::{Arc, RwLock},
};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
	Controller,
	Worker,
}

impl fmt::Display for NodeRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			NodeRole::Controller => "controller",
			NodeRole::Worker => "worker",
		})
	}
}

/// A machine the configuration asks for, before the cloud knows about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNode {
	pub name: String,
	pub role: NodeRole,
	pub index: u8,
	pub private_ip: Ipv4Addr,
	pub pod_cidr: Option<Cidr>,
}

/// The fixed set of controllers and workers derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
	controllers: Vec<PlannedNode>,
	workers: Vec<PlannedNode>,
}

impl Topology {
	// Controllers take .1i and workers .2i in the node subnet.
	const CONTROLLER_OFFSET: u32 = 10;
	const WORKER_OFFSET: u32 = 20;

	pub fn from_config(config: &Config) -> Result<Self, ProvisionError> {
		let subnet = config.subnet_cidr()?;
		let cluster = config.cluster_cidr()?;
		let host = |offset: u32, index: u8| {
			subnet.host(offset + u32::from(index)).ok_or_else(|| {
				ProvisionError::Config(format!("subnet {subnet} has no room for node {index}"))
			})
		};
		let controllers = (0..config.controllers)
			.map(|index| {
				Ok(PlannedNode {
					name: format!("controller-{index}"),
					role: NodeRole::Controller,
					index,
					private_ip: host(Topology::CONTROLLER_OFFSET, index)?,
					pod_cidr: None,
				})
			})
			.collect::<Result<Vec<_>, ProvisionError>>()?;
		let workers = (0..config.workers)
			.map(|index| {
				let pod_cidr = cluster.subnet(24, u32::from(index)).ok_or_else(|| {
					ProvisionError::Config(format!(
						"cluster CIDR {cluster} has no /24 for worker {index}"
					))
				})?;
				Ok(PlannedNode {
					name: format!("worker-{index}"),
					role: NodeRole::Worker,
					index,
					private_ip: host(Topology::WORKER_OFFSET, index)?,
					pod_cidr: Some(pod_cidr),
				})
			})
			.collect::<Result<Vec<_>, ProvisionError>>()?;
		Ok(Topology {
			controllers,
			workers,
		})
	}

	pub fn controllers(&self) -> &[PlannedNode] {
		&self.controllers
	}

	pub fn workers(&self) -> &[PlannedNode] {
		&self.workers
	}

	pub fn nodes(&self) -> impl Iterator<Item = &PlannedNode> {
		self.controllers.iter().chain(&self.workers)
	}

	pub fn get(&self, name: &str) -> Option<&PlannedNode> {
		self.nodes().find(|node| node.name == name)
	}
}

/// A node with the addresses the cloud reported for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
	pub name: String,
	pub role: NodeRole,
	pub internal_ip: Ipv4Addr,
	pub external_ip: Ipv4Addr,
	pub pod_cidr: Option<Cidr>,
}

/// Persisted form of everything resolved so far, kept in `inventory.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
	pub public_address: Option<Ipv4Addr>,
	pub nodes: BTreeMap<String, Node>,
	pub updated_at: Option<DateTime<Utc>>,
}

impl InventorySnapshot {
	pub fn load(path: &Path) -> Result<Self, ProvisionError> {
		if !path.exists() {
			return Ok(InventorySnapshot::default());
		}
		let txt = fs::read_to_string(path)?;
		Ok(serde_json::from_str(&txt)?)
	}

	pub fn save(&self, path: &Path) -> Result<(), ProvisionError> {
		write_atomic(path, &serde_json::to_vec_pretty(self)?)
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribedInstance {
	#[serde(default)]
	network_interfaces: Vec<NetworkInterface>,
	#[serde(default)]
	metadata: Metadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
	#[serde(rename = "networkIP")]
	network_ip: Option<Ipv4Addr>,
	#[serde(default)]
	access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessConfig {
	#[serde(rename = "natIP")]
	nat_ip: Option<Ipv4Addr>,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
	#[serde(default)]
	items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
struct MetadataItem {
	key: String,
	value: Option<String>,
}

fn parse_instance(planned: &PlannedNode, json: &str) -> Result<Node, ProvisionError> {
	let instance: DescribedInstance = serde_json::from_str(json)?;
	let missing = |field: &str| {
		ProvisionError::State(format!("{} has no {field} yet", planned.name))
	};
	let interface = instance
		.network_interfaces
		.first()
		.ok_or_else(|| missing("network interface"))?;
	let internal_ip = interface.network_ip.ok_or_else(|| missing("internal IP"))?;
	let external_ip = interface
		.access_configs
		.iter()
		.find_map(|config| config.nat_ip)
		.ok_or_else(|| missing("external IP"))?;
	let pod_cidr = match instance
		.metadata
		.items
		.iter()
		.find(|item| item.key == "pod-cidr")
		.and_then(|item| item.value.as_deref())
	{
		Some(value) => Some(value.parse()?),
		None => planned.pod_cidr,
	};
	Ok(Node {
		name: planned.name.clone(),
		role: planned.role,
		internal_ip,
		external_ip,
		pod_cidr,
	})
}

/// Node addresses resolved from the cloud, at most once per node per run.
pub struct Inventory {
	topology: Topology,
	cluster_name: String,
	gcloud: Gcloud,
	executor: Executor,
	file: PathBuf,
	nodes: RwLock<HashMap<String, Arc<OnceCell<Node>>>>,
	public_address: OnceCell<Ipv4Addr>,
	persist: Mutex<()>,
}

impl Inventory {
	pub fn new(config: &Config, topology: Topology, executor: Executor, file: PathBuf) -> Self {
		Inventory {
			topology,
			cluster_name: config.cluster_name.clone(),
			gcloud: Gcloud::from_config(config),
			executor,
			file,
			nodes: RwLock::new(HashMap::new()),
			public_address: OnceCell::new(),
			persist: Mutex::new(()),
		}
	}

	pub fn topology(&self) -> &Topology {
		&self.topology
	}

	fn cell(&self, name: &str) -> Result<Arc<OnceCell<Node>>, ProvisionError> {
		if let Some(cell) = self
			.nodes
			.read()
			.map_err(|_| ProvisionError::State("inventory lock poisoned".to_owned()))?
			.get(name)
		{
			return Ok(cell.clone());
		}
		let mut nodes = self
			.nodes
			.write()
			.map_err(|_| ProvisionError::State("inventory lock poisoned".to_owned()))?;
		Ok(nodes.entry(name.to_owned()).or_default().clone())
	}

	/// Addresses of one node, asking the cloud only the first time in this run.
	pub async fn describe_node(&self, name: &str) -> Result<Node, ProvisionError> {
		let planned = self.topology.get(name).ok_or_else(|| {
			ProvisionError::State(format!("'{name}' is not part of the cluster topology"))
		})?;
		let cell = self.cell(name)?;
		let node = cell
			.get_or_try_init(|| async {
				debug!("Describing {name}.");
				let output = self
					.executor
					.execute(&self.gcloud.describe_instance(name)?)
					.await?;
				let node = parse_instance(planned, &output.stdout)?;
				info!(
					"Resolved {name}: internal {}, external {}.",
					node.internal_ip, node.external_ip
				);
				self.record(|snapshot| {
					snapshot.nodes.insert(node.name.clone(), node.clone());
				})
				.await?;
				Ok::<_, ProvisionError>(node)
			})
			.await?;
		Ok(node.clone())
	}

	/// The static address fronting the API servers.
	pub async fn public_address(&self) -> Result<Ipv4Addr, ProvisionError> {
		let address = self
			.public_address
			.get_or_try_init(|| async {
				let output = self
					.executor
					.execute(&self.gcloud.describe_address(&self.cluster_name)?)
					.await?;
				let address = output.stdout.trim().parse::<Ipv4Addr>().map_err(|_| {
					ProvisionError::State(format!(
						"address '{}' did not resolve to an IPv4 address",
						self.cluster_name
					))
				})?;
				self.record(|snapshot| snapshot.public_address = Some(address))
					.await?;
				Ok::<_, ProvisionError>(address)
			})
			.await?;
		Ok(*address)
	}

	pub async fn controllers(&self) -> Result<Vec<Node>, ProvisionError> {
		futures::future::try_join_all(
			self.topology
				.controllers()
				.iter()
				.map(|node| self.describe_node(&node.name)),
		)
		.await
	}

	pub async fn workers(&self) -> Result<Vec<Node>, ProvisionError> {
		futures::future::try_join_all(
			self.topology
				.workers()
				.iter()
				.map(|node| self.describe_node(&node.name)),
		)
		.await
	}

	pub fn load_snapshot(&self) -> Result<InventorySnapshot, ProvisionError> {
		InventorySnapshot::load(&self.file)
	}

	async fn record(
		&self,
		update: impl FnOnce(&mut InventorySnapshot),
	) -> Result<(), ProvisionError> {
		let _guard = self.persist.lock().await;
		let mut snapshot = InventorySnapshot::load(&self.file)?;
		update(&mut snapshot);
		snapshot.updated_at = Some(Utc::now());
		snapshot.save(&self.file)
	}
}

const ENCRYPTION_KEY_BYTES: usize = 32;

fn write_encryption_key(path: &Path) -> Result<String, ProvisionError> {
	let mut key = [0u8; ENCRYPTION_KEY_BYTES];
	OsRng.fill_bytes(&mut key);
	let encoded = STANDARD.encode(key);
	write_atomic(path, encoded.as_bytes())?;
	fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
	Ok(encoded)
}

/// The base64 data encryption key, generated on first use and reused after.
pub fn allocate_encryption_key(path: &Path) -> Result<String, ProvisionError> {
	if path.exists() {
		let key = fs::read_to_string(path)?.trim().to_owned();
		let decoded = STANDARD.decode(&key).map_err(|err| {
			ProvisionError::State(format!("{} is not base64: {err}", path.display()))
		})?;
		if decoded.len() != ENCRYPTION_KEY_BYTES {
			return Err(ProvisionError::State(format!(
				"{} holds a {} byte key, expected {ENCRYPTION_KEY_BYTES}",
				path.display(),
				decoded.len()
			)));
		}
		return Ok(key);
	}
	info!("Generating a new data encryption key.");
	write_encryption_key(path)
}

/// Replaces the data encryption key. Only the operator asks for this.
pub fn rotate_encryption_key(path: &Path) -> Result<String, ProvisionError> {
	info!("Rotating the data encryption key at {}.", path.display());
	write_encryption_key(path)
}
