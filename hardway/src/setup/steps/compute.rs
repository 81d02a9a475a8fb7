use crate::context::Context;
use crate::error::ProvisionError;
use crate::setup::SetupStep;
use crate::setup::utils::{
	gcloud::InstanceSpec,
	inventory::PlannedNode,
};
use async_trait::async_trait;
use tracing::info;

pub struct Compute;

impl Compute {
	pub const NAME: &str = "compute";
}

async fn create_instance(ctx: &Context, node: PlannedNode) -> Result<(), ProvisionError> {
	let role = node.role.to_string();
	let spec = ctx.gcloud.create_instance(&InstanceSpec {
		name: &node.name,
		machine: &ctx.config.machine,
		subnet: &ctx.config.subnet_name,
		private_ip: node.private_ip,
		tags: &[ctx.config.cluster_name.as_str(), role.as_str()],
		pod_cidr: node.pod_cidr,
	})?;
	ctx.executor.execute(&spec).await?;
	Ok(())
}

#[async_trait]
impl SetupStep for Compute {
	fn name(&self) -> &'static str {
		Compute::NAME
	}

	fn description(&self) -> &'static str {
		"create controller and worker instances and record their addresses"
	}

	async fn check(&self, ctx: &Context) -> Result<bool, ProvisionError> {
		let snapshot = ctx.inventory.load_snapshot()?;
		let missing = ctx
			.inventory
			.topology()
			.nodes()
			.filter(|node| !snapshot.nodes.contains_key(&node.name))
			.map(|node| node.name.as_str())
			.collect::<Vec<_>>();
		if !missing.is_empty() {
			info!("No addresses recorded for {}.", missing.join(", "));
		}
		Ok(missing.is_empty())
	}

	async fn set(&self, ctx: &Context) -> Result<(), ProvisionError> {
		let nodes = ctx.inventory.topology().nodes().cloned().collect::<Vec<_>>();
		ctx.for_each(
			Compute::NAME,
			nodes,
			|node| node.name.clone(),
			|node| create_instance(ctx, node),
		)
		.await?;
		for node in ctx
			.inventory
			.controllers()
			.await?
			.into_iter()
			.chain(ctx.inventory.workers().await?)
		{
			info!(
				"{} {}: internal {}, external {}.",
				node.role, node.name, node.internal_ip, node.external_ip
			);
		}
		Ok(())
	}
}
