pub mod state;
pub mod steps;
pub mod utils;

use crate::context::Context;
use crate::error::ProvisionError;
use crate::setup::steps::{
	Certificates, Compute, ControlPlane, Encryption, Environment, Etcd, Kubeconfigs, Networking,
	Workers,
};
use async_trait::async_trait;
use tracing::{error, info, warn};

#[async_trait]
pub trait SetupStep: Send + Sync {
	fn name(&self) -> &'static str;

	fn description(&self) -> &'static str;

	/// Postcondition verified right after `set`.
	async fn check(&self, _ctx: &Context) -> Result<bool, ProvisionError> {
		Ok(true)
	}

	async fn set(&self, ctx: &Context) -> Result<(), ProvisionError>;
}

pub const PIPELINE: &[&dyn SetupStep] = &[
	&Environment,
	&Networking,
	&Compute,
	&Certificates,
	&Kubeconfigs,
	&Encryption,
	&Etcd,
	&ControlPlane,
	&Workers,
];

#[derive(Debug)]
pub enum Outcome {
	Completed,
	Failed {
		step: &'static str,
		error: ProvisionError,
	},
	Cancelled {
		step: &'static str,
	},
}

#[derive(Debug)]
pub struct RunReport {
	pub executed: Vec<&'static str>,
	pub skipped: Vec<&'static str>,
	pub outcome: Outcome,
}

fn position(steps: &[&dyn SetupStep], name: &str) -> Result<usize, ProvisionError> {
	steps
		.iter()
		.position(|step| step.name() == name)
		.ok_or_else(|| ProvisionError::State(format!("unknown step '{name}'")))
}

/// Runs `steps` from `from` through `to` inclusive, in order.
///
/// Steps already marked complete are skipped unless the context forces them.
/// The first failing step halts the run and is recorded as failed; artifacts of
/// earlier steps stay where they are.
pub async fn run(
	ctx: &Context,
	steps: &[&dyn SetupStep],
	from: Option<&str>,
	to: Option<&str>,
) -> Result<RunReport, ProvisionError> {
	if steps.is_empty() {
		return Err(ProvisionError::State("no steps to run".to_owned()));
	}
	let start = from.map(|name| position(steps, name)).transpose()?.unwrap_or(0);
	let end = to
		.map(|name| position(steps, name))
		.transpose()?
		.unwrap_or(steps.len() - 1);
	if start > end {
		return Err(ProvisionError::State(format!(
			"'{}' comes after '{}'",
			steps[start].name(),
			steps[end].name()
		)));
	}
	for earlier in &steps[..start] {
		if !ctx.state.is_complete(earlier.name())? {
			return Err(ProvisionError::State(format!(
				"'{}' cannot run before '{}' completes",
				steps[start].name(),
				earlier.name()
			)));
		}
	}
	let mut report = RunReport {
		executed: Vec::new(),
		skipped: Vec::new(),
		outcome: Outcome::Completed,
	};
	for step in &steps[start..=end] {
		let name = step.name();
		if ctx.cancel.is_cancelled() {
			warn!("Cancelled before step {name}.");
			report.outcome = Outcome::Cancelled { step: name };
			break;
		}
		if !ctx.force && ctx.state.is_complete(name)? {
			info!("Step {name} is already complete.");
			report.skipped.push(name);
			continue;
		}
		if ctx.force {
			ctx.state.clear_ops(name)?;
		}
		info!("Step {name} started: {}.", step.description());
		let result = match step.set(ctx).await {
			Ok(()) => match step.check(ctx).await {
				Ok(true) => Ok(()),
				Ok(false) => Err(ProvisionError::StepFailed { step: name }),
				Err(err) => Err(err),
			},
			Err(err) => Err(err),
		};
		match result {
			Ok(()) => {
				ctx.state.mark_complete(name)?;
				info!("Step {name} finished.");
				report.executed.push(name);
			}
			Err(ProvisionError::Cancelled) => {
				ctx.state.mark_partial(name)?;
				warn!("Step {name} cancelled, finished work is recorded.");
				report.outcome = Outcome::Cancelled { step: name };
				break;
			}
			Err(err) => {
				ctx.state.mark_failed(name, &err)?;
				error!("Step {name} failed: {err}");
				report.outcome = Outcome::Failed { step: name, error: err };
				break;
			}
		}
	}
	Ok(report)
}

#[cfg(test)]
mod tests {
	use super::state::StepStatus;
	use super::*;
	use crate::context::testing::context;
	use crate::exec::testing::{FakeLauncher, FakeTransport, exit, instance_json, ok};
	use std::sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	};

	struct Counting {
		name: &'static str,
		calls: AtomicUsize,
		holds: bool,
	}

	impl Counting {
		fn new(name: &'static str) -> Self {
			Counting {
				name,
				calls: AtomicUsize::new(0),
				holds: true,
			}
		}
	}

	#[async_trait]
	impl SetupStep for Counting {
		fn name(&self) -> &'static str {
			self.name
		}

		fn description(&self) -> &'static str {
			"counts invocations"
		}

		async fn check(&self, _ctx: &Context) -> Result<bool, ProvisionError> {
			Ok(self.holds)
		}

		async fn set(&self, _ctx: &Context) -> Result<(), ProvisionError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	fn fakes() -> (Arc<FakeLauncher>, Arc<FakeTransport>) {
		(Arc::new(FakeLauncher::new(|_| ok(""))), Arc::new(FakeTransport::ok()))
	}

	#[tokio::test]
	async fn completed_steps_are_not_run_again() {
		let dir = tempfile::tempdir().unwrap();
		let (launcher, transport) = fakes();
		let ctx = context(dir.path(), launcher, transport);
		let (a, b) = (Counting::new("a"), Counting::new("b"));
		let steps: [&dyn SetupStep; 2] = [&a, &b];
		let report = run(&ctx, &steps, None, None).await.unwrap();
		assert!(matches!(report.outcome, Outcome::Completed));
		assert_eq!(report.executed, ["a", "b"]);
		let report = run(&ctx, &steps, None, None).await.unwrap();
		assert_eq!(report.skipped, ["a", "b"]);
		assert_eq!(a.calls.load(Ordering::SeqCst), 1);
		assert_eq!(b.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn forced_runs_repeat_completed_steps() {
		let dir = tempfile::tempdir().unwrap();
		let (launcher, transport) = fakes();
		let mut ctx = context(dir.path(), launcher, transport);
		let a = Counting::new("a");
		let steps: [&dyn SetupStep; 1] = [&a];
		run(&ctx, &steps, None, None).await.unwrap();
		ctx.force = true;
		let report = run(&ctx, &steps, None, None).await.unwrap();
		assert_eq!(report.executed, ["a"]);
		assert_eq!(a.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn steps_cannot_start_before_their_predecessors() {
		let dir = tempfile::tempdir().unwrap();
		let (launcher, transport) = fakes();
		let ctx = context(dir.path(), launcher, transport);
		let (a, b, c) = (Counting::new("a"), Counting::new("b"), Counting::new("c"));
		let steps: [&dyn SetupStep; 3] = [&a, &b, &c];
		let err = run(&ctx, &steps, Some("b"), None).await.unwrap_err();
		assert!(matches!(err, ProvisionError::State(_)), "got {err}");
		assert_eq!(b.calls.load(Ordering::SeqCst), 0);
		assert!(matches!(
			run(&ctx, &steps, Some("c"), Some("a")).await,
			Err(ProvisionError::State(_))
		));
		assert!(matches!(
			run(&ctx, &steps, Some("z"), None).await,
			Err(ProvisionError::State(_))
		));
		run(&ctx, &steps, None, Some("a")).await.unwrap();
		let report = run(&ctx, &steps, Some("b"), Some("b")).await.unwrap();
		assert_eq!(report.executed, ["b"]);
		assert_eq!(c.calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn a_false_postcondition_fails_the_step() {
		let dir = tempfile::tempdir().unwrap();
		let (launcher, transport) = fakes();
		let ctx = context(dir.path(), launcher, transport);
		let a = Counting {
			holds: false,
			..Counting::new("a")
		};
		let b = Counting::new("b");
		let steps: [&dyn SetupStep; 2] = [&a, &b];
		let report = run(&ctx, &steps, None, None).await.unwrap();
		assert!(matches!(
			report.outcome,
			Outcome::Failed {
				step: "a",
				error: ProvisionError::StepFailed { step: "a" }
			}
		));
		assert_eq!(b.calls.load(Ordering::SeqCst), 0);
		assert_eq!(
			ctx.state.record("a").unwrap().unwrap().status,
			StepStatus::Failed
		);
	}

	/// Works through three nodes, the last one only after cancellation.
	struct Interrupted;

	#[async_trait]
	impl SetupStep for Interrupted {
		fn name(&self) -> &'static str {
			"nodes"
		}

		fn description(&self) -> &'static str {
			"visits three nodes"
		}

		async fn set(&self, ctx: &Context) -> Result<(), ProvisionError> {
			ctx.for_each("nodes", 0..3, |i| format!("node-{i}"), |i| async move {
				if i == 1 {
					ctx.cancel.cancel();
				}
				ctx.executor
					.execute_remote(&format!("worker-{i}"), "true")
					.await?;
				Ok(())
			})
			.await
		}
	}

	#[tokio::test]
	async fn cancelled_steps_resume_with_unfinished_nodes() {
		let dir = tempfile::tempdir().unwrap();
		let (launcher, transport) = fakes();
		let mut ctx = context(dir.path(), launcher.clone(), transport.clone());
		ctx.config.parallelism = 1;
		let steps: [&dyn SetupStep; 1] = [&Interrupted];
		let report = run(&ctx, &steps, None, None).await.unwrap();
		assert!(matches!(report.outcome, Outcome::Cancelled { step: "nodes" }));
		let record = ctx.state.record("nodes").unwrap().unwrap();
		assert_eq!(record.status, StepStatus::Partial);
		assert_eq!(
			record.completed_ops.into_iter().collect::<Vec<_>>(),
			["node-0", "node-1"]
		);
		let mut resumed = context(dir.path(), launcher, transport.clone());
		resumed.config.parallelism = 1;
		let report = run(&resumed, &steps, None, None).await.unwrap();
		assert!(matches!(report.outcome, Outcome::Completed));
		let hosts = transport
			.runs()
			.into_iter()
			.map(|(host, _)| host)
			.collect::<Vec<_>>();
		assert_eq!(hosts, ["worker-0", "worker-1", "worker-2"]);
	}

	#[tokio::test]
	async fn ca_failure_halts_the_pipeline_at_certificates() {
		let dir = tempfile::tempdir().unwrap();
		let launcher = Arc::new(FakeLauncher::new(|spec| match spec.program.as_str() {
			"cfssl" => exit(1, "cfssl: unable to generate CA key"),
			"gcloud" if spec.args.contains(&"describe".to_owned()) => {
				if spec.args.contains(&"addresses".to_owned()) {
					ok("35.203.0.1\n")
				} else {
					ok(&instance_json("10.240.0.20", "35.203.0.20", None))
				}
			}
			_ => ok(""),
		}));
		let transport = Arc::new(FakeTransport::ok());
		let ctx = context(dir.path(), launcher.clone(), transport.clone());
		assert_eq!((ctx.config.controllers, ctx.config.workers), (3, 3));
		let steps: [&dyn SetupStep; 4] = [&Networking, &Certificates, &Kubeconfigs, &Encryption];
		let report = run(&ctx, &steps, None, None).await.unwrap();
		assert_eq!(report.executed, ["networking"]);
		match &report.outcome {
			Outcome::Failed { step, error } => {
				assert_eq!(*step, "certificates");
				let ProvisionError::Execution { code, stderr, .. } = error else {
					panic!("unexpected error: {error}");
				};
				assert_eq!(*code, Some(1));
				assert!(stderr.contains("CA key"));
			}
			other => panic!("unexpected outcome: {other:?}"),
		}
		assert!(launcher.calls().iter().all(|spec| spec.program != "kubectl"));
		assert!(!ctx.state.is_complete("kubeconfigs").unwrap());
		assert!(!ctx.layout.encryption_key().exists());
		assert!(transport.uploads().is_empty());
		assert_eq!(
			ctx.state.record("certificates").unwrap().unwrap().status,
			StepStatus::Failed
		);
	}
}
