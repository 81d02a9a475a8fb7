use crate::error::ProvisionError;
use crate::setup::utils::layout::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
	collections::{BTreeMap, BTreeSet},
	fs,
	path::{Path, PathBuf},
	sync::{Mutex, MutexGuard},
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
	Complete,
	Partial,
	Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
	pub status: StepStatus,
	/// Node operations already finished, kept until the step completes.
	#[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
	pub completed_ops: BTreeSet<String>,
	pub updated_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl StepRecord {
	fn new(status: StepStatus) -> Self {
		StepRecord {
			status,
			completed_ops: BTreeSet::new(),
			updated_at: Utc::now(),
			error: None,
		}
	}
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
	steps: BTreeMap<String, StepRecord>,
}

/// Step completion markers persisted in `state.json`.
pub struct StateStore {
	path: PathBuf,
	state: Mutex<StateFile>,
}

impl StateStore {
	pub fn open(path: &Path) -> Result<Self, ProvisionError> {
		let state = if path.exists() {
			serde_json::from_str(&fs::read_to_string(path)?)?
		} else {
			StateFile::default()
		};
		Ok(StateStore {
			path: path.to_owned(),
			state: Mutex::new(state),
		})
	}

	fn lock(&self) -> Result<MutexGuard<'_, StateFile>, ProvisionError> {
		self.state
			.lock()
			.map_err(|_| ProvisionError::State("state lock poisoned".to_owned()))
	}

	fn update(
		&self,
		step: &str,
		change: impl FnOnce(&mut BTreeMap<String, StepRecord>),
	) -> Result<(), ProvisionError> {
		let mut state = self.lock()?;
		change(&mut state.steps);
		debug!("Saving state for {step} to {}.", self.path.display());
		write_atomic(&self.path, &serde_json::to_vec_pretty(&*state)?)
	}

	pub fn record(&self, step: &str) -> Result<Option<StepRecord>, ProvisionError> {
		Ok(self.lock()?.steps.get(step).cloned())
	}

	pub fn records(&self) -> Result<BTreeMap<String, StepRecord>, ProvisionError> {
		Ok(self.lock()?.steps.clone())
	}

	pub fn is_complete(&self, step: &str) -> Result<bool, ProvisionError> {
		Ok(self
			.record(step)?
			.is_some_and(|record| record.status == StepStatus::Complete))
	}

	pub fn mark_complete(&self, step: &str) -> Result<(), ProvisionError> {
		self.update(step, |steps| {
			steps.insert(step.to_owned(), StepRecord::new(StepStatus::Complete));
		})
	}

	fn mark_unfinished(
		&self,
		step: &str,
		status: StepStatus,
		error: Option<String>,
	) -> Result<(), ProvisionError> {
		self.update(step, |steps| {
			let record = steps
				.entry(step.to_owned())
				.or_insert_with(|| StepRecord::new(status));
			record.status = status;
			record.updated_at = Utc::now();
			record.error = error;
		})
	}

	/// Cancelled part way; finished node operations are kept.
	pub fn mark_partial(&self, step: &str) -> Result<(), ProvisionError> {
		self.mark_unfinished(step, StepStatus::Partial, None)
	}

	pub fn mark_failed(&self, step: &str, error: &ProvisionError) -> Result<(), ProvisionError> {
		self.mark_unfinished(step, StepStatus::Failed, Some(error.to_string()))
	}

	pub fn op_done(&self, step: &str, op: &str) -> Result<bool, ProvisionError> {
		Ok(self
			.record(step)?
			.is_some_and(|record| record.completed_ops.contains(op)))
	}

	pub fn record_op(&self, step: &str, op: &str) -> Result<(), ProvisionError> {
		self.update(step, |steps| {
			let record = steps
				.entry(step.to_owned())
				.or_insert_with(|| StepRecord::new(StepStatus::Partial));
			record.status = StepStatus::Partial;
			record.completed_ops.insert(op.to_owned());
			record.updated_at = Utc::now();
		})
	}

	/// Forgets per-node progress so a forced run repeats every node.
	pub fn clear_ops(&self, step: &str) -> Result<(), ProvisionError> {
		if self.record(step)?.is_none_or(|record| record.completed_ops.is_empty()) {
			return Ok(());
		}
		self.update(step, |steps| {
			if let Some(record) = steps.get_mut(step) {
				record.completed_ops.clear();
			}
		})
	}

	/// Drops the marker of one step, or of every step.
	pub fn reset(&self, step: Option<&str>) -> Result<(), ProvisionError> {
		self.update(step.unwrap_or("all steps"), |steps| match step {
			Some(step) => {
				steps.remove(step);
			}
			None => steps.clear(),
		})
	}
}
