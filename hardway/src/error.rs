use std::{io, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
	#[error("I/O error: {0}.")]
	Io(#[from] io::Error),

	#[error("Failed to execute command '{cmd}': {source}")]
	CommandLaunch {
		cmd: String,
		#[source]
		source: io::Error,
	},

	#[error("Command failed with exit code {code:?}: {cmd}\n{stderr}")]
	Execution {
		cmd: String,
		code: Option<i32>,
		stderr: String,
	},

	#[error("Command timed out after {after:?}: {cmd}")]
	Timeout { cmd: String, after: Duration },

	#[error("Transport to '{host}' failed: {message}")]
	Transport { host: String, message: String },

	#[error("Template '{template}' is missing required variable '{variable}'.")]
	MissingVariable {
		template: &'static str,
		variable: &'static str,
	},

	#[error("Template '{template}' failed: {message}")]
	Template { template: String, message: String },

	#[error("State error: {0}")]
	State(String),

	#[error("Step '{step}' failed its postcondition check after being set.")]
	StepFailed { step: &'static str },

	#[error("Invalid argument: {0}.")]
	InvalidArgument(String),

	#[error("Invalid configuration: {0}.")]
	Config(String),

	#[error("Operation cancelled.")]
	Cancelled,

	#[error("JSON error: {0}.")]
	Json(#[from] serde_json::Error),

	#[error("TOML error: {0}.")]
	Toml(#[from] toml::de::Error),
}

impl ProvisionError {
	/// Connection level failures are the only errors worth retrying.
	pub fn is_transient(&self) -> bool {
		matches!(self, ProvisionError::Transport { .. })
	}
}
