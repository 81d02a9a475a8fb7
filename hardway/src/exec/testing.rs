//! In-memory launchers and transports that record what they were asked to do.

use super::{CommandSpec, Launcher, ProcessOutput, Transport};
use crate::error::ProvisionError;
use async_trait::async_trait;
use std::{
	path::PathBuf,
	sync::{
		Mutex,
		atomic::{AtomicUsize, Ordering},
	},
};

type Responder = dyn Fn(&CommandSpec) -> Result<ProcessOutput, ProvisionError> + Send + Sync;

pub fn ok(stdout: &str) -> Result<ProcessOutput, ProvisionError> {
	Ok(ProcessOutput {
		code: Some(0),
		stdout: stdout.to_owned(),
		stderr: String::new(),
	})
}

pub fn exit(code: i32, stderr: &str) -> Result<ProcessOutput, ProvisionError> {
	Ok(ProcessOutput {
		code: Some(code),
		stdout: String::new(),
		stderr: stderr.to_owned(),
	})
}

/// Minimal `gcloud compute instances describe --format=json` output.
pub fn instance_json(internal: &str, external: &str, pod_cidr: Option<&str>) -> String {
	let metadata = match pod_cidr {
		Some(cidr) => format!(r#"{{"items":[{{"key":"pod-cidr","value":"{cidr}"}}]}}"#),
		None => "{}".to_owned(),
	};
	format!(
		r#"{{"networkInterfaces":[{{"networkIP":"{internal}","accessConfigs":[{{"natIP":"{external}"}}]}}],"metadata":{metadata}}}"#
	)
}

pub struct FakeLauncher {
	calls: Mutex<Vec<CommandSpec>>,
	responder: Box<Responder>,
}

impl FakeLauncher {
	pub fn new(
		responder: impl Fn(&CommandSpec) -> Result<ProcessOutput, ProvisionError>
		+ Send
		+ Sync
		+ 'static,
	) -> Self {
		FakeLauncher {
			calls: Mutex::new(Vec::new()),
			responder: Box::new(responder),
		}
	}

	pub fn calls(&self) -> Vec<CommandSpec> {
		self.calls.lock().unwrap().clone()
	}

	pub fn lines(&self) -> Vec<String> {
		self.calls().iter().map(ToString::to_string).collect()
	}
}

#[async_trait]
impl Launcher for FakeLauncher {
	async fn launch(
		&self,
		spec: &CommandSpec,
		_capture: bool,
	) -> Result<ProcessOutput, ProvisionError> {
		self.calls.lock().unwrap().push(spec.clone());
		(self.responder)(spec)
	}
}

enum Behaviour {
	Succeed,
	FailFirst(usize),
	Exit(i32),
}

pub struct FakeTransport {
	behaviour: Behaviour,
	attempts: AtomicUsize,
	runs: Mutex<Vec<(String, String)>>,
	uploads: Mutex<Vec<(String, Vec<PathBuf>)>>,
}

impl FakeTransport {
	fn with(behaviour: Behaviour) -> Self {
		FakeTransport {
			behaviour,
			attempts: AtomicUsize::new(0),
			runs: Mutex::new(Vec::new()),
			uploads: Mutex::new(Vec::new()),
		}
	}

	pub fn ok() -> Self {
		FakeTransport::with(Behaviour::Succeed)
	}

	/// Fails to connect the first `n` times.
	pub fn failing_first(n: usize) -> Self {
		FakeTransport::with(Behaviour::FailFirst(n))
	}

	pub fn exiting(code: i32) -> Self {
		FakeTransport::with(Behaviour::Exit(code))
	}

	pub fn runs(&self) -> Vec<(String, String)> {
		self.runs.lock().unwrap().clone()
	}

	pub fn uploads(&self) -> Vec<(String, Vec<PathBuf>)> {
		self.uploads.lock().unwrap().clone()
	}

	fn respond(&self, host: &str) -> Result<ProcessOutput, ProvisionError> {
		let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
		match self.behaviour {
			Behaviour::Succeed => ok(""),
			Behaviour::FailFirst(n) if attempt < n => Err(ProvisionError::Transport {
				host: host.to_owned(),
				message: "connection refused".to_owned(),
			}),
			Behaviour::FailFirst(_) => ok(""),
			Behaviour::Exit(code) => exit(code, "remote failure"),
		}
	}
}

#[async_trait]
impl Transport for FakeTransport {
	async fn run(
		&self,
		host: &str,
		command: &str,
		_capture: bool,
	) -> Result<ProcessOutput, ProvisionError> {
		self.runs
			.lock()
			.unwrap()
			.push((host.to_owned(), command.to_owned()));
		self.respond(host)
	}

	async fn upload(&self, host: &str, files: &[PathBuf]) -> Result<ProcessOutput, ProvisionError> {
		self.uploads
			.lock()
			.unwrap()
			.push((host.to_owned(), files.to_vec()));
		self.respond(host)
	}
}
