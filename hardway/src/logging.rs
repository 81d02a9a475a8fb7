use std::{
	io::{self, IsTerminal},
	panic,
};
use tracing::Level;
use tracing_journald::layer as journald_layer;
use tracing_panic::panic_hook;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, registry::Registry};

pub const SYSLOG_IDENTIFIER: &str = "hardway";

/// Stderr plus journald when it is reachable. `RUST_LOG` overrides the level.
// journalctl -t hardway
pub fn init(verbose: bool) {
	panic::set_hook(Box::new(panic_hook));
	let level = if verbose { Level::DEBUG } else { Level::INFO };
	let log_sub = Registry::default()
		.with(
			EnvFilter::builder()
				.with_default_directive(level.into())
				.from_env_lossy(),
		)
		.with(
			fmt::layer()
				.with_ansi(io::stderr().is_terminal())
				.with_file(verbose)
				.with_line_number(verbose)
				.with_target(true)
				.with_thread_ids(verbose)
				.with_timer(fmt::time::SystemTime)
				.with_writer(io::stderr)
				.compact(),
		)
		.with(
			journald_layer()
				.map_err(|err| eprintln!("journald not available: {err}"))
				.ok()
				.map(|layr| layr.with_syslog_identifier(SYSLOG_IDENTIFIER.into())),
		);
	if let Err(err) = tracing::subscriber::set_global_default(log_sub) {
		eprintln!("Failed to set log subscriber: {err}");
	}
}
