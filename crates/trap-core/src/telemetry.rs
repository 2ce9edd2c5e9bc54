use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

mod rolling;

pub use rolling::{RollingConfig, SizeRolling};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Initializes tracing with a stdout layer and, when configured, a
/// non-blocking file layer behind a size-rotating writer.
///
/// `RUST_LOG` takes precedence over the passed default directive. The
/// returned guards must be held for the lifetime of the process or buffered
/// file output is lost.
pub fn setup_logging(
	default_directive: &str,
	file: Option<RollingConfig>,
) -> anyhow::Result<Vec<WorkerGuard>> {
	Lazy::force(&APPLICATION_START_TIME);
	let mut guards = Vec::new();

	let stdout_layer = fmt::layer()
		.with_writer(std::io::stdout)
		.with_filter(build_filter(default_directive)?);

	let file_layer = match file {
		Some(cfg) => {
			let writer = SizeRolling::new(cfg)?;
			let (non_blocking, guard) = tracing_appender::non_blocking(writer);
			guards.push(guard);
			Some(
				fmt::layer()
					.with_ansi(false)
					.with_writer(non_blocking)
					.with_filter(build_filter(default_directive)?),
			)
		},
		None => None,
	};

	tracing_subscriber::registry()
		.with(stdout_layer)
		.with(file_layer)
		.init();
	Ok(guards)
}

fn build_filter(default_directive: &str) -> anyhow::Result<EnvFilter> {
	match std::env::var(EnvFilter::DEFAULT_ENV) {
		Ok(_) => Ok(EnvFilter::try_from_default_env()?),
		Err(_) => Ok(EnvFilter::try_new(default_directive)?),
	}
}
