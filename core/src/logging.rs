use std::{fs, path::Path, sync::Once};

use anyhow::{anyhow, Context, Result};
use tracing_appender::{
	non_blocking::WorkerGuard,
	rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "tandem.log";

/// Installs the global subscriber: `RUST_LOG` (or `default_filter`) to stdout
/// and to a daily rolling file under `logs_dir`
///
/// Only the first call in a process installs anything; later calls return
/// `Ok(None)`. Keep the returned guard alive for as long as file logs should
/// be flushed.
pub fn init_tracing(logs_dir: impl AsRef<Path>, default_filter: &str) -> Result<Option<WorkerGuard>> {
	static INIT: Once = Once::new();

	let mut result = Ok(None);
	INIT.call_once(|| {
		result = install(logs_dir.as_ref(), default_filter).map(Some);
	});

	result
}

fn install(logs_dir: &Path, default_filter: &str) -> Result<WorkerGuard> {
	fs::create_dir_all(logs_dir)
		.with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

	let (file_writer, guard) = tracing_appender::non_blocking(RollingFileAppender::new(
		Rotation::DAILY,
		logs_dir,
		LOG_FILE_PREFIX,
	));

	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(default_filter))
		.with_context(|| format!("invalid log filter '{default_filter}'"))?;

	tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer().with_target(true).with_writer(std::io::stdout))
		.with(
			fmt::layer()
				.with_target(true)
				.with_ansi(false)
				.with_writer(file_writer),
		)
		.try_init()
		.map_err(|e| anyhow!("failed to initialize tracing: {e}"))?;

	Ok(guard)
}
