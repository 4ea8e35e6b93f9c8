use std::{fmt::Display, path::Path};

use thiserror::Error;
use tracing::error;

/// Logs the error of a fire-and-forget operation, if any
pub fn report_error<T>(res: &Result<T, impl Display>, context: &str) {
	if let Err(e) = res {
		error!(%context, "{e:#}");
	}
}

/// File I/O error carrying the path it happened on
#[derive(Error, Debug)]
pub struct FileIOError {
	pub path: Box<Path>,
	#[source]
	pub source: std::io::Error,
	pub maybe_context: Option<&'static str>,
}

impl Display for FileIOError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "file I/O error")?;
		if let Some(ctx) = self.maybe_context {
			write!(f, " ({ctx})")?;
		}
		write!(f, ": {}; path: '{}'", self.source, self.path.display())
	}
}

impl FileIOError {
	pub fn new(path: impl AsRef<Path>, source: std::io::Error, context: &'static str) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: Some(context),
		}
	}
}

impl From<(&Path, std::io::Error)> for FileIOError {
	fn from((path, source): (&Path, std::io::Error)) -> Self {
		Self {
			path: path.into(),
			source,
			maybe_context: None,
		}
	}
}
