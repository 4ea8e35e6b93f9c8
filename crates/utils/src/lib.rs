//! Small helpers shared by the Tandem crates that touch the filesystem.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use std::{io::ErrorKind, path::Path};

use tokio::fs;
use uuid::Uuid;

pub mod error;

use error::FileIOError;

/// Reads a whole file, `None` when it does not exist yet
pub async fn read_if_exists(path: impl AsRef<Path>) -> Result<Option<Vec<u8>>, FileIOError> {
	let path = path.as_ref();

	match fs::read(path).await {
		Ok(bytes) => Ok(Some(bytes)),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
		Err(e) => Err(FileIOError::new(path, e, "read")),
	}
}

/// Replaces `path` with `bytes` so readers see either the old or the new file
///
/// The bytes go to a sibling temp file first, which is then renamed over the
/// target. Parent directories are created as needed.
pub async fn write_atomic(path: impl AsRef<Path>, bytes: &[u8]) -> Result<(), FileIOError> {
	let path = path.as_ref();

	if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
		fs::create_dir_all(parent)
			.await
			.map_err(|e| FileIOError::new(parent, e, "create parent directory"))?;
	}

	let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));

	fs::write(&tmp, bytes)
		.await
		.map_err(|e| FileIOError::new(&tmp, e, "write temp file"))?;

	if let Err(e) = fs::rename(&tmp, path).await {
		let _ = fs::remove_file(&tmp).await;
		return Err(FileIOError::new(path, e, "rename temp file"));
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn missing_file_reads_as_none() {
		let dir = tempfile::tempdir().unwrap();

		assert_eq!(read_if_exists(dir.path().join("nope")).await.unwrap(), None);
	}

	#[tokio::test]
	async fn atomic_write_replaces_contents_and_leaves_no_temp_files() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("nested").join("state.bin");

		write_atomic(&path, b"first").await.unwrap();
		write_atomic(&path, b"second").await.unwrap();

		assert_eq!(read_if_exists(&path).await.unwrap(), Some(b"second".to_vec()));

		let mut entries = std::fs::read_dir(path.parent().unwrap()).unwrap();
		assert!(entries.next().is_some());
		assert!(entries.next().is_none());
	}

	#[test]
	fn io_errors_mention_path_and_context() {
		let err = FileIOError::new(
			"/tmp/outbox.bin",
			std::io::Error::from(ErrorKind::PermissionDenied),
			"read",
		);

		let message = err.to_string();
		assert!(message.contains("(read)"));
		assert!(message.contains("/tmp/outbox.bin"));
	}
}
