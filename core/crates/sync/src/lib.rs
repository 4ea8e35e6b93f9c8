//! Server-side sync core: field-level conflict detection, idempotent replay of
//! client transactions and scope-sequence catch-up, all reading the change log
//! through the traits defined in `td-sync`.

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

use td_sync::{Cursor, StoreError};

mod catch_up;
mod conflict;
mod idempotency;
mod manager;
pub mod memory;
mod stream;

pub use catch_up::{
	CatchUpConfig, CatchUpReconciler, CatchUpRequest, CatchUpResponse, ScopeChanges,
	DEFAULT_DELETE_LIMIT,
};
pub use conflict::{ConflictCheck, ConflictDetector, FieldConflict, FieldExpectation};
pub use idempotency::{Applied, IdempotencyGuard};
pub use manager::{ClientMutation, Manager as SyncManager};
pub use stream::{ChangeStream, StreamEvent};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("{} field(s) changed since the client baseline", .0.len())]
	Conflict(Vec<FieldConflict>),
	#[error("invalid catch-up cursor: <cursor='{0}'>")]
	InvalidCursor(Cursor),
	#[error("commit failed: {0}")]
	Commit(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
	/// Conflicting fields when this is a conflict, for the merge UI
	#[must_use]
	pub fn conflicts(&self) -> Option<&[FieldConflict]> {
		match self {
			Self::Conflict(conflicts) => Some(conflicts),
			_ => None,
		}
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
