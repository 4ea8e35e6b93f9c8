//! Shared primitives of the Tandem sync core: the hybrid logical clock that
//! mints transaction ids, the time sources it reads, and the change log data
//! model every other sync crate builds on.

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

mod change_log;
mod hlc;
mod time_source;

pub use change_log::{
	ChangeAction, ChangeLog, ChangeLogEntry, ChangeLogId, Cursor, EntityRef, ScopeKey,
	ScopeSequences,
};
pub use hlc::{
	HlcError, HlcTimestamp, HybridClock, TransactionId, LOGICAL_WIDTH, MAX_LOGICAL, WALL_WIDTH,
};
pub use time_source::{ms_to_datetime, FakeTimeSource, SystemTimeSource, TimeSource};

/// Failure reported by the storage layer behind [`ChangeLog`] and [`ScopeSequences`]
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("change store unavailable: {0}")]
	Unavailable(String),
	#[error("change store backend error: {0}")]
	Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}
