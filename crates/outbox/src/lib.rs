//! Client-side offline outbox.
//!
//! Mutations made while offline are persisted with a transaction id that
//! doubles as their idempotency key, then delivered in order once the network
//! comes back. Instances sharing a store elect a single leader that does the
//! delivering; the others only queue.

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

use td_sync::TransactionId;
use td_utils::error::FileIOError;

mod entry;
mod executor;
mod leader;
mod mutation;
mod retry;
mod store;

pub use entry::{MutationName, PendingMutation};
pub use executor::{OutboxEvent, OutboxExecutor, PassReport};
pub use leader::{
	LeaderElector, LeaderState, Lease, LeaseConfig, DEFAULT_HEARTBEAT, DEFAULT_LEASE_TTL,
};
pub use mutation::{
	default_classifier, MutationContext, MutationError, MutationFn, MutationOutput,
	MutationRegistry, RetryClassifier,
};
pub use retry::{
	BackoffPolicy, DeadLetterPolicy, EvictionPolicy, RetryPolicy, DEFAULT_INITIAL_BACKOFF,
	DEFAULT_JITTER_RATIO, DEFAULT_MAX_BACKOFF, DEFAULT_RETRY_HORIZON,
};
pub use store::{FileOutboxStore, LeaseStore, MemoryOutboxStore, OutboxStore};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("failed to encode outbox snapshot: {0}")]
	Encode(#[from] rmp_serde::encode::Error),
	#[error("failed to decode outbox snapshot: {0}")]
	Decode(#[from] rmp_serde::decode::Error),

	// Outcomes of a submitted mutation
	#[error("mutation <key='{key}'> was rejected: {error}")]
	Rejected {
		key: TransactionId,
		#[source]
		error: MutationError,
	},
	#[error("mutation <key='{0}'> outlived the retry horizon and was evicted")]
	Evicted(TransactionId),
	#[error("mutation <key='{0}'> was moved to dead letters")]
	DeadLettered(TransactionId),
	#[error("mutation <key='{key}'> names an unregistered function: {mutation}")]
	UnknownMutation {
		key: TransactionId,
		mutation: MutationName,
	},
	#[error("outbox executor shut down")]
	Shutdown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
