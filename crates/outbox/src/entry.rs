use td_sync::TransactionId;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name a mutation function is registered under: `{entity_type}.{operation}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationName(String);

impl MutationName {
	pub fn new(entity_type: impl AsRef<str>, operation: impl AsRef<str>) -> Self {
		Self(format!("{}.{}", entity_type.as_ref(), operation.as_ref()))
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for MutationName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// A mutation waiting in the outbox
///
/// The idempotency key is minted once at enqueue time and resent unchanged on
/// every retry, so the server can absorb duplicate deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
	pub idempotency_key: TransactionId,
	pub entity_type: String,
	pub operation: String,
	pub payload: serde_json::Value,
	pub enqueued_at: DateTime<Utc>,
	pub retry_count: u32,
	/// Earliest time the next attempt may run, `None` until the first failure
	#[serde(default)]
	pub next_attempt_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub last_error: Option<String>,
}

impl PendingMutation {
	pub fn new(
		idempotency_key: TransactionId,
		entity_type: impl Into<String>,
		operation: impl Into<String>,
		payload: serde_json::Value,
		enqueued_at: DateTime<Utc>,
	) -> Self {
		Self {
			idempotency_key,
			entity_type: entity_type.into(),
			operation: operation.into(),
			payload,
			enqueued_at,
			retry_count: 0,
			next_attempt_at: None,
			last_error: None,
		}
	}

	#[must_use]
	pub fn mutation_name(&self) -> MutationName {
		MutationName::new(&self.entity_type, &self.operation)
	}

	/// Whether the entry is still backing off at `now`
	#[must_use]
	pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
		self.next_attempt_at.is_some_and(|at| at > now)
	}
}
