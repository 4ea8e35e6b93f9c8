use td_sync::{ChangeLog, TransactionId};

use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Error;

/// Outcome of a single field check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCheck {
	pub has_conflict: bool,
	/// Latest transaction recorded for the field, drives the merge UI
	pub server_transaction_id: Option<TransactionId>,
}

/// The transaction a client last saw for one field of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldExpectation {
	pub field: String,
	pub expected_transaction_id: Option<TransactionId>,
}

impl FieldExpectation {
	pub fn new(field: impl Into<String>, expected: Option<TransactionId>) -> Self {
		Self {
			field: field.into(),
			expected_transaction_id: expected,
		}
	}
}

/// A field that changed on the server since the client's baseline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
	pub field: String,
	pub expected_transaction_id: Option<TransactionId>,
	pub server_transaction_id: TransactionId,
}

/// Field-level optimistic lock over the change log
///
/// Edits to different fields of the same entity never conflict with each other.
#[derive(Clone)]
pub struct ConflictDetector {
	log: Arc<dyn ChangeLog>,
}

impl ConflictDetector {
	#[must_use]
	pub fn new(log: Arc<dyn ChangeLog>) -> Self {
		Self { log }
	}

	/// A field never written before is conflict-free whatever the expectation.
	/// A recorded transaction conflicts unless it is exactly the expected one,
	/// so a client without a baseline (`None`) conflicts with any recorded write.
	pub async fn check(
		&self,
		entity_type: &str,
		entity_id: &str,
		field: &str,
		expected: Option<&TransactionId>,
	) -> Result<ConflictCheck, Error> {
		let server_transaction_id = self
			.log
			.latest_field_transaction(entity_type, entity_id, field)
			.await?;

		let has_conflict = server_transaction_id
			.as_ref()
			.is_some_and(|server| Some(server) != expected);

		if has_conflict {
			debug!(
				%entity_type,
				%entity_id,
				%field,
				expected = ?expected,
				server = ?server_transaction_id,
				"Field changed since client baseline"
			);
		}

		Ok(ConflictCheck {
			has_conflict,
			server_transaction_id,
		})
	}

	/// Checks every expectation and returns the conflicting fields only
	pub async fn check_fields(
		&self,
		entity_type: &str,
		entity_id: &str,
		expectations: &[FieldExpectation],
	) -> Result<Vec<FieldConflict>, Error> {
		let checks = try_join_all(expectations.iter().map(|expectation| {
			self.check(
				entity_type,
				entity_id,
				&expectation.field,
				expectation.expected_transaction_id.as_ref(),
			)
		}))
		.await?;

		Ok(expectations
			.iter()
			.zip(checks)
			.filter_map(|(expectation, check)| match check {
				ConflictCheck {
					has_conflict: true,
					server_transaction_id: Some(server_transaction_id),
				} => Some(FieldConflict {
					field: expectation.field.clone(),
					expected_transaction_id: expectation.expected_transaction_id.clone(),
					server_transaction_id,
				}),
				_ => None,
			})
			.collect())
	}

	/// Like [`ConflictDetector::check_fields`] but fails with [`Error::Conflict`]
	pub async fn ensure_no_conflicts(
		&self,
		entity_type: &str,
		entity_id: &str,
		expectations: &[FieldExpectation],
	) -> Result<(), Error> {
		let conflicts = self
			.check_fields(entity_type, entity_id, expectations)
			.await?;

		if conflicts.is_empty() {
			Ok(())
		} else {
			Err(Error::Conflict(conflicts))
		}
	}
}
