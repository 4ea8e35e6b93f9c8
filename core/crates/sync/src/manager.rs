use td_sync::{ChangeLog, EntityRef, ScopeKey, ScopeSequences, TransactionId};

use std::{fmt, future::Future, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{
	Applied, CatchUpConfig, CatchUpReconciler, CatchUpRequest, CatchUpResponse, ConflictDetector,
	Error, FieldExpectation, IdempotencyGuard,
};

/// A client mutation as it arrives at the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMutation {
	pub transaction_id: TransactionId,
	pub entity_type: String,
	/// `None` for inserts, which have no fields to conflict on yet
	#[serde(default)]
	pub entity_id: Option<String>,
	#[serde(default)]
	pub expectations: Vec<FieldExpectation>,
}

/// Bundles the read side of the sync core around one change store
pub struct Manager {
	conflicts: ConflictDetector,
	idempotency: IdempotencyGuard,
	catch_up: CatchUpReconciler,
}

impl fmt::Debug for Manager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SyncManager").finish()
	}
}

impl Manager {
	#[must_use]
	pub fn new(
		log: Arc<dyn ChangeLog>,
		sequences: Arc<dyn ScopeSequences>,
		catch_up: CatchUpConfig,
	) -> Self {
		Self {
			conflicts: ConflictDetector::new(Arc::clone(&log)),
			idempotency: IdempotencyGuard::new(Arc::clone(&log)),
			catch_up: CatchUpReconciler::new(log, sequences, catch_up),
		}
	}

	#[must_use]
	pub const fn conflicts(&self) -> &ConflictDetector {
		&self.conflicts
	}

	#[must_use]
	pub const fn idempotency(&self) -> &IdempotencyGuard {
		&self.idempotency
	}

	/// Applies a client mutation at most once
	///
	/// A replayed transaction returns the entity of its first application
	/// without checking conflicts or running `commit`. Otherwise every field
	/// expectation must still hold, or the structured conflicts are returned.
	#[instrument(
		skip_all,
		fields(transaction_id = %mutation.transaction_id, entity_type = %mutation.entity_type),
		err
	)]
	pub async fn apply<F, Fut>(&self, mutation: &ClientMutation, commit: F) -> Result<Applied, Error>
	where
		F: FnOnce() -> Fut + Send,
		Fut: Future<Output = Result<EntityRef, Error>> + Send,
	{
		self.idempotency
			.apply_once(&mutation.transaction_id, || async move {
				if let Some(entity_id) = &mutation.entity_id {
					self.conflicts
						.ensure_no_conflicts(
							&mutation.entity_type,
							entity_id,
							&mutation.expectations,
						)
						.await?;
				}

				let entity = commit().await?;
				debug!(%entity, "Client mutation committed");

				Ok::<_, Error>(entity)
			})
			.await
	}

	pub async fn catch_up(
		&self,
		scopes: &[ScopeKey],
		request: CatchUpRequest,
	) -> Result<CatchUpResponse, Error> {
		self.catch_up.catch_up(scopes, request).await
	}
}
