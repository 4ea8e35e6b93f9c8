use td_sync::{ChangeLog, EntityRef, TransactionId};

use std::{
	collections::HashMap,
	future::Future,
	sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use super::Error;

/// Result of applying a client mutation exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "entity", rename_all = "snake_case")]
pub enum Applied {
	/// The mutation ran now
	Fresh(EntityRef),
	/// The transaction was already processed, nothing ran
	Replayed(EntityRef),
}

impl Applied {
	#[must_use]
	pub const fn entity(&self) -> &EntityRef {
		match self {
			Self::Fresh(entity) | Self::Replayed(entity) => entity,
		}
	}

	#[must_use]
	pub const fn is_replay(&self) -> bool {
		matches!(self, Self::Replayed(_))
	}
}

type Slots = Arc<Mutex<HashMap<TransactionId, Arc<AsyncMutex<()>>>>>;

/// Deduplicates client mutations by their transaction id
///
/// A transaction already present in the change log is a success, never an
/// error: the caller gets the entity the first application produced.
#[derive(Clone)]
pub struct IdempotencyGuard {
	log: Arc<dyn ChangeLog>,
	in_flight: Slots,
}

impl IdempotencyGuard {
	#[must_use]
	pub fn new(log: Arc<dyn ChangeLog>) -> Self {
		Self {
			log,
			in_flight: Slots::default(),
		}
	}

	pub async fn is_transaction_processed(
		&self,
		transaction_id: &TransactionId,
	) -> Result<bool, Error> {
		Ok(self.log.find_by_transaction(transaction_id).await?.is_some())
	}

	pub async fn get_entity_by_transaction(
		&self,
		transaction_id: &TransactionId,
	) -> Result<Option<EntityRef>, Error> {
		Ok(self
			.log
			.find_by_transaction(transaction_id)
			.await?
			.map(|entry| entry.entity()))
	}

	/// Runs `commit` unless `transaction_id` was already applied
	///
	/// Concurrent deliveries of one id through this guard run one at a time, so
	/// the later ones replay. Guards in other processes are not coordinated:
	/// the commit layer behind them must itself refuse a transaction id it has
	/// already recorded, as [`MemoryChangeStore::commit`] does.
	///
	/// [`MemoryChangeStore::commit`]: crate::memory::MemoryChangeStore::commit
	pub async fn apply_once<F, Fut>(
		&self,
		transaction_id: &TransactionId,
		commit: F,
	) -> Result<Applied, Error>
	where
		F: FnOnce() -> Fut + Send,
		Fut: Future<Output = Result<EntityRef, Error>> + Send,
	{
		let _in_flight = self.serialize(transaction_id).await;

		if let Some(entity) = self.get_entity_by_transaction(transaction_id).await? {
			debug!(%transaction_id, %entity, "Transaction already processed, replaying result");
			return Ok(Applied::Replayed(entity));
		}

		commit().await.map(Applied::Fresh)
	}

	async fn serialize(&self, transaction_id: &TransactionId) -> InFlight {
		let slot = Arc::clone(
			self.in_flight
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.entry(transaction_id.clone())
				.or_default(),
		);

		InFlight {
			permit: Some(Arc::clone(&slot).lock_owned().await),
			slot,
			slots: Arc::clone(&self.in_flight),
			transaction_id: transaction_id.clone(),
		}
	}
}

/// Exclusive turn at applying one transaction id
struct InFlight {
	permit: Option<OwnedMutexGuard<()>>,
	slot: Arc<AsyncMutex<()>>,
	slots: Slots,
	transaction_id: TransactionId,
}

impl Drop for InFlight {
	fn drop(&mut self) {
		self.permit.take();

		let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
		// Only the map and this turn still hold the slot: nobody is queued behind us
		if Arc::strong_count(&self.slot) == 2 {
			slots.remove(&self.transaction_id);
		}
	}
}
