//! In-memory change store
//!
//! Stands in for the relational commit path in tests and single-process
//! deployments. Every [`Commit`] appends its change log entries and bumps the
//! affected scope counters under one write lock, so a reader can never see a
//! counter value whose entries are not visible yet.

use td_sync::{
	ChangeAction, ChangeLog, ChangeLogEntry, ChangeLogId, EntityRef, ScopeKey, ScopeSequences,
	StoreError, SystemTimeSource, TimeSource, TransactionId,
};

use std::{
	collections::HashMap,
	fmt,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::stream::ChangeStream;

const CHANGE_FEED_CAPACITY: usize = 1024;

/// A mutation as committed by the server
#[derive(Debug, Clone)]
pub struct Commit {
	pub entity: EntityRef,
	pub action: ChangeAction,
	/// One entry is written per field; no fields writes a single row-level entry
	pub changed_fields: Vec<String>,
	pub transaction_id: Option<TransactionId>,
	pub scopes: Vec<ScopeKey>,
}

#[derive(Default)]
struct Inner {
	entries: Vec<ChangeLogEntry>,
	by_transaction: HashMap<TransactionId, Vec<usize>>,
	seqs: HashMap<ScopeKey, u64>,
}

pub struct MemoryChangeStore {
	inner: RwLock<Inner>,
	time: Arc<dyn TimeSource>,
	feed: broadcast::Sender<ChangeLogEntry>,
	delete_scans: AtomicUsize,
}

impl fmt::Debug for MemoryChangeStore {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MemoryChangeStore").finish_non_exhaustive()
	}
}

impl Default for MemoryChangeStore {
	fn default() -> Self {
		Self::with_time_source(Arc::new(SystemTimeSource))
	}
}

impl MemoryChangeStore {
	#[must_use]
	pub fn with_time_source(time: Arc<dyn TimeSource>) -> Self {
		let (feed, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

		Self {
			inner: RwLock::default(),
			time,
			feed,
			delete_scans: AtomicUsize::new(0),
		}
	}

	/// Appends the commit's entries and bumps each scope counter once, atomically
	///
	/// Committing a transaction id that is already recorded changes nothing and
	/// returns the entries of the original commit.
	pub async fn commit(&self, commit: Commit) -> Vec<ChangeLogEntry> {
		let mut inner = self.inner.write().await;

		if let Some(existing) = commit
			.transaction_id
			.as_ref()
			.and_then(|tx| inner.by_transaction.get(tx))
		{
			debug!(
				transaction_id = ?commit.transaction_id,
				"Transaction already committed, skipping"
			);
			return existing
				.iter()
				.map(|&idx| inner.entries[idx].clone())
				.collect();
		}

		let created_at = self.time.now();
		let fields = if commit.changed_fields.is_empty() {
			vec![None]
		} else {
			commit.changed_fields.into_iter().map(Some).collect()
		};

		let mut written = Vec::with_capacity(fields.len());
		for changed_field in fields {
			let idx = inner.entries.len();
			let entry = ChangeLogEntry {
				id: ChangeLogId(idx as u64 + 1),
				entity_type: commit.entity.entity_type.clone(),
				entity_id: commit.entity.entity_id.clone(),
				action: commit.action,
				changed_field,
				transaction_id: commit.transaction_id.clone(),
				created_at,
			};

			if let Some(tx) = &entry.transaction_id {
				inner.by_transaction.entry(tx.clone()).or_default().push(idx);
			}
			inner.entries.push(entry.clone());
			written.push(entry);
		}

		for scope in commit.scopes {
			*inner.seqs.entry(scope).or_default() += 1;
		}

		for entry in &written {
			// No subscribers is fine, the log is the source of truth
			let _ = self.feed.send(entry.clone());
		}

		written
	}

	/// Live feed of committed entries, optionally filtered by entity type
	pub fn subscribe(
		&self,
		entity_types: Option<Vec<String>>,
		cancel: CancellationToken,
	) -> ChangeStream {
		ChangeStream::new(self.feed.subscribe(), entity_types, cancel)
	}

	/// Snapshot of the whole log, oldest first
	pub async fn entries(&self) -> Vec<ChangeLogEntry> {
		self.inner.read().await.entries.clone()
	}

	/// How many delete scans were issued against this store
	pub fn delete_scan_count(&self) -> usize {
		self.delete_scans.load(Ordering::Relaxed)
	}
}

#[async_trait]
impl ChangeLog for MemoryChangeStore {
	async fn latest_field_transaction(
		&self,
		entity_type: &str,
		entity_id: &str,
		field: &str,
	) -> Result<Option<TransactionId>, StoreError> {
		Ok(self
			.inner
			.read()
			.await
			.entries
			.iter()
			.filter(|entry| {
				entry.entity_type == entity_type
					&& entry.entity_id == entity_id
					&& entry.changed_field.as_deref() == Some(field)
					&& entry.transaction_id.is_some()
			})
			.max_by_key(|entry| (entry.created_at, entry.id))
			.and_then(|entry| entry.transaction_id.clone()))
	}

	async fn find_by_transaction(
		&self,
		transaction_id: &TransactionId,
	) -> Result<Option<ChangeLogEntry>, StoreError> {
		let inner = self.inner.read().await;

		Ok(inner
			.by_transaction
			.get(transaction_id)
			.and_then(|idxs| idxs.first())
			.map(|&idx| inner.entries[idx].clone()))
	}

	async fn deletions_after(
		&self,
		after: ChangeLogId,
		entity_types: &[String],
		limit: usize,
	) -> Result<Vec<ChangeLogEntry>, StoreError> {
		self.delete_scans.fetch_add(1, Ordering::Relaxed);

		Ok(self
			.inner
			.read()
			.await
			.entries
			.iter()
			.filter(|entry| {
				entry.id > after
					&& entry.action == ChangeAction::Delete
					&& entity_types.contains(&entry.entity_type)
			})
			.take(limit)
			.cloned()
			.collect())
	}

	async fn latest_id(&self, entity_types: &[String]) -> Result<Option<ChangeLogId>, StoreError> {
		Ok(self
			.inner
			.read()
			.await
			.entries
			.iter()
			.rev()
			.find(|entry| entity_types.contains(&entry.entity_type))
			.map(|entry| entry.id))
	}
}

#[async_trait]
impl ScopeSequences for MemoryChangeStore {
	async fn current_seqs(&self, scopes: &[ScopeKey]) -> Result<HashMap<ScopeKey, u64>, StoreError> {
		let inner = self.inner.read().await;

		Ok(scopes
			.iter()
			.filter_map(|scope| {
				inner
					.seqs
					.get(scope)
					.map(|&seq| (scope.clone(), seq))
			})
			.collect())
	}
}
