//! Durable outbox storage
//!
//! Any instance sharing a store may append; only the elected leader removes or
//! reschedules entries. The same store also holds the leadership lease so that
//! election and the queue it guards live in one place.

use td_sync::TransactionId;
use td_utils::{read_if_exists, write_atomic};

use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{entry::PendingMutation, leader::Lease, Error};

/// Append-only from every instance, mutated by the leader
#[async_trait]
pub trait OutboxStore: Send + Sync {
	/// Persists `entry` at the tail of the queue
	async fn append(&self, entry: PendingMutation) -> Result<(), Error>;

	/// Every pending entry, oldest first
	async fn pending(&self) -> Result<Vec<PendingMutation>, Error>;

	/// Replaces the entry with the same idempotency key, keeping its position
	async fn update(&self, entry: &PendingMutation) -> Result<(), Error>;

	async fn remove(&self, key: &TransactionId) -> Result<Option<PendingMutation>, Error>;

	/// Moves an entry out of the queue into the dead-letter list
	async fn dead_letter(&self, entry: PendingMutation) -> Result<(), Error>;

	async fn dead_letters(&self) -> Result<Vec<PendingMutation>, Error>;
}

/// Shared leadership lease with compare-and-swap semantics
#[async_trait]
pub trait LeaseStore: Send + Sync {
	async fn read_lease(&self) -> Result<Option<Lease>, Error>;

	/// Stores `new` only if the current lease still equals `expected`
	async fn compare_and_swap_lease(
		&self,
		expected: Option<&Lease>,
		new: Option<Lease>,
	) -> Result<bool, Error>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Snapshot {
	pending: Vec<PendingMutation>,
	dead_letters: Vec<PendingMutation>,
	lease: Option<Lease>,
}

impl Snapshot {
	fn append(&mut self, entry: PendingMutation) -> bool {
		if self
			.pending
			.iter()
			.any(|pending| pending.idempotency_key == entry.idempotency_key)
		{
			return false;
		}
		self.pending.push(entry);
		true
	}

	fn update(&mut self, entry: &PendingMutation) -> bool {
		match self
			.pending
			.iter_mut()
			.find(|pending| pending.idempotency_key == entry.idempotency_key)
		{
			Some(pending) => {
				*pending = entry.clone();
				true
			}
			None => false,
		}
	}

	fn remove(&mut self, key: &TransactionId) -> Option<PendingMutation> {
		self.pending
			.iter()
			.position(|pending| &pending.idempotency_key == key)
			.map(|idx| self.pending.remove(idx))
	}

	fn dead_letter(&mut self, entry: PendingMutation) {
		self.remove(&entry.idempotency_key);
		self.dead_letters.push(entry);
	}

	fn swap_lease(&mut self, expected: Option<&Lease>, new: Option<Lease>) -> bool {
		if self.lease.as_ref() != expected {
			return false;
		}
		self.lease = new;
		true
	}
}

/// Process-local store; clones share one queue, like tabs sharing a browser store
#[derive(Debug, Default, Clone)]
pub struct MemoryOutboxStore {
	state: Arc<Mutex<Snapshot>>,
}

impl MemoryOutboxStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
	async fn append(&self, entry: PendingMutation) -> Result<(), Error> {
		self.state.lock().await.append(entry);
		Ok(())
	}

	async fn pending(&self) -> Result<Vec<PendingMutation>, Error> {
		Ok(self.state.lock().await.pending.clone())
	}

	async fn update(&self, entry: &PendingMutation) -> Result<(), Error> {
		self.state.lock().await.update(entry);
		Ok(())
	}

	async fn remove(&self, key: &TransactionId) -> Result<Option<PendingMutation>, Error> {
		Ok(self.state.lock().await.remove(key))
	}

	async fn dead_letter(&self, entry: PendingMutation) -> Result<(), Error> {
		self.state.lock().await.dead_letter(entry);
		Ok(())
	}

	async fn dead_letters(&self) -> Result<Vec<PendingMutation>, Error> {
		Ok(self.state.lock().await.dead_letters.clone())
	}
}

#[async_trait]
impl LeaseStore for MemoryOutboxStore {
	async fn read_lease(&self) -> Result<Option<Lease>, Error> {
		Ok(self.state.lock().await.lease.clone())
	}

	async fn compare_and_swap_lease(
		&self,
		expected: Option<&Lease>,
		new: Option<Lease>,
	) -> Result<bool, Error> {
		Ok(self.state.lock().await.swap_lease(expected, new))
	}
}

/// Outbox persisted as a single `MessagePack` file
///
/// Every change rewrites the whole snapshot through a temp file and a rename,
/// so a crash mid-write leaves the previous snapshot intact. Instances in one
/// process must share the same `FileOutboxStore` (behind an `Arc`) for their
/// writes to be serialized.
#[derive(Debug)]
pub struct FileOutboxStore {
	path: PathBuf,
	lock: Mutex<()>,
}

impl FileOutboxStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			lock: Mutex::new(()),
		}
	}

	#[must_use]
	pub fn path(&self) -> &Path {
		&self.path
	}

	async fn load(&self) -> Result<Snapshot, Error> {
		match read_if_exists(&self.path).await? {
			Some(bytes) => Ok(rmp_serde::from_slice(&bytes)?),
			None => {
				trace!(path = %self.path.display(), "No outbox file yet, starting empty");
				Ok(Snapshot::default())
			}
		}
	}

	async fn save(&self, snapshot: &Snapshot) -> Result<(), Error> {
		let bytes = rmp_serde::to_vec_named(snapshot)?;
		write_atomic(&self.path, &bytes).await?;
		debug!(
			path = %self.path.display(),
			pending = snapshot.pending.len(),
			bytes = bytes.len(),
			"Outbox persisted"
		);
		Ok(())
	}

	/// Loads, applies `f` and saves when `f` reports a change
	async fn modify<T: Send>(
		&self,
		f: impl FnOnce(&mut Snapshot) -> (T, bool) + Send,
	) -> Result<T, Error> {
		let _guard = self.lock.lock().await;

		let mut snapshot = self.load().await?;
		let (out, changed) = f(&mut snapshot);
		if changed {
			self.save(&snapshot).await?;
		}

		Ok(out)
	}

	async fn read(&self) -> Result<Snapshot, Error> {
		let _guard = self.lock.lock().await;
		self.load().await
	}
}

#[async_trait]
impl OutboxStore for FileOutboxStore {
	async fn append(&self, entry: PendingMutation) -> Result<(), Error> {
		self.modify(|snapshot| ((), snapshot.append(entry))).await
	}

	async fn pending(&self) -> Result<Vec<PendingMutation>, Error> {
		Ok(self.read().await?.pending)
	}

	async fn update(&self, entry: &PendingMutation) -> Result<(), Error> {
		let entry = entry.clone();
		self.modify(move |snapshot| ((), snapshot.update(&entry))).await
	}

	async fn remove(&self, key: &TransactionId) -> Result<Option<PendingMutation>, Error> {
		let key = key.clone();
		self.modify(move |snapshot| {
			let removed = snapshot.remove(&key);
			let changed = removed.is_some();
			(removed, changed)
		})
		.await
	}

	async fn dead_letter(&self, entry: PendingMutation) -> Result<(), Error> {
		self.modify(|snapshot| {
			snapshot.dead_letter(entry);
			((), true)
		})
		.await
	}

	async fn dead_letters(&self) -> Result<Vec<PendingMutation>, Error> {
		Ok(self.read().await?.dead_letters)
	}
}

#[async_trait]
impl LeaseStore for FileOutboxStore {
	async fn read_lease(&self) -> Result<Option<Lease>, Error> {
		Ok(self.read().await?.lease)
	}

	async fn compare_and_swap_lease(
		&self,
		expected: Option<&Lease>,
		new: Option<Lease>,
	) -> Result<bool, Error> {
		let expected = expected.cloned();
		self.modify(move |snapshot| {
			let swapped = snapshot.swap_lease(expected.as_ref(), new);
			(swapped, swapped)
		})
		.await
	}
}
