use td_sync::ChangeLogEntry;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
	Change(ChangeLogEntry),
	/// Entries were dropped because the subscriber fell behind; run a catch-up
	Lagged(u64),
}

/// Live subscription to committed change log entries
///
/// Ends when the cancellation token fires or the store goes away.
#[derive(Debug)]
pub struct ChangeStream {
	rx: broadcast::Receiver<ChangeLogEntry>,
	entity_types: Option<Vec<String>>,
	cancel: CancellationToken,
}

impl ChangeStream {
	pub(crate) fn new(
		rx: broadcast::Receiver<ChangeLogEntry>,
		entity_types: Option<Vec<String>>,
		cancel: CancellationToken,
	) -> Self {
		Self {
			rx,
			entity_types,
			cancel,
		}
	}

	/// Next event, or `None` once cancelled or closed
	pub async fn next(&mut self) -> Option<StreamEvent> {
		loop {
			let received = tokio::select! {
				biased;
				() = self.cancel.cancelled() => {
					trace!("Change stream cancelled");
					return None;
				}
				received = self.rx.recv() => received,
			};

			match received {
				Ok(entry) if self.wants(&entry) => return Some(StreamEvent::Change(entry)),
				Ok(_) => continue,
				Err(RecvError::Lagged(skipped)) => {
					warn!(%skipped, "Change stream lagged behind, client must catch up");
					return Some(StreamEvent::Lagged(skipped));
				}
				Err(RecvError::Closed) => return None,
			}
		}
	}

	fn wants(&self, entry: &ChangeLogEntry) -> bool {
		self.entity_types
			.as_ref()
			.map_or(true, |types| types.contains(&entry.entity_type))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::{Commit, MemoryChangeStore};

	use td_sync::{ChangeAction, EntityRef, ScopeKey};

	fn insert(entity_type: &str, entity_id: &str) -> Commit {
		Commit {
			entity: EntityRef::new(entity_type, entity_id),
			action: ChangeAction::Insert,
			changed_fields: vec![],
			transaction_id: None,
			scopes: vec![ScopeKey::entity_type(entity_type)],
		}
	}

	#[tokio::test]
	async fn filters_by_entity_type() {
		let store = MemoryChangeStore::default();
		let mut stream = store.subscribe(Some(vec!["task".into()]), CancellationToken::new());

		store.commit(insert("page", "page_1")).await;
		store.commit(insert("task", "task_1")).await;

		match stream.next().await {
			Some(StreamEvent::Change(entry)) => assert_eq!(entry.entity_id, "task_1"),
			other => panic!("unexpected event: {other:?}"),
		}
	}

	#[tokio::test]
	async fn cancellation_ends_the_stream() {
		let store = MemoryChangeStore::default();
		let cancel = CancellationToken::new();
		let mut stream = store.subscribe(None, cancel.clone());

		cancel.cancel();
		store.commit(insert("task", "task_1")).await;

		assert_eq!(stream.next().await, None);
	}
}
