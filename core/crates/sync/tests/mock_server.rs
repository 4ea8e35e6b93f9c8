use td_core_sync::{
	memory::{Commit, MemoryChangeStore},
	Applied, CatchUpConfig, ClientMutation, Error, FieldExpectation, SyncManager,
};
use td_sync::{ChangeAction, EntityRef, ScopeKey, TransactionId};

use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

/// A server holding one change store, minting entity ids the way a database would
pub struct Server {
	pub store: Arc<MemoryChangeStore>,
	pub sync: SyncManager,
	next_id: AtomicU64,
}

impl Server {
	pub fn new() -> Self {
		let store = Arc::new(MemoryChangeStore::default());

		Self {
			sync: SyncManager::new(store.clone(), store.clone(), CatchUpConfig::default()),
			store,
			next_id: AtomicU64::new(123),
		}
	}

	/// Inserts an entity of `entity_type`, returning its freshly minted id
	pub async fn create(&self, entity_type: &str, tx: &str) -> Result<Applied, Error> {
		let mutation = ClientMutation {
			transaction_id: tx.into(),
			entity_type: entity_type.into(),
			entity_id: None,
			expectations: vec![],
		};

		self.sync
			.apply(&mutation, || async {
				let id = self.next_id.fetch_add(1, Ordering::SeqCst);
				let entity = EntityRef::new(entity_type, format!("{}_{id}", prefix(entity_type)));
				self.store
					.commit(Commit {
						entity: entity.clone(),
						action: ChangeAction::Insert,
						changed_fields: vec![],
						transaction_id: Some(mutation.transaction_id.clone()),
						scopes: vec![ScopeKey::entity_type(entity_type)],
					})
					.await;
				Ok::<_, Error>(entity)
			})
			.await
	}

	/// Writes `field` on an existing entity, guarded by the client's baseline
	pub async fn set_field(
		&self,
		entity: &EntityRef,
		field: &str,
		expected: Option<TransactionId>,
		tx: &str,
	) -> Result<Applied, Error> {
		let mutation = ClientMutation {
			transaction_id: tx.into(),
			entity_type: entity.entity_type.clone(),
			entity_id: Some(entity.entity_id.clone()),
			expectations: vec![FieldExpectation::new(field, expected)],
		};

		self.sync
			.apply(&mutation, || async {
				self.store
					.commit(Commit {
						entity: entity.clone(),
						action: ChangeAction::Update,
						changed_fields: vec![field.to_string()],
						transaction_id: Some(mutation.transaction_id.clone()),
						scopes: vec![ScopeKey::entity_type(&entity.entity_type)],
					})
					.await;
				Ok::<_, Error>(entity.clone())
			})
			.await
	}

	pub async fn delete(&self, entity: &EntityRef) {
		self.store
			.commit(Commit {
				entity: entity.clone(),
				action: ChangeAction::Delete,
				changed_fields: vec![],
				transaction_id: None,
				scopes: vec![ScopeKey::entity_type(&entity.entity_type)],
			})
			.await;
	}

	/// Bumps a scope counter through an insert without a transaction id
	pub async fn touch(&self, entity_type: &str, entity_id: &str) {
		self.store
			.commit(Commit {
				entity: EntityRef::new(entity_type, entity_id),
				action: ChangeAction::Insert,
				changed_fields: vec![],
				transaction_id: None,
				scopes: vec![ScopeKey::entity_type(entity_type)],
			})
			.await;
	}
}

fn prefix(entity_type: &str) -> &str {
	match entity_type {
		"organization" => "org",
		other => other,
	}
}
