//! Per-process context objects
//!
//! Everything that would otherwise be process-wide state (the clock, the
//! in-flight request registry, the outbox and its election) lives in one of
//! these, built once and handed to whoever needs it. Two contexts in the same
//! process never share anything unless given the same store.

use td_coalesce::{CoalesceError, Coalescer};
use td_core_sync::{
	memory::MemoryChangeStore, CatchUpRequest, CatchUpResponse, ChangeStream, SyncManager,
};
use td_outbox::{
	FileOutboxStore, LeaderElector, LeaseStore, MutationError, MutationOutput, MutationRegistry,
	OutboxExecutor, OutboxStore,
};
use td_sync::{
	ChangeLog, Cursor, HlcError, HlcTimestamp, HybridClock, ScopeKey, ScopeSequences,
	SystemTimeSource, TransactionId,
};

use std::{
	collections::HashMap,
	fmt,
	future::Future,
	sync::{Arc, Mutex, PoisonError},
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::config::SyncConfig;

const CATCH_UP_KEY: &str = "catch-up";

/// Server side: change store, clock and the sync read path over them
pub struct ServerSyncContext {
	clock: Arc<HybridClock>,
	store: Arc<MemoryChangeStore>,
	sync: SyncManager,
}

impl fmt::Debug for ServerSyncContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ServerSyncContext")
			.field("clock", &self.clock)
			.finish_non_exhaustive()
	}
}

impl ServerSyncContext {
	#[must_use]
	pub fn new(config: &SyncConfig) -> Self {
		Self::with_store(config, Arc::new(MemoryChangeStore::default()))
	}

	#[must_use]
	pub fn with_store(config: &SyncConfig, store: Arc<MemoryChangeStore>) -> Self {
		let sync = SyncManager::new(
			Arc::clone(&store) as Arc<dyn ChangeLog>,
			Arc::clone(&store) as Arc<dyn ScopeSequences>,
			config.catch_up,
		);

		Self {
			clock: Arc::new(HybridClock::new(config.node_id)),
			store,
			sync,
		}
	}

	#[must_use]
	pub const fn clock(&self) -> &Arc<HybridClock> {
		&self.clock
	}

	#[must_use]
	pub const fn store(&self) -> &Arc<MemoryChangeStore> {
		&self.store
	}

	#[must_use]
	pub const fn sync(&self) -> &SyncManager {
		&self.sync
	}

	/// Merges a client's transaction id so ids minted here order after it
	pub fn observe(&self, transaction_id: &TransactionId) -> Result<HlcTimestamp, HlcError> {
		self.clock.receive_id(transaction_id)
	}

	pub fn subscribe(
		&self,
		entity_types: Option<Vec<String>>,
		cancel: CancellationToken,
	) -> ChangeStream {
		self.store.subscribe(entity_types, cancel)
	}
}

/// What a client knows about the server after its last catch-up
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct CatchUpState {
	cursor: Option<Cursor>,
	seqs: HashMap<ScopeKey, u64>,
}

impl CatchUpState {
	fn request(&self) -> CatchUpRequest {
		CatchUpRequest {
			cursor: self.cursor.clone(),
			client_seqs: (!self.seqs.is_empty()).then(|| self.seqs.clone()),
		}
	}

	fn record(&mut self, response: &CatchUpResponse) {
		// A truncated page leaves deletions behind the new cursor; keeping the
		// old seqs makes the next call fetch them instead of fast-pathing
		if !response.has_more {
			for (scope, changes) in &response.changes {
				self.seqs.insert(scope.clone(), changes.seq);
			}
		}

		if response.cursor.is_some() {
			self.cursor.clone_from(&response.cursor);
		}
	}
}

/// Client side: clock, durable outbox with its election, and request coalescing
///
/// Each context gets its own instance id, so several instances on one device
/// never mint the same transaction id nor mistake each other's lease.
pub struct ClientSyncContext {
	config: SyncConfig,
	instance_id: Uuid,
	clock: Arc<HybridClock>,
	outbox: Arc<OutboxExecutor>,
	requests: Coalescer<MutationOutput, MutationError>,
	catch_ups: Coalescer<CatchUpResponse, String>,
	catch_up_state: Mutex<CatchUpState>,
	cancel: CancellationToken,
	runner: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ClientSyncContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientSyncContext")
			.field("instance_id", &self.instance_id)
			.field("outbox", &self.outbox)
			.finish_non_exhaustive()
	}
}

impl ClientSyncContext {
	/// Builds a context over the outbox file named in `config`
	#[must_use]
	pub fn new(config: SyncConfig, registry: MutationRegistry) -> Self {
		let store = Arc::new(FileOutboxStore::new(config.outbox_store_path()));
		Self::with_store(config, store, registry)
	}

	/// Builds a context over any shared outbox store
	#[must_use]
	pub fn with_store<S>(config: SyncConfig, store: Arc<S>, registry: MutationRegistry) -> Self
	where
		S: OutboxStore + LeaseStore + 'static,
	{
		let instance_id = Uuid::new_v4();
		let clock = Arc::new(HybridClock::new(instance_id));

		let leader = Arc::new(LeaderElector::new(
			instance_id,
			Arc::clone(&store) as Arc<dyn LeaseStore>,
			Arc::new(SystemTimeSource),
			config.outbox.lease_config(),
		));

		let outbox = Arc::new(
			OutboxExecutor::new(
				Arc::clone(&clock),
				store as Arc<dyn OutboxStore>,
				leader,
				registry,
			)
			.with_retry_policy(config.outbox.retry_policy()),
		);

		Self {
			config,
			instance_id,
			clock,
			outbox,
			requests: Coalescer::new(),
			catch_ups: Coalescer::new(),
			catch_up_state: Mutex::default(),
			cancel: CancellationToken::new(),
			runner: Mutex::default(),
		}
	}

	#[must_use]
	pub const fn config(&self) -> &SyncConfig {
		&self.config
	}

	#[must_use]
	pub const fn instance_id(&self) -> Uuid {
		self.instance_id
	}

	#[must_use]
	pub const fn clock(&self) -> &Arc<HybridClock> {
		&self.clock
	}

	#[must_use]
	pub const fn outbox(&self) -> &Arc<OutboxExecutor> {
		&self.outbox
	}

	/// Coalescer for ad-hoc fetches such as presigned urls
	#[must_use]
	pub const fn requests(&self) -> &Coalescer<MutationOutput, MutationError> {
		&self.requests
	}

	/// Starts the outbox run loop on the current Tokio runtime, once
	pub fn start(&self) {
		let mut runner = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
		if runner.is_some() {
			return;
		}

		info!(instance_id = %self.instance_id, "Starting outbox executor");
		*runner = Some(tokio::spawn({
			let outbox = Arc::clone(&self.outbox);
			let cancel = self.cancel.child_token();
			async move { outbox.run(cancel).await }
		}));
	}

	/// Stops the run loop, resigning leadership if held
	pub async fn shutdown(&self) {
		self.cancel.cancel();

		let runner = self
			.runner
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();

		if let Some(runner) = runner {
			if let Err(e) = runner.await {
				error!(?e, "Outbox executor task failed");
			}
		}
	}

	/// Request for the next catch-up, built from what previous ones returned
	#[must_use]
	pub fn catch_up_request(&self) -> CatchUpRequest {
		self.catch_up_state
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.request()
	}

	/// Runs a catch-up through `fetch` and records its outcome
	///
	/// Concurrent calls, e.g. several reconnect triggers firing at once, share
	/// one round trip.
	pub async fn reconcile<F, Fut>(&self, fetch: F) -> Result<CatchUpResponse, CoalesceError<String>>
	where
		F: FnOnce(CatchUpRequest) -> Fut,
		Fut: Future<Output = Result<CatchUpResponse, String>> + Send + 'static,
	{
		let request = self.catch_up_request();
		let response = self
			.catch_ups
			.coalesce(CATCH_UP_KEY, move || fetch(request))
			.await?;

		debug!(
			changed_scopes = response.changes.len(),
			has_more = response.has_more,
			"Catch-up received"
		);

		self.catch_up_state
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.record(&response);

		Ok(response)
	}
}
