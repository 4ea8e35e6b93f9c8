//! Outbox executor
//!
//! Enqueueing persists first and dispatches later. Only the elected leader
//! dispatches, and it re-checks its lease before every send. Entries are
//! grouped by collection (entity type), so the insert, update and delete of
//! one collection share a queue, and each group is drained strictly in enqueue
//! order, concurrently with the other groups. A transient failure parks the
//! rest of its own group until the backoff deadline, without holding up any
//! other group.

use td_sync::{ms_to_datetime, HybridClock, SystemTimeSource, TimeSource, TransactionId};
use td_utils::error::report_error;

use std::{
	collections::HashSet,
	fmt,
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};

use chrono::{DateTime, Utc};
use futures_concurrency::future::{Join, TryJoin};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use tokio::{
	sync::{
		broadcast::{self, error::RecvError},
		Notify,
	},
	time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::{
	entry::{MutationName, PendingMutation},
	leader::{LeaderElector, LeaderState},
	mutation::{
		default_classifier, MutationContext, MutationError, MutationFn, MutationOutput,
		MutationRegistry, RetryClassifier,
	},
	retry::RetryPolicy,
	store::OutboxStore,
	Error,
};

const EVENTS_CAPACITY: usize = 256;

/// Observable outcome of outbox work
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboxEvent {
	Succeeded {
		key: TransactionId,
		output: MutationOutput,
	},
	/// Non-retriable failure, the entry was removed
	Failed {
		key: TransactionId,
		error: MutationError,
	},
	Retrying {
		key: TransactionId,
		attempt: u32,
		next_attempt_at: DateTime<Utc>,
	},
	/// Dropped unsent after outliving the retry horizon
	Evicted { key: TransactionId },
	DeadLettered { key: TransactionId, attempts: u32 },
	/// The entry names a mutation function this build does not register
	UnknownMutation {
		key: TransactionId,
		mutation: MutationName,
	},
	LeadershipChanged { state: LeaderState },
}

impl OutboxEvent {
	#[must_use]
	pub const fn key(&self) -> Option<&TransactionId> {
		match self {
			Self::Succeeded { key, .. }
			| Self::Failed { key, .. }
			| Self::Retrying { key, .. }
			| Self::Evicted { key }
			| Self::DeadLettered { key, .. }
			| Self::UnknownMutation { key, .. } => Some(key),
			Self::LeadershipChanged { .. } => None,
		}
	}
}

/// What one dispatch pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
	pub dispatched: usize,
	pub succeeded: usize,
	pub failed: usize,
	pub retrying: usize,
	pub evicted: usize,
	pub dead_lettered: usize,
	pub unknown: usize,
	/// Earliest backoff deadline among parked collections
	pub next_attempt_at: Option<DateTime<Utc>>,
}

impl PassReport {
	fn merge(&mut self, other: Self) {
		self.dispatched += other.dispatched;
		self.succeeded += other.succeeded;
		self.failed += other.failed;
		self.retrying += other.retrying;
		self.evicted += other.evicted;
		self.dead_lettered += other.dead_lettered;
		self.unknown += other.unknown;
		self.next_attempt_at = match (self.next_attempt_at, other.next_attempt_at) {
			(Some(a), Some(b)) => Some(a.min(b)),
			(a, b) => a.or(b),
		};
	}
}

pub struct OutboxExecutor {
	clock: Arc<HybridClock>,
	store: Arc<dyn OutboxStore>,
	leader: Arc<LeaderElector>,
	registry: MutationRegistry,
	retry: RetryPolicy,
	classifier: RetryClassifier,
	time: Arc<dyn TimeSource>,
	rng: Mutex<StdRng>,
	events: broadcast::Sender<OutboxEvent>,
	wake: Notify,
	reported_unknown: Mutex<HashSet<TransactionId>>,
}

impl fmt::Debug for OutboxExecutor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("OutboxExecutor")
			.field("leader", &self.leader)
			.field("registry", &self.registry)
			.field("retry", &self.retry)
			.finish_non_exhaustive()
	}
}

impl OutboxExecutor {
	pub fn new(
		clock: Arc<HybridClock>,
		store: Arc<dyn OutboxStore>,
		leader: Arc<LeaderElector>,
		registry: MutationRegistry,
	) -> Self {
		let (events, _) = broadcast::channel(EVENTS_CAPACITY);

		leader.on_change({
			let events = events.clone();
			move |state| {
				// Nobody listening is fine
				let _ = events.send(OutboxEvent::LeadershipChanged { state });
			}
		});

		Self {
			clock,
			store,
			leader,
			registry,
			retry: RetryPolicy::default(),
			classifier: default_classifier(),
			time: Arc::new(SystemTimeSource),
			rng: Mutex::new(StdRng::from_entropy()),
			events,
			wake: Notify::new(),
			reported_unknown: Mutex::default(),
		}
	}

	#[must_use]
	pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	/// Replaces the default retriable/non-retriable split
	#[must_use]
	pub fn with_classifier(
		mut self,
		classifier: impl Fn(&MutationError) -> bool + Send + Sync + 'static,
	) -> Self {
		self.classifier = Arc::new(classifier);
		self
	}

	#[must_use]
	pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
		self.time = time;
		self
	}

	/// Seeds backoff jitter, for reproducible schedules
	#[must_use]
	pub fn with_rng(mut self, rng: StdRng) -> Self {
		self.rng = Mutex::new(rng);
		self
	}

	#[must_use]
	pub fn leader(&self) -> &Arc<LeaderElector> {
		&self.leader
	}

	#[must_use]
	pub fn store(&self) -> &Arc<dyn OutboxStore> {
		&self.store
	}

	pub fn subscribe(&self) -> broadcast::Receiver<OutboxEvent> {
		self.events.subscribe()
	}

	/// Persists a mutation under a fresh transaction id and returns that id
	///
	/// Works on every instance; followers only queue, the leader dispatches.
	#[instrument(skip(self, payload), err)]
	pub async fn enqueue(
		&self,
		entity_type: &str,
		operation: &str,
		payload: serde_json::Value,
	) -> Result<TransactionId, Error> {
		let key = self.clock.create_transaction_id();

		self.store
			.append(PendingMutation::new(
				key.clone(),
				entity_type,
				operation,
				payload,
				self.time.now(),
			))
			.await?;

		debug!(%key, "Mutation persisted to outbox");
		self.wake.notify_one();

		Ok(key)
	}

	/// Enqueues a mutation and waits for its final outcome on this instance
	///
	/// Retries are transparent to the caller. The future only resolves once
	/// this instance settles the entry, so it waits through any period in
	/// which another instance holds leadership.
	pub async fn submit(
		&self,
		entity_type: &str,
		operation: &str,
		payload: serde_json::Value,
	) -> Result<MutationOutput, Error> {
		let mut events = self.events.subscribe();
		let key = self.enqueue(entity_type, operation, payload).await?;

		loop {
			let event = match events.recv().await {
				Ok(event) if event.key() == Some(&key) => event,
				Ok(_) => continue,
				Err(RecvError::Lagged(skipped)) => {
					warn!(%key, %skipped, "Outbox event subscriber lagged");
					continue;
				}
				Err(RecvError::Closed) => return Err(Error::Shutdown),
			};

			match event {
				OutboxEvent::Succeeded { output, .. } => return Ok(output),
				OutboxEvent::Failed { error, .. } => return Err(Error::Rejected { key, error }),
				OutboxEvent::Evicted { .. } => return Err(Error::Evicted(key)),
				OutboxEvent::DeadLettered { .. } => return Err(Error::DeadLettered(key)),
				OutboxEvent::UnknownMutation { mutation, .. } => {
					return Err(Error::UnknownMutation { key, mutation })
				}
				OutboxEvent::Retrying { .. } | OutboxEvent::LeadershipChanged { .. } => {}
			}
		}
	}

	/// Evicts expired entries, then drains every collection's queue once
	///
	/// Does nothing unless this instance holds a live lease.
	#[instrument(skip(self), fields(node_id = %self.leader.node_id()), err)]
	pub async fn run_pass(&self) -> Result<PassReport, Error> {
		let mut report = PassReport::default();

		if !self.leader.confirm().await? {
			trace!("Not the outbox leader, skipping dispatch");
			return Ok(report);
		}

		let now = self.time.now();
		let pending = self.store.pending().await?;
		self.forget_settled_unknowns(&pending);

		let mut groups: Vec<(String, Vec<PendingMutation>)> = vec![];

		for entry in pending {
			if self.retry.eviction.is_expired(entry.enqueued_at, now) {
				self.store.remove(&entry.idempotency_key).await?;
				info!(
					key = %entry.idempotency_key,
					mutation = %entry.mutation_name(),
					enqueued_at = %entry.enqueued_at,
					retry_count = entry.retry_count,
					"Evicting mutation past the retry horizon"
				);
				self.emit(OutboxEvent::Evicted {
					key: entry.idempotency_key,
				});
				report.evicted += 1;
				continue;
			}

			match groups
				.iter_mut()
				.find(|(collection, _)| *collection == entry.entity_type)
			{
				Some((_, entries)) => entries.push(entry),
				None => groups.push((entry.entity_type.clone(), vec![entry])),
			}
		}

		let outcomes = groups
			.into_iter()
			.map(|(_, entries)| self.drain_group(entries, now))
			.collect::<Vec<_>>()
			.try_join()
			.await?;

		for outcome in outcomes {
			report.merge(outcome);
		}

		Ok(report)
	}

	/// Sends one collection's entries in order until one of them cannot go
	///
	/// Stops at an entry that is backing off, that no registered function
	/// handles, or once the lease can no longer be confirmed.
	async fn drain_group(
		&self,
		entries: Vec<PendingMutation>,
		now: DateTime<Utc>,
	) -> Result<PassReport, Error> {
		let mut report = PassReport::default();

		for entry in entries {
			if entry.is_backing_off(now) {
				report.next_attempt_at = entry.next_attempt_at;
				break;
			}

			let name = entry.mutation_name();
			let Some(mutation) = self.registry.get(&name) else {
				self.report_unknown(&name, entry, &mut report);
				break;
			};

			if !self.leader.confirm().await? {
				debug!(%name, "Lost the outbox lease mid-pass, stopping");
				break;
			}

			report.dispatched += 1;
			if !self.dispatch(&name, mutation, entry, &mut report).await? {
				break;
			}
		}

		Ok(report)
	}

	/// Runs one entry, returns whether the rest of its group may proceed
	async fn dispatch(
		&self,
		name: &MutationName,
		mutation: &MutationFn,
		mut entry: PendingMutation,
		report: &mut PassReport,
	) -> Result<bool, Error> {
		let key = entry.idempotency_key.clone();

		let result = mutation(MutationContext {
			idempotency_key: key.clone(),
			transaction: entry.clone(),
		})
		.await;

		let error = match result {
			Ok(output) => {
				self.store.remove(&key).await?;
				debug!(%key, mutation = %name, attempts = entry.retry_count + 1, "Mutation delivered");
				self.emit(OutboxEvent::Succeeded { key, output });
				report.succeeded += 1;
				return Ok(true);
			}
			Err(error) if !(self.classifier)(&error) => {
				self.store.remove(&key).await?;
				warn!(%key, mutation = %name, %error, "Mutation failed permanently, dropping it");
				self.emit(OutboxEvent::Failed { key, error });
				report.failed += 1;
				return Ok(true);
			}
			Err(error) => error,
		};

		entry.retry_count = entry.retry_count.saturating_add(1);
		entry.last_error = Some(error.to_string());
		let attempts = entry.retry_count;

		if self.retry.dead_letter.should_dead_letter(attempts) {
			error!(%key, mutation = %name, attempts, %error, "Giving up on mutation, moving it to dead letters");
			self.store.dead_letter(entry).await?;
			self.emit(OutboxEvent::DeadLettered { key, attempts });
			report.dead_lettered += 1;
			return Ok(true);
		}

		let delay = {
			let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
			self.retry.backoff.delay(attempts, &mut *rng)
		};
		let next_attempt_at = self.deadline_after(delay);

		entry.next_attempt_at = Some(next_attempt_at);
		self.store.update(&entry).await?;

		debug!(
			%key,
			mutation = %name,
			attempts,
			?delay,
			%error,
			"Transient mutation failure, backing off"
		);
		self.emit(OutboxEvent::Retrying {
			key,
			attempt: attempts,
			next_attempt_at,
		});
		report.retrying += 1;
		report.next_attempt_at = Some(next_attempt_at);

		Ok(false)
	}

	fn report_unknown(&self, name: &MutationName, entry: PendingMutation, report: &mut PassReport) {
		report.unknown += 1;

		let first_sighting = self
			.reported_unknown
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(entry.idempotency_key.clone());

		if first_sighting {
			warn!(
				key = %entry.idempotency_key,
				mutation = %name,
				"Queued mutation is not registered in this build, leaving it in the outbox"
			);
			self.emit(OutboxEvent::UnknownMutation {
				key: entry.idempotency_key,
				mutation: name.clone(),
			});
		}
	}

	/// Drops reported unknown keys that left the outbox, e.g. through eviction
	fn forget_settled_unknowns(&self, pending: &[PendingMutation]) {
		let mut reported = self
			.reported_unknown
			.lock()
			.unwrap_or_else(PoisonError::into_inner);

		if !reported.is_empty() {
			let still_pending = pending
				.iter()
				.map(|entry| &entry.idempotency_key)
				.collect::<HashSet<_>>();
			reported.retain(|key| still_pending.contains(key));
		}
	}

	/// Heartbeats the election and dispatches while leader, until cancelled
	///
	/// Heartbeats run alongside dispatch, so a slow mutation never lets the
	/// lease lapse. A pass runs after every heartbeat that finds us leading,
	/// after every local enqueue and when the earliest backoff deadline is
	/// reached. Leadership is resigned on the way out.
	#[instrument(skip_all, fields(node_id = %self.leader.node_id()))]
	pub async fn run(&self, cancel: CancellationToken) {
		(self.heartbeat(&cancel), self.dispatch_loop(&cancel))
			.join()
			.await;

		report_error(&self.leader.resign().await, "outbox leader resign");
		debug!("Outbox executor stopped");
	}

	async fn heartbeat(&self, cancel: &CancellationToken) {
		let mut interval = tokio::time::interval(self.leader.config().heartbeat);
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				biased;
				() = cancel.cancelled() => break,
				_ = interval.tick() => {
					let state = self.leader.tick().await;
					report_error(&state, "outbox leader heartbeat");

					if matches!(state, Ok(LeaderState::Leader)) {
						self.wake.notify_one();
					}
				}
			}
		}
	}

	async fn dispatch_loop(&self, cancel: &CancellationToken) {
		let mut next_attempt_at = None;

		loop {
			let until_retry = next_attempt_at.map(|at| self.time_until(at));

			tokio::select! {
				biased;
				() = cancel.cancelled() => break,
				() = self.wake.notified() => {}
				() = sleep_for(until_retry) => {}
			}

			match self.run_pass().await {
				Ok(report) => next_attempt_at = report.next_attempt_at,
				Err(e) => error!(?e, "Outbox pass failed"),
			}
		}
	}

	fn deadline_after(&self, delay: Duration) -> DateTime<Utc> {
		let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
		ms_to_datetime(self.time.current_time_ms().saturating_add(delay_ms))
	}

	fn time_until(&self, at: DateTime<Utc>) -> Duration {
		(at - self.time.now()).to_std().unwrap_or_default()
	}

	fn emit(&self, event: OutboxEvent) {
		// Nobody listening is fine
		let _ = self.events.send(event);
	}
}

async fn sleep_for(duration: Option<Duration>) {
	match duration {
		Some(duration) => tokio::time::sleep(duration).await,
		None => std::future::pending().await,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		leader::LeaseConfig,
		retry::{BackoffPolicy, DeadLetterPolicy, EvictionPolicy},
		store::MemoryOutboxStore,
	};

	use td_sync::FakeTimeSource;

	use serde_json::json;
	use tracing_test::traced_test;
	use uuid::Uuid;

	type Calls = Arc<Mutex<Vec<(String, TransactionId)>>>;

	struct Harness {
		executor: OutboxExecutor,
		store: MemoryOutboxStore,
		time: FakeTimeSource,
		calls: Calls,
	}

	fn recording(
		calls: &Calls,
		label: &'static str,
		outcome: impl Fn(usize) -> Result<MutationOutput, MutationError> + Send + Sync + 'static,
	) -> impl Fn(MutationContext) -> futures::future::Ready<Result<MutationOutput, MutationError>>
	       + Send
	       + Sync
	       + 'static {
		let calls = Arc::clone(calls);
		move |ctx| {
			let mut calls = calls.lock().unwrap();
			calls.push((label.to_string(), ctx.idempotency_key));
			let attempt = calls.iter().filter(|(l, _)| l == label).count();
			futures::future::ready(outcome(attempt))
		}
	}

	async fn harness(
		registry: impl FnOnce(&Calls) -> MutationRegistry,
		retry: RetryPolicy,
	) -> Harness {
		let store = MemoryOutboxStore::new();
		let time = FakeTimeSource::new(1_700_000_000_000);
		let node_id = Uuid::new_v4();
		let calls = Calls::default();

		let leader = Arc::new(LeaderElector::new(
			node_id,
			Arc::new(store.clone()),
			Arc::new(time.clone()),
			LeaseConfig::default(),
		));
		leader.tick().await.unwrap();

		let executor = OutboxExecutor::new(
			Arc::new(HybridClock::with_time_source(node_id, Arc::new(time.clone()))),
			Arc::new(store.clone()),
			leader,
			registry(&calls),
		)
		.with_retry_policy(retry)
		.with_time_source(Arc::new(time.clone()))
		.with_rng(StdRng::seed_from_u64(1));

		Harness {
			executor,
			store,
			time,
			calls,
		}
	}

	fn retry_policy() -> RetryPolicy {
		RetryPolicy {
			backoff: BackoffPolicy {
				initial: Duration::from_secs(1),
				max: Duration::from_secs(60),
				jitter_ratio: 0.5,
			},
			eviction: EvictionPolicy {
				horizon: Duration::from_secs(24 * 60 * 60),
			},
			dead_letter: DeadLetterPolicy::default(),
		}
	}

	fn ok(_: usize) -> Result<MutationOutput, MutationError> {
		Ok(json!({ "ok": true }))
	}

	fn labels(calls: &Calls) -> Vec<String> {
		calls.lock().unwrap().iter().map(|(l, _)| l.clone()).collect()
	}

	#[tokio::test]
	async fn dispatches_in_fifo_order_and_removes_on_success() {
		let h = harness(
			|calls| {
				MutationRegistry::new()
					.register("task", "insert", recording(calls, "insert", ok))
					.register("task", "update", recording(calls, "update", ok))
			},
			retry_policy(),
		)
		.await;

		let first = h.executor.enqueue("task", "insert", json!({ "n": 1 })).await.unwrap();
		h.executor.enqueue("task", "update", json!({ "n": 2 })).await.unwrap();
		let third = h.executor.enqueue("task", "insert", json!({ "n": 3 })).await.unwrap();
		assert!(first < third);

		let report = h.executor.run_pass().await.unwrap();

		assert_eq!(report.succeeded, 3);
		assert!(h.store.pending().await.unwrap().is_empty());

		assert_eq!(labels(&h.calls), vec!["insert", "update", "insert"]);

		let calls = h.calls.lock().unwrap().clone();
		let inserts = calls
			.iter()
			.filter(|(label, _)| label == "insert")
			.map(|(_, key)| key.clone())
			.collect::<Vec<_>>();
		assert_eq!(inserts, vec![first, third]);
	}

	#[tokio::test]
	async fn update_waits_behind_its_failed_insert() {
		let h = harness(
			|calls| {
				MutationRegistry::new()
					.register(
						"task",
						"insert",
						recording(calls, "insert", |attempt| {
							if attempt == 1 {
								Err(MutationError::Network("offline".into()))
							} else {
								Ok(json!("task_1"))
							}
						}),
					)
					.register("task", "update", recording(calls, "update", ok))
			},
			retry_policy(),
		)
		.await;

		h.executor.enqueue("task", "insert", json!({ "title": "a" })).await.unwrap();
		h.executor.enqueue("task", "update", json!({ "title": "b" })).await.unwrap();

		let report = h.executor.run_pass().await.unwrap();
		assert_eq!(report.retrying, 1);
		assert_eq!(report.dispatched, 1);
		assert_eq!(labels(&h.calls), vec!["insert"]);
		assert_eq!(h.store.pending().await.unwrap().len(), 2);

		let at = report.next_attempt_at.unwrap();
		h.time.set(u64::try_from(at.timestamp_millis()).unwrap());
		h.executor.leader().tick().await.unwrap();

		assert_eq!(h.executor.run_pass().await.unwrap().succeeded, 2);
		assert_eq!(labels(&h.calls), vec!["insert", "insert", "update"]);
	}

	#[tokio::test]
	async fn transient_failure_backs_off_and_reuses_the_key() {
		let h = harness(
			|calls| {
				MutationRegistry::new().register(
					"organization",
					"insert",
					recording(calls, "insert", |attempt| {
						if attempt < 4 {
							Err(MutationError::Network("offline".into()))
						} else {
							Ok(json!("org_123"))
						}
					}),
				)
			},
			retry_policy(),
		)
		.await;
		let mut events = h.executor.subscribe();

		let key = h
			.executor
			.enqueue("organization", "insert", json!({ "name": "Acme" }))
			.await
			.unwrap();

		let mut deadlines = vec![h.time.now()];
		for _ in 0..3 {
			let report = h.executor.run_pass().await.unwrap();
			assert_eq!(report.retrying, 1);
			let at = report.next_attempt_at.unwrap();
			deadlines.push(at);

			// Still backing off: nothing is dispatched
			assert_eq!(h.executor.run_pass().await.unwrap().dispatched, 0);

			h.time.set(u64::try_from(at.timestamp_millis()).unwrap());
			h.executor.leader().tick().await.unwrap();
		}

		let report = h.executor.run_pass().await.unwrap();
		assert_eq!(report.succeeded, 1);

		let intervals = deadlines
			.windows(2)
			.map(|pair| pair[1] - pair[0])
			.collect::<Vec<_>>();
		assert!(intervals.windows(2).all(|pair| pair[0] < pair[1]), "{intervals:?}");

		let calls = h.calls.lock().unwrap().clone();
		assert_eq!(calls.len(), 4);
		assert!(calls.iter().all(|(_, k)| *k == key));

		let mut retrying = 0;
		while let Ok(event) = events.try_recv() {
			match event {
				OutboxEvent::Retrying { attempt, .. } => {
					retrying += 1;
					assert_eq!(attempt, retrying);
				}
				OutboxEvent::Succeeded { output, .. } => assert_eq!(output, json!("org_123")),
				_ => {}
			}
		}
		assert_eq!(retrying, 3);
	}

	#[tokio::test]
	async fn non_retriable_failure_is_dropped_without_blocking_its_queue() {
		let h = harness(
			|calls| {
				MutationRegistry::new().register(
					"task",
					"delete",
					recording(calls, "delete", |attempt| {
						if attempt == 1 {
							Err(MutationError::Gone("task_1".into()))
						} else {
							Ok(json!(null))
						}
					}),
				)
			},
			retry_policy(),
		)
		.await;
		let mut events = h.executor.subscribe();

		let gone = h.executor.enqueue("task", "delete", json!("task_1")).await.unwrap();
		h.executor.enqueue("task", "delete", json!("task_2")).await.unwrap();

		let report = h.executor.run_pass().await.unwrap();
		assert_eq!(report.failed, 1);
		assert_eq!(report.succeeded, 1);
		assert!(h.store.pending().await.unwrap().is_empty());

		assert_eq!(
			events.try_recv().unwrap(),
			OutboxEvent::Failed {
				key: gone,
				error: MutationError::Gone("task_1".into()),
			}
		);

		// Nothing is retried later
		h.time.advance(60 * 60 * 1000);
		h.executor.leader().tick().await.unwrap();
		h.executor.run_pass().await.unwrap();
		assert_eq!(h.calls.lock().unwrap().len(), 2);
	}

	#[tokio::test]
	async fn transient_failure_only_halts_its_own_group() {
		let h = harness(
			|calls| {
				MutationRegistry::new()
					.register(
						"task",
						"update",
						recording(calls, "update", |_| Err(MutationError::Timeout)),
					)
					.register("page", "update", recording(calls, "page", ok))
			},
			retry_policy(),
		)
		.await;

		h.executor.enqueue("task", "update", json!(1)).await.unwrap();
		h.executor.enqueue("task", "update", json!(2)).await.unwrap();
		h.executor.enqueue("page", "update", json!(3)).await.unwrap();

		let report = h.executor.run_pass().await.unwrap();

		assert_eq!(report.retrying, 1);
		assert_eq!(report.succeeded, 1);
		// The second task update waits behind the first
		let mut called = labels(&h.calls);
		called.sort();
		assert_eq!(called, vec!["page", "update"]);
		assert_eq!(h.store.pending().await.unwrap().len(), 2);
	}

	#[tokio::test]
	async fn entries_past_the_horizon_are_evicted_unsent() {
		let h = harness(
			|calls| MutationRegistry::new().register("task", "insert", recording(calls, "insert", ok)),
			RetryPolicy {
				eviction: EvictionPolicy {
					horizon: Duration::from_secs(60),
				},
				..retry_policy()
			},
		)
		.await;
		let mut events = h.executor.subscribe();

		let key = h.executor.enqueue("task", "insert", json!({})).await.unwrap();
		h.time.advance(61_000);
		// Keep the lease fresh after the jump
		h.executor.leader().tick().await.unwrap();

		let report = h.executor.run_pass().await.unwrap();

		assert_eq!(report.evicted, 1);
		assert_eq!(report.dispatched, 0);
		assert!(h.calls.lock().unwrap().is_empty());
		assert!(h.store.pending().await.unwrap().is_empty());
		assert_eq!(events.try_recv().unwrap(), OutboxEvent::Evicted { key });
	}

	#[tokio::test]
	#[traced_test]
	async fn unknown_mutation_is_reported_and_kept() {
		let h = harness(
			|calls| MutationRegistry::new().register("task", "insert", recording(calls, "insert", ok)),
			retry_policy(),
		)
		.await;

		let key = h.executor.enqueue("widget", "explode", json!({})).await.unwrap();
		h.executor.enqueue("task", "insert", json!({})).await.unwrap();

		let report = h.executor.run_pass().await.unwrap();

		assert_eq!(report.unknown, 1);
		assert_eq!(report.succeeded, 1);
		let pending = h.store.pending().await.unwrap();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].idempotency_key, key);
		assert!(logs_contain("not registered in this build"));
		assert!(logs_contain("widget.explode"));
	}

	#[tokio::test]
	async fn unknown_mutation_blocks_only_its_collection() {
		let h = harness(
			|calls| {
				MutationRegistry::new()
					.register("task", "update", recording(calls, "update", ok))
					.register("page", "insert", recording(calls, "page", ok))
			},
			retry_policy(),
		)
		.await;

		h.executor.enqueue("task", "archive", json!({})).await.unwrap();
		h.executor.enqueue("task", "update", json!({})).await.unwrap();
		h.executor.enqueue("page", "insert", json!({})).await.unwrap();

		let report = h.executor.run_pass().await.unwrap();

		assert_eq!(report.unknown, 1);
		assert_eq!(labels(&h.calls), vec!["page"]);
		assert_eq!(h.store.pending().await.unwrap().len(), 2);
	}

	#[tokio::test]
	async fn reported_unknowns_are_forgotten_once_they_leave_the_outbox() {
		let h = harness(|_| MutationRegistry::new(), retry_policy()).await;
		let mut events = h.executor.subscribe();

		let key = h.executor.enqueue("widget", "explode", json!({})).await.unwrap();
		h.executor.run_pass().await.unwrap();
		h.executor.run_pass().await.unwrap();

		assert!(matches!(events.try_recv(), Ok(OutboxEvent::UnknownMutation { .. })));
		// Reported once, however many passes see it
		assert!(events.try_recv().is_err());
		assert!(h.executor.reported_unknown.lock().unwrap().contains(&key));

		h.store.remove(&key).await.unwrap();
		h.executor.run_pass().await.unwrap();

		assert!(h.executor.reported_unknown.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn retriable_failures_dead_letter_when_capped() {
		let h = harness(
			|calls| {
				MutationRegistry::new().register(
					"task",
					"insert",
					recording(calls, "insert", |_| {
						Err(MutationError::Server {
							status: 500,
							message: "boom".into(),
						})
					}),
				)
			},
			RetryPolicy {
				dead_letter: DeadLetterPolicy {
					max_attempts: Some(2),
				},
				..retry_policy()
			},
		)
		.await;

		h.executor.enqueue("task", "insert", json!({})).await.unwrap();

		let first = h.executor.run_pass().await.unwrap();
		assert_eq!(first.retrying, 1);
		h.time.advance(10 * 60 * 1000);
		h.executor.leader().tick().await.unwrap();

		let second = h.executor.run_pass().await.unwrap();
		assert_eq!(second.dead_lettered, 1);
		assert!(h.store.pending().await.unwrap().is_empty());

		let dead = h.store.dead_letters().await.unwrap();
		assert_eq!(dead.len(), 1);
		assert_eq!(dead[0].retry_count, 2);
		assert!(dead[0].last_error.as_deref().is_some_and(|e| e.contains("boom")));
	}

	#[tokio::test]
	async fn followers_queue_but_never_dispatch() {
		let h = harness(
			|calls| MutationRegistry::new().register("task", "insert", recording(calls, "insert", ok)),
			retry_policy(),
		)
		.await;

		let follower = OutboxExecutor::new(
			Arc::new(HybridClock::new(Uuid::new_v4())),
			Arc::new(h.store.clone()),
			Arc::new(LeaderElector::new(
				Uuid::new_v4(),
				Arc::new(h.store.clone()),
				Arc::new(h.time.clone()),
				LeaseConfig::default(),
			)),
			MutationRegistry::new().register("task", "insert", recording(&h.calls, "follower", ok)),
		)
		.with_time_source(Arc::new(h.time.clone()));

		assert_eq!(follower.leader().tick().await.unwrap(), LeaderState::Follower);
		follower.enqueue("task", "insert", json!({})).await.unwrap();

		assert_eq!(follower.run_pass().await.unwrap(), PassReport::default());
		assert_eq!(h.executor.run_pass().await.unwrap().succeeded, 1);
		assert_eq!(labels(&h.calls), vec!["insert"]);
	}

	#[tokio::test]
	async fn lapsed_leader_stops_dispatching_once_replaced() {
		let h = harness(
			|calls| MutationRegistry::new().register("task", "insert", recording(calls, "stale", ok)),
			retry_policy(),
		)
		.await;

		let successor = OutboxExecutor::new(
			Arc::new(HybridClock::new(Uuid::new_v4())),
			Arc::new(h.store.clone()),
			Arc::new(LeaderElector::new(
				Uuid::new_v4(),
				Arc::new(h.store.clone()),
				Arc::new(h.time.clone()),
				LeaseConfig::default(),
			)),
			MutationRegistry::new().register("task", "insert", recording(&h.calls, "successor", ok)),
		)
		.with_time_source(Arc::new(h.time.clone()));

		h.executor.enqueue("task", "insert", json!({})).await.unwrap();

		// The first leader stalls past its lease and another instance takes over
		h.time.advance(LeaseConfig::default().ttl.as_millis().try_into().unwrap());
		assert_eq!(successor.leader().tick().await.unwrap(), LeaderState::Leader);
		assert!(h.executor.leader().is_leader());

		assert_eq!(h.executor.run_pass().await.unwrap().dispatched, 0);
		assert_eq!(h.executor.leader().state(), LeaderState::Follower);

		assert_eq!(successor.run_pass().await.unwrap().succeeded, 1);
		assert_eq!(labels(&h.calls), vec!["successor"]);
	}
}
