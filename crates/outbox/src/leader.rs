//! Outbox leader election
//!
//! Several instances (tabs, windows) share one outbox store, but only one of
//! them may dispatch to the network. Leadership is a lease kept in the shared
//! store: the leader renews it every heartbeat, and when a leader dies without
//! resigning its lease simply runs out and the next instance to tick claims it.

use td_sync::{ms_to_datetime, TimeSource};

use std::{
	fmt,
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{store::LeaseStore, Error};

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderState {
	Follower,
	/// Trying to claim an expired or missing lease
	Electing,
	Leader,
}

impl fmt::Display for LeaderState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Follower => "follower",
			Self::Electing => "electing",
			Self::Leader => "leader",
		})
	}
}

/// Leadership record kept in the shared store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
	pub holder: Uuid,
	pub expires_at: DateTime<Utc>,
}

impl Lease {
	#[must_use]
	pub const fn new(holder: Uuid, expires_at: DateTime<Utc>) -> Self {
		Self { holder, expires_at }
	}

	#[must_use]
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		now >= self.expires_at
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
	/// How long a lease stays valid without renewal
	pub ttl: Duration,
	/// How often the leader renews, must be well below `ttl`
	pub heartbeat: Duration,
}

impl Default for LeaseConfig {
	fn default() -> Self {
		Self {
			ttl: DEFAULT_LEASE_TTL,
			heartbeat: DEFAULT_HEARTBEAT,
		}
	}
}

type Callback = Box<dyn Fn(LeaderState) + Send + Sync>;

/// Lease-based `{follower, electing, leader}` state machine for one instance
pub struct LeaderElector {
	node_id: Uuid,
	store: Arc<dyn LeaseStore>,
	time: Arc<dyn TimeSource>,
	config: LeaseConfig,
	state: watch::Sender<LeaderState>,
	callbacks: Mutex<Vec<Callback>>,
}

impl fmt::Debug for LeaderElector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LeaderElector")
			.field("node_id", &self.node_id)
			.field("state", &*self.state.borrow())
			.finish_non_exhaustive()
	}
}

impl LeaderElector {
	pub fn new(
		node_id: Uuid,
		store: Arc<dyn LeaseStore>,
		time: Arc<dyn TimeSource>,
		config: LeaseConfig,
	) -> Self {
		let (state, _) = watch::channel(LeaderState::Follower);

		Self {
			node_id,
			store,
			time,
			config,
			state,
			callbacks: Mutex::default(),
		}
	}

	#[must_use]
	pub const fn node_id(&self) -> Uuid {
		self.node_id
	}

	#[must_use]
	pub const fn config(&self) -> LeaseConfig {
		self.config
	}

	#[must_use]
	pub fn state(&self) -> LeaderState {
		*self.state.borrow()
	}

	#[must_use]
	pub fn is_leader(&self) -> bool {
		self.state() == LeaderState::Leader
	}

	pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
		self.state.subscribe()
	}

	/// Registers a callback invoked on every state transition
	pub fn on_change(&self, callback: impl Fn(LeaderState) + Send + Sync + 'static) {
		self.callbacks
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push(Box::new(callback));
	}

	/// One heartbeat: renew our lease, or claim it if it is free or expired
	///
	/// A failed heartbeat leaves us unable to prove we hold the lease, so it
	/// drops this instance to follower.
	#[instrument(skip(self), fields(node_id = %self.node_id), err)]
	pub async fn tick(&self) -> Result<LeaderState, Error> {
		let result = self.renew_or_claim().await;
		if result.is_err() {
			self.transition(LeaderState::Follower);
		}

		result
	}

	/// Checks the shared store that our lease is still ours and unexpired
	///
	/// Dispatch calls this before every send. Anything short of a live lease
	/// held by us, including a store error, demotes this instance to follower.
	pub async fn confirm(&self) -> Result<bool, Error> {
		if !self.is_leader() {
			return Ok(false);
		}

		let now = self.time.now();
		let lease = match self.store.read_lease().await {
			Ok(lease) => lease,
			Err(e) => {
				self.transition(LeaderState::Follower);
				return Err(e);
			}
		};

		let held = lease
			.as_ref()
			.is_some_and(|lease| lease.holder == self.node_id && !lease.is_expired(now));

		if !held {
			debug!(?lease, "Outbox lease no longer ours");
			self.transition(LeaderState::Follower);
		}

		Ok(held)
	}

	async fn renew_or_claim(&self) -> Result<LeaderState, Error> {
		let now = self.time.now();
		let current = self.store.read_lease().await?;

		let claimable = current
			.as_ref()
			.map_or(true, |lease| lease.holder == self.node_id || lease.is_expired(now));

		if !claimable {
			self.transition(LeaderState::Follower);
			return Ok(LeaderState::Follower);
		}

		if !self.is_leader() {
			self.transition(LeaderState::Electing);
		}

		let renewed = Lease::new(self.node_id, self.expiry_from(now));
		let won = self
			.store
			.compare_and_swap_lease(current.as_ref(), Some(renewed))
			.await?;

		let next = if won {
			LeaderState::Leader
		} else {
			debug!("Lost the race for the lease");
			LeaderState::Follower
		};
		self.transition(next);

		Ok(next)
	}

	/// Gives up leadership so another instance can take over right away
	pub async fn resign(&self) -> Result<(), Error> {
		if let Some(lease) = self
			.store
			.read_lease()
			.await?
			.filter(|lease| lease.holder == self.node_id)
		{
			self.store.compare_and_swap_lease(Some(&lease), None).await?;
		}

		self.transition(LeaderState::Follower);

		Ok(())
	}

	fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
		let ttl_ms = u64::try_from(self.config.ttl.as_millis()).unwrap_or(u64::MAX);
		let now_ms = u64::try_from(now.timestamp_millis()).unwrap_or(0);

		ms_to_datetime(now_ms.saturating_add(ttl_ms))
	}

	fn transition(&self, next: LeaderState) {
		let previous = self.state.send_replace(next);
		if previous == next {
			return;
		}

		info!(node_id = %self.node_id, from = %previous, to = %next, "Outbox leadership changed");

		for callback in self
			.callbacks
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
		{
			callback(next);
		}
	}
}
