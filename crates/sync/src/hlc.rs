//! Hybrid Logical Clock (HLC) and transaction identifiers
//!
//! Every client-originated mutation is tagged with a [`TransactionId`] derived
//! from the node's [`HybridClock`]. The clock combines physical time with a
//! logical counter, so identifiers keep increasing even when the wall clock is
//! frozen or moves backwards, and the node id breaks ties between nodes.

use std::{
	fmt,
	str::FromStr,
	sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use super::time_source::{SystemTimeSource, TimeSource};

/// Digits reserved for the logical counter inside a [`TransactionId`]
pub const LOGICAL_WIDTH: usize = 6;

/// Largest logical value that still fits [`LOGICAL_WIDTH`] digits
pub const MAX_LOGICAL: u32 = 999_999;

/// Digits reserved for the wall time (milliseconds fit 13 digits until year 2286)
pub const WALL_WIDTH: usize = 13;

#[derive(Debug, thiserror::Error)]
pub enum HlcError {
	#[error("invalid transaction id <id='{id}'>: {reason}")]
	Parse { id: String, reason: &'static str },
}

/// A single reading of a [`HybridClock`]
///
/// Ordering is wall time, then logical counter, then node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HlcTimestamp {
	/// Milliseconds since the Unix epoch
	pub wall_time: u64,
	pub logical: u32,
	pub node_id: Uuid,
}

impl HlcTimestamp {
	#[must_use]
	pub fn to_transaction_id(&self) -> TransactionId {
		TransactionId(format!(
			"{:0wall$}.{:0logical$}.{}",
			self.wall_time,
			self.logical,
			self.node_id,
			wall = WALL_WIDTH,
			logical = LOGICAL_WIDTH,
		))
	}
}

impl fmt::Display for HlcTimestamp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"HLC({},{},:{})",
			self.wall_time,
			self.logical,
			&self.node_id.to_string()[..8]
		)
	}
}

/// Opaque, lexicographically sortable transaction identifier
///
/// Ids produced by a [`HybridClock`] have the shape
/// `{wallTime}.{logical}.{nodeId}` with both numeric parts zero-padded, so
/// plain string comparison is the causal order. Ids received from clients are
/// treated as opaque and are never required to parse.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}

	#[must_use]
	pub fn into_inner(self) -> String {
		self.0
	}

	/// Decodes the clock reading this id was formatted from
	pub fn timestamp(&self) -> Result<HlcTimestamp, HlcError> {
		let parse_err = |reason| HlcError::Parse {
			id: self.0.clone(),
			reason,
		};

		let mut parts = self.0.splitn(3, '.');
		let (Some(wall), Some(logical), Some(node)) = (parts.next(), parts.next(), parts.next())
		else {
			return Err(parse_err("expected three dot separated parts"));
		};

		if logical.len() != LOGICAL_WIDTH {
			return Err(parse_err("logical counter has the wrong width"));
		}

		Ok(HlcTimestamp {
			wall_time: wall
				.parse()
				.map_err(|_| parse_err("wall time is not a number"))?,
			logical: logical
				.parse()
				.map_err(|_| parse_err("logical counter is not a number"))?,
			node_id: Uuid::parse_str(node).map_err(|_| parse_err("node id is not a uuid"))?,
		})
	}
}

impl fmt::Display for TransactionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<String> for TransactionId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

impl From<&str> for TransactionId {
	fn from(id: &str) -> Self {
		Self(id.to_string())
	}
}

impl FromStr for TransactionId {
	type Err = std::convert::Infallible;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self::from(s))
	}
}

#[derive(Debug, Default, Clone, Copy)]
struct ClockState {
	last_wall: u64,
	logical: u32,
}

impl ClockState {
	/// Keeps the logical counter within its fixed width by borrowing a millisecond
	fn carry_overflow(&mut self) {
		if self.logical > MAX_LOGICAL {
			self.last_wall += 1;
			self.logical = 0;
		}
	}
}

/// Per-node hybrid logical clock
///
/// Clock steps never suspend: each call takes the internal lock, computes the
/// next reading and releases it, so readings are atomic with respect to other
/// work in the process.
pub struct HybridClock {
	node_id: Uuid,
	time: Arc<dyn TimeSource>,
	state: Mutex<ClockState>,
}

impl fmt::Debug for HybridClock {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("HybridClock")
			.field("node_id", &self.node_id)
			.finish_non_exhaustive()
	}
}

impl HybridClock {
	/// Clock reading the system wall clock
	#[must_use]
	pub fn new(node_id: Uuid) -> Self {
		Self::with_time_source(node_id, Arc::new(SystemTimeSource))
	}

	#[must_use]
	pub fn with_time_source(node_id: Uuid, time: Arc<dyn TimeSource>) -> Self {
		Self {
			node_id,
			time,
			state: Mutex::default(),
		}
	}

	#[must_use]
	pub const fn node_id(&self) -> Uuid {
		self.node_id
	}

	/// Next reading for a local event
	///
	/// Adopts physical time when it moved past the last recorded wall time,
	/// otherwise keeps the recorded wall time and bumps the logical counter.
	pub fn now(&self) -> HlcTimestamp {
		let physical = self.time.current_time_ms();
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

		if physical > state.last_wall {
			state.last_wall = physical;
			state.logical = 0;
		} else {
			state.logical = state.logical.saturating_add(1);
			state.carry_overflow();
		}

		self.reading(*state)
	}

	/// Merges a remote reading so later local readings sort after it
	pub fn receive(&self, remote_wall: u64, remote_logical: u32) -> HlcTimestamp {
		let physical = self.time.current_time_ms();
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

		let local_wall = state.last_wall;
		let max_wall = physical.max(local_wall).max(remote_wall);

		state.logical = if max_wall == local_wall && max_wall == remote_wall {
			state.logical.max(remote_logical).saturating_add(1)
		} else if max_wall == local_wall {
			state.logical.saturating_add(1)
		} else if max_wall == remote_wall {
			remote_logical.saturating_add(1)
		} else {
			0
		};
		state.last_wall = max_wall;
		state.carry_overflow();

		trace!(
			remote_wall,
			remote_logical,
			wall = state.last_wall,
			logical = state.logical,
			"Merged remote clock reading"
		);

		self.reading(*state)
	}

	/// Merges the clock reading carried by a remote transaction id
	///
	/// Ids that were not produced by a hybrid clock are rejected.
	pub fn receive_id(&self, remote: &TransactionId) -> Result<HlcTimestamp, HlcError> {
		let remote = remote.timestamp()?;
		Ok(self.receive(remote.wall_time, remote.logical))
	}

	/// Formats a fresh reading as a transaction id
	pub fn create_transaction_id(&self) -> TransactionId {
		self.now().to_transaction_id()
	}

	const fn reading(&self, state: ClockState) -> HlcTimestamp {
		HlcTimestamp {
			wall_time: state.last_wall,
			logical: state.logical,
			node_id: self.node_id,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::time_source::FakeTimeSource;

	fn clock_at(ms: u64) -> (HybridClock, FakeTimeSource) {
		let time = FakeTimeSource::new(ms);
		(
			HybridClock::with_time_source(Uuid::new_v4(), Arc::new(time.clone())),
			time,
		)
	}

	#[test]
	fn adopts_physical_time_when_it_advances() {
		let (clock, time) = clock_at(1_000);

		let first = clock.now();
		assert_eq!((first.wall_time, first.logical), (1_000, 0));

		time.advance(5);
		let second = clock.now();
		assert_eq!((second.wall_time, second.logical), (1_005, 0));
	}

	#[test]
	fn frozen_clock_still_increases() {
		let (clock, _time) = clock_at(1_000);

		let readings = (0..50).map(|_| clock.now()).collect::<Vec<_>>();

		for pair in readings.windows(2) {
			assert!(pair[0] < pair[1]);
			assert!(pair[0].to_transaction_id() < pair[1].to_transaction_id());
		}
		assert_eq!(readings[49].logical, 49);
	}

	#[test]
	fn regressing_clock_still_increases() {
		let (clock, time) = clock_at(5_000);

		let before = clock.now();
		time.set(4_000);
		let after = clock.now();

		assert_eq!(after.wall_time, 5_000);
		assert_eq!(after.logical, before.logical + 1);
		assert!(after.to_transaction_id() > before.to_transaction_id());
	}

	#[test]
	fn receive_from_the_future_adopts_remote_wall() {
		let (clock, _time) = clock_at(1_000);
		clock.now();

		let merged = clock.receive(2_000, 7);
		assert_eq!((merged.wall_time, merged.logical), (2_000, 8));

		let next = clock.now();
		assert!((next.wall_time, next.logical) > (2_000, 7));
	}

	#[test]
	fn receive_with_equal_walls_takes_max_logical() {
		let (clock, _time) = clock_at(1_000);
		clock.now();
		clock.now(); // logical 1

		let merged = clock.receive(1_000, 4);
		assert_eq!((merged.wall_time, merged.logical), (1_000, 5));

		let merged = clock.receive(1_000, 0);
		assert_eq!(merged.logical, 6);
	}

	#[test]
	fn receive_from_the_past_only_bumps_local_logical() {
		let (clock, time) = clock_at(3_000);
		clock.now();
		time.set(2_500);

		let merged = clock.receive(1_000, 40);
		assert_eq!((merged.wall_time, merged.logical), (3_000, 1));
	}

	#[test]
	fn receive_resets_logical_when_physical_time_dominates() {
		let (clock, time) = clock_at(1_000);
		clock.now();
		time.set(9_000);

		let merged = clock.receive(2_000, 3);
		assert_eq!((merged.wall_time, merged.logical), (9_000, 0));
	}

	#[test]
	fn logical_overflow_borrows_a_millisecond() {
		let (clock, _time) = clock_at(1_000);

		let merged = clock.receive(1_000, MAX_LOGICAL);
		assert_eq!((merged.wall_time, merged.logical), (1_001, 0));

		let next = clock.now();
		assert_eq!((next.wall_time, next.logical), (1_001, 1));
	}

	#[test]
	fn transaction_ids_round_trip_through_text() {
		let (clock, _time) = clock_at(1_700_000_000_000);
		let reading = clock.now();
		let id = reading.to_transaction_id();

		assert!(id.as_str().starts_with("1700000000000.000000."));
		assert_eq!(id.timestamp().unwrap(), reading);
	}

	#[test]
	fn opaque_ids_do_not_parse() {
		assert!(TransactionId::from("T1").timestamp().is_err());
		assert!(TransactionId::from("1.2.not-a-uuid").timestamp().is_err());
	}

	#[test]
	fn receive_id_orders_later_local_ids_after_remote() {
		let (remote, _) = clock_at(8_000);
		let (local, _) = clock_at(1_000);

		let remote_id = remote.create_transaction_id();
		local.receive_id(&remote_id).unwrap();

		assert!(local.create_transaction_id() > remote_id);
	}
}
