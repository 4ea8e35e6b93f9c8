//! Time source abstraction
//!
//! The hybrid clock, outbox leases and retry deadlines all read time through
//! [`TimeSource`], so tests can freeze the clock, move it forward in big jumps
//! or set it backwards to simulate skew.

use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

use chrono::{DateTime, Utc};

/// Source of wall-clock time in milliseconds since the Unix epoch
pub trait TimeSource: Send + Sync {
	fn current_time_ms(&self) -> u64;

	/// Same instant as [`TimeSource::current_time_ms`], as a UTC datetime
	fn now(&self) -> DateTime<Utc> {
		ms_to_datetime(self.current_time_ms())
	}
}

/// Production time source backed by the system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
	fn current_time_ms(&self) -> u64 {
		// Before the epoch only on a badly misconfigured host
		u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
	}
}

/// Manually driven time source for tests
///
/// Clones share the same underlying instant, so a single `FakeTimeSource` can
/// drive several clocks, leases and executors at once. Time may be set
/// backwards to exercise clock regression.
///
/// ```
/// use td_sync::{FakeTimeSource, TimeSource};
///
/// let time = FakeTimeSource::new(1_000);
/// time.advance(500);
/// assert_eq!(time.current_time_ms(), 1_500);
///
/// time.set(200);
/// assert_eq!(time.current_time_ms(), 200);
/// ```
#[derive(Debug, Clone)]
pub struct FakeTimeSource {
	time: Arc<AtomicU64>,
}

impl Default for FakeTimeSource {
	fn default() -> Self {
		Self::new(1_000)
	}
}

impl FakeTimeSource {
	#[must_use]
	pub fn new(initial_ms: u64) -> Self {
		Self {
			time: Arc::new(AtomicU64::new(initial_ms)),
		}
	}

	pub fn advance(&self, delta_ms: u64) {
		self.time.fetch_add(delta_ms, Ordering::SeqCst);
	}

	pub fn set(&self, time_ms: u64) {
		self.time.store(time_ms, Ordering::SeqCst);
	}

	#[must_use]
	pub fn get(&self) -> u64 {
		self.time.load(Ordering::SeqCst)
	}
}

impl TimeSource for FakeTimeSource {
	fn current_time_ms(&self) -> u64 {
		self.get()
	}
}

/// Converts epoch milliseconds into a UTC datetime, saturating at the far future
#[must_use]
pub fn ms_to_datetime(ms: u64) -> DateTime<Utc> {
	i64::try_from(ms)
		.ok()
		.and_then(DateTime::from_timestamp_millis)
		.unwrap_or(DateTime::<Utc>::MAX_UTC)
}
