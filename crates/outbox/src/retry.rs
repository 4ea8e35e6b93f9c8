//! Retry scheduling policies
//!
//! Three independent concerns, composed by [`RetryPolicy`]:
//! - [`BackoffPolicy`]: when the next attempt may run, never by attempt count
//! - [`EvictionPolicy`]: how old an entry may get before it is dropped unsent
//! - [`DeadLetterPolicy`]: optional cap on attempts, off by default

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_JITTER_RATIO: f64 = 0.5;
pub const DEFAULT_RETRY_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential backoff with additive jitter
///
/// Attempt `n` (1-based) waits `base * (1 + jitter_ratio * u)` with
/// `base = initial * 2^(n-1)` and `u` uniform in `[0, 1)`. With the ratio
/// clamped to `[0, 1]`, the delay of attempt `n` is below `2 * base`, the
/// smallest delay attempt `n + 1` can draw, so delays strictly increase until
/// `base` reaches `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
	pub initial: Duration,
	pub max: Duration,
	pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
	fn default() -> Self {
		Self {
			initial: DEFAULT_INITIAL_BACKOFF,
			max: DEFAULT_MAX_BACKOFF,
			jitter_ratio: DEFAULT_JITTER_RATIO,
		}
	}
}

impl BackoffPolicy {
	/// Delay without jitter before attempt `attempt`
	#[must_use]
	pub fn base_delay(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(31);
		self.initial
			.saturating_mul(2_u32.saturating_pow(exponent))
			.min(self.max)
	}

	/// Jittered delay before attempt `attempt`, 1 being the first retry
	pub fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
		let base = self.base_delay(attempt);
		let ratio = if self.jitter_ratio.is_finite() {
			self.jitter_ratio.clamp(0.0, 1.0)
		} else {
			0.0
		};

		base.saturating_add(base.mul_f64(ratio * rng.gen::<f64>()))
	}
}

/// Drops entries older than a fixed horizon, whatever their retry state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
	pub horizon: Duration,
}

impl Default for EvictionPolicy {
	fn default() -> Self {
		Self {
			horizon: DEFAULT_RETRY_HORIZON,
		}
	}
}

impl EvictionPolicy {
	#[must_use]
	pub fn is_expired(&self, enqueued_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
		(now - enqueued_at)
			.to_std()
			.is_ok_and(|age| age > self.horizon)
	}
}

/// Moves an entry aside after too many retriable failures
///
/// Keeps a misclassified permanent failure from stalling its queue forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadLetterPolicy {
	pub max_attempts: Option<u32>,
}

impl DeadLetterPolicy {
	#[must_use]
	pub fn should_dead_letter(&self, attempts: u32) -> bool {
		self.max_attempts.is_some_and(|max| attempts >= max)
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RetryPolicy {
	pub backoff: BackoffPolicy,
	pub eviction: EvictionPolicy,
	pub dead_letter: DeadLetterPolicy,
}
