//! Deduplication of concurrent identical requests.
//!
//! Callers asking for the same key while a fetch is in flight share that fetch
//! instead of starting their own. Once it settles the key is forgotten, so the
//! next caller starts a fresh one.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use std::{
	collections::{hash_map::Entry, HashMap},
	fmt,
	future::Future,
	panic::AssertUnwindSafe,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CoalesceError<E> {
	/// The shared fetch failed; every waiter gets the same error
	#[error("coalesced fetch failed: {0}")]
	Fetch(E),
	/// The fetch panicked or was dropped before settling
	#[error("coalesced fetch was abandoned before settling")]
	Abandoned,
}

type Outcome<T, E> = Result<T, CoalesceError<E>>;
type Waiters<T, E> = Vec<oneshot::Sender<Outcome<T, E>>>;

/// Registry of in-flight fetches keyed by request identity
///
/// Clones share the registry.
pub struct Coalescer<T, E> {
	pending: Arc<Mutex<HashMap<String, Waiters<T, E>>>>,
}

impl<T, E> Clone for Coalescer<T, E> {
	fn clone(&self) -> Self {
		Self {
			pending: Arc::clone(&self.pending),
		}
	}
}

impl<T, E> Default for Coalescer<T, E> {
	fn default() -> Self {
		Self {
			pending: Arc::default(),
		}
	}
}

impl<T, E> fmt::Debug for Coalescer<T, E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Coalescer")
			.field("pending", &self.lock().len())
			.finish()
	}
}

impl<T, E> Coalescer<T, E>
where
	T: Clone + Send + 'static,
	E: Clone + Send + 'static,
{
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Joins the in-flight fetch for `key`, or starts one with `fetcher`
	///
	/// Registration happens when this is called, not when the returned future
	/// is first polled, so callers in the same tick always share. The fetch runs
	/// on its own task: dropping one caller's future never cancels it for the
	/// others. Must be called within a Tokio runtime.
	pub fn coalesce<F, Fut>(
		&self,
		key: impl Into<String>,
		fetcher: F,
	) -> impl Future<Output = Outcome<T, E>> + Send + 'static
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>> + Send + 'static,
	{
		let key = key.into();
		let (tx, rx) = oneshot::channel();

		let first = match self.lock().entry(key.clone()) {
			Entry::Occupied(mut waiters) => {
				waiters.get_mut().push(tx);
				trace!(%key, subscribers = waiters.get().len(), "Joined in-flight fetch");
				false
			}
			Entry::Vacant(slot) => {
				slot.insert(vec![tx]);
				true
			}
		};

		if first {
			trace!(%key, "Starting fetch");
			match std::panic::catch_unwind(AssertUnwindSafe(fetcher)) {
				Ok(fetch) => self.spawn_fetch(key, fetch),
				Err(_) => {
					warn!(%key, "Fetcher panicked before starting");
					settle(&self.pending, &key, &Err(CoalesceError::Abandoned));
				}
			}
		}

		async move { rx.await.unwrap_or(Err(CoalesceError::Abandoned)) }
	}

	/// Whether a fetch for `key` is currently in flight
	#[must_use]
	pub fn is_pending(&self, key: &str) -> bool {
		self.lock().contains_key(key)
	}

	/// How many callers are waiting on the fetch for `key`
	#[must_use]
	pub fn subscriber_count(&self, key: &str) -> usize {
		self.lock().get(key).map_or(0, Vec::len)
	}

	fn spawn_fetch(
		&self,
		key: String,
		fetch: impl Future<Output = Result<T, E>> + Send + 'static,
	) {
		let pending = Arc::clone(&self.pending);

		tokio::spawn(async move {
			let outcome = match AssertUnwindSafe(fetch).catch_unwind().await {
				Ok(result) => result.map_err(CoalesceError::Fetch),
				Err(_) => {
					warn!(%key, "Coalesced fetch panicked");
					Err(CoalesceError::Abandoned)
				}
			};

			settle(&pending, &key, &outcome);
		});
	}
}

/// Forgets `key`, then resolves everyone waiting on it with `outcome`
///
/// The key goes first so a caller reacting to the outcome starts a fresh fetch.
fn settle<T: Clone, E: Clone>(
	pending: &Mutex<HashMap<String, Waiters<T, E>>>,
	key: &str,
	outcome: &Outcome<T, E>,
) {
	let waiters = pending
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.remove(key)
		.unwrap_or_default();

	debug!(%key, subscribers = waiters.len(), ok = outcome.is_ok(), "Coalesced fetch settled");

	for waiter in waiters {
		// The caller may have stopped listening
		let _ = waiter.send(outcome.clone());
	}
}

impl<T, E> Coalescer<T, E> {
	fn lock(&self) -> MutexGuard<'_, HashMap<String, Waiters<T, E>>> {
		self.pending.lock().unwrap_or_else(PoisonError::into_inner)
	}
}
