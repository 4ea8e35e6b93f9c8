use td_sync::TransactionId;

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use super::entry::{MutationName, PendingMutation};

/// What a registered mutation function receives
#[derive(Debug, Clone)]
pub struct MutationContext {
	pub transaction: PendingMutation,
	/// Same key on every attempt of the same entry
	pub idempotency_key: TransactionId,
}

/// Failure reported by a mutation function
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum MutationError {
	#[error("network error: {0}")]
	Network(String),
	#[error("request timed out")]
	Timeout,
	#[error("server responded with status {status}: {message}")]
	Server { status: u16, message: String },
	#[error("validation failed: {0}")]
	Validation(String),
	#[error("payload too large")]
	PayloadTooLarge,
	/// The target no longer exists, e.g. deleting an already deleted entity
	#[error("entity is gone: {0}")]
	Gone(String),
	#[error("{0}")]
	Other(String),
}

impl MutationError {
	/// Default classification: transport trouble and 5xx retry, everything else is final
	#[must_use]
	pub const fn is_retriable(&self) -> bool {
		match self {
			Self::Network(_) | Self::Timeout => true,
			Self::Server { status, .. } => *status >= 500 || *status == 408 || *status == 429,
			Self::Validation(_) | Self::PayloadTooLarge | Self::Gone(_) | Self::Other(_) => false,
		}
	}
}

pub type MutationOutput = serde_json::Value;

pub type MutationFn = Arc<
	dyn Fn(MutationContext) -> BoxFuture<'static, Result<MutationOutput, MutationError>>
		+ Send
		+ Sync,
>;

/// Decides whether a failure is worth retrying
pub type RetryClassifier = Arc<dyn Fn(&MutationError) -> bool + Send + Sync>;

#[must_use]
pub fn default_classifier() -> RetryClassifier {
	Arc::new(MutationError::is_retriable)
}

/// Named mutation functions known to this build
#[derive(Default, Clone)]
pub struct MutationRegistry {
	mutations: HashMap<MutationName, MutationFn>,
}

impl fmt::Debug for MutationRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_set().entries(self.mutations.keys()).finish()
	}
}

impl MutationRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `mutation` as the `{entity_type}.{operation}` function
	#[must_use]
	pub fn register<F, Fut>(mut self, entity_type: &str, operation: &str, mutation: F) -> Self
	where
		F: Fn(MutationContext) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<MutationOutput, MutationError>> + Send + 'static,
	{
		self.mutations.insert(
			MutationName::new(entity_type, operation),
			Arc::new(move |ctx: MutationContext| mutation(ctx).boxed()),
		);
		self
	}

	#[must_use]
	pub fn get(&self, name: &MutationName) -> Option<&MutationFn> {
		self.mutations.get(name)
	}

	#[must_use]
	pub fn contains(&self, name: &MutationName) -> bool {
		self.mutations.contains_key(name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_classification() {
		for retriable in [
			MutationError::Network("connection reset".into()),
			MutationError::Timeout,
			MutationError::Server {
				status: 503,
				message: "unavailable".into(),
			},
			MutationError::Server {
				status: 429,
				message: "slow down".into(),
			},
		] {
			assert!(retriable.is_retriable(), "{retriable}");
		}

		for fatal in [
			MutationError::Validation("name is required".into()),
			MutationError::PayloadTooLarge,
			MutationError::Gone("org_1".into()),
			MutationError::Server {
				status: 403,
				message: "quota exceeded".into(),
			},
		] {
			assert!(!fatal.is_retriable(), "{fatal}");
		}
	}

	#[tokio::test]
	async fn registered_functions_are_callable_by_name() {
		let registry = MutationRegistry::new().register("organization", "insert", |ctx| async move {
			Ok::<_, MutationError>(serde_json::json!({ "key": ctx.idempotency_key }))
		});

		let name = MutationName::new("organization", "insert");
		assert!(registry.contains(&name));
		assert!(!registry.contains(&MutationName::new("organization", "delete")));

		let entry = PendingMutation::new(
			"T1".into(),
			"organization",
			"insert",
			serde_json::Value::Null,
			chrono::Utc::now(),
		);
		let output = registry.get(&name).unwrap()(MutationContext {
			idempotency_key: entry.idempotency_key.clone(),
			transaction: entry,
		})
		.await
		.unwrap();

		assert_eq!(output, serde_json::json!({ "key": "T1" }));
	}
}
