//! Change log and scope counter data model
//!
//! The change log is an append-only record of committed mutations. It is
//! written by the server-side commit path only; the sync core reads it through
//! [`ChangeLog`] and reads the per-scope counters through [`ScopeSequences`].

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{hlc::TransactionId, StoreError};

/// Monotonically increasing change log row id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeLogId(pub u64);

impl fmt::Display for ChangeLogId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Opaque catch-up position handed to clients
///
/// Clients must echo it back untouched; only the server interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
	/// Change log position encoded in this cursor, `None` when it was tampered with
	#[must_use]
	pub fn change_log_id(&self) -> Option<ChangeLogId> {
		self.0.parse().ok().map(ChangeLogId)
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<ChangeLogId> for Cursor {
	fn from(id: ChangeLogId) -> Self {
		Self(id.0.to_string())
	}
}

impl From<String> for Cursor {
	fn from(raw: String) -> Self {
		Self(raw)
	}
}

impl fmt::Display for Cursor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
	Insert,
	Update,
	Delete,
}

impl fmt::Display for ChangeAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Insert => "insert",
			Self::Update => "update",
			Self::Delete => "delete",
		})
	}
}

/// One committed mutation, immutable once written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
	pub id: ChangeLogId,
	pub entity_type: String,
	pub entity_id: String,
	pub action: ChangeAction,
	pub changed_field: Option<String>,
	pub transaction_id: Option<TransactionId>,
	pub created_at: DateTime<Utc>,
}

impl ChangeLogEntry {
	#[must_use]
	pub fn entity(&self) -> EntityRef {
		EntityRef {
			entity_type: self.entity_type.clone(),
			entity_id: self.entity_id.clone(),
		}
	}
}

/// Identifies the entity a transaction produced or touched
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
	pub entity_type: String,
	pub entity_id: String,
}

impl EntityRef {
	pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
		Self {
			entity_type: entity_type.into(),
			entity_id: entity_id.into(),
		}
	}
}

impl fmt::Display for EntityRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.entity_type, self.entity_id)
	}
}

/// Partition key of a sequence counter
///
/// A scope is an entity type, optionally qualified by an organization
/// (`{org}:{entity_type}`) or marked as public (`public:{entity_type}`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeKey(String);

impl ScopeKey {
	const PUBLIC_PREFIX: &'static str = "public";

	pub fn entity_type(entity_type: impl AsRef<str>) -> Self {
		Self(entity_type.as_ref().to_string())
	}

	/// Scope of one organization's entities of a type
	///
	/// Change log entries carry no organization, so catch-up hands a delete
	/// tombstone to every requested scope of the entity's type. A client
	/// tracking several organizations may see another one's deleted ids and
	/// should ignore ids it does not hold.
	pub fn for_org(org_id: impl fmt::Display, entity_type: impl AsRef<str>) -> Self {
		Self(format!("{org_id}:{}", entity_type.as_ref()))
	}

	pub fn public(entity_type: impl AsRef<str>) -> Self {
		Self(format!("{}:{}", Self::PUBLIC_PREFIX, entity_type.as_ref()))
	}

	/// Entity type this scope partitions
	#[must_use]
	pub fn entity(&self) -> &str {
		self.0
			.rsplit_once(':')
			.map_or(self.0.as_str(), |(_, entity)| entity)
	}

	#[must_use]
	pub fn is_public(&self) -> bool {
		self.0
			.split_once(':')
			.is_some_and(|(prefix, _)| prefix == Self::PUBLIC_PREFIX)
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for ScopeKey {
	fn from(raw: &str) -> Self {
		Self(raw.to_string())
	}
}

impl From<String> for ScopeKey {
	fn from(raw: String) -> Self {
		Self(raw)
	}
}

impl fmt::Display for ScopeKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Read access to the change log
#[async_trait]
pub trait ChangeLog: Send + Sync {
	/// Transaction id of the newest entry for this entity field that carries one
	async fn latest_field_transaction(
		&self,
		entity_type: &str,
		entity_id: &str,
		field: &str,
	) -> Result<Option<TransactionId>, StoreError>;

	/// Any entry already tagged with this transaction id
	async fn find_by_transaction(
		&self,
		transaction_id: &TransactionId,
	) -> Result<Option<ChangeLogEntry>, StoreError>;

	/// Delete entries with an id greater than `after`, oldest first, at most `limit`
	async fn deletions_after(
		&self,
		after: ChangeLogId,
		entity_types: &[String],
		limit: usize,
	) -> Result<Vec<ChangeLogEntry>, StoreError>;

	/// Id of the newest entry for any of these entity types
	async fn latest_id(&self, entity_types: &[String]) -> Result<Option<ChangeLogId>, StoreError>;
}

/// Direct key lookup of scope sequence counters
#[async_trait]
pub trait ScopeSequences: Send + Sync {
	/// Current counter per requested scope; scopes never written are absent
	async fn current_seqs(&self, scopes: &[ScopeKey]) -> Result<HashMap<ScopeKey, u64>, StoreError>;
}
