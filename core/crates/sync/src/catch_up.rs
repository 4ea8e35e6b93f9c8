//! Catch-up reconciliation for reconnecting clients
//!
//! "Did anything change" is answered from the scope sequence counters alone,
//! one key lookup per scope. The change log is only consulted for delete
//! tombstones of scopes whose counter moved, and only when the client already
//! holds a cursor.

use td_sync::{ChangeLog, Cursor, ScopeKey, ScopeSequences};

use std::{
	collections::{BTreeMap, BTreeSet, HashMap},
	sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::Error;

pub const DEFAULT_DELETE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpConfig {
	/// Most delete tombstones returned by a single catch-up
	pub delete_limit: usize,
}

impl Default for CatchUpConfig {
	fn default() -> Self {
		Self {
			delete_limit: DEFAULT_DELETE_LIMIT,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchUpRequest {
	#[serde(default)]
	pub cursor: Option<Cursor>,
	/// Last seq the client saw per scope; omitted means "send me everything"
	#[serde(default)]
	pub client_seqs: Option<HashMap<ScopeKey, u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeChanges {
	pub seq: u64,
	pub deleted_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchUpResponse {
	pub changes: BTreeMap<ScopeKey, ScopeChanges>,
	pub cursor: Option<Cursor>,
	/// Deletions were truncated at the limit; call again with the new cursor
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub has_more: bool,
}

#[derive(Clone)]
pub struct CatchUpReconciler {
	log: Arc<dyn ChangeLog>,
	sequences: Arc<dyn ScopeSequences>,
	config: CatchUpConfig,
}

impl CatchUpReconciler {
	#[must_use]
	pub fn new(
		log: Arc<dyn ChangeLog>,
		sequences: Arc<dyn ScopeSequences>,
		config: CatchUpConfig,
	) -> Self {
		Self {
			log,
			sequences,
			config,
		}
	}

	/// Computes what `scopes` changed since the client's cursor and seqs
	#[instrument(skip_all, fields(scopes = scopes.len(), cursor = ?request.cursor), err)]
	pub async fn catch_up(
		&self,
		scopes: &[ScopeKey],
		request: CatchUpRequest,
	) -> Result<CatchUpResponse, Error> {
		let CatchUpRequest {
			cursor,
			client_seqs,
		} = request;

		let after = cursor
			.as_ref()
			.map(|cursor| {
				cursor
					.change_log_id()
					.ok_or_else(|| Error::InvalidCursor(cursor.clone()))
			})
			.transpose()?;

		let server_seqs = self.sequences.current_seqs(scopes).await?;

		if let Some(cursor) = cursor.filter(|_| {
			changed_scopes(scopes, &server_seqs, client_seqs.as_ref()).is_empty()
		}) {
			debug!("No scope changed, echoing cursor");
			return Ok(CatchUpResponse {
				changes: BTreeMap::new(),
				cursor: Some(cursor),
				has_more: false,
			});
		}

		// The cursor is read before the seqs that get reported with it. A commit
		// racing this call then either shows in those seqs, which marks its scope
		// changed and puts its tombstone in the scan below, or lands after the
		// returned cursor.
		let tracked_types = entity_types(scopes.iter());
		let latest = self.log.latest_id(&tracked_types).await?;
		let server_seqs = self.sequences.current_seqs(scopes).await?;
		let mut changes = changed_scopes(scopes, &server_seqs, client_seqs.as_ref());

		let mut next = latest.max(after);
		let mut has_more = false;

		if let Some(after) = after.filter(|_| !changes.is_empty()) {
			let limit = self.config.delete_limit.max(1);
			let deletions = self
				.log
				.deletions_after(after, &entity_types(changes.keys()), limit)
				.await?;

			if deletions.len() >= limit {
				has_more = true;
				next = deletions.last().map(|entry| entry.id).or(next);
			}

			for entry in &deletions {
				for (scope, scope_changes) in &mut changes {
					if scope.entity() == entry.entity_type
						&& !scope_changes.deleted_ids.contains(&entry.entity_id)
					{
						scope_changes.deleted_ids.push(entry.entity_id.clone());
					}
				}
			}

			debug!(
				changed = changes.len(),
				deletions = deletions.len(),
				has_more,
				"Collected delete tombstones"
			);
		}

		Ok(CatchUpResponse {
			changes,
			cursor: next.map(Cursor::from),
			has_more,
		})
	}
}

/// Scopes whose server seq differs from what the client last saw
///
/// Without client seqs every scope counts as changed. A scope never written
/// reads as seq 0.
fn changed_scopes(
	scopes: &[ScopeKey],
	server_seqs: &HashMap<ScopeKey, u64>,
	client_seqs: Option<&HashMap<ScopeKey, u64>>,
) -> BTreeMap<ScopeKey, ScopeChanges> {
	scopes
		.iter()
		.filter_map(|scope| {
			let seq = server_seqs.get(scope).copied().unwrap_or(0);
			let changed = client_seqs.map_or(true, |client| client.get(scope) != Some(&seq));

			changed.then(|| {
				(
					scope.clone(),
					ScopeChanges {
						seq,
						deleted_ids: vec![],
					},
				)
			})
		})
		.collect()
}

fn entity_types<'a>(scopes: impl Iterator<Item = &'a ScopeKey>) -> Vec<String> {
	scopes
		.map(|scope| scope.entity().to_string())
		.collect::<BTreeSet<_>>()
		.into_iter()
		.collect()
}
