use td_core_sync::CatchUpConfig;
use td_outbox::{
	BackoffPolicy, DeadLetterPolicy, EvictionPolicy, LeaseConfig, RetryPolicy,
	DEFAULT_JITTER_RATIO, DEFAULT_RETRY_HORIZON,
};

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::Migrate;

pub const CONFIG_FILE_NAME: &str = "tandem-sync.json";

/// Sync configuration of one device, kept as JSON in its data directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
	/// Config schema version
	pub version: u32,

	/// Directory this config was loaded from
	#[serde(skip)]
	pub data_dir: PathBuf,

	/// Stable id of this device, generated on first run
	pub node_id: Uuid,

	/// Default `tracing` filter when `RUST_LOG` is unset
	pub log_level: String,

	#[serde(default)]
	pub outbox: OutboxSection,

	#[serde(default)]
	pub catch_up: CatchUpConfig,
}

/// Outbox retry, eviction and leader election settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSection {
	pub initial_backoff_ms: u64,
	pub max_backoff_ms: u64,
	pub jitter_ratio: f64,
	/// Entries older than this are evicted unsent
	pub retry_horizon_secs: u64,
	/// Dead-letter after this many failed attempts; never when unset
	pub dead_letter_after: Option<u32>,
	pub lease_ttl_ms: u64,
	pub heartbeat_ms: u64,
	/// Outbox file name, relative to the data directory
	pub store_file: String,
}

impl Default for OutboxSection {
	fn default() -> Self {
		Self {
			initial_backoff_ms: 1_000,
			max_backoff_ms: 5 * 60 * 1_000,
			jitter_ratio: DEFAULT_JITTER_RATIO,
			retry_horizon_secs: DEFAULT_RETRY_HORIZON.as_secs(),
			dead_letter_after: None,
			lease_ttl_ms: 5_000,
			heartbeat_ms: 1_000,
			store_file: "outbox.msgpack".to_string(),
		}
	}
}

impl OutboxSection {
	#[must_use]
	pub fn retry_policy(&self) -> RetryPolicy {
		RetryPolicy {
			backoff: BackoffPolicy {
				initial: Duration::from_millis(self.initial_backoff_ms),
				max: Duration::from_millis(self.max_backoff_ms),
				jitter_ratio: self.jitter_ratio,
			},
			eviction: EvictionPolicy {
				horizon: Duration::from_secs(self.retry_horizon_secs),
			},
			dead_letter: DeadLetterPolicy {
				max_attempts: self.dead_letter_after,
			},
		}
	}

	#[must_use]
	pub const fn lease_config(&self) -> LeaseConfig {
		LeaseConfig {
			ttl: Duration::from_millis(self.lease_ttl_ms),
			heartbeat: Duration::from_millis(self.heartbeat_ms),
		}
	}

	fn validate(&self) -> Result<()> {
		if self.initial_backoff_ms == 0 || self.initial_backoff_ms > self.max_backoff_ms {
			bail!(
				"outbox backoff must satisfy 0 < initial ({}ms) <= max ({}ms)",
				self.initial_backoff_ms,
				self.max_backoff_ms
			);
		}

		if !(0.0..=1.0).contains(&self.jitter_ratio) {
			bail!("outbox jitter ratio must be within [0, 1], got {}", self.jitter_ratio);
		}

		if self.heartbeat_ms == 0 || self.heartbeat_ms >= self.lease_ttl_ms {
			bail!(
				"outbox heartbeat ({}ms) must be shorter than the lease ttl ({}ms)",
				self.heartbeat_ms,
				self.lease_ttl_ms
			);
		}

		if self.dead_letter_after == Some(0) {
			bail!("outbox dead_letter_after must be at least 1 when set");
		}

		Ok(())
	}
}

impl SyncConfig {
	/// Loads the config from `data_dir`, creating a default one when missing
	///
	/// Older versions are migrated and written back.
	pub fn load_from(data_dir: impl AsRef<Path>) -> Result<Self> {
		let data_dir = data_dir.as_ref();
		let config_path = data_dir.join(CONFIG_FILE_NAME);

		if !config_path.exists() {
			warn!(path = %config_path.display(), "No sync config found, creating default");
			let config = Self::default_with_dir(data_dir);
			config.save()?;
			return Ok(config);
		}

		info!(path = %config_path.display(), "Loading sync config");
		let json = fs::read_to_string(&config_path)
			.with_context(|| format!("failed to read {}", config_path.display()))?;
		let mut config: Self = serde_json::from_str(&json)
			.with_context(|| format!("failed to parse {}", config_path.display()))?;
		config.data_dir = data_dir.to_path_buf();

		if config.current_version() < Self::target_version() {
			info!(
				from = config.current_version(),
				to = Self::target_version(),
				"Migrating sync config"
			);
			config.migrate()?;
			config.save()?;
		}

		config.validate()?;

		Ok(config)
	}

	#[must_use]
	pub fn default_with_dir(data_dir: impl Into<PathBuf>) -> Self {
		Self {
			version: Self::target_version(),
			data_dir: data_dir.into(),
			node_id: Uuid::new_v4(),
			log_level: "info".to_string(),
			outbox: OutboxSection::default(),
			catch_up: CatchUpConfig::default(),
		}
	}

	pub fn save(&self) -> Result<()> {
		fs::create_dir_all(&self.data_dir)
			.with_context(|| format!("failed to create {}", self.data_dir.display()))?;

		let config_path = self.data_dir.join(CONFIG_FILE_NAME);
		let json = serde_json::to_string_pretty(self)?;
		fs::write(&config_path, json)
			.with_context(|| format!("failed to write {}", config_path.display()))?;

		info!(path = %config_path.display(), "Saved sync config");
		Ok(())
	}

	pub fn validate(&self) -> Result<()> {
		self.outbox.validate()?;

		if self.catch_up.delete_limit == 0 {
			bail!("catch_up delete_limit must be at least 1");
		}

		Ok(())
	}

	#[must_use]
	pub fn outbox_store_path(&self) -> PathBuf {
		self.data_dir.join(&self.outbox.store_file)
	}

	#[must_use]
	pub fn logs_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}
}

impl Migrate for SyncConfig {
	fn current_version(&self) -> u32 {
		self.version
	}

	fn target_version() -> u32 {
		2
	}

	fn migrate(&mut self) -> Result<()> {
		match self.version {
			1 => {
				// v2 introduced the catch_up section
				self.catch_up = CatchUpConfig::default();
				self.version = 2;
				Ok(())
			}
			2 => Ok(()),
			v => Err(anyhow!("Unknown sync config version: {v}")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use serde_json::json;

	#[test]
	fn missing_config_is_created_with_defaults() {
		let dir = tempfile::tempdir().unwrap();

		let created = SyncConfig::load_from(dir.path()).unwrap();
		assert!(dir.path().join(CONFIG_FILE_NAME).exists());
		assert_eq!(created.outbox.retry_horizon_secs, 24 * 60 * 60);
		assert_eq!(created.outbox.dead_letter_after, None);
		assert_eq!(created.catch_up.delete_limit, 1000);

		// The node id is only generated once
		let reloaded = SyncConfig::load_from(dir.path()).unwrap();
		assert_eq!(reloaded, created);
	}

	#[test]
	fn old_configs_are_migrated_and_written_back() {
		let dir = tempfile::tempdir().unwrap();
		let node_id = Uuid::new_v4();
		fs::write(
			dir.path().join(CONFIG_FILE_NAME),
			json!({
				"version": 1,
				"node_id": node_id,
				"log_level": "debug",
				"outbox": { "max_backoff_ms": 60000 }
			})
			.to_string(),
		)
		.unwrap();

		let config = SyncConfig::load_from(dir.path()).unwrap();
		assert_eq!(config.version, 2);
		assert_eq!(config.node_id, node_id);
		assert_eq!(config.outbox.max_backoff_ms, 60_000);
		// Untouched keys keep their defaults
		assert_eq!(config.outbox.initial_backoff_ms, 1_000);

		let on_disk: serde_json::Value =
			serde_json::from_str(&fs::read_to_string(dir.path().join(CONFIG_FILE_NAME)).unwrap())
				.unwrap();
		assert_eq!(on_disk["version"], 2);
		assert_eq!(on_disk["catch_up"]["delete_limit"], 1000);
	}

	#[test]
	fn unknown_versions_are_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let mut config = SyncConfig::default_with_dir(dir.path());
		config.version = 0;
		config.save().unwrap();

		assert!(SyncConfig::load_from(dir.path()).is_err());
	}

	#[test]
	fn heartbeat_must_be_shorter_than_the_lease() {
		let dir = tempfile::tempdir().unwrap();
		let mut config = SyncConfig::default_with_dir(dir.path());
		config.outbox.heartbeat_ms = config.outbox.lease_ttl_ms;
		config.save().unwrap();

		let err = SyncConfig::load_from(dir.path()).unwrap_err();
		assert!(err.to_string().contains("heartbeat"), "{err}");
	}

	#[test]
	fn sections_convert_into_runtime_policies() {
		let mut config = SyncConfig::default_with_dir("/tmp/tandem");
		config.outbox.dead_letter_after = Some(10);

		let retry = config.outbox.retry_policy();
		assert_eq!(retry.backoff.initial, Duration::from_secs(1));
		assert_eq!(retry.backoff.max, Duration::from_secs(300));
		assert_eq!(retry.eviction.horizon, Duration::from_secs(24 * 60 * 60));
		assert_eq!(retry.dead_letter.max_attempts, Some(10));

		let lease = config.outbox.lease_config();
		assert_eq!(lease.ttl, Duration::from_secs(5));
		assert_eq!(lease.heartbeat, Duration::from_secs(1));

		assert_eq!(
			config.outbox_store_path(),
			Path::new("/tmp/tandem").join("outbox.msgpack")
		);
	}
}
