//! Sync configuration management

use anyhow::Result;

mod sync_config;

pub use sync_config::{OutboxSection, SyncConfig, CONFIG_FILE_NAME};

/// A versioned config that upgrades itself in place
pub trait Migrate {
	fn current_version(&self) -> u32;

	fn target_version() -> u32;

	/// Walks the version chain up to [`Migrate::target_version`]
	fn migrate(&mut self) -> Result<()>;
}
