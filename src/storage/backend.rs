//! Connector trait for concrete backend adapters
//!
//! A connector binds a declarative configuration block to a physical engine.
//! It validates the configuration, builds the engine-specific connection
//! string and opens [`Driver`]s on demand, so the relational backend can
//! reconnect (after a failure or a backup) without knowing which engine it
//! is talking to.

use std::path::Path;
use std::time::Duration;

use crate::config::{BackendConfig, StorageConfig};
use crate::error::{Result, VarStoreError};

use super::driver::Driver;
use super::sqlite::SqliteConnector;

/// Maximum variable name length, in characters
pub const MAX_NAME_LENGTH: usize = 380;

/// Maximum type tag length, in characters
pub const MAX_TYPE_LENGTH: usize = 50;

/// Maximum payload size, in bytes
pub const MAX_VALUE_SIZE: usize = 10_000;

/// Size limits of a backend's columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    pub max_name_length: usize,
    pub max_type_length: usize,
    pub max_value_size: usize,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            max_name_length: MAX_NAME_LENGTH,
            max_type_length: MAX_TYPE_LENGTH,
            max_value_size: MAX_VALUE_SIZE,
        }
    }
}

/// Opens connections to one configured physical engine
pub trait Connector: Send + Sync {
    /// Engine name (e.g. "sqlite", "turso")
    fn engine(&self) -> &'static str;

    /// Open a new physical connection
    fn connect(&self) -> Result<Box<dyn Driver>>;

    /// Backing file, for engines that have one
    fn backing_file(&self) -> Option<&Path> {
        None
    }

    /// Whether this engine cannot run without a backing file
    fn requires_file(&self) -> bool;

    fn limits(&self) -> SizeLimits {
        SizeLimits::default()
    }

    /// How often to ping an idle connection, if the far end drops idle peers
    fn keep_alive_interval(&self) -> Option<Duration> {
        None
    }
}

/// Build the connector for a storage's backend block
pub fn connector_for(config: &StorageConfig) -> Result<Box<dyn Connector>> {
    match &config.backend {
        BackendConfig::Sqlite { .. } => {
            let path = config.file_path().ok_or_else(|| {
                VarStoreError::Config(format!("storage '{}': missing 'file'", config.name))
            })?;
            Ok(Box::new(SqliteConnector::new(path)?))
        }
        #[cfg(feature = "turso")]
        BackendConfig::Turso {
            url,
            host,
            port,
            database,
            auth_token,
        } => {
            let url = super::turso::connection_url(
                url.as_deref(),
                host.as_deref(),
                *port,
                database.as_deref(),
            )?;
            Ok(Box::new(super::turso::TursoConnector::new(
                url,
                auth_token.clone(),
            )))
        }
        #[cfg(not(feature = "turso"))]
        BackendConfig::Turso { .. } => Err(VarStoreError::Config(format!(
            "storage '{}': built without the 'turso' feature",
            config.name
        ))),
    }
}
