//! Storage configuration
//!
//! One declarative block per storage instance. Blocks are usually read from a
//! TOML file:
//!
//! ```toml
//! [[storage]]
//! name = "default"
//! pattern = ".*"
//! backup_interval_secs = 3600
//! backups_to_keep = 24
//!
//! [storage.backend]
//! type = "sqlite"
//! file = "~/.local/share/varstore/variables.db"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VarStoreError};
use crate::types::NamePattern;

/// Default backing table name
pub const DEFAULT_TABLE: &str = "variables";

/// Backend-specific connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Embedded single-file engine
    Sqlite {
        /// Path to the database file, created if absent
        file: String,
    },
    /// Networked libSQL/Turso engine
    Turso {
        /// Full database URL; built from host/port/database when absent
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        database: Option<String>,
        #[serde(default)]
        auth_token: Option<String>,
    },
}

impl BackendConfig {
    /// Engine name used in logs
    pub fn engine(&self) -> &'static str {
        match self {
            BackendConfig::Sqlite { .. } => "sqlite",
            BackendConfig::Turso { .. } => "turso",
        }
    }
}

/// Configuration for a single storage instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage name, used in logs and as the load source
    pub name: String,
    pub backend: BackendConfig,
    /// Regular expression restricting accepted variable names
    #[serde(default)]
    pub pattern: Option<String>,
    /// Backing table
    #[serde(default = "default_table")]
    pub table: String,
    /// Poll the backend for rows written by other instances
    #[serde(default)]
    pub monitor_changes: bool,
    /// Delay between poll cycles in milliseconds
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
    /// Delay between automatic backups in seconds (0 = disabled)
    #[serde(default)]
    pub backup_interval_secs: u64,
    /// Backups retained after rotation (0 = keep all)
    #[serde(default)]
    pub backups_to_keep: usize,
    /// Delay between transaction commits in milliseconds
    #[serde(default = "default_commit_interval")]
    pub commit_interval_ms: u64,
    /// Write queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_monitor_interval() -> u64 {
    20_000
}

fn default_commit_interval() -> u64 {
    500
}

fn default_queue_capacity() -> usize {
    1000
}

impl StorageConfig {
    /// A file-backed storage with default settings
    pub fn sqlite(name: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: BackendConfig::Sqlite { file: file.into() },
            pattern: None,
            table: default_table(),
            monitor_changes: false,
            monitor_interval_ms: default_monitor_interval(),
            backup_interval_secs: 0,
            backups_to_keep: 0,
            commit_interval_ms: default_commit_interval(),
            queue_capacity: default_queue_capacity(),
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_monitor(mut self, interval: Duration) -> Self {
        self.monitor_changes = true;
        self.monitor_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_backups(mut self, interval: Duration, keep: usize) -> Self {
        self.backup_interval_secs = interval.as_secs();
        self.backups_to_keep = keep;
        self
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    /// `None` when automatic backups are disabled
    pub fn backup_interval(&self) -> Option<Duration> {
        (self.backup_interval_secs > 0).then(|| Duration::from_secs(self.backup_interval_secs))
    }

    /// Expanded backing file path, for file-based backends
    pub fn file_path(&self) -> Option<PathBuf> {
        match &self.backend {
            BackendConfig::Sqlite { file } => Some(PathBuf::from(shellexpand::tilde(file).as_ref())),
            BackendConfig::Turso { .. } => None,
        }
    }

    /// Check required fields and compile the name pattern
    pub fn validate(&self) -> Result<NamePattern> {
        if self.name.trim().is_empty() {
            return Err(VarStoreError::Config("storage name cannot be empty".to_string()));
        }

        if !is_identifier(&self.table) {
            return Err(VarStoreError::Config(format!(
                "storage '{}': table name '{}' must be a plain identifier ([A-Za-z_][A-Za-z0-9_]*)",
                self.name, self.table
            )));
        }

        if self.monitor_changes && self.monitor_interval_ms == 0 {
            return Err(VarStoreError::Config(format!(
                "storage '{}': monitor interval must be greater than zero",
                self.name
            )));
        }

        if self.commit_interval_ms == 0 {
            return Err(VarStoreError::Config(format!(
                "storage '{}': commit interval must be greater than zero",
                self.name
            )));
        }

        if self.queue_capacity == 0 {
            return Err(VarStoreError::Config(format!(
                "storage '{}': queue capacity must be greater than zero",
                self.name
            )));
        }

        match &self.backend {
            BackendConfig::Sqlite { file } if file.trim().is_empty() => {
                return Err(VarStoreError::Config(format!(
                    "storage '{}': 'file' is required for the sqlite backend",
                    self.name
                )));
            }
            BackendConfig::Turso { url: None, host: None, .. } => {
                return Err(VarStoreError::Config(format!(
                    "storage '{}': either 'url' or 'host' is required for the turso backend",
                    self.name
                )));
            }
            _ => {}
        }

        NamePattern::parse(self.pattern.as_deref())
    }
}

/// All configured storages, in declaration order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoragesConfig {
    #[serde(default)]
    pub storage: Vec<StorageConfig>,
}

impl StoragesConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
