//! varstore - persistent variable storage
//!
//! Durable storage for a scripting runtime's named variables. Writes are
//! queued and persisted by background threads, several running instances
//! can share one database and pick up each other's changes by polling, and
//! file-backed storages take online backups with rotation.

pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod storage;
pub mod types;

pub use config::{BackendConfig, StorageConfig, StoragesConfig};
pub use engine::{StorageEngine, StorageSet};
pub use error::{Result, VarStoreError};
pub use registry::{MemoryRegistry, VariableSink};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
