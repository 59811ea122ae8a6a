//! Error types for varstore

use thiserror::Error;

/// Result type alias for varstore operations
pub type Result<T> = std::result::Result<T, VarStoreError>;

/// Main error type for varstore
#[derive(Error, Debug)]
pub enum VarStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Remote database error: {0}")]
    Remote(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid name pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Storage '{0}' is closed")]
    Closed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl VarStoreError {
    /// Configuration errors are fatal to a storage's load but not to the process
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            VarStoreError::Config(_) | VarStoreError::Pattern(_) | VarStoreError::ConfigParse(_)
        )
    }

    /// Whether the backend connection is beyond recovery
    pub fn is_terminal(&self) -> bool {
        matches!(self, VarStoreError::Connection(_) | VarStoreError::Closed(_))
    }
}

#[cfg(feature = "turso")]
impl From<libsql::Error> for VarStoreError {
    fn from(e: libsql::Error) -> Self {
        VarStoreError::Remote(e.to_string())
    }
}
