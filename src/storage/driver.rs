//! Backend driver adapter
//!
//! The relational backend only needs four things from a physical engine:
//! connect, disconnect, execute a statement, and run a query. Drivers are
//! synchronous; networked drivers block on their own runtime internally.

use crate::error::{Result, VarStoreError};

/// A bound statement parameter or a column value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<Option<&[u8]>> for SqlValue {
    fn from(v: Option<&[u8]>) -> Self {
        v.map_or(SqlValue::Null, |b| SqlValue::Blob(b.to_vec()))
    }
}

impl From<Option<&str>> for SqlValue {
    fn from(v: Option<&str>) -> Self {
        v.map_or(SqlValue::Null, SqlValue::from)
    }
}

/// One result row
#[derive(Debug, Clone, Default)]
pub struct SqlRow(pub Vec<SqlValue>);

impl SqlRow {
    fn column(&self, idx: usize) -> Result<&SqlValue> {
        self.0
            .get(idx)
            .ok_or_else(|| VarStoreError::InvalidInput(format!("missing column {}", idx)))
    }

    pub fn text(&self, idx: usize) -> Result<String> {
        match self.column(idx)? {
            SqlValue::Text(s) => Ok(s.clone()),
            SqlValue::Blob(b) => Ok(String::from_utf8_lossy(b).into_owned()),
            other => Err(VarStoreError::InvalidInput(format!(
                "column {} is not text: {:?}",
                idx, other
            ))),
        }
    }

    pub fn opt_text(&self, idx: usize) -> Result<Option<String>> {
        match self.column(idx)? {
            SqlValue::Null => Ok(None),
            _ => self.text(idx).map(Some),
        }
    }

    pub fn opt_blob(&self, idx: usize) -> Result<Option<Vec<u8>>> {
        match self.column(idx)? {
            SqlValue::Null => Ok(None),
            SqlValue::Blob(b) => Ok(Some(b.clone())),
            SqlValue::Text(s) => Ok(Some(s.clone().into_bytes())),
            SqlValue::Integer(i) => Err(VarStoreError::InvalidInput(format!(
                "column {} is not a blob: {}",
                idx, i
            ))),
        }
    }

    pub fn integer(&self, idx: usize) -> Result<i64> {
        match self.column(idx)? {
            SqlValue::Integer(i) => Ok(*i),
            other => Err(VarStoreError::InvalidInput(format!(
                "column {} is not an integer: {:?}",
                idx, other
            ))),
        }
    }
}

/// An open physical connection
pub trait Driver: Send {
    /// Execute a statement, returning the number of affected rows
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run a query and collect every row
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>>;

    /// Start a write transaction (no-op for autocommit engines)
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    /// Commit the open transaction, if any
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether a transaction is currently open
    fn in_transaction(&self) -> bool {
        false
    }

    /// Drop and recreate prepared statements after a failure
    fn reset_statements(&mut self) -> Result<()>;

    /// Flush any write-ahead state into the main file
    fn checkpoint(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the physical connection
    fn close(self: Box<Self>) -> Result<()>;
}
