//! Embedded SQLite adapter
//!
//! Single-file engine with WAL journaling. Several processes may share one
//! file; writes are grouped into transactions committed by the engine's
//! commit loop.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};

use crate::error::{Result, VarStoreError};

use super::backend::Connector;
use super::driver::{Driver, SqlRow, SqlValue};

/// Connector for a SQLite file (or an in-memory database in tests)
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: Option<PathBuf>,
}

impl SqliteConnector {
    /// Validate the backing file, creating it when absent
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                VarStoreError::Config(format!(
                    "database file '{}' must be readable and writable: {}",
                    path.display(),
                    e
                ))
            })?;

        Ok(Self { path: Some(path) })
    }

    /// Private in-memory database; its contents do not survive a reconnect
    pub fn in_memory() -> Self {
        Self { path: None }
    }
}

impl Connector for SqliteConnector {
    fn engine(&self) -> &'static str {
        "sqlite"
    }

    fn connect(&self) -> Result<Box<dyn Driver>> {
        let conn = match &self.path {
            Some(path) => {
                let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX;
                Connection::open_with_flags(path, flags)?
            }
            None => Connection::open_in_memory()?,
        };

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=30000;
            PRAGMA temp_store=MEMORY;
            "#,
        )?;

        Ok(Box::new(SqliteDriver { conn }))
    }

    fn backing_file(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn requires_file(&self) -> bool {
        true
    }
}

/// An open SQLite connection
pub struct SqliteDriver {
    conn: Connection,
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl Driver for SqliteDriver {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let changed = stmt.execute(params_from_iter(params.iter()))?;
        Ok(changed as u64)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let column_count = stmt.column_count();

        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            let mut values = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                values.push(match row.get_ref(idx)? {
                    ValueRef::Null => SqlValue::Null,
                    ValueRef::Integer(i) => SqlValue::Integer(i),
                    ValueRef::Real(f) => SqlValue::Text(f.to_string()),
                    ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
                    ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
                });
            }
            Ok(SqlRow(values))
        })?;

        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn begin(&mut self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn reset_statements(&mut self) -> Result<()> {
        self.conn.flush_prepared_statement_cache();
        // Touch the connection so a dead handle surfaces here rather than on the next write
        self.conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().map_err(|(_, e)| VarStoreError::Database(e))
    }
}
