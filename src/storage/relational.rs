//! Relational storage backend
//!
//! Turns the engine's persist / load / poll / purge operations into SQL
//! against one table per storage:
//!
//! ```text
//! rowid (autoincrement) | name (unique) | type | value (blob, NULL = tombstone) | writer_guid
//! ```
//!
//! Upserts go through `INSERT OR REPLACE`, which deletes the old row and
//! inserts a fresh one, so every change to a variable receives a new, higher
//! `rowid`. Pollers in other instances use that as their watermark.

use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::types::{PersistedRow, SerializedRecord};

use super::backend::{Connector, SizeLimits};
use super::connection::{BackendConnection, ConnectionState};
use super::driver::{SqlRow, SqlValue};
use super::schema::ensure_schema;

/// SQL text for one table
#[derive(Debug, Clone)]
struct Statements {
    upsert: String,
    tombstone: String,
    delete: String,
    load_all: String,
    poll: String,
    purge: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            upsert: format!(
                "INSERT OR REPLACE INTO {} (name, type, value, writer_guid) VALUES (?1, ?2, ?3, ?4)",
                table
            ),
            tombstone: format!(
                "INSERT OR REPLACE INTO {} (name, type, value, writer_guid) VALUES (?1, NULL, NULL, ?2)",
                table
            ),
            delete: format!("DELETE FROM {} WHERE name = ?1", table),
            load_all: format!("SELECT name, type, value, rowid FROM {} ORDER BY rowid", table),
            poll: format!(
                "SELECT name, type, value, rowid FROM {} WHERE rowid > ?1 AND writer_guid != ?2 ORDER BY rowid",
                table
            ),
            purge: format!("DELETE FROM {} WHERE value IS NULL AND rowid < ?1", table),
        }
    }
}

/// Options fixed when the backend is opened
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Storage name, for logs
    pub storage: String,
    pub table: String,
    /// GUID stamped on every row this instance writes
    pub writer_guid: String,
    /// Store deletions as NULL rows so polling peers can observe them
    pub keep_tombstones: bool,
}

/// SQL backend over one physical connection
pub struct RelationalBackend {
    options: BackendOptions,
    limits: SizeLimits,
    conn: BackendConnection,
    sql: Statements,
}

impl RelationalBackend {
    /// Connect and make sure the table exists
    pub fn open(options: BackendOptions, connector: Box<dyn Connector>) -> Result<Self> {
        let limits = connector.limits();
        let mut conn = BackendConnection::new(options.storage.clone(), connector);
        conn.connect()?;
        ensure_schema(conn.driver()?, &options.table, limits)?;

        Ok(Self {
            sql: Statements::for_table(&options.table),
            options,
            limits,
            conn,
        })
    }

    pub fn writer_guid(&self) -> &str {
        &self.options.writer_guid
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn backing_file(&self) -> Option<&Path> {
        self.conn.connector().backing_file()
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.conn.connector().keep_alive_interval()
    }

    /// Write one record: upsert for values, delete (or NULL row) for tombstones
    ///
    /// Oversized records are still written, with a warning. On failure the
    /// connection's statements are recreated so the next write starts clean;
    /// the failed record itself is not retried.
    pub fn persist(&mut self, record: &SerializedRecord) -> Result<()> {
        // A failed connection has nothing left to recover
        self.conn.driver()?;
        self.warn_if_oversized(record);

        let result = self.write(record);
        if let Err(e) = &result {
            tracing::warn!(
                storage = %self.options.storage,
                variable = %record.name,
                "Failed to save variable: {}",
                e
            );
            if let Err(recover_err) = self.conn.recover() {
                tracing::error!(
                    storage = %self.options.storage,
                    "Could not recover connection: {}",
                    recover_err
                );
            }
        }
        result
    }

    fn write(&mut self, record: &SerializedRecord) -> Result<()> {
        let driver = self.conn.driver()?;
        driver.begin()?;

        match &record.value {
            Some(value) => {
                driver.execute(
                    &self.sql.upsert,
                    &[
                        SqlValue::from(record.name.as_str()),
                        SqlValue::from(value.type_tag.as_str()),
                        SqlValue::Blob(value.payload.clone()),
                        SqlValue::from(self.options.writer_guid.as_str()),
                    ],
                )?;
            }
            None if self.options.keep_tombstones => {
                driver.execute(
                    &self.sql.tombstone,
                    &[
                        SqlValue::from(record.name.as_str()),
                        SqlValue::from(self.options.writer_guid.as_str()),
                    ],
                )?;
            }
            None => {
                driver.execute(&self.sql.delete, &[SqlValue::from(record.name.as_str())])?;
            }
        }
        Ok(())
    }

    fn warn_if_oversized(&self, record: &SerializedRecord) {
        let name_len = record.name.chars().count();
        if name_len > self.limits.max_name_length {
            tracing::warn!(
                storage = %self.options.storage,
                variable = %record.name,
                "Variable name is {} characters long, the maximum is {}. \
                 The variable may be truncated and NOT RETRIEVABLE under the same name after a restart",
                name_len,
                self.limits.max_name_length
            );
        }

        if let Some(value) = &record.value {
            let type_len = value.type_tag.chars().count();
            if type_len > self.limits.max_type_length {
                tracing::warn!(
                    storage = %self.options.storage,
                    variable = %record.name,
                    "Type tag '{}' exceeds {} characters, the value may not load after a restart",
                    value.type_tag,
                    self.limits.max_type_length
                );
            }
            if value.payload.len() > self.limits.max_value_size {
                tracing::warn!(
                    storage = %self.options.storage,
                    variable = %record.name,
                    "Value is {} bytes, the maximum is {}. The value may be LOST after a restart",
                    value.payload.len(),
                    self.limits.max_value_size
                );
            }
        }
    }

    /// Every row, oldest first, tombstones included
    pub fn load_all(&mut self) -> Result<Vec<PersistedRow>> {
        let rows = self.conn.driver()?.query(&self.sql.load_all, &[])?;
        rows.iter().map(parse_row).collect()
    }

    /// Rows written by other instances after `watermark`
    ///
    /// Commits first: inside an open transaction the connection would keep
    /// reading the snapshot it started with.
    pub fn poll(&mut self, watermark: i64) -> Result<Vec<PersistedRow>> {
        let driver = self.conn.driver()?;
        driver.commit()?;
        let rows = driver.query(
            &self.sql.poll,
            &[
                SqlValue::Integer(watermark),
                SqlValue::from(self.options.writer_guid.as_str()),
            ],
        )?;
        rows.iter().map(parse_row).collect()
    }

    /// Physically delete tombstones older than `before`
    pub fn purge_tombstones(&mut self, before: i64) -> Result<u64> {
        let driver = self.conn.driver()?;
        driver.begin()?;
        driver.execute(&self.sql.purge, &[SqlValue::Integer(before)])
    }

    /// Make every write since the last commit durable
    pub fn commit(&mut self) -> Result<()> {
        self.conn.driver()?.commit()
    }

    /// Cheap round trip so idle remote connections stay open
    pub fn keep_alive(&mut self) -> Result<()> {
        self.conn.driver()?.query("SELECT 1", &[])?;
        Ok(())
    }

    /// Commit, checkpoint and close the connection (backups, shutdown)
    pub fn disconnect(&mut self) -> Result<()> {
        if self.conn.state() == ConnectionState::Connected {
            let driver = self.conn.driver()?;
            driver.commit()?;
            driver.checkpoint()?;
        }
        self.conn.disconnect()
    }

    pub fn reconnect(&mut self) -> Result<()> {
        self.conn.reconnect()
    }
}

fn parse_row(row: &SqlRow) -> Result<PersistedRow> {
    Ok(PersistedRow {
        name: row.text(0)?,
        type_tag: row.opt_text(1)?,
        payload: row.opt_blob(2)?,
        row_id: row.integer(3)?,
    })
}
