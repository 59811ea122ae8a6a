//! Turso/libSQL networked adapter
//!
//! Multiple running instances share one remote database. Statements run in
//! autocommit mode, so the commit loop has nothing to do; a keep-alive query
//! stops the far end from dropping an idle stream.

#![cfg(feature = "turso")]

use std::time::Duration;

use libsql::{Builder, Connection, Database};
use tokio::runtime::Runtime;

use crate::error::{Result, VarStoreError};

use super::backend::Connector;
use super::driver::{Driver, SqlRow, SqlValue};

/// Keep-alive cadence for idle remote connections
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Build the database URL from either an explicit URL or host/port/database
pub fn connection_url(
    url: Option<&str>,
    host: Option<&str>,
    port: Option<u16>,
    database: Option<&str>,
) -> Result<String> {
    if let Some(url) = url {
        return Ok(url.to_string());
    }

    let host = host.ok_or_else(|| {
        VarStoreError::Config("turso backend needs either 'url' or 'host'".to_string())
    })?;

    let scheme = if host.starts_with("localhost") || host.starts_with("127.") {
        "http"
    } else {
        "libsql"
    };

    let mut url = format!("{}://{}", scheme, host);
    if let Some(port) = port {
        url.push_str(&format!(":{}", port));
    }
    if let Some(database) = database {
        url.push('/');
        url.push_str(database);
    }
    Ok(url)
}

/// Connector for a remote libSQL database
#[derive(Debug, Clone)]
pub struct TursoConnector {
    url: String,
    auth_token: Option<String>,
}

impl TursoConnector {
    pub fn new(url: String, auth_token: Option<String>) -> Self {
        Self { url, auth_token }
    }
}

impl Connector for TursoConnector {
    fn engine(&self) -> &'static str {
        "turso"
    }

    fn connect(&self) -> Result<Box<dyn Driver>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let db = runtime.block_on(
            Builder::new_remote(
                self.url.clone(),
                self.auth_token.clone().unwrap_or_default(),
            )
            .build(),
        )?;
        let conn = db.connect()?;

        Ok(Box::new(TursoDriver {
            runtime,
            _db: db,
            conn,
        }))
    }

    fn requires_file(&self) -> bool {
        false
    }

    fn keep_alive_interval(&self) -> Option<Duration> {
        Some(KEEP_ALIVE_INTERVAL)
    }
}

/// An open remote connection, driven by a private single-thread runtime
pub struct TursoDriver {
    runtime: Runtime,
    _db: Database,
    conn: Connection,
}

fn to_libsql(params: &[SqlValue]) -> Vec<libsql::Value> {
    params
        .iter()
        .map(|p| match p {
            SqlValue::Null => libsql::Value::Null,
            SqlValue::Integer(i) => libsql::Value::Integer(*i),
            SqlValue::Text(s) => libsql::Value::Text(s.clone()),
            SqlValue::Blob(b) => libsql::Value::Blob(b.clone()),
        })
        .collect()
}

fn from_libsql(value: libsql::Value) -> SqlValue {
    match value {
        libsql::Value::Null => SqlValue::Null,
        libsql::Value::Integer(i) => SqlValue::Integer(i),
        libsql::Value::Real(f) => SqlValue::Text(f.to_string()),
        libsql::Value::Text(s) => SqlValue::Text(s),
        libsql::Value::Blob(b) => SqlValue::Blob(b),
    }
}

impl Driver for TursoDriver {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let params = to_libsql(params);
        let changed = self.runtime.block_on(self.conn.execute(sql, params))?;
        Ok(changed)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let params = to_libsql(params);
        let conn = &self.conn;
        self.runtime.block_on(async move {
            let mut rows = conn.query(sql, params).await?;
            let column_count = rows.column_count();
            let mut out = Vec::new();
            while let Some(row) = rows.next().await? {
                let mut values = Vec::with_capacity(column_count.max(0) as usize);
                for idx in 0..column_count {
                    values.push(from_libsql(row.get_value(idx)?));
                }
                out.push(SqlRow(values));
            }
            Ok::<_, VarStoreError>(out)
        })
    }

    fn reset_statements(&mut self) -> Result<()> {
        // Statements are not cached; check the stream instead
        self.runtime.block_on(self.conn.query("SELECT 1", ()))?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
