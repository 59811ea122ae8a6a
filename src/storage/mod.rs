//! Relational storage for variables
//!
//! Layers, leaves first: [`driver`] (physical connection), [`backend`]
//! (connectors for concrete engines), [`connection`] (state machine),
//! [`relational`] (schema and statements).

pub mod backend;
pub mod connection;
pub mod driver;
pub mod relational;
mod schema;
pub mod sqlite;
#[cfg(feature = "turso")]
pub mod turso;

pub use backend::{connector_for, Connector, SizeLimits};
pub use connection::{BackendConnection, ConnectionState};
pub use driver::{Driver, SqlRow, SqlValue};
pub use relational::{BackendOptions, RelationalBackend};
pub use sqlite::SqliteConnector;
#[cfg(feature = "turso")]
pub use turso::TursoConnector;
