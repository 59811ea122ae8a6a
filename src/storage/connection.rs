//! Backend connection state machine
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED -> (RECONNECTING on failure) -> CONNECTED | FAILED
//! ```
//!
//! `Failed` is terminal: it is only reached when a reconnect attempt itself
//! fails, and every later operation on the connection is refused until the
//! process restarts.

use crate::error::{Result, VarStoreError};

use super::backend::Connector;
use super::driver::Driver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// A physical connection owned by exactly one storage engine
pub struct BackendConnection {
    storage: String,
    connector: Box<dyn Connector>,
    driver: Option<Box<dyn Driver>>,
    state: ConnectionState,
}

impl BackendConnection {
    pub fn new(storage: impl Into<String>, connector: Box<dyn Connector>) -> Self {
        Self {
            storage: storage.into(),
            connector,
            driver: None,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    /// Open the physical connection
    pub fn connect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Failed => return Err(self.failed_error()),
            _ => {}
        }

        self.state = ConnectionState::Connecting;
        match self.connector.connect() {
            Ok(driver) => {
                self.driver = Some(driver);
                self.state = ConnectionState::Connected;
                tracing::debug!(storage = %self.storage, engine = self.connector.engine(), "Connected");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Close the physical connection; a failed connection stays failed
    pub fn disconnect(&mut self) -> Result<()> {
        let result = match self.driver.take() {
            Some(driver) => driver.close(),
            None => Ok(()),
        };
        if self.state != ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
        result
    }

    /// Drop the current connection and open a fresh one
    ///
    /// A failure here is terminal for this connection.
    pub fn reconnect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Failed {
            return Err(self.failed_error());
        }

        self.state = ConnectionState::Reconnecting;
        if let Some(mut driver) = self.driver.take() {
            // Closing with an open transaction would roll back writes that already succeeded
            if driver.in_transaction() {
                if let Err(e) = driver.commit() {
                    tracing::error!(
                        storage = %self.storage,
                        "Could not commit pending writes before reconnecting, they may be lost: {}",
                        e
                    );
                }
            }
            if let Err(e) = driver.close() {
                tracing::debug!(storage = %self.storage, "Error closing stale connection: {}", e);
            }
        }

        match self.connector.connect() {
            Ok(driver) => {
                self.driver = Some(driver);
                self.state = ConnectionState::Connected;
                tracing::info!(storage = %self.storage, "Reconnected");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Failed;
                tracing::error!(
                    storage = %self.storage,
                    "Reconnect failed, variables for this storage are NO LONGER BEING SAVED until restart: {}",
                    e
                );
                Err(VarStoreError::Connection(format!(
                    "storage '{}' failed to reconnect: {}",
                    self.storage, e
                )))
            }
        }
    }

    /// Recreate prepared statements after a failed operation, reconnecting
    /// when the connection itself is broken
    pub fn recover(&mut self) -> Result<()> {
        let reset = match self.driver.as_deref_mut() {
            Some(driver) => driver.reset_statements(),
            None => Err(VarStoreError::Connection("not connected".to_string())),
        };

        match reset {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(storage = %self.storage, "Connection unusable, reconnecting: {}", e);
                self.reconnect()
            }
        }
    }

    /// The open driver, or an error when not connected
    pub fn driver(&mut self) -> Result<&mut dyn Driver> {
        if self.state == ConnectionState::Failed {
            return Err(self.failed_error());
        }
        match self.driver.as_deref_mut() {
            Some(driver) => Ok(driver),
            None => Err(VarStoreError::Connection(format!(
                "storage '{}' is not connected",
                self.storage
            ))),
        }
    }

    fn failed_error(&self) -> VarStoreError {
        VarStoreError::Connection(format!(
            "storage '{}' connection has failed permanently",
            self.storage
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteConnector;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Opens in-memory connections until `allowed` is exhausted
    struct FlakyConnector {
        allowed: Arc<AtomicUsize>,
    }

    impl Connector for FlakyConnector {
        fn engine(&self) -> &'static str {
            "flaky"
        }

        fn connect(&self) -> Result<Box<dyn Driver>> {
            let left = self.allowed.load(Ordering::SeqCst);
            if left == 0 {
                return Err(VarStoreError::Connection("refused".to_string()));
            }
            self.allowed.store(left - 1, Ordering::SeqCst);
            SqliteConnector::in_memory().connect()
        }

        fn requires_file(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_connect_disconnect_cycle() {
        let mut conn = BackendConnection::new("test", Box::new(SqliteConnector::in_memory()));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.driver().is_err());

        conn.connect().unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.driver().unwrap().query("SELECT 1", &[]).unwrap().len(), 1);

        conn.disconnect().unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_failed_reconnect_is_terminal() {
        let allowed = Arc::new(AtomicUsize::new(1));
        let mut conn = BackendConnection::new(
            "flaky",
            Box::new(FlakyConnector {
                allowed: allowed.clone(),
            }),
        );
        conn.connect().unwrap();

        assert!(conn.reconnect().is_err());
        assert_eq!(conn.state(), ConnectionState::Failed);

        // Even once the far end comes back, the connection stays dead
        allowed.store(5, Ordering::SeqCst);
        assert!(conn.driver().is_err());
        assert!(conn.connect().is_err());
        assert!(conn.reconnect().is_err());
    }

    #[test]
    fn test_recover_keeps_healthy_connection() {
        let mut conn = BackendConnection::new("test", Box::new(SqliteConnector::in_memory()));
        conn.connect().unwrap();
        conn.recover().unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }
}
