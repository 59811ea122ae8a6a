//! Storage engine
//!
//! Backend-agnostic lifecycle of one configured storage: name routing, the
//! bounded write queue, and the writer, commit, monitor, keep-alive and
//! backup threads. `save` only enqueues; all backend I/O happens on the
//! engine's own threads, serialized by a single lock around the connection.
//!
//! Lifecycle:
//!
//! 1. [`StorageEngine::open`] validates the configuration, connects and
//!    ensures the schema exists.
//! 2. [`StorageEngine::bulk_load`] reads every live row and sets the polling
//!    watermark.
//! 3. [`StorageEngine::start_writer`] starts draining the queue.
//! 4. [`StorageEngine::start_background`] starts commit, monitor, keep-alive
//!    and backup threads. A [`StorageSet`] only does this once every storage
//!    has finished step 2.
//! 5. [`StorageEngine::close`] drains the queue, stops every thread, commits
//!    and disconnects.

mod backup;
mod queue;
mod set;
mod workers;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{Result, VarStoreError};
use crate::registry::VariableSink;
use crate::storage::{connector_for, BackendOptions, ConnectionState, Connector, RelationalBackend};
use crate::types::{NamePattern, SerializedRecord};

pub use backup::{backup_dir, list_backups, rotate_backups, BACKUP_DIR};
pub use queue::{RateLimiter, WriteQueue, ERROR_INTERVAL, WARNING_INTERVAL};
pub use set::StorageSet;
pub use workers::{Shutdown, PURGE_INTERVAL_FACTOR};

/// State shared between an engine and its threads
pub(crate) struct EngineInner {
    pub(crate) name: String,
    pub(crate) config: StorageConfig,
    pub(crate) pattern: NamePattern,
    pub(crate) queue: WriteQueue,
    pub(crate) backend: Mutex<RelationalBackend>,
    pub(crate) closed: AtomicBool,
    pub(crate) shutdown: Shutdown,
    /// Highest peer rowid seen; 0 = none
    pub(crate) watermark: AtomicI64,
    /// Held for a whole poll so concurrent polls never import a row twice
    pub(crate) poll_lock: Mutex<()>,
    /// Shared by every path that persists, so a dead connection is reported once per interval
    pub(crate) dead_connection: RateLimiter,
    writer_guid: String,
}

/// One configured storage and its background threads
pub struct StorageEngine {
    inner: Arc<EngineInner>,
    writer: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl StorageEngine {
    /// Validate the configuration, connect and create the schema
    pub fn open(config: StorageConfig) -> Result<Self> {
        let connector = connector_for(&config)?;
        Self::open_with_connector(config, connector)
    }

    /// Like [`StorageEngine::open`], with an explicit connector instead of the
    /// one named by the configuration's backend block
    pub fn open_with_connector(config: StorageConfig, connector: Box<dyn Connector>) -> Result<Self> {
        let pattern = config.validate()?;

        if connector.requires_file() && connector.backing_file().is_none() {
            return Err(VarStoreError::Config(format!(
                "storage '{}': the {} backend requires a file",
                config.name,
                connector.engine()
            )));
        }

        let writer_guid = Uuid::new_v4().to_string();
        let backend = RelationalBackend::open(
            BackendOptions {
                storage: config.name.clone(),
                table: config.table.clone(),
                writer_guid: writer_guid.clone(),
                keep_tombstones: config.monitor_changes,
            },
            connector,
        )?;

        tracing::info!(
            storage = %config.name,
            engine = config.backend.engine(),
            table = %config.table,
            pattern = pattern.as_str().unwrap_or("<all>"),
            "Opened storage"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                name: config.name.clone(),
                queue: WriteQueue::new(config.name.clone(), config.queue_capacity),
                config,
                pattern,
                backend: Mutex::new(backend),
                closed: AtomicBool::new(false),
                shutdown: Shutdown::new(),
                watermark: AtomicI64::new(0),
                poll_lock: Mutex::new(()),
                dead_connection: RateLimiter::new(ERROR_INTERVAL),
                writer_guid,
            }),
            writer: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Open a single storage, load it into `sink` and start every thread
    pub fn load(config: StorageConfig, sink: Arc<dyn VariableSink>) -> Result<Self> {
        let engine = Self::open(config)?;
        for record in engine.bulk_load()? {
            sink.variable_loaded(&record.name, record.value.as_ref(), engine.name());
        }
        engine.start_writer()?;
        engine.start_background(sink)?;
        Ok(engine)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// GUID stamped on every row this instance writes
    pub fn writer_guid(&self) -> &str {
        &self.inner.writer_guid
    }

    /// Whether this storage is responsible for `name`
    pub fn accept(&self, name: &str) -> bool {
        self.inner.pattern.matches(name)
    }

    /// Every live variable, oldest first
    ///
    /// Tombstones are skipped but still advance the watermark, so polling
    /// only returns rows written after this load.
    pub fn bulk_load(&self) -> Result<Vec<SerializedRecord>> {
        let rows = self.inner.backend.lock().load_all()?;

        let highest = rows.iter().map(|r| r.row_id).max().unwrap_or(0);
        self.inner.watermark.fetch_max(highest, Ordering::SeqCst);

        let records: Vec<SerializedRecord> = rows
            .into_iter()
            .filter(|r| !r.is_tombstone())
            .map(|r| r.into_record())
            .collect();

        tracing::info!(
            storage = %self.inner.name,
            "Loaded {} variables",
            records.len()
        );
        Ok(records)
    }

    /// Start the thread that drains the write queue
    pub fn start_writer(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return Ok(());
        }

        let inner = self.inner.clone();
        *writer = Some(
            thread::Builder::new()
                .name(format!("varstore-{}-writer", self.inner.name))
                .spawn(move || workers::run_writer(inner))?,
        );
        Ok(())
    }

    /// Start the commit thread and, as configured, the monitor, keep-alive
    /// and backup threads
    pub fn start_background(&self, sink: Arc<dyn VariableSink>) -> Result<()> {
        let mut handles = self.workers.lock();
        if !handles.is_empty() {
            return Ok(());
        }

        let name = &self.inner.name;
        let (backing_file, keep_alive) = {
            let backend = self.inner.backend.lock();
            (
                backend.backing_file().map(PathBuf::from),
                backend.keep_alive_interval(),
            )
        };

        let inner = self.inner.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("varstore-{}-commit", name))
                .spawn(move || workers::run_committer(inner))?,
        );

        if self.inner.config.monitor_changes {
            let inner = self.inner.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("varstore-{}-monitor", name))
                    .spawn(move || workers::run_monitor(inner, sink))?,
            );
        }

        if let Some(interval) = keep_alive {
            let inner = self.inner.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("varstore-{}-keepalive", name))
                    .spawn(move || workers::run_keep_alive(inner, interval))?,
            );
        }

        if let Some(interval) = self.inner.config.backup_interval() {
            if backing_file.is_some() {
                let inner = self.inner.clone();
                handles.push(
                    thread::Builder::new()
                        .name(format!("varstore-{}-backup", name))
                        .spawn(move || workers::run_backups(inner, interval))?,
                );
            } else {
                tracing::warn!(
                    storage = %name,
                    "Backups are configured but the {} backend has no file to back up",
                    self.inner.config.backend.engine()
                );
            }
        }

        Ok(())
    }

    /// Queue a record for persistence
    ///
    /// Returns immediately unless the queue is full, in which case the caller
    /// blocks until the writer catches up. Returns false (and logs) only when
    /// the engine has been closed and the record was not accepted. This
    /// includes a caller still blocked on a full queue when [`close`] runs:
    /// its record is dropped, while everything accepted before is persisted.
    ///
    /// [`close`]: StorageEngine::close
    pub fn save(&self, record: SerializedRecord) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            tracing::error!(
                storage = %self.inner.name,
                variable = %record.name,
                "Storage is closed, variable change was not saved"
            );
            return false;
        }

        match self.inner.queue.push(record) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(storage = %self.inner.name, "Variable change was not saved: {}", e);
                false
            }
        }
    }

    /// Records waiting for the writer thread
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Highest row written by another instance that has been imported
    pub fn watermark(&self) -> Option<i64> {
        let watermark = self.inner.watermark.load(Ordering::SeqCst);
        (watermark > 0).then_some(watermark)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.backend.lock().state()
    }

    pub fn backing_file(&self) -> Option<PathBuf> {
        self.inner.backend.lock().backing_file().map(PathBuf::from)
    }

    /// Poll once for changes from other instances, outside the monitor cadence
    pub fn poll_now(&self, sink: &dyn VariableSink) -> Result<usize> {
        if self.is_closed() {
            return Err(VarStoreError::Closed(self.inner.name.clone()));
        }
        workers::poll_once(&self.inner, sink)
    }

    /// Take a backup right now and apply rotation
    pub fn backup_now(&self) -> Result<PathBuf> {
        if self.is_closed() {
            return Err(VarStoreError::Closed(self.inner.name.clone()));
        }
        backup::run_backup(&self.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting writes, persist everything already queued, stop every
    /// thread, then commit and disconnect
    ///
    /// Blocks until the queue is drained. Calling it again is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.queue.close();
        match self.writer.lock().take() {
            Some(writer) => {
                if writer.join().is_err() {
                    tracing::error!(storage = %self.inner.name, "Writer thread panicked");
                }
            }
            None => {
                // Never started: drain on the caller's thread instead
                let receiver = self.inner.queue.receiver();
                while let Ok(record) = receiver.try_recv() {
                    workers::persist_record(&self.inner, &record);
                }
            }
        }

        self.inner.shutdown.trigger();
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                tracing::error!(storage = %self.inner.name, "Background thread panicked");
            }
        }

        let mut backend = self.inner.backend.lock();
        if let Err(e) = backend.commit() {
            if !e.is_terminal() {
                tracing::error!(storage = %self.inner.name, "Final commit failed: {}", e);
            }
        }
        if let Err(e) = backend.disconnect() {
            tracing::warn!(storage = %self.inner.name, "Error while disconnecting: {}", e);
        }

        tracing::info!(storage = %self.inner.name, "Storage closed");
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::types::SerializedValue;
    use tempfile::tempdir;

    #[test]
    fn test_accept_uses_pattern() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::sqlite("players", dir.path().join("p.db").to_string_lossy())
            .with_pattern("player::.*");
        let engine = StorageEngine::open(config).unwrap();
        assert!(engine.accept("player::steve"));
        assert!(!engine.accept("global"));
    }

    #[test]
    fn test_writer_guid_is_per_instance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.db").to_string_lossy().into_owned();
        let a = StorageEngine::open(StorageConfig::sqlite("a", path.clone())).unwrap();
        let b = StorageEngine::open(StorageConfig::sqlite("b", path)).unwrap();
        assert_ne!(a.writer_guid(), b.writer_guid());
        assert_eq!(a.writer_guid().len(), 36);
    }

    #[test]
    fn test_close_without_writer_still_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.db").to_string_lossy().into_owned();

        let engine = StorageEngine::open(StorageConfig::sqlite("s", path.clone())).unwrap();
        assert!(engine.save(SerializedRecord::value(
            "a",
            SerializedValue::new("int", vec![1])
        )));
        engine.close();
        assert!(engine.is_closed());
        assert!(!engine.save(SerializedRecord::tombstone("a")));

        let registry = Arc::new(MemoryRegistry::new());
        let engine = StorageEngine::load(StorageConfig::sqlite("s", path), registry.clone()).unwrap();
        assert_eq!(registry.get("a"), Some(SerializedValue::new("int", vec![1])));
        engine.close();
    }

    #[test]
    fn test_bulk_load_sets_watermark() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.db").to_string_lossy().into_owned();

        let engine = StorageEngine::open(StorageConfig::sqlite("s", path.clone())).unwrap();
        assert_eq!(engine.bulk_load().unwrap().len(), 0);
        assert_eq!(engine.watermark(), None);
        engine.save(SerializedRecord::value("a", SerializedValue::new("int", vec![1])));
        engine.close();

        let engine = StorageEngine::open(StorageConfig::sqlite("s", path)).unwrap();
        assert_eq!(engine.bulk_load().unwrap().len(), 1);
        assert_eq!(engine.watermark(), Some(1));
    }

    #[test]
    fn test_invalid_config_fails_open() {
        let mut config = StorageConfig::sqlite("bad", "unused.db");
        config.pattern = Some("(".to_string());
        assert!(StorageEngine::open(config).unwrap_err().is_config());
    }
}
