//! Background loops of a storage engine
//!
//! Every loop takes the backend lock only for the duration of one backend
//! call, so the writer, committer, monitor and backup loops interleave on
//! the shared connection without holding it across sleeps.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::backup;
use super::queue::{RateLimiter, WARNING_INTERVAL};
use super::EngineInner;
use crate::error::Result;
use crate::registry::VariableSink;
use crate::types::SerializedRecord;

/// Tombstones are purged once every this many monitor cycles
pub const PURGE_INTERVAL_FACTOR: u32 = 10;

/// Interruptible sleep shared by all loops of one engine
#[derive(Debug, Default)]
pub struct Shutdown {
    stopped: Mutex<bool>,
    signal: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `timeout`; returns true once shutdown has been requested
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.signal.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }

    pub fn trigger(&self) {
        *self.stopped.lock() = true;
        self.signal.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.lock()
    }
}

/// Drain the queue into the backend until it is closed and empty
pub(crate) fn run_writer(inner: Arc<EngineInner>) {
    let receiver = inner.queue.receiver();

    while let Ok(record) = receiver.recv_blocking() {
        persist_record(&inner, &record);
    }

    tracing::debug!(storage = %inner.name, "Writer thread stopped");
}

/// Persist one dequeued record; transient failures are already logged by the backend
pub(crate) fn persist_record(inner: &EngineInner, record: &SerializedRecord) {
    let result = inner.backend.lock().persist(record);
    match result {
        Err(e) if e.is_terminal() && inner.dead_connection.ready() => {
            tracing::error!(
                storage = %inner.name,
                "Storage connection is dead, variables are NOT being saved: {}",
                e
            );
        }
        _ => {}
    }
}

/// Commit the running transaction at a fixed cadence
pub(crate) fn run_committer(inner: Arc<EngineInner>) {
    let interval = inner.config.commit_interval();

    while !inner.shutdown.wait(interval) {
        if let Err(e) = inner.backend.lock().commit() {
            if !e.is_terminal() {
                tracing::warn!(storage = %inner.name, "Commit failed: {}", e);
            }
        }
    }

    tracing::debug!(storage = %inner.name, "Commit thread stopped");
}

/// Import rows written by other instances, then advance the watermark
///
/// Returns the number of imported rows.
pub(crate) fn poll_once(inner: &EngineInner, sink: &dyn VariableSink) -> Result<usize> {
    let _polling = inner.poll_lock.lock();
    let watermark = inner.watermark.load(Ordering::SeqCst);
    let rows = inner.backend.lock().poll(watermark)?;

    let count = rows.len();
    let mut highest = watermark;
    for row in rows {
        highest = highest.max(row.row_id);
        let record = row.into_record();
        sink.variable_loaded(&record.name, record.value.as_ref(), &inner.name);
    }

    inner.watermark.fetch_max(highest, Ordering::SeqCst);
    Ok(count)
}

/// Poll for peer changes and purge tombstones every peer has had time to see
pub(crate) fn run_monitor(inner: Arc<EngineInner>, sink: Arc<dyn VariableSink>) {
    let interval = inner.config.monitor_interval();
    let purge_every = interval * PURGE_INTERVAL_FACTOR;
    let slow = RateLimiter::new(WARNING_INTERVAL);
    let mut last_purge = Instant::now();
    // Watermark as of the previous purge; only tombstones below it are removed
    let mut purge_mark: Option<i64> = None;

    tracing::info!(
        storage = %inner.name,
        "Monitoring changes every {}ms",
        interval.as_millis()
    );

    while !inner.shutdown.wait(interval) {
        let started = Instant::now();

        match poll_once(&inner, sink.as_ref()) {
            Ok(0) => {}
            Ok(count) => {
                tracing::debug!(storage = %inner.name, "Imported {} changed variables", count);
            }
            Err(e) if e.is_terminal() => {}
            Err(e) => {
                tracing::warn!(storage = %inner.name, "Polling for changes failed: {}", e);
            }
        }

        if last_purge.elapsed() >= purge_every {
            if let Some(mark) = purge_mark {
                match inner.backend.lock().purge_tombstones(mark) {
                    Ok(0) => {}
                    Ok(purged) => {
                        tracing::debug!(storage = %inner.name, "Purged {} tombstones", purged);
                    }
                    Err(e) => {
                        tracing::warn!(storage = %inner.name, "Tombstone purge failed: {}", e);
                    }
                }
            }
            let current = inner.watermark.load(Ordering::SeqCst);
            purge_mark = (current > 0).then_some(current);
            last_purge = Instant::now();
        }

        let took = started.elapsed();
        if took > interval && slow.ready() {
            tracing::warn!(
                storage = %inner.name,
                "Polling took {}ms, longer than the {}ms monitor interval. \
                 Increase the interval or reduce how often variables change",
                took.as_millis(),
                interval.as_millis()
            );
        }
    }

    tracing::debug!(storage = %inner.name, "Monitor thread stopped");
}

/// Ping the connection so the far end does not close it while idle
pub(crate) fn run_keep_alive(inner: Arc<EngineInner>, interval: Duration) {
    while !inner.shutdown.wait(interval) {
        if let Err(e) = inner.backend.lock().keep_alive() {
            if !e.is_terminal() {
                tracing::warn!(storage = %inner.name, "Keep-alive query failed: {}", e);
            }
        }
    }
}

/// Take a backup every `interval`
pub(crate) fn run_backups(inner: Arc<EngineInner>, interval: Duration) {
    tracing::info!(
        storage = %inner.name,
        "Automatic backups every {}s",
        interval.as_secs()
    );

    while !inner.shutdown.wait(interval) {
        match backup::run_backup(&inner) {
            Ok(path) => {
                tracing::info!(storage = %inner.name, "Created backup {}", path.display());
            }
            Err(e) => {
                tracing::error!(storage = %inner.name, "Backup failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_shutdown_wait_times_out() {
        let shutdown = Shutdown::new();
        let started = Instant::now();
        assert!(!shutdown.wait(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_shutdown_interrupts_sleep() {
        let shutdown = Arc::new(Shutdown::new());
        let sleeper = {
            let shutdown = shutdown.clone();
            thread::spawn(move || shutdown.wait(Duration::from_secs(60)))
        };

        thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        assert!(sleeper.join().unwrap());
        assert!(shutdown.is_triggered());
        assert!(shutdown.wait(Duration::from_secs(60)));
    }
}
