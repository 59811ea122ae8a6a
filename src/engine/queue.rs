//! Bounded write queue with backpressure
//!
//! Many producers (script threads calling `save`) and one consumer (the
//! writer thread). A full queue blocks the producer instead of dropping the
//! record: stalling a script is recoverable, a lost variable is not.

use std::time::{Duration, Instant};

use async_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::error::{Result, VarStoreError};
use crate::types::SerializedRecord;

/// Minimum delay between "falling behind" warnings
pub const WARNING_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum delay between "queue full" errors
pub const ERROR_INTERVAL: Duration = Duration::from_secs(30);

/// Emits at most once per interval
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// True if the caller may emit now; records the emission
    pub fn ready(&self) -> bool {
        let mut last = self.last.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// FIFO queue of records waiting for the writer thread
pub struct WriteQueue {
    storage: String,
    sender: Sender<SerializedRecord>,
    receiver: Receiver<SerializedRecord>,
    warning_threshold: usize,
    warnings: RateLimiter,
    errors: RateLimiter,
}

impl WriteQueue {
    pub fn new(storage: impl Into<String>, capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            storage: storage.into(),
            sender,
            receiver,
            warning_threshold: (capacity * 3 / 10).max(1),
            warnings: RateLimiter::new(WARNING_INTERVAL),
            errors: RateLimiter::new(ERROR_INTERVAL),
        }
    }

    /// Enqueue a record, blocking while the queue is full
    pub fn push(&self, record: SerializedRecord) -> Result<()> {
        let len = self.sender.len();
        if len > self.warning_threshold && self.warnings.ready() {
            tracing::warn!(
                storage = %self.storage,
                queued = len,
                "Cannot write variables to the database fast enough, saving is falling behind"
            );
        }

        match self.sender.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(record)) => {
                if self.errors.ready() {
                    tracing::error!(
                        storage = %self.storage,
                        capacity = self.capacity(),
                        "Write queue is full, callers are blocked until the database catches up"
                    );
                }
                self.sender
                    .send_blocking(record)
                    .map_err(|_| VarStoreError::Closed(self.storage.clone()))
            }
            Err(TrySendError::Closed(_)) => Err(VarStoreError::Closed(self.storage.clone())),
        }
    }

    /// Consumer side, for the writer thread
    pub fn receiver(&self) -> Receiver<SerializedRecord> {
        self.receiver.clone()
    }

    /// Refuse new records; queued ones can still be received
    pub fn close(&self) -> bool {
        self.sender.close()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity().unwrap_or(usize::MAX)
    }
}
