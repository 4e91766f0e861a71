//! Shared store implementations.
//!
//! The shared store is the only resource genuinely shared across contexts: a
//! persistent record readable and writable by everyone, emitting best-effort,
//! at-least-once change notices with no payload diff and no latency bound.
//! Writes are optimistic: `compare_and_put` rejects a write whose expected
//! base revision no longer matches, and callers re-read, merge, and retry.

use crate::error::StoreError;
use crate::persist::record::PersistedRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use sled::Db;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// "Something changed" notice delivered to every context after a successful
/// write. Carries no state beyond the write id and a revision hint;
/// receivers re-read the record before reconciling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNotice {
    pub write_id: String,
    pub revision: u64,
}

/// Persistent multi-writer record store with change notices.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read the current record. An empty store reads as the default record
    /// at revision zero.
    async fn read(&self) -> Result<PersistedRecord, StoreError>;

    /// Commit `record` iff the stored revision still equals
    /// `expected_revision`. Fails with `RevisionMismatch` otherwise.
    async fn compare_and_put(
        &self,
        expected_revision: u64,
        record: PersistedRecord,
    ) -> Result<(), StoreError>;

    /// Subscribe to change notices.
    fn subscribe(&self) -> broadcast::Receiver<StoreNotice>;
}

const NOTICE_CAPACITY: usize = 64;

/// In-memory shared store for tests and simulation.
///
/// Supports injecting notification latency and duplicate redelivery, the two
/// store behaviors the engine must tolerate.
pub struct MemorySharedStore {
    record: Mutex<PersistedRecord>,
    notices: broadcast::Sender<StoreNotice>,
    latency: Mutex<Duration>,
    redeliver: AtomicBool,
}

impl Default for MemorySharedStore {
    fn default() -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            record: Mutex::new(PersistedRecord::default()),
            notices,
            latency: Mutex::new(Duration::ZERO),
            redeliver: AtomicBool::new(false),
        }
    }
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay notices by `latency` to model the store's 100ms–3000ms window.
    pub fn set_notice_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Deliver every notice twice, modeling at-least-once redelivery.
    pub fn set_redeliver(&self, redeliver: bool) {
        self.redeliver.store(redeliver, Ordering::Relaxed);
    }

    fn announce(&self, notice: StoreNotice) {
        let latency = *self.latency.lock();
        let copies = if self.redeliver.load(Ordering::Relaxed) {
            2
        } else {
            1
        };
        if latency.is_zero() {
            for _ in 0..copies {
                let _ = self.notices.send(notice.clone());
            }
        } else {
            let sender = self.notices.clone();
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                for _ in 0..copies {
                    let _ = sender.send(notice.clone());
                }
            });
        }
    }
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn read(&self) -> Result<PersistedRecord, StoreError> {
        Ok(self.record.lock().clone())
    }

    async fn compare_and_put(
        &self,
        expected_revision: u64,
        record: PersistedRecord,
    ) -> Result<(), StoreError> {
        let notice = {
            let mut stored = self.record.lock();
            if stored.revision != expected_revision {
                return Err(StoreError::RevisionMismatch {
                    expected: expected_revision,
                    actual: stored.revision,
                });
            }
            let notice = StoreNotice {
                write_id: record.write_id.clone(),
                revision: record.revision,
            };
            *stored = record;
            notice
        };
        self.announce(notice);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreNotice> {
        self.notices.subscribe()
    }
}

const RECORD_KEY: &[u8] = b"record";

/// Durable sled-backed shared store.
///
/// The record is stored as JSON bytes under a single key to keep the
/// forward-compatible record shape intact on disk. Writes are serialized
/// through an in-process lock; cross-context concurrency is resolved by the
/// revision check, not by the lock.
pub struct SledSharedStore {
    db: Db,
    write_lock: Mutex<()>,
    notices: broadcast::Sender<StoreNotice>,
}

impl SledSharedStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            notices,
        })
    }

    fn read_sync(&self) -> Result<PersistedRecord, StoreError> {
        match self
            .db
            .get(RECORD_KEY)
            .map_err(|e| StoreError::Backend(e.to_string()))?
        {
            Some(bytes) => PersistedRecord::from_json_bytes(&bytes),
            None => Ok(PersistedRecord::default()),
        }
    }
}

#[async_trait]
impl SharedStore for SledSharedStore {
    async fn read(&self) -> Result<PersistedRecord, StoreError> {
        self.read_sync()
    }

    async fn compare_and_put(
        &self,
        expected_revision: u64,
        record: PersistedRecord,
    ) -> Result<(), StoreError> {
        let notice = {
            let _guard = self.write_lock.lock();
            let stored = self.read_sync()?;
            if stored.revision != expected_revision {
                return Err(StoreError::RevisionMismatch {
                    expected: expected_revision,
                    actual: stored.revision,
                });
            }
            let bytes = record.to_json_bytes()?;
            self.db
                .insert(RECORD_KEY, bytes)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            self.db
                .flush()
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            StoreNotice {
                write_id: record.write_id.clone(),
                revision: record.revision,
            }
        };
        let _ = self.notices.send(notice);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreNotice> {
        self.notices.subscribe()
    }
}
