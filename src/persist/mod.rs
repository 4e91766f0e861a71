//! Persistence Transaction Layer.
//!
//! Serializes the local entity store into the shared record exactly when a
//! true state change occurred, tolerating an eventually-consistent,
//! multi-writer store with no native transactions. Writes are owner-scoped
//! read-merge-writes validated by optimistic revision checks; incoming
//! notices are classified against recently committed write ids and a rolling
//! content fingerprint before any reconciliation work happens.

pub mod record;

use crate::config::SyncConfig;
use crate::entity::Entity;
use crate::error::{StoreError, SyncError};
use crate::sharedstore::SharedStore;
use crate::types::{now_millis, ContextId};
use parking_lot::Mutex;
use record::{Fingerprint, PersistedRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Classification of an incoming change notice's write id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfWriteStatus {
    /// This context committed the write; the notice is an echo.
    Own,
    /// The write id was ours but expired before the notice arrived. The
    /// notice is treated as foreign; reconciliation is redundant but safe.
    ExpiredOwn,
    Foreign,
}

/// Short-lived set of write ids this context committed, used to recognize
/// echoes of its own writes.
///
/// Entries live for the configured TTL, which must exceed the store's
/// worst-case notification latency. Expired ids are remembered for one more
/// TTL so a late echo is logged as a boundary case instead of being
/// silently misclassified.
#[derive(Debug)]
pub struct SelfWriteTracker {
    ttl: Duration,
    live: HashMap<String, Instant>,
    expired: HashMap<String, Instant>,
}

impl SelfWriteTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            live: HashMap::new(),
            expired: HashMap::new(),
        }
    }

    pub fn record(&mut self, write_id: String, now: Instant) {
        self.purge(now);
        self.live.insert(write_id, now);
    }

    pub fn classify(&mut self, write_id: &str, now: Instant) -> SelfWriteStatus {
        self.purge(now);
        if self.live.contains_key(write_id) {
            SelfWriteStatus::Own
        } else if self.expired.contains_key(write_id) {
            SelfWriteStatus::ExpiredOwn
        } else {
            SelfWriteStatus::Foreign
        }
    }

    fn purge(&mut self, now: Instant) {
        let ttl = self.ttl;
        let mut newly_expired = Vec::new();
        self.live.retain(|id, at| {
            if now.duration_since(*at) >= ttl {
                newly_expired.push(id.clone());
                false
            } else {
                true
            }
        });
        for id in newly_expired {
            self.expired.insert(id, now);
        }
        self.expired.retain(|_, at| now.duration_since(*at) < ttl);
    }
}

/// Rolling fingerprint of the most recently applied record, used to drop
/// logically identical re-deliveries independent of write id.
#[derive(Debug, Default)]
pub struct FingerprintWindow {
    last: Option<Fingerprint>,
}

impl FingerprintWindow {
    pub fn note_applied(&mut self, fingerprint: Fingerprint) {
        self.last = Some(fingerprint);
    }

    pub fn is_duplicate(&self, fingerprint: &Fingerprint) -> bool {
        self.last.as_ref() == Some(fingerprint)
    }
}

/// Trailing-edge debounce for persistence writes.
///
/// Rapid successive schedules coalesce into one flush. The window is
/// validated (config) to close before the notification-acceptance window so
/// storage never reports a change before any context expects one.
#[derive(Debug)]
pub struct DebounceState {
    window: Duration,
    deadline: Option<Instant>,
    intentional_empty: bool,
}

impl DebounceState {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            intentional_empty: false,
        }
    }

    /// Mark the store dirty; returns the flush deadline.
    pub fn schedule(&mut self, now: Instant) -> Instant {
        let deadline = now + self.window;
        self.deadline = Some(deadline);
        deadline
    }

    /// Only the destroy path arms this, when the write legitimately empties
    /// the owner's entity set.
    pub fn arm_intentional_empty(&mut self) {
        self.intentional_empty = true;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.map(|d| d <= now).unwrap_or(false)
    }

    /// Consume a due flush, returning the intentional-empty flag.
    pub fn take_due(&mut self, now: Instant) -> Option<bool> {
        if self.is_due(now) {
            self.deadline = None;
            Some(std::mem::take(&mut self.intentional_empty))
        } else {
            None
        }
    }

    /// Consume any pending flush regardless of deadline.
    pub fn take_pending(&mut self) -> Option<bool> {
        if self.deadline.take().is_some() {
            Some(std::mem::take(&mut self.intentional_empty))
        } else {
            None
        }
    }
}

/// Owner-scoped transactional writer over the shared store.
pub struct PersistLayer {
    context: ContextId,
    store: Arc<dyn SharedStore>,
    cfg: SyncConfig,
    write_counter: AtomicU64,
    self_writes: Mutex<SelfWriteTracker>,
    window: Mutex<FingerprintWindow>,
}

impl PersistLayer {
    pub fn new(context: ContextId, store: Arc<dyn SharedStore>, cfg: SyncConfig) -> Self {
        let ttl = cfg.self_write_ttl();
        Self {
            context,
            store,
            cfg,
            write_counter: AtomicU64::new(1),
            self_writes: Mutex::new(SelfWriteTracker::new(ttl)),
            window: Mutex::new(FingerprintWindow::default()),
        }
    }

    fn fresh_write_id(&self) -> String {
        let n = self.write_counter.fetch_add(1, Ordering::Relaxed);
        format!("w{}-{}-{}", self.context.0, now_millis(), n)
    }

    /// Commit this context's owned entities into the shared record.
    ///
    /// Read-merge-write: foreign entities in the stored record always carry
    /// over. On a revision conflict the current record is re-read, re-merged,
    /// and the write retried with backoff until the budget is exhausted.
    ///
    /// An empty `owned` set without `intentional_empty` signals an identity
    /// failure upstream, not a legitimate empty state; the write is refused
    /// locally and never attempted.
    pub async fn commit_owned(
        &self,
        owned: Vec<Entity>,
        intentional_empty: bool,
    ) -> Result<Fingerprint, SyncError> {
        if owned.is_empty() && !intentional_empty {
            return Err(SyncError::IdentityUnavailable(format!(
                "{} write would clear all owned entities without an intentional-empty marker",
                self.context
            )));
        }
        debug_assert!(owned.iter().all(|e| e.owner_context_id == self.context));

        let mut attempts = 0usize;
        loop {
            let current = self.store.read().await?;
            let write_id = self.fresh_write_id();
            let candidate = current.merge_owned(
                self.context,
                owned.clone(),
                write_id.clone(),
                intentional_empty,
            );
            let fingerprint = candidate.fingerprint();

            match self
                .store
                .compare_and_put(current.revision, candidate)
                .await
            {
                Ok(()) => {
                    self.self_writes.lock().record(write_id, Instant::now());
                    self.window.lock().note_applied(fingerprint);
                    debug!(context = %self.context, %fingerprint, "committed owned entities");
                    return Ok(fingerprint);
                }
                Err(StoreError::RevisionMismatch { expected, actual }) => {
                    attempts += 1;
                    if attempts > self.cfg.max_write_retries {
                        warn!(
                            context = %self.context,
                            attempts, expected, actual,
                            "persistence conflict: retry budget exhausted"
                        );
                        return Err(SyncError::PersistenceConflict { attempts });
                    }
                    debug!(
                        context = %self.context,
                        attempts, expected, actual,
                        "revision conflict, re-reading and retrying"
                    );
                    tokio::time::sleep(self.cfg.backoff_delay(attempts - 1)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Classify an incoming notice's write id against our recent commits.
    pub fn classify_notice(&self, write_id: &str) -> SelfWriteStatus {
        let status = self.self_writes.lock().classify(write_id, Instant::now());
        if status == SelfWriteStatus::ExpiredOwn {
            warn!(
                context = %self.context,
                write_id, "self-write id expired before its notice arrived"
            );
        }
        status
    }

    /// True when the record content matches the most recently applied state.
    pub fn is_duplicate(&self, fingerprint: &Fingerprint) -> bool {
        self.window.lock().is_duplicate(fingerprint)
    }

    /// Record the fingerprint of a foreign record after applying it.
    pub fn note_applied(&self, fingerprint: Fingerprint) {
        self.window.lock().note_applied(fingerprint);
    }

    pub async fn read_record(&self) -> Result<PersistedRecord, SyncError> {
        Ok(self.store.read().await?)
    }
}
