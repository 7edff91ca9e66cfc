//! Replication session: moves changes between a [`RowStore`] and a [`Remote`].
//!
//! ```text
//!   send(changes) ──► RowStore.apply_local ──► outbox ──flush──► Remote.push
//!                                                                    │
//!   RowStore.apply_remote ◄──── log order ◄─────────── pull ◄───────┘
//! ```
//!
//! `send` completes once the changes are durable locally and queued in the
//! outbox; pushing happens in the background (`run`) or on `settle`. Remote
//! failures are logged and retried on the next tick, never surfaced to the
//! caller of `send`.
//!
//! Pulled pages are applied in log order, our own pushes included, so every
//! replica ends on the value of the last write in the log.
//!
//! Reference: Kleppmann, Chapter 5 - Replication

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::change::Change;
use crate::identity::Identity;
use crate::replication::remote::{Remote, RemoteError};
use crate::storage::{RowStore, StoreError};

/// Replication tuning.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Outbox entries pushed per request
    pub push_batch: usize,
    /// Messages requested per pull
    pub pull_limit: usize,
    /// Interval between background syncs
    pub poll_interval: Duration,
    /// Delay before retrying a failed settle
    pub retry_interval: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            push_batch: 64,
            pull_limit: 500,
            poll_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl ReplicationConfig {
    /// Config for testing (short intervals).
    pub fn for_testing() -> Self {
        Self {
            push_batch: 8,
            pull_limit: 50,
            poll_interval: Duration::from_millis(50),
            retry_interval: Duration::from_millis(20),
        }
    }
}

/// Replication errors.
#[derive(Debug, Clone)]
pub enum ReplicationError {
    Store(StoreError),
    Remote(RemoteError),
    /// The session was closed
    Closed,
}

impl std::fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationError::Store(e) => write!(f, "Replication store error: {e}"),
            ReplicationError::Remote(e) => write!(f, "Replication remote error: {e}"),
            ReplicationError::Closed => write!(f, "Replication session is closed"),
        }
    }
}

impl std::error::Error for ReplicationError {}

impl From<StoreError> for ReplicationError {
    fn from(e: StoreError) -> Self {
        ReplicationError::Store(e)
    }
}

impl From<RemoteError> for ReplicationError {
    fn from(e: RemoteError) -> Self {
        ReplicationError::Remote(e)
    }
}

/// Counters for monitoring replication health.
#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    pub pushed: u64,
    pub pulled: u64,
    pub failures: u64,
}

/// Replication driver bound to one store and one group.
pub struct ReplicationSession {
    store: Arc<RowStore>,
    remote: Arc<dyn Remote>,
    group_id: String,
    /// Replaced on token refresh; read on every request
    identity: RwLock<Identity>,
    /// Our replica id, stamped on every push
    origin: Uuid,
    config: ReplicationConfig,
    /// Serializes flush/pull so the outbox is never pushed twice
    sync_lock: Mutex<()>,
    wake: Notify,
    closed: AtomicBool,
    pushed: AtomicU64,
    pulled: AtomicU64,
    failures: AtomicU64,
}

impl ReplicationSession {
    pub fn new(
        store: Arc<RowStore>,
        remote: Arc<dyn Remote>,
        group_id: impl Into<String>,
        identity: Identity,
        config: ReplicationConfig,
    ) -> Arc<Self> {
        let origin = store.client_id();
        Arc::new(Self {
            store,
            remote,
            group_id: group_id.into(),
            identity: RwLock::new(identity),
            origin,
            config,
            sync_lock: Mutex::new(()),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            pulled: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    /// Apply changes locally and queue them for the remote.
    ///
    /// Returns the outbox sequence number of the batch.
    pub async fn send(&self, changes: Vec<Change>) -> Result<u64, ReplicationError> {
        self.check_open()?;
        let seq = self.store.apply_local(&changes)?;
        self.wake.notify_one();
        Ok(seq)
    }

    /// Push the outbox, then pull everything new.
    pub async fn sync(&self) -> Result<(), ReplicationError> {
        let _guard = self.sync_lock.lock().await;
        self.flush().await?;
        self.pull().await?;
        Ok(())
    }

    /// Push every queued outbox entry. Returns the number of changes pushed.
    async fn flush(&self) -> Result<usize, ReplicationError> {
        let mut total = 0;
        loop {
            self.check_open()?;
            let entries = self.store.outbox_read(self.config.push_batch)?;
            let Some(last_seq) = entries.last().map(|(seq, _)| *seq) else {
                break;
            };
            let changes: Vec<Change> = entries.into_iter().flat_map(|(_, c)| c).collect();
            let count = changes.len();
            let token = self.bearer_token();
            self.remote
                .push(
                    &self.group_id,
                    token.as_deref(),
                    self.origin,
                    changes,
                )
                .await?;
            self.store.outbox_truncate(last_seq)?;
            self.pushed.fetch_add(count as u64, Ordering::Relaxed);
            total += count;
        }
        if total > 0 {
            log::debug!("Pushed {total} changes to group {}", self.group_id);
        }
        Ok(total)
    }

    /// Pull messages past the stored cursor.
    ///
    /// Returns the number of columns that changed locally; echoes of our own
    /// pushes change nothing.
    async fn pull(&self) -> Result<usize, ReplicationError> {
        let mut total = 0;
        loop {
            self.check_open()?;
            let cursor = self.store.cursor();
            let token = self.bearer_token();
            let page = self
                .remote
                .pull(&self.group_id, token.as_deref(), cursor, self.config.pull_limit)
                .await?;
            let received = page.messages.len();
            if received == 0 {
                break;
            }
            let changes: Vec<Change> = page.messages.into_iter().map(|m| m.change).collect();
            total += self.store.apply_remote(&changes, page.cursor)?;
            if received < self.config.pull_limit {
                break;
            }
        }
        if total > 0 {
            self.pulled.fetch_add(total as u64, Ordering::Relaxed);
            log::debug!("Pulled {total} changes from group {}", self.group_id);
        }
        Ok(total)
    }

    /// Background loop: sync on every send and every poll interval until closed.
    pub async fn run(self: Arc<Self>) {
        log::info!("Replication started for group {}", self.group_id);
        while !self.is_closed() {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            if self.is_closed() {
                break;
            }
            if let Err(e) = self.sync().await {
                if self.is_closed() {
                    break;
                }
                self.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Background sync for group {} failed: {e}", self.group_id);
            }
        }
        log::info!("Replication stopped for group {}", self.group_id);
    }

    /// Wait until the outbox is pushed and the latest remote state pulled.
    ///
    /// Retries failed syncs indefinitely; returns early only if the session
    /// is closed.
    pub async fn settle(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            match self.sync().await {
                Ok(()) => match self.store.outbox_len() {
                    Ok(0) => return,
                    Ok(_) => continue,
                    Err(e) => {
                        log::warn!("Settle for group {} could not read outbox: {e}", self.group_id);
                    }
                },
                Err(e) => {
                    if self.is_closed() {
                        return;
                    }
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Settle for group {} retrying after: {e}", self.group_id);
                }
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// Stop the background loop and reject further work.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Swap in a refreshed identity for the same user.
    pub fn update_identity(&self, identity: Identity) {
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = identity;
    }

    fn bearer_token(&self) -> Option<String> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .bearer_token()
            .map(str::to_string)
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            pulled: self.pulled.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn check_open(&self) -> Result<(), ReplicationError> {
        if self.is_closed() {
            Err(ReplicationError::Closed)
        } else {
            Ok(())
        }
    }
}
