//! The remote side of replication.
//!
//! A remote keeps one append-only log of [`RemoteMessage`]s per replication
//! group. Replicas push their outbox and pull everything past their cursor.
//! Conflict resolution and the network transport live behind [`Remote`]; this
//! crate ships [`MemoryRemote`], an in-process hub used by tests and by
//! applications that share one process.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::change::Change;

/// A change as stored by the remote, tagged with the replica that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub origin: Uuid,
    pub change: Change,
}

/// One page of a pull.
#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub messages: Vec<RemoteMessage>,
    /// Cursor to pass to the next pull
    pub cursor: u64,
}

/// Remote errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// The remote could not be reached
    Offline,
    /// Missing or rejected bearer token
    Unauthorized,
    /// The remote refused the request
    Rejected(String),
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Offline => write!(f, "Remote is offline"),
            RemoteError::Unauthorized => write!(f, "Remote rejected credentials"),
            RemoteError::Rejected(e) => write!(f, "Remote rejected request: {e}"),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Transport to the remote copy of a replication group.
pub trait Remote: Send + Sync {
    /// Append changes to the group's log. Returns the new log length.
    fn push(
        &self,
        group_id: &str,
        token: Option<&str>,
        origin: Uuid,
        changes: Vec<Change>,
    ) -> BoxFuture<'static, Result<u64, RemoteError>>;

    /// Read up to `limit` messages starting at `cursor`.
    fn pull(
        &self,
        group_id: &str,
        token: Option<&str>,
        cursor: u64,
        limit: usize,
    ) -> BoxFuture<'static, Result<RemotePage, RemoteError>>;
}

type GroupLog = Arc<RwLock<Vec<RemoteMessage>>>;

/// In-process remote: maps group ids to message logs.
pub struct MemoryRemote {
    groups: Arc<RwLock<HashMap<String, GroupLog>>>,
    online: Arc<AtomicBool>,
    require_token: bool,
    /// When set, the only bearer token accepted
    accepted_token: std::sync::RwLock<Option<String>>,
    pushes: Arc<AtomicU64>,
    pulls: Arc<AtomicU64>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
            online: Arc::new(AtomicBool::new(true)),
            require_token: false,
            accepted_token: std::sync::RwLock::new(None),
            pushes: Arc::new(AtomicU64::new(0)),
            pulls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Reject requests that carry no bearer token.
    pub fn with_required_token(mut self) -> Self {
        self.require_token = true;
        self
    }

    /// Accept only `token`; anything else is `Unauthorized`.
    pub fn with_accepted_token(self, token: impl Into<String>) -> Self {
        self.set_accepted_token(token);
        self.with_required_token()
    }

    /// Rotate the accepted token, as a server would on expiry.
    pub fn set_accepted_token(&self, token: impl Into<String>) {
        *self
            .accepted_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    /// Toggle reachability. While offline every request fails.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of groups that have been written to.
    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    /// All messages of a group.
    pub async fn messages(&self, group_id: &str) -> Vec<RemoteMessage> {
        let log = self.groups.read().await.get(group_id).cloned();
        match log {
            Some(log) => log.read().await.clone(),
            None => Vec::new(),
        }
    }

    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    pub fn pull_count(&self) -> u64 {
        self.pulls.load(Ordering::Relaxed)
    }

    fn check(&self, token: Option<&str>) -> Result<(), RemoteError> {
        if !self.is_online() {
            return Err(RemoteError::Offline);
        }
        if self.require_token && token.is_none() {
            return Err(RemoteError::Unauthorized);
        }
        let accepted = self
            .accepted_token
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match accepted.as_deref() {
            Some(expected) if token != Some(expected) => Err(RemoteError::Unauthorized),
            _ => Ok(()),
        }
    }

    /// Get or create the log for a group.
    async fn group(groups: &RwLock<HashMap<String, GroupLog>>, group_id: &str) -> GroupLog {
        // Fast path: read lock
        {
            let groups = groups.read().await;
            if let Some(log) = groups.get(group_id) {
                return log.clone();
            }
        }

        // Slow path: write lock to create
        let mut groups = groups.write().await;
        groups
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
            .clone()
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl Remote for MemoryRemote {
    fn push(
        &self,
        group_id: &str,
        token: Option<&str>,
        origin: Uuid,
        changes: Vec<Change>,
    ) -> BoxFuture<'static, Result<u64, RemoteError>> {
        let checked = self.check(token);
        let groups = self.groups.clone();
        let pushes = self.pushes.clone();
        let group_id = group_id.to_string();
        async move {
            checked?;
            let log = Self::group(&groups, &group_id).await;
            let mut log = log.write().await;
            log.extend(
                changes
                    .into_iter()
                    .map(|change| RemoteMessage { origin, change }),
            );
            pushes.fetch_add(1, Ordering::Relaxed);
            Ok(log.len() as u64)
        }
        .boxed()
    }

    fn pull(
        &self,
        group_id: &str,
        token: Option<&str>,
        cursor: u64,
        limit: usize,
    ) -> BoxFuture<'static, Result<RemotePage, RemoteError>> {
        let checked = self.check(token);
        let groups = self.groups.clone();
        let pulls = self.pulls.clone();
        let group_id = group_id.to_string();
        async move {
            checked?;
            pulls.fetch_add(1, Ordering::Relaxed);
            let log = groups.read().await.get(&group_id).cloned();
            let Some(log) = log else {
                return Ok(RemotePage {
                    messages: Vec::new(),
                    cursor,
                });
            };
            let log = log.read().await;
            let start = (cursor as usize).min(log.len());
            let end = start.saturating_add(limit).min(log.len());
            Ok(RemotePage {
                messages: log[start..end].to_vec(),
                cursor: end as u64,
            })
        }
        .boxed()
    }
}
