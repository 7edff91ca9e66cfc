//! The store facade handed to applications.
//!
//! ```text
//!  IdentitySource ──notifications──► watcher task ──► SessionShared
//!                                                        ▲   ▲
//!  Store::db() ──► DatabaseView ──(Weak)─────────────────┘   │
//!  Store::listen_changes() ──► Subscription ──(Weak)─────────┘
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::change::ChangeBatch;
use crate::identity::{Identity, IdentitySource};
use crate::replication::{Remote, ReplicationConfig};
use crate::session::{SessionError, SessionShared};
use crate::storage::StoreConfig;
use crate::view::DatabaseView;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Directory holding one row store per identity
    pub root: PathBuf,
    /// Logical name scoping stores and replication groups
    pub name: Option<String>,
    /// Explicit replication group, overriding the derived one
    pub group_id: Option<String>,
    /// Template for each identity's row store; `path` is replaced
    pub storage: StoreConfig,
    pub replication: ReplicationConfig,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("fidb_data"),
            name: None,
            group_id: None,
            storage: StoreConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl StoreOptions {
    /// Create options for testing (small caches, short intervals).
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            storage: StoreConfig::for_testing(root.clone()),
            root,
            replication: ReplicationConfig::for_testing(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Directory name of an identity's row store: `<name>_<id>` or `<id>`.
    pub fn store_dir_name(&self, identity_id: &str) -> String {
        match &self.name {
            Some(name) => format!("{name}_{identity_id}"),
            None => identity_id.to_string(),
        }
    }

    /// Replication group: explicit id, else `<id>.<name>`, else `<id>`.
    pub fn group_id_for(&self, identity_id: &str) -> String {
        match (&self.group_id, &self.name) {
            (Some(group_id), _) => group_id.clone(),
            (None, Some(name)) => format!("{identity_id}.{name}"),
            (None, None) => identity_id.to_string(),
        }
    }

    pub(crate) fn store_config_for(&self, identity_id: &str) -> StoreConfig {
        StoreConfig {
            path: self.root.join(self.store_dir_name(identity_id)),
            ..self.storage.clone()
        }
    }
}

/// Identity-scoped, replicated store.
///
/// Must be opened inside a tokio runtime. The views it hands out are
/// synchronous and may be used from any thread.
pub struct Store {
    shared: Arc<SessionShared>,
    db: DatabaseView,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Store {
    /// Open the store and react to the current identity before returning.
    pub async fn open(
        options: StoreOptions,
        identity: Arc<dyn IdentitySource>,
        remote: Arc<dyn Remote>,
    ) -> Result<Self, SessionError> {
        let shared = SessionShared::new(options, remote, Handle::current());
        let mut notifications = identity.subscribe(false);
        shared.handle_identity(identity.current()).await?;

        let session = Arc::downgrade(&shared);
        let watcher = tokio::spawn(async move {
            while let Some(next) = notifications.recv().await {
                let Some(shared) = session.upgrade() else {
                    break;
                };
                if let Err(e) = shared.handle_identity(next).await {
                    log::error!("Identity change failed: {e}");
                }
            }
            log::debug!("Identity watcher stopped");
        });

        Ok(Self {
            db: DatabaseView::new(shared.weak()),
            shared,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// The root view. Empty and read-only while signed out.
    pub fn db(&self) -> DatabaseView {
        self.db.clone()
    }

    /// Call `callback` with every change batch, local or remote.
    ///
    /// Registered while signed out, the callback starts receiving on the next
    /// sign-in. It survives identity changes until the subscription is dropped.
    pub fn listen_changes(
        &self,
        callback: impl Fn(&ChangeBatch) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.shared.listen(Arc::new(callback));
        Subscription {
            session: self.shared.weak(),
            id,
        }
    }

    /// Wait until every write issued so far has reached replication.
    pub async fn settle(&self) {
        self.shared.settle().await;
    }

    /// Release the row store and stop following identity changes.
    ///
    /// Does not wait for pending writes; call [`settle`](Self::settle) first
    /// to keep them.
    pub fn close(&self) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.shared.identity()
    }

    pub fn is_signed_in(&self) -> bool {
        self.identity().is_some()
    }

    /// Number of registered change listeners.
    pub fn listener_count(&self) -> usize {
        self.shared.listener_count()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to a change listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    session: Weak<SessionShared>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.unlisten(self.id);
        }
    }
}
