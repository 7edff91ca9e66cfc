//! Identity-scoped session: owns the mirror and everything tied to one user.
//!
//! ```text
//!              identity notification
//!                      │
//!            ┌─────────▼─────────┐
//!            │  handle_identity  │  same id → refresh token only
//!            └─────────┬─────────┘
//!         teardown ◄───┴───► sign_in
//!   (generation += 1)        (generation += 1)
//!   abort tasks              open RowStore, load mirror
//!   drain writer queue       start writer, mirror task, sync, live loop
//!   close RowStore           attach registered listeners
//!   clear caches + ledger
//! ```
//!
//! View operations lock [`SessionState`] briefly and never across an await.
//! Writes go to the mirror first, then through a single ordered writer task to
//! the replication session. Every send and the initial sync are tracked in the
//! pending-write ledger until they finish; `settle` waits on a snapshot of it.
//!
//! Completions are tagged with the generation they were issued under. A
//! completion arriving after a transition leaves the ledger alone.
//!
//! Columns written to the mirror but not yet committed by the writer are
//! in flight. Remote batches never overwrite an in-flight column; the local
//! commit that follows them in the feed carries the newer value.

use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::change::{Change, ChangeBatch};
use crate::error::ViewError;
use crate::feed::{ChangeFeed, FeedEvent, Origin};
use crate::identity::Identity;
use crate::mirror::Mirror;
use crate::replication::{Remote, ReplicationError, ReplicationSession};
use crate::storage::{OpenHooks, RowStore, StoreError};
use crate::store::StoreOptions;
use crate::view::{DatasetView, RowView};

/// Change listener registered through the store facade.
pub(crate) type Listener = Arc<dyn Fn(&ChangeBatch) + Send + Sync>;

type PendingWrite = Shared<BoxFuture<'static, ()>>;

/// `(dataset, id, column)`
type ColumnKey = (String, String, String);

fn column_keys(batch: &ChangeBatch) -> Vec<ColumnKey> {
    batch
        .iter()
        .flat_map(|(dataset, id, columns)| {
            columns
                .keys()
                .map(move |column| (dataset.to_string(), id.to_string(), column.clone()))
        })
        .collect()
}

/// Errors raised while switching identities.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to open row store: {0}")]
    Store(#[from] StoreError),

    #[error("session task failed: {0}")]
    Task(String),
}

/// One batch queued for the outbound writer.
struct OutboundWrite {
    changes: Vec<Change>,
    done: oneshot::Sender<Result<u64, ReplicationError>>,
}

/// Everything that exists only while signed in.
pub(crate) struct ActiveSession {
    pub(crate) identity: Identity,
    pub(crate) mirror: Mirror,
    generation: u64,
    store: Arc<RowStore>,
    replication: Arc<ReplicationSession>,
    /// `None` once shutdown has closed the queue
    writer: Option<mpsc::UnboundedSender<OutboundWrite>>,
    writer_task: Option<JoinHandle<()>>,
    /// Columns queued on the writer, counted per pending send
    inflight: HashMap<ColumnKey, usize>,
    /// Republished store feed; listeners subscribe here
    notify: ChangeFeed,
    tasks: Vec<JoinHandle<()>>,
    listener_tasks: HashMap<u64, JoinHandle<()>>,
}

impl ActiveSession {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for (_, task) in self.listener_tasks.drain() {
            task.abort();
        }
    }

    /// Stop background work, let queued writes reach the store, then close.
    async fn shutdown(mut self) {
        self.abort_tasks();
        self.writer = None;
        if let Some(writer) = self.writer_task.take() {
            if let Err(e) = writer.await {
                log::warn!("Outbound writer for {} failed: {e}", self.identity.id());
            }
        }
    }

    fn release(&mut self, keys: &[ColumnKey]) {
        for key in keys {
            if let Some(count) = self.inflight.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    self.inflight.remove(key);
                }
            }
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.abort_tasks();
        if let Some(writer) = self.writer_task.take() {
            writer.abort();
        }
        self.replication.close();
        self.store.close();
        log::info!(
            "Closed session for {} (generation {})",
            self.identity.id(),
            self.generation
        );
    }
}

/// Mutable session state, guarded by [`SessionShared`]'s mutex.
#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) active: Option<ActiveSession>,
    datasets: HashMap<String, DatasetView>,
    rows: HashMap<(String, String), RowView>,
    ledger: HashMap<u64, PendingWrite>,
    listeners: IndexMap<u64, Listener>,
}

impl SessionState {
    pub(crate) fn mirror(&self) -> Option<&Mirror> {
        self.active.as_ref().map(|active| &active.mirror)
    }

    pub(crate) fn mirror_mut(&mut self) -> Option<&mut Mirror> {
        self.active.as_mut().map(|active| &mut active.mirror)
    }

    /// Cached dataset view, created on first access.
    pub(crate) fn dataset_view(&mut self, session: &Weak<SessionShared>, name: &str) -> DatasetView {
        self.datasets
            .entry(name.to_string())
            .or_insert_with(|| DatasetView::new(session.clone(), name))
            .clone()
    }

    /// Cached row view, created on first access.
    pub(crate) fn row_view(
        &mut self,
        session: &Weak<SessionShared>,
        dataset: &str,
        id: &str,
    ) -> RowView {
        self.rows
            .entry((dataset.to_string(), id.to_string()))
            .or_insert_with(|| RowView::new(session.clone(), dataset, id))
            .clone()
    }

    fn reset_caches(&mut self) {
        self.datasets.clear();
        self.rows.clear();
    }
}

/// Session shared between the store facade, its views and its tasks.
pub(crate) struct SessionShared {
    this: Weak<SessionShared>,
    state: Mutex<SessionState>,
    options: StoreOptions,
    remote: Arc<dyn Remote>,
    runtime: Handle,
    generation: AtomicU64,
    next_entry: AtomicU64,
    next_listener: AtomicU64,
    closed: AtomicBool,
}

impl SessionShared {
    pub(crate) fn new(options: StoreOptions, remote: Arc<dyn Remote>, runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: Mutex::new(SessionState::default()),
            options,
            remote,
            runtime,
            generation: AtomicU64::new(0),
            next_entry: AtomicU64::new(0),
            next_listener: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn weak(&self) -> Weak<SessionShared> {
        self.this.clone()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn identity(&self) -> Option<Identity> {
        self.lock().active.as_ref().map(|active| active.identity.clone())
    }

    /// Number of ledger entries not yet completed.
    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.lock().ledger.len()
    }

    // ─── Identity lifecycle ───────────────────────────────────────────

    /// React to one identity notification.
    pub(crate) async fn handle_identity(&self, identity: Option<Identity>) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let current = self.identity();
        match (&current, &identity) {
            (None, None) => return Ok(()),
            (Some(old), Some(new)) if old.id() == new.id() => {
                self.refresh_identity(new.clone());
                return Ok(());
            }
            _ => {}
        }

        if current.is_some() {
            self.teardown().await;
        }
        match identity {
            Some(identity) => self.sign_in(identity).await,
            None => Ok(()),
        }
    }

    /// Same user, possibly a new bearer token: keep the session.
    fn refresh_identity(&self, identity: Identity) {
        let mut state = self.lock();
        if let Some(active) = state.active.as_mut() {
            log::debug!("Refreshing credentials for {}", identity.id());
            active.replication.update_identity(identity.clone());
            active.identity = identity;
        }
    }

    /// Discard the active session. Listeners stay registered.
    ///
    /// Writes already queued are committed to the store before it closes.
    pub(crate) async fn teardown(&self) {
        let Some(active) = self.take_active() else {
            return;
        };
        log::info!("Signing out {}", active.identity.id());
        active.shutdown().await;
    }

    fn take_active(&self) -> Option<ActiveSession> {
        let mut state = self.lock();
        let active = state.active.take()?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        state.reset_caches();
        state.ledger.clear();
        Some(active)
    }

    async fn sign_in(&self, identity: Identity) -> Result<(), SessionError> {
        let config = self.options.store_config_for(identity.id());
        let path = config.path.clone();
        let (store, feed_rx, datasets) = tokio::task::spawn_blocking(move || {
            let store = RowStore::open_with(config, &OpenHooks::logging())?;
            // Subscribe before loading so no committed batch is missed
            let feed_rx = store.subscribe_unbounded();
            let datasets = store.load_all()?;
            Ok::<_, StoreError>((store, feed_rx, datasets))
        })
        .await
        .map_err(|e| SessionError::Task(e.to_string()))??;
        let store = Arc::new(store);
        let mirror = Mirror::from_datasets(datasets);
        let group_id = self.options.group_id_for(identity.id());
        let replication = ReplicationSession::new(
            store.clone(),
            self.remote.clone(),
            group_id.clone(),
            identity.clone(),
            self.options.replication.clone(),
        );
        log::info!(
            "Signed in as {}: {} rows from {}, group {group_id}",
            identity.id(),
            mirror.row_count(),
            path.display()
        );

        let mut state = self.lock();
        // Checked under the lock: `close` takes it to tear down
        if self.closed.load(Ordering::SeqCst) {
            drop(state);
            replication.close();
            store.close();
            log::debug!("Store closed while signing in {}", identity.id());
            return Ok(());
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        state.reset_caches();
        state.ledger.clear();

        let notify = ChangeFeed::new(self.options.storage.feed_capacity);
        let (writer, writer_rx) = mpsc::unbounded_channel();
        let writer_task = self
            .runtime
            .spawn(writer_loop(replication.clone(), writer_rx));
        let tasks = vec![self
            .runtime
            .spawn(mirror_loop(self.weak(), generation, feed_rx, notify.clone()))];
        let listener_tasks = state
            .listeners
            .iter()
            .map(|(id, listener)| (*id, self.attach(&notify, listener.clone())))
            .collect();

        state.active = Some(ActiveSession {
            identity,
            mirror,
            generation,
            store,
            replication: replication.clone(),
            writer: Some(writer),
            writer_task: Some(writer_task),
            inflight: HashMap::new(),
            notify,
            tasks,
            listener_tasks,
        });

        let initial = replication.clone();
        self.track(&mut state, generation, async move {
            if let Err(e) = initial.sync().await {
                log::warn!("Initial sync for group {} failed: {e}", initial.group_id());
            }
        });
        let live = self.runtime.spawn(replication.run());
        if let Some(active) = state.active.as_mut() {
            active.tasks.push(live);
        }
        Ok(())
    }

    /// Stop reacting to identities and drop the active session.
    ///
    /// Abrupt: writes still queued on the writer are discarded.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(active) = self.take_active() {
            log::info!("Closing session for {}", active.identity.id());
            drop(active);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Queue changes on the outbound writer and track the completion.
    pub(crate) fn send(&self, state: &mut SessionState, changes: Vec<Change>) -> Result<(), ViewError> {
        let Some(active) = state.active.as_mut() else {
            let (dataset, id) = changes
                .first()
                .map(|c| (c.dataset.as_str(), c.row.as_str()))
                .unwrap_or_default();
            return Err(ViewError::logged_out_save(dataset, id));
        };
        let generation = active.generation;
        let keys = column_keys(&ChangeBatch::from_changes(&changes));
        let (done, done_rx) = oneshot::channel();
        let queued = active
            .writer
            .as_ref()
            .is_some_and(|writer| writer.send(OutboundWrite { changes, done }).is_ok());
        if !queued {
            log::warn!("Outbound writer for generation {generation} is gone");
            return Ok(());
        }
        for key in &keys {
            *active.inflight.entry(key.clone()).or_insert(0) += 1;
        }

        let this = self.weak();
        self.track(state, generation, async move {
            let committed = match done_rx.await {
                Ok(Ok(seq)) => {
                    log::trace!("Send {seq} queued for replication");
                    true
                }
                Ok(Err(e)) => {
                    log::warn!("Send failed: {e}");
                    false
                }
                Err(_) => {
                    log::debug!("Send dropped before completion");
                    false
                }
            };
            // A committed send is released by its feed event instead
            if !committed {
                if let Some(shared) = this.upgrade() {
                    shared.release(generation, &keys);
                }
            }
        });
        Ok(())
    }

    fn release(&self, generation: u64, keys: &[ColumnKey]) {
        let mut state = self.lock();
        if let Some(active) = state.active.as_mut().filter(|a| a.generation == generation) {
            active.release(keys);
        }
    }

    /// Add a future to the ledger; it removes itself when done.
    fn track(
        &self,
        state: &mut SessionState,
        generation: u64,
        fut: impl Future<Output = ()> + Send + 'static,
    ) {
        let entry = self.next_entry.fetch_add(1, Ordering::Relaxed);
        let this = self.weak();
        let tracked = async move {
            fut.await;
            if let Some(shared) = this.upgrade() {
                shared.complete(generation, entry);
            }
        }
        .boxed()
        .shared();
        state.ledger.insert(entry, tracked.clone());
        self.runtime.spawn(tracked);
    }

    fn complete(&self, generation: u64, entry: u64) {
        if generation != self.generation() {
            log::debug!("Dropping completion {entry} from stale generation {generation}");
            return;
        }
        self.lock().ledger.remove(&entry);
    }

    /// Wait for every write issued so far, then for replication to drain.
    pub(crate) async fn settle(&self) {
        let (pending, replication) = {
            let state = self.lock();
            let pending: Vec<PendingWrite> = state.ledger.values().cloned().collect();
            let replication = state.active.as_ref().map(|a| a.replication.clone());
            (pending, replication)
        };
        join_all(pending).await;
        if let Some(replication) = replication {
            replication.settle().await;
        }
    }

    /// Fold one committed store batch into the session.
    ///
    /// A local commit releases its in-flight columns. A remote batch is
    /// applied to the mirror except for in-flight columns. Returns false once
    /// `generation` is no longer active.
    fn absorb(&self, generation: u64, event: &FeedEvent) -> bool {
        let mut state = self.lock();
        let Some(active) = state.active.as_mut().filter(|a| a.generation == generation) else {
            return false;
        };
        match event.origin {
            Origin::Local => active.release(&column_keys(&event.batch)),
            Origin::Remote => {
                for change in event.batch.to_changes() {
                    let key = (change.dataset.clone(), change.row.clone(), change.column.clone());
                    if !active.inflight.contains_key(&key) {
                        active.mirror.apply(&change);
                    }
                }
            }
        }
        true
    }

    // ─── Listeners ────────────────────────────────────────────────────

    /// Register a listener; attached now if signed in, else on next sign-in.
    pub(crate) fn listen(&self, listener: Listener) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        state.listeners.insert(id, listener.clone());
        if let Some(active) = state.active.as_mut() {
            let task = self.attach(&active.notify, listener);
            active.listener_tasks.insert(id, task);
        }
        id
    }

    pub(crate) fn unlisten(&self, id: u64) {
        let mut state = self.lock();
        state.listeners.shift_remove(&id);
        if let Some(task) = state
            .active
            .as_mut()
            .and_then(|active| active.listener_tasks.remove(&id))
        {
            task.abort();
        }
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn attach(&self, notify: &ChangeFeed, listener: Listener) -> JoinHandle<()> {
        let mut rx = notify.subscribe();
        self.runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                listener(event.batch.as_ref());
            }
        })
    }
}

/// Apply queued writes to replication strictly in issue order.
async fn writer_loop(
    replication: Arc<ReplicationSession>,
    mut rx: mpsc::UnboundedReceiver<OutboundWrite>,
) {
    while let Some(write) = rx.recv().await {
        let result = replication.send(write.changes).await;
        let _ = write.done.send(result);
    }
}

/// Mirror remote batches, then republish every batch to listeners.
///
/// Local batches are already in the mirror. The store subscription is
/// unbounded so the mirror never skips a commit.
async fn mirror_loop(
    session: Weak<SessionShared>,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<FeedEvent>,
    notify: ChangeFeed,
) {
    while let Some(event) = rx.recv().await {
        let Some(shared) = session.upgrade() else {
            break;
        };
        if !shared.absorb(generation, &event) {
            break;
        }
        notify.publish_event(event);
    }
}
