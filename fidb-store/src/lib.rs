//! # fidb-store - Identity-scoped replicated store with synchronous views
//!
//! Gives an application plain, synchronous get/set access to per-user data
//! that is persisted locally and replicated to a remote in the background.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   get/set    ┌──────────────┐   diff    ┌──────────────┐
//! │ DatabaseView │ ───────────► │ Mirror       │ ────────► │ writer task  │
//! │ DatasetView  │  (sync)      │ (in memory)  │           │ (ordered)    │
//! │ RowView      │              └──────▲───────┘           └──────┬───────┘
//! └──────────────┘                     │ remote batches           │
//!                                      │                          ▼
//! ┌──────────────┐  listeners   ┌──────┴───────┐  feed    ┌──────────────┐
//! │ Subscription │ ◄─────────── │ mirror task  │ ◄─────── │ RowStore     │
//! └──────────────┘              └──────────────┘          │ (RocksDB)    │
//!                                                         └──────┬───────┘
//!                                                   outbox/pull  │
//!                                                         ┌──────▼───────┐
//!                                                         │ Replication  │ ◄──► Remote
//!                                                         └──────────────┘
//! ```
//!
//! Everything below the views belongs to one signed-in identity and is
//! rebuilt when the identity changes.
//!
//! ## Modules
//!
//! - [`value`] - primitive column values and row records
//! - [`change`] - change records and the column diff engine
//! - [`mirror`] - in-memory copy of all rows
//! - [`view`] - database, dataset and row views
//! - [`store`] - the [`Store`] facade
//! - [`feed`] - change batch fan-out
//! - [`storage`] - RocksDB row store with outbox and sync cursor
//! - [`replication`] - replication driver and remote transport
//! - [`identity`] - identity source and in-process watcher
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fidb_store::{Identity, IdentityWatcher, MemoryRemote, Store, StoreOptions};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = Arc::new(IdentityWatcher::signed_in(Identity::new("daaku")));
//! let store = Store::open(StoreOptions::default(), identity, Arc::new(MemoryRemote::new())).await?;
//!
//! let jedi = store.db().dataset("jedi");
//! jedi.put("yoda", json!({"name": "yoda", "age": 942}))?;
//! assert!(jedi.contains("yoda"));
//! store.settle().await;
//! # Ok(())
//! # }
//! ```

pub mod change;
pub mod error;
pub mod feed;
pub mod identity;
pub mod mirror;
pub mod replication;
mod session;
pub mod storage;
pub mod store;
pub mod value;
pub mod view;

// Re-exports for convenience
pub use change::{diff, Change, ChangeBatch, ColumnChanges};
pub use error::{ShapeOp, ViewError};
pub use feed::{ChangeFeed, FeedEvent, FeedReceiver, FeedStats, Origin};
pub use identity::{Identity, IdentitySource, IdentityStream, IdentityWatcher};
pub use mirror::{DatasetRows, Mirror};
pub use replication::{
    MemoryRemote, Remote, RemoteError, RemoteMessage, RemotePage, ReplicationConfig,
    ReplicationError, ReplicationSession, ReplicationStats,
};
pub use session::SessionError;
pub use storage::{OpenHooks, RowStore, StoreConfig, StoreError, StoreMeta};
pub use store::{Store, StoreOptions, Subscription};
pub use value::{Row, Value, ID_COLUMN, TOMBSTONE_COLUMN};
pub use view::{DatabaseView, DatasetView, RowView, VirtualRecord};
