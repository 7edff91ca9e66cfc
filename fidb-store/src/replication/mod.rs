//! Replication between the local row store and a remote group log.
//!
//! ```text
//!   replica A                     remote                      replica B
//! ┌───────────┐   push(outbox)  ┌──────────┐   pull(cursor)  ┌───────────┐
//! │ RowStore  │ ──────────────► │ group    │ ──────────────► │ RowStore  │
//! │ + session │ ◄────────────── │ log      │ ◄────────────── │ + session │
//! └───────────┘   pull(cursor)  └──────────┘   push(outbox)  └───────────┘
//! ```
//!
//! Every replica applies the log in the same order, its own messages included,
//! so all replicas end on the last write per column. Re-applying an own write
//! is a no-op.

pub mod remote;
pub mod syncer;

pub use remote::{MemoryRemote, Remote, RemoteError, RemoteMessage, RemotePage};
pub use syncer::{ReplicationConfig, ReplicationError, ReplicationSession, ReplicationStats};
