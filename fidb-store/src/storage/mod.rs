//! Durable local storage for one identity's rows.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   apply_local    ┌──────────────────────────────────┐
//! │ Replication  │ ───────────────► │ RowStore (RocksDB)               │
//! │ Session      │   apply_remote   │                                  │
//! └──────────────┘ ───────────────► │ CF "rows"  : LZ4(JSON) bodies    │
//!                                   │ CF "outbox": unpushed changes    │
//!                                   │ CF "meta"  : version, cursor     │
//!                                   └───────────────┬──────────────────┘
//!                                                   │ ChangeFeed
//!                                                   ▼
//!                                          mirror + listeners
//! ```

pub mod rocks;

pub use rocks::{OpenHooks, RowStore, StoreConfig, StoreError, StoreMeta};
