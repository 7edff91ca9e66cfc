//! Synchronous views over the session mirror.
//!
//! ```text
//!   DatabaseView ──dataset("jedi")──► DatasetView ──get("yoda")──► RowView
//!        │                                 │                          │
//!        └────────── Weak<SessionShared> ──┴──────────────────────────┘
//! ```
//!
//! Views carry only their coordinates and a weak handle to the session. Every
//! call re-reads the session state, so a sign-out is observed by all views at
//! once. Reads never fail for a signed-out session; mutations do.

pub mod database;
pub mod dataset;
pub mod row;

pub use database::DatabaseView;
pub use dataset::DatasetView;
pub use row::RowView;

use crate::error::ViewError;

/// Keyed access shared by the three view levels.
pub trait VirtualRecord {
    /// What reading a key yields.
    type Output;
    /// What writing a key accepts.
    type Input;

    fn read(&self, key: &str) -> Result<Option<Self::Output>, ViewError>;

    fn write(&self, key: &str, value: Self::Input) -> Result<(), ViewError>;

    fn remove(&self, key: &str) -> Result<(), ViewError>;

    /// Keys currently visible, in insertion order.
    fn keys(&self) -> Vec<String>;

    fn contains(&self, key: &str) -> bool;

    /// Defining a key directly is never allowed.
    fn define(&self, key: &str) -> Result<(), ViewError>;
}
