//! Dataset-level access. Read-only shape: datasets come into existence by
//! writing rows, never by assignment at this level.

use serde_json::Value as Json;
use std::sync::Weak;

use crate::error::{ShapeOp, ViewError};
use crate::session::SessionShared;
use crate::view::{DatasetView, VirtualRecord};

const TARGET: &str = "database";

/// Root view handed out by [`Store::db`](crate::Store::db).
#[derive(Clone)]
pub struct DatabaseView {
    session: Weak<SessionShared>,
}

impl DatabaseView {
    pub(crate) fn new(session: Weak<SessionShared>) -> Self {
        Self { session }
    }

    /// The view for dataset `name`. Always succeeds; cached per session.
    pub fn dataset(&self, name: &str) -> DatasetView {
        let Some(session) = self.session.upgrade() else {
            return DatasetView::new(Weak::new(), name);
        };
        let mut state = session.lock();
        state.dataset_view(&self.session, name)
    }

    /// Whether any row, tombstoned or not, exists in dataset `name`.
    pub fn contains(&self, name: &str) -> bool {
        let Some(session) = self.session.upgrade() else {
            return false;
        };
        let state = session.lock();
        state.mirror().is_some_and(|m| m.has_dataset(name))
    }

    /// Dataset names in insertion order.
    pub fn keys(&self) -> Vec<String> {
        let Some(session) = self.session.upgrade() else {
            return Vec::new();
        };
        let state = session.lock();
        state.mirror().map(|m| m.dataset_names()).unwrap_or_default()
    }
}

impl std::fmt::Debug for DatabaseView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseView").finish_non_exhaustive()
    }
}

impl VirtualRecord for DatabaseView {
    type Output = DatasetView;
    type Input = Json;

    fn read(&self, key: &str) -> Result<Option<DatasetView>, ViewError> {
        Ok(Some(self.dataset(key)))
    }

    fn write(&self, _key: &str, _value: Json) -> Result<(), ViewError> {
        Err(ViewError::read_only(ShapeOp::Set, TARGET))
    }

    fn remove(&self, _key: &str) -> Result<(), ViewError> {
        Err(ViewError::read_only(ShapeOp::Delete, TARGET))
    }

    fn keys(&self) -> Vec<String> {
        DatabaseView::keys(self)
    }

    fn contains(&self, key: &str) -> bool {
        DatabaseView::contains(self, key)
    }

    fn define(&self, _key: &str) -> Result<(), ViewError> {
        Err(ViewError::read_only(ShapeOp::Define, TARGET))
    }
}
