//! Row-level access to one dataset.
//!
//! Writes replace a row whole: the proposed value is diffed against the stored
//! row (tombstoned or not) and only the differing columns are sent. A deleted
//! row keeps its columns and gains `tombstone: true`; writing it again clears
//! the tombstone and drops every column the new value does not carry.

use serde::Serialize;
use serde_json::Value as Json;
use std::sync::{Arc, Weak};

use crate::change::{diff, new_row, Change};
use crate::error::{ShapeOp, ViewError};
use crate::session::SessionShared;
use crate::value::{json_kind, ID_COLUMN, TOMBSTONE_COLUMN};
use crate::view::{RowView, VirtualRecord};

struct DatasetInner {
    session: Weak<SessionShared>,
    name: String,
}

/// View of one dataset. Cheap to clone; clones share identity.
#[derive(Clone)]
pub struct DatasetView {
    inner: Arc<DatasetInner>,
}

impl DatasetView {
    pub(crate) fn new(session: Weak<SessionShared>, name: &str) -> Self {
        Self {
            inner: Arc::new(DatasetInner {
                session,
                name: name.to_string(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ptr_eq(&self, other: &DatasetView) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The live row `id`, or `None` if missing, tombstoned or signed out.
    pub fn get(&self, id: &str) -> Option<RowView> {
        let session = self.inner.session.upgrade()?;
        let mut state = session.lock();
        state.mirror()?.live_row(self.name(), id)?;
        Some(state.row_view(&self.inner.session, self.name(), id))
    }

    /// The row view for `id` whether or not the row exists.
    ///
    /// Setting a column through it creates the row.
    pub fn row(&self, id: &str) -> RowView {
        let Some(session) = self.inner.session.upgrade() else {
            return RowView::new(Weak::new(), self.name(), id);
        };
        let mut state = session.lock();
        state.row_view(&self.inner.session, self.name(), id)
    }

    /// Replace row `id` with `value`, which must be an object of primitives.
    pub fn put(&self, id: &str, value: Json) -> Result<(), ViewError> {
        let logged_out = || ViewError::logged_out_save(self.name(), id);
        let session = self.inner.session.upgrade().ok_or_else(logged_out)?;
        let mut state = session.lock();
        let mirror = state.mirror_mut().ok_or_else(logged_out)?;

        let proposed = match value {
            Json::Object(row) => row,
            other => {
                return Err(ViewError::InvalidValue {
                    dataset: self.name().to_string(),
                    id: id.to_string(),
                    reason: format!("expected an object, got {}", json_kind(&other)),
                })
            }
        };
        let proposed = match proposed.get(ID_COLUMN).cloned() {
            Some(Json::String(found)) if found == id => proposed,
            Some(found) => {
                return Err(ViewError::IdMismatch {
                    dataset: self.name().to_string(),
                    expected: id.to_string(),
                    found: found.as_str().map_or_else(|| found.to_string(), str::to_string),
                })
            }
            None => {
                let mut stamped = new_row(id);
                stamped.extend(proposed);
                stamped
            }
        };

        let changes = diff(self.name(), id, mirror.row(self.name(), id), &proposed)?;
        mirror.replace_row(self.name(), id, proposed);
        if changes.is_empty() {
            return Ok(());
        }
        session.send(&mut state, changes)
    }

    /// Serialize `value` and [`put`](Self::put) it.
    pub fn put_as<T: Serialize>(&self, id: &str, value: &T) -> Result<(), ViewError> {
        let json = serde_json::to_value(value).map_err(|e| ViewError::InvalidValue {
            dataset: self.name().to_string(),
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        self.put(id, json)
    }

    /// Tombstone row `id`. Missing or already deleted rows are left alone.
    pub fn delete(&self, id: &str) -> Result<(), ViewError> {
        let logged_out = || ViewError::logged_out_delete(self.name(), id);
        let session = self.inner.session.upgrade().ok_or_else(logged_out)?;
        let mut state = session.lock();
        let mirror = state.mirror_mut().ok_or_else(logged_out)?;

        if mirror.live_row(self.name(), id).is_none() {
            return Ok(());
        }
        let row = mirror.row_mut_or_create(self.name(), id);
        row.insert(TOMBSTONE_COLUMN.to_string(), Json::Bool(true));
        session.send(
            &mut state,
            vec![Change::set(self.name(), id, TOMBSTONE_COLUMN, true)],
        )
    }

    /// Ids of live rows, in insertion order.
    pub fn ids(&self) -> Vec<String> {
        let Some(session) = self.inner.session.upgrade() else {
            return Vec::new();
        };
        let state = session.lock();
        state
            .mirror()
            .map(|m| m.live_ids(self.name()))
            .unwrap_or_default()
    }

    pub fn contains(&self, id: &str) -> bool {
        let Some(session) = self.inner.session.upgrade() else {
            return false;
        };
        let state = session.lock();
        state
            .mirror()
            .is_some_and(|m| m.live_row(self.name(), id).is_some())
    }

    pub fn define(&self, _id: &str) -> Result<(), ViewError> {
        Err(ViewError::read_only(ShapeOp::Define, self.name()))
    }
}

impl std::fmt::Debug for DatasetView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetView")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl VirtualRecord for DatasetView {
    type Output = RowView;
    type Input = Json;

    fn read(&self, key: &str) -> Result<Option<RowView>, ViewError> {
        Ok(self.get(key))
    }

    fn write(&self, key: &str, value: Json) -> Result<(), ViewError> {
        self.put(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), ViewError> {
        self.delete(key)
    }

    fn keys(&self) -> Vec<String> {
        self.ids()
    }

    fn contains(&self, key: &str) -> bool {
        DatasetView::contains(self, key)
    }

    fn define(&self, key: &str) -> Result<(), ViewError> {
        DatasetView::define(self, key)
    }
}
