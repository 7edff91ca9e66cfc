//! Column-level access to one `(dataset, id)` row.

use serde::de::DeserializeOwned;
use std::sync::{Arc, Weak};

use crate::change::Change;
use crate::error::{ShapeOp, ViewError};
use crate::session::SessionShared;
use crate::value::{json_kind, Row, Value, ID_COLUMN};
use crate::view::VirtualRecord;

struct RowInner {
    session: Weak<SessionShared>,
    dataset: String,
    id: String,
}

/// View of a single row. Cheap to clone; clones share identity.
#[derive(Clone)]
pub struct RowView {
    inner: Arc<RowInner>,
}

impl RowView {
    pub(crate) fn new(session: Weak<SessionShared>, dataset: &str, id: &str) -> Self {
        Self {
            inner: Arc::new(RowInner {
                session,
                dataset: dataset.to_string(),
                id: id.to_string(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn dataset(&self) -> &str {
        &self.inner.dataset
    }

    /// Whether both handles are the same cached view.
    pub fn ptr_eq(&self, other: &RowView) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read a column. `None` if the row or column is absent, or signed out.
    pub fn get(&self, column: &str) -> Result<Option<Value>, ViewError> {
        let Some(session) = self.inner.session.upgrade() else {
            return Ok(None);
        };
        let state = session.lock();
        let Some(json) = state
            .mirror()
            .and_then(|m| m.row(self.dataset(), self.id()))
            .and_then(|row| row.get(column))
        else {
            return Ok(None);
        };
        match Value::from_json(json) {
            Some(value) => Ok(Some(value)),
            None => Err(ViewError::NonPrimitiveValue {
                dataset: self.dataset().to_string(),
                id: self.id().to_string(),
                column: column.to_string(),
                kind: json_kind(json),
                value: json.to_string(),
            }),
        }
    }

    /// Write one column, creating the row if needed.
    ///
    /// Writing the value already stored is a no-op.
    pub fn set(&self, column: &str, value: impl Into<Value>) -> Result<(), ViewError> {
        let value = value.into();
        let logged_out = || ViewError::logged_out_save(self.dataset(), self.id());
        let session = self.inner.session.upgrade().ok_or_else(logged_out)?;
        let mut state = session.lock();
        let mirror = state.mirror_mut().ok_or_else(logged_out)?;

        if column == ID_COLUMN {
            return match value.as_str() {
                Some(id) if id == self.id() => Ok(()),
                _ => Err(ViewError::IdMismatch {
                    dataset: self.dataset().to_string(),
                    expected: self.id().to_string(),
                    found: value.as_str().map_or_else(|| value.to_string(), str::to_string),
                }),
            };
        }

        let row = mirror.row_mut_or_create(self.dataset(), self.id());
        if row.get(column).and_then(Value::from_json).as_ref() == Some(&value) {
            return Ok(());
        }
        row.insert(column.to_string(), value.to_json());
        session.send(
            &mut state,
            vec![Change::set(self.dataset(), self.id(), column, value)],
        )
    }

    /// Remove one column. The `id` column cannot be removed.
    pub fn remove(&self, column: &str) -> Result<(), ViewError> {
        let logged_out = || ViewError::logged_out_delete(self.dataset(), self.id());
        let session = self.inner.session.upgrade().ok_or_else(logged_out)?;
        let mut state = session.lock();
        let mirror = state.mirror_mut().ok_or_else(logged_out)?;

        if column == ID_COLUMN {
            return Err(ViewError::read_only(
                ShapeOp::Delete,
                format!("{}/{}.{ID_COLUMN}", self.dataset(), self.id()),
            ));
        }

        let removed = mirror
            .row_mut(self.dataset(), self.id())
            .and_then(|row| row.shift_remove(column))
            .is_some();
        if !removed {
            return Ok(());
        }
        session.send(
            &mut state,
            vec![Change::remove(self.dataset(), self.id(), column)],
        )
    }

    /// Column names currently in the row, `id` and `tombstone` included.
    pub fn keys(&self) -> Vec<String> {
        self.snapshot()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.snapshot().is_some_and(|row| row.contains_key(column))
    }

    /// A copy of the stored row.
    pub fn snapshot(&self) -> Option<Row> {
        let session = self.inner.session.upgrade()?;
        let state = session.lock();
        state.mirror()?.row(self.dataset(), self.id()).cloned()
    }

    /// Decode the stored row into a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<Option<T>, ViewError> {
        let Some(row) = self.snapshot() else {
            return Ok(None);
        };
        serde_json::from_value(serde_json::Value::Object(row))
            .map(Some)
            .map_err(|e| ViewError::InvalidValue {
                dataset: self.dataset().to_string(),
                id: self.id().to_string(),
                reason: e.to_string(),
            })
    }

    pub fn define(&self, column: &str) -> Result<(), ViewError> {
        Err(ViewError::read_only(
            ShapeOp::Define,
            format!("{}/{}.{column}", self.dataset(), self.id()),
        ))
    }
}

impl std::fmt::Debug for RowView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowView")
            .field("dataset", &self.inner.dataset)
            .field("id", &self.inner.id)
            .finish()
    }
}

impl VirtualRecord for RowView {
    type Output = Value;
    type Input = Value;

    fn read(&self, key: &str) -> Result<Option<Value>, ViewError> {
        self.get(key)
    }

    fn write(&self, key: &str, value: Value) -> Result<(), ViewError> {
        self.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), ViewError> {
        RowView::remove(self, key)
    }

    fn keys(&self) -> Vec<String> {
        RowView::keys(self)
    }

    fn contains(&self, key: &str) -> bool {
        RowView::contains(self, key)
    }

    fn define(&self, key: &str) -> Result<(), ViewError> {
        RowView::define(self, key)
    }
}
