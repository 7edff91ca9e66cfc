//! Change records and the column-level diff engine.
//!
//! ```text
//!  existing row            proposed row             changes
//! ┌──────────────┐        ┌──────────────┐        ┌─────────────────────┐
//! │ id:   yoda   │        │ id:   yoda   │        │ age  = 943          │
//! │ name: yoda   │  diff  │ name: yoda   │  ───►  │ rank = "master"     │
//! │ age:  942    │ ─────► │ age:  943    │        │ home = <removed>    │
//! │ home: dagoba │        │ rank: master │        └─────────────────────┘
//! └──────────────┘        └──────────────┘
//! ```
//!
//! A `Vec<Change>` is the unit handed to replication per logical mutation.
//! A [`ChangeBatch`] regroups changes as `{dataset: {id: {column: value}}}`,
//! the shape delivered to change listeners.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ViewError;
use crate::value::{is_inexact_integer, json_kind, Row, Value, ID_COLUMN};

/// A single column delta. `value: None` removes the column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub dataset: String,
    pub row: String,
    pub column: String,
    pub value: Option<Value>,
}

impl Change {
    pub fn set(
        dataset: impl Into<String>,
        row: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            row: row.into(),
            column: column.into(),
            value: Some(value.into()),
        }
    }

    pub fn remove(
        dataset: impl Into<String>,
        row: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            row: row.into(),
            column: column.into(),
            value: None,
        }
    }

    /// Apply this change to a row record.
    ///
    /// The `id` column is the row key and is never touched.
    pub fn apply_to(&self, row: &mut Row) {
        if self.column == ID_COLUMN {
            return;
        }
        match &self.value {
            Some(v) => {
                row.insert(self.column.clone(), v.to_json());
            }
            None => {
                row.shift_remove(&self.column);
            }
        }
    }
}

/// A fresh row containing only its `id`.
pub fn new_row(id: &str) -> Row {
    let mut row = Row::new();
    row.insert(ID_COLUMN.to_string(), serde_json::Value::String(id.to_string()));
    row
}

/// Compute the changes turning `existing` into `proposed`.
///
/// Columns of `proposed` come first in their insertion order, followed by
/// removals in `existing`'s order. Fails if `proposed` holds a non-primitive
/// or an integer that would not survive replication as a number.
pub fn diff(
    dataset: &str,
    id: &str,
    existing: Option<&Row>,
    proposed: &Row,
) -> Result<Vec<Change>, ViewError> {
    let mut changes = Vec::new();

    for (column, json) in proposed {
        if is_inexact_integer(json) {
            return Err(ViewError::InvalidValue {
                dataset: dataset.to_string(),
                id: id.to_string(),
                reason: format!("column {column:?} holds {json}, beyond the exact integer range"),
            });
        }
        let value = Value::from_json(json).ok_or_else(|| ViewError::InvalidValue {
            dataset: dataset.to_string(),
            id: id.to_string(),
            reason: format!("column {column:?} holds a non-primitive {}", json_kind(json)),
        })?;
        let unchanged = existing
            .and_then(|row| row.get(column))
            .and_then(Value::from_json)
            .is_some_and(|old| old == value);
        if !unchanged {
            changes.push(Change::set(dataset, id, column.as_str(), value));
        }
    }

    if let Some(existing) = existing {
        for column in existing.keys() {
            if column != ID_COLUMN && !proposed.contains_key(column) {
                changes.push(Change::remove(dataset, id, column.as_str()));
            }
        }
    }

    Ok(changes)
}

/// Column updates for one row.
pub type ColumnChanges = IndexMap<String, Option<Value>>;

/// Changes grouped as `{dataset: {id: {column: value}}}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    datasets: IndexMap<String, IndexMap<String, ColumnChanges>>,
}

impl ChangeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_changes(changes: &[Change]) -> Self {
        let mut batch = Self::new();
        for change in changes {
            batch.push(change);
        }
        batch
    }

    /// Add a change. A later change to the same column replaces the earlier one.
    pub fn push(&mut self, change: &Change) {
        self.datasets
            .entry(change.dataset.clone())
            .or_default()
            .entry(change.row.clone())
            .or_default()
            .insert(change.column.clone(), change.value.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Number of column updates in the batch.
    pub fn len(&self) -> usize {
        self.datasets
            .values()
            .flat_map(|rows| rows.values())
            .map(|cols| cols.len())
            .sum()
    }

    pub fn datasets(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    pub fn row(&self, dataset: &str, id: &str) -> Option<&ColumnChanges> {
        self.datasets.get(dataset)?.get(id)
    }

    /// The update for one column: `Some(None)` is a removal.
    pub fn column(&self, dataset: &str, id: &str, column: &str) -> Option<&Option<Value>> {
        self.row(dataset, id)?.get(column)
    }

    /// Iterate `(dataset, id, columns)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &ColumnChanges)> {
        self.datasets.iter().flat_map(|(dataset, rows)| {
            rows.iter()
                .map(move |(id, cols)| (dataset.as_str(), id.as_str(), cols))
        })
    }

    /// Flatten back into change records.
    pub fn to_changes(&self) -> Vec<Change> {
        self.iter()
            .flat_map(|(dataset, id, cols)| {
                cols.iter().map(move |(column, value)| Change {
                    dataset: dataset.to_string(),
                    row: id.to_string(),
                    column: column.clone(),
                    value: value.clone(),
                })
            })
            .collect()
    }
}
