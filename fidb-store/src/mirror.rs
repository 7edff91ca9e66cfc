//! In-memory mirror of every known row.
//!
//! Authoritative for reads. Tombstoned rows stay in the mirror so that a later
//! write to the same id diffs against them, but they are hidden from
//! enumeration and existence checks.

use indexmap::IndexMap;

use crate::change::{new_row, Change, ChangeBatch};
use crate::value::{is_tombstoned, Row};

/// Rows of one dataset, keyed by id.
pub type DatasetRows = IndexMap<String, Row>;

#[derive(Debug, Clone, Default)]
pub struct Mirror {
    datasets: IndexMap<String, DatasetRows>,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mirror from a loaded snapshot.
    pub fn from_datasets(datasets: IndexMap<String, DatasetRows>) -> Self {
        Self { datasets }
    }

    pub fn has_dataset(&self, name: &str) -> bool {
        self.datasets.contains_key(name)
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.datasets.keys().cloned().collect()
    }

    /// The stored row, tombstoned or not.
    pub fn row(&self, dataset: &str, id: &str) -> Option<&Row> {
        self.datasets.get(dataset)?.get(id)
    }

    /// The stored row if it exists and is not tombstoned.
    pub fn live_row(&self, dataset: &str, id: &str) -> Option<&Row> {
        self.row(dataset, id).filter(|row| !is_tombstoned(row))
    }

    /// Ids of non-tombstoned rows, in insertion order.
    pub fn live_ids(&self, dataset: &str) -> Vec<String> {
        self.datasets
            .get(dataset)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, row)| !is_tombstoned(row))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn row_mut(&mut self, dataset: &str, id: &str) -> Option<&mut Row> {
        self.datasets.get_mut(dataset)?.get_mut(id)
    }

    /// The row for `(dataset, id)`, created as `{id}` if missing.
    pub fn row_mut_or_create(&mut self, dataset: &str, id: &str) -> &mut Row {
        self.datasets
            .entry(dataset.to_string())
            .or_default()
            .entry(id.to_string())
            .or_insert_with(|| new_row(id))
    }

    /// Replace a row whole (no merge).
    pub fn replace_row(&mut self, dataset: &str, id: &str, row: Row) {
        self.datasets
            .entry(dataset.to_string())
            .or_default()
            .insert(id.to_string(), row);
    }

    pub fn apply(&mut self, change: &Change) {
        let row = self.row_mut_or_create(&change.dataset, &change.row);
        change.apply_to(row);
    }

    pub fn apply_batch(&mut self, batch: &ChangeBatch) {
        for change in batch.to_changes() {
            self.apply(&change);
        }
    }

    pub fn datasets(&self) -> &IndexMap<String, DatasetRows> {
        &self.datasets
    }

    /// Total number of rows, tombstones included.
    pub fn row_count(&self) -> usize {
        self.datasets.values().map(|rows| rows.len()).sum()
    }
}
