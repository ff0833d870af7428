use indexmap::IndexMap;

use crate::models::NormalizedRecord;

/// Records waiting for the next flush, keyed by external id.
///
/// A later sighting of the same external id replaces the earlier one so a
/// single statement never touches the same row twice.
#[derive(Debug, Default)]
pub struct BatchBuffer {
    records: IndexMap<String, NormalizedRecord>,
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the record replaced a buffered one.
    pub fn push(&mut self, record: NormalizedRecord) -> bool {
        self.records
            .insert(record.external_id().to_string(), record)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self, threshold: usize) -> bool {
        self.records.len() >= threshold
    }

    pub fn records(&self) -> Vec<&NormalizedRecord> {
        self.records.values().collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
