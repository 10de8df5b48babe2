use crate::data::index::UNKNOWN_INDEX;
use crate::data::info::DatasetInfo;
use crate::models::EncodedRecord;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub n_records: usize,
    pub n_positive: usize,
    pub n_negative: usize,
    pub n_users: usize,
    pub n_items: usize,
    pub sparsity: f64,
}

/// Ordered encoded records plus the `DatasetInfo` they were encoded with.
#[derive(Debug, Clone)]
pub struct Dataset {
    records: Vec<EncodedRecord>,
    info: Arc<DatasetInfo>,
}

impl Dataset {
    pub fn new(records: Vec<EncodedRecord>, info: Arc<DatasetInfo>) -> Self {
        Self { records, info }
    }

    pub fn records(&self) -> &[EncodedRecord] {
        &self.records
    }

    pub fn info(&self) -> &Arc<DatasetInfo> {
        &self.info
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn positives(&self) -> impl Iterator<Item = &EncodedRecord> + '_ {
        self.records.iter().filter(|r| r.is_positive())
    }

    /// New dataset with `extra` appended after the existing records.
    pub fn with_appended(&self, extra: Vec<EncodedRecord>) -> Dataset {
        let mut records = Vec::with_capacity(self.records.len() + extra.len());
        records.extend_from_slice(&self.records);
        records.extend(extra);
        Dataset::new(records, Arc::clone(&self.info))
    }

    pub fn stats(&self) -> DatasetStats {
        let n_negative = self.records.iter().filter(|r| r.is_negative).count();
        let n_positive = self.positives().count();
        DatasetStats {
            n_records: self.records.len(),
            n_positive,
            n_negative,
            n_users: self.info.n_users(),
            n_items: self.info.n_items(),
            sparsity: self.info.sparsity(),
        }
    }

    /// Sorted, de-duplicated positive items per user index (sentinel row included).
    pub fn user_consumed(&self) -> Vec<Vec<u32>> {
        let mut consumed = vec![Vec::new(); self.info.user_index().table_size()];
        for record in self.positives() {
            if record.user_index == UNKNOWN_INDEX || record.item_index == UNKNOWN_INDEX {
                continue;
            }
            if let Some(items) = consumed.get_mut(record.user_index as usize) {
                items.push(record.item_index);
            }
        }
        for items in &mut consumed {
            items.sort_unstable();
            items.dedup();
        }
        consumed
    }

    /// Positive interaction count per item index.
    pub fn item_popularity(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.info.item_index().table_size()];
        for record in self.positives() {
            if record.item_index != UNKNOWN_INDEX {
                if let Some(count) = counts.get_mut(record.item_index as usize) {
                    *count += 1;
                }
            }
        }
        counts
    }

    pub fn mean_label(&self) -> f32 {
        let (sum, n) = self
            .records
            .iter()
            .filter(|r| !r.is_negative)
            .fold((0.0f64, 0usize), |(s, n), r| (s + r.label as f64, n + 1));
        if n == 0 {
            0.0
        } else {
            (sum / n as f64) as f32
        }
    }
}
