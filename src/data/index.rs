use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Index reserved for identifiers or categories not seen at build time.
pub const UNKNOWN_INDEX: u32 = 0;

/// Bidirectional mapping between raw values and dense internal indices.
///
/// Known values are numbered `1..=len()` in first-seen order; `0` is the
/// unknown sentinel. The index is only mutable through [`IndexBuilder`], so
/// once a `DatasetInfo` holds it the mapping is frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierIndex {
    values: Vec<String>,
    #[serde(skip)]
    lookup: HashMap<String, u32>,
}

impl IdentifierIndex {
    fn from_values(values: Vec<String>) -> Self {
        let lookup = values
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i as u32 + 1))
            .collect();
        Self { values, lookup }
    }

    /// Rebuilds the lookup table after deserialization.
    pub(crate) fn rehydrate(&mut self) {
        if self.lookup.len() != self.values.len() {
            *self = Self::from_values(std::mem::take(&mut self.values));
        }
    }

    /// Number of known values, excluding the sentinel.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Rows needed by a table indexed by this mapping (sentinel included).
    pub fn table_size(&self) -> usize {
        self.values.len() + 1
    }

    pub fn get(&self, raw: &str) -> Option<u32> {
        self.lookup.get(raw).copied()
    }

    pub fn encode(&self, raw: &str) -> u32 {
        self.get(raw).unwrap_or(UNKNOWN_INDEX)
    }

    pub fn decode(&self, index: u32) -> Option<&str> {
        if index == UNKNOWN_INDEX {
            return None;
        }
        self.values.get(index as usize - 1).map(|s| s.as_str())
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}

/// Per-column category mapping; same sentinel policy as identifiers.
pub type CategoricalFeatureIndex = IdentifierIndex;

#[derive(Debug, Default)]
pub struct IndexBuilder {
    values: Vec<String>,
    lookup: HashMap<String, u32>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, raw: &str) -> u32 {
        if let Some(&index) = self.lookup.get(raw) {
            return index;
        }
        self.values.push(raw.to_string());
        let index = self.values.len() as u32;
        self.lookup.insert(raw.to_string(), index);
        index
    }

    pub fn freeze(self) -> IdentifierIndex {
        IdentifierIndex {
            values: self.values,
            lookup: self.lookup,
        }
    }
}
