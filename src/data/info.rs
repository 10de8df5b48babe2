use crate::data::index::{CategoricalFeatureIndex, IdentifierIndex, UNKNOWN_INDEX};
use crate::data::schema::{ColumnRef, ColumnRoles, FeatureSide};
use crate::error::{EntityKind, RecError, Result, SchemaError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::info;

/// Bumped whenever the persisted layout of [`DatasetInfo`] changes.
pub const DATASET_INFO_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub column: ColumnRef,
    pub side: FeatureSide,
}

/// First-seen side-feature values per user or per item.
///
/// `sparse_slots` / `dense_slots` are positions inside an encoded record's
/// feature vectors; row 0 of each table belongs to the unknown sentinel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideFeatureTable {
    pub sparse_slots: Vec<usize>,
    pub dense_slots: Vec<usize>,
    pub sparse: Vec<Vec<u32>>,
    pub dense: Vec<Vec<f32>>,
}

impl SideFeatureTable {
    pub(crate) fn new(sparse_slots: Vec<usize>, dense_slots: Vec<usize>, rows: usize) -> Self {
        let sparse = vec![vec![UNKNOWN_INDEX; sparse_slots.len()]; rows];
        let dense = vec![vec![0.0; dense_slots.len()]; rows];
        Self {
            sparse_slots,
            dense_slots,
            sparse,
            dense,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sparse_slots.is_empty() && self.dense_slots.is_empty()
    }

    pub(crate) fn fill(&mut self, entity: u32, sparse_codes: &[u32], dense_values: &[f32]) {
        let row = entity as usize;
        for (k, &slot) in self.sparse_slots.iter().enumerate() {
            self.sparse[row][k] = sparse_codes[slot];
        }
        for (k, &slot) in self.dense_slots.iter().enumerate() {
            self.dense[row][k] = dense_values[slot];
        }
    }

    /// Overwrites the side slots of a record's features with `entity`'s values.
    pub fn apply(&self, entity: u32, sparse_codes: &mut [u32], dense_values: &mut [f32]) {
        let row = entity as usize;
        if row >= self.sparse.len() {
            return;
        }
        for (k, &slot) in self.sparse_slots.iter().enumerate() {
            sparse_codes[slot] = self.sparse[row][k];
        }
        for (k, &slot) in self.dense_slots.iter().enumerate() {
            dense_values[slot] = self.dense[row][k];
        }
    }
}

/// Frozen encoding state shared by training, evaluation and serving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub(crate) format_version: u32,
    pub(crate) roles: ColumnRoles,
    pub(crate) user_index: IdentifierIndex,
    pub(crate) item_index: IdentifierIndex,
    pub(crate) sparse_indexes: Vec<CategoricalFeatureIndex>,
    pub(crate) sparse_columns: Vec<FeatureColumn>,
    pub(crate) dense_columns: Vec<FeatureColumn>,
    pub(crate) n_train_records: usize,
    pub(crate) n_interactions: usize,
    pub(crate) user_features: SideFeatureTable,
    pub(crate) item_features: SideFeatureTable,
}

impl DatasetInfo {
    pub fn roles(&self) -> &ColumnRoles {
        &self.roles
    }

    pub fn user_index(&self) -> &IdentifierIndex {
        &self.user_index
    }

    pub fn item_index(&self) -> &IdentifierIndex {
        &self.item_index
    }

    pub fn sparse_index(&self, column: usize) -> Option<&CategoricalFeatureIndex> {
        self.sparse_indexes.get(column)
    }

    pub fn sparse_columns(&self) -> &[FeatureColumn] {
        &self.sparse_columns
    }

    pub fn dense_columns(&self) -> &[FeatureColumn] {
        &self.dense_columns
    }

    pub fn n_users(&self) -> usize {
        self.user_index.len()
    }

    pub fn n_items(&self) -> usize {
        self.item_index.len()
    }

    pub fn n_train_records(&self) -> usize {
        self.n_train_records
    }

    /// Fraction of the user × item matrix holding at least one training interaction.
    pub fn sparsity(&self) -> f64 {
        let cells = self.n_users() as f64 * self.n_items() as f64;
        if cells == 0.0 {
            0.0
        } else {
            self.n_interactions as f64 / cells
        }
    }

    pub fn user_features(&self) -> &SideFeatureTable {
        &self.user_features
    }

    pub fn item_features(&self) -> &SideFeatureTable {
        &self.item_features
    }

    pub fn user_id(&self, index: u32) -> Option<&str> {
        self.user_index.decode(index)
    }

    pub fn item_id(&self, index: u32) -> Option<&str> {
        self.item_index.decode(index)
    }

    pub fn require_user(&self, raw: &str) -> Result<u32> {
        self.user_index.get(raw).ok_or_else(|| RecError::UnknownEntity {
            kind: EntityKind::User,
            id: raw.to_string(),
        })
    }

    pub fn require_item(&self, raw: &str) -> Result<u32> {
        self.item_index.get(raw).ok_or_else(|| RecError::UnknownEntity {
            kind: EntityKind::Item,
            id: raw.to_string(),
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        info!(
            "Saved dataset info ({} users, {} items) to {}",
            self.n_users(),
            self.n_items(),
            path.display()
        );
        Ok(())
    }

    /// Loads persisted mappings, rejecting other format versions and column
    /// roles that differ from `expected`.
    pub fn load(path: impl AsRef<Path>, expected: &ColumnRoles) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut info: DatasetInfo = serde_json::from_reader(reader)?;

        if info.format_version != DATASET_INFO_VERSION {
            return Err(RecError::Artifact(format!(
                "dataset info format version {} is not supported (expected {})",
                info.format_version, DATASET_INFO_VERSION
            )));
        }
        if &info.roles != expected {
            return Err(SchemaError::Mismatch {
                detail: format!("persisted {:?}, current {:?}", info.roles, expected),
            }
            .into());
        }

        info.user_index.rehydrate();
        info.item_index.rehydrate();
        for index in &mut info.sparse_indexes {
            index.rehydrate();
        }
        Ok(info)
    }
}
