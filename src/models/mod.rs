use crate::error::{RecError, Result};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Bumped whenever the persisted layout of [`ModelArtifact`] changes.
pub const MODEL_ARTIFACT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedRecord {
    pub user_index: u32,
    pub item_index: u32,
    pub label: f32,
    pub sparse_codes: Vec<u32>,
    pub dense_values: Vec<f32>,
    pub is_negative: bool,
}

impl EncodedRecord {
    pub fn negative(user_index: u32, item_index: u32, sparse_codes: Vec<u32>, dense_values: Vec<f32>) -> Self {
        Self {
            user_index,
            item_index,
            label: 0.0,
            sparse_codes,
            dense_values,
            is_negative: true,
        }
    }

    /// An observed interaction with positive strength.
    pub fn is_positive(&self) -> bool {
        !self.is_negative && self.label > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Als,
    Svd,
    SvdPlusPlus,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Als => write!(f, "als"),
            ModelKind::Svd => write!(f, "svd"),
            ModelKind::SvdPlusPlus => write!(f, "svd++"),
        }
    }
}

/// Fitted factor matrices. Row 0 of every per-user / per-item table is the
/// unknown sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorModel {
    pub kind: ModelKind,
    pub user_factors: Array2<f32>,
    pub item_factors: Array2<f32>,
    pub user_bias: Option<Array1<f32>>,
    pub item_bias: Option<Array1<f32>>,
    pub global_bias: f32,
    pub implicit_factors: Option<Array2<f32>>,
    /// Mean implicit factor over each user's consumed items (SVD++ only).
    pub user_implicit: Option<Array2<f32>>,
}

impl FactorModel {
    pub fn new(kind: ModelKind, user_factors: Array2<f32>, item_factors: Array2<f32>) -> Self {
        Self {
            kind,
            user_factors,
            item_factors,
            user_bias: None,
            item_bias: None,
            global_bias: 0.0,
            implicit_factors: None,
            user_implicit: None,
        }
    }

    pub fn n_factors(&self) -> usize {
        self.user_factors.ncols()
    }

    pub fn n_user_rows(&self) -> usize {
        self.user_factors.nrows()
    }

    pub fn n_item_rows(&self) -> usize {
        self.item_factors.nrows()
    }

    /// Effective user vector: `p_u`, plus the implicit term for SVD++.
    pub fn user_vector(&self, user: u32) -> Array1<f32> {
        let u = user as usize;
        if u >= self.n_user_rows() {
            return Array1::zeros(self.n_factors());
        }
        let mut vector = self.user_factors.row(u).to_owned();
        if let Some(implicit) = &self.user_implicit {
            vector += &implicit.row(u);
        }
        vector
    }

    fn offset(&self, user: u32) -> f32 {
        let user_bias = self
            .user_bias
            .as_ref()
            .and_then(|b| b.get(user as usize).copied())
            .unwrap_or(0.0);
        self.global_bias + user_bias
    }

    fn item_term(&self, item: usize, user_vector: ArrayView1<f32>) -> f32 {
        let bias = self.item_bias.as_ref().map(|b| b[item]).unwrap_or(0.0);
        bias + self.item_factors.row(item).dot(&user_vector)
    }

    pub fn predict(&self, user: u32, item: u32) -> f32 {
        let i = item as usize;
        if i >= self.n_item_rows() {
            return self.offset(user);
        }
        let vector = self.user_vector(user);
        self.offset(user) + self.item_term(i, vector.view())
    }

    /// Scores for every item row (sentinel included) in index order.
    pub fn score_all(&self, user: u32) -> Vec<f32> {
        let vector = self.user_vector(user);
        let mut scores = self.item_factors.dot(&vector);
        if let Some(bias) = &self.item_bias {
            scores += bias;
        }
        scores += self.offset(user);
        scores.to_vec()
    }

    pub fn score_subset(&self, user: u32, items: &[u32]) -> Vec<f32> {
        let vector = self.user_vector(user);
        let offset = self.offset(user);
        items
            .iter()
            .map(|&item| {
                let i = item as usize;
                if i < self.n_item_rows() {
                    offset + self.item_term(i, vector.view())
                } else {
                    offset
                }
            })
            .collect()
    }

    /// Recomputes the SVD++ per-user aggregate from consumed item lists.
    pub fn refresh_user_implicit(&mut self, consumed: &[Vec<u32>]) {
        let Some(implicit) = &self.implicit_factors else {
            return;
        };
        let mut aggregate = Array2::<f32>::zeros((self.n_user_rows(), self.n_factors()));
        for (u, items) in consumed.iter().enumerate().take(self.n_user_rows()) {
            if items.is_empty() {
                continue;
            }
            let mut row = aggregate.row_mut(u);
            for &j in items {
                row += &implicit.row(j as usize);
            }
            row /= items.len() as f32;
        }
        self.user_implicit = Some(aggregate);
    }

    pub fn all_finite(&self) -> bool {
        let matrices = [
            Some(&self.user_factors),
            Some(&self.item_factors),
            self.implicit_factors.as_ref(),
            self.user_implicit.as_ref(),
        ];
        let vectors = [self.user_bias.as_ref(), self.item_bias.as_ref()];
        self.global_bias.is_finite()
            && matrices.iter().flatten().all(|m| m.iter().all(|v| v.is_finite()))
            && vectors.iter().flatten().all(|v| v.iter().all(|x| x.is_finite()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Users,
    Items,
    Sgd,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Users => write!(f, "user phase"),
            Phase::Items => write!(f, "item phase"),
            Phase::Sgd => write!(f, "sgd epoch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseLoss {
    pub epoch: usize,
    pub phase: Phase,
    pub loss: f64,
}

/// Outcome metadata of one `fit` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs_completed: usize,
    pub converged: bool,
    pub cancelled: bool,
    pub history: Vec<PhaseLoss>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl TrainingReport {
    pub fn start() -> Self {
        Self {
            epochs_completed: 0,
            converged: false,
            cancelled: false,
            history: Vec::new(),
            started_at: Utc::now(),
            elapsed_ms: 0,
        }
    }

    pub fn record(&mut self, epoch: usize, phase: Phase, loss: f64) {
        self.history.push(PhaseLoss { epoch, phase, loss });
    }

    pub fn final_loss(&self) -> Option<f64> {
        self.history.last().map(|h| h.loss)
    }

    pub fn finish(mut self) -> Self {
        let elapsed = Utc::now().signed_duration_since(self.started_at);
        self.elapsed_ms = elapsed.num_milliseconds().max(0) as u64;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub kind: ModelKind,
    pub factors: usize,
    pub regularization: f32,
    pub epochs: usize,
    pub learning_rate: Option<f32>,
    pub alpha: Option<f32>,
    pub seed: u64,
}

/// Everything needed to evaluate or serve without retraining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub artifact_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub hyperparameters: Hyperparameters,
    pub report: TrainingReport,
    pub model: FactorModel,
}

impl ModelArtifact {
    pub fn new(model: FactorModel, hyperparameters: Hyperparameters, report: TrainingReport) -> Self {
        Self {
            format_version: MODEL_ARTIFACT_VERSION,
            artifact_id: Uuid::new_v4(),
            created_at: Utc::now(),
            hyperparameters,
            report,
            model,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        info!(
            "Saved {} model artifact {} to {}",
            self.model.kind,
            self.artifact_id,
            path.display()
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let artifact: ModelArtifact = serde_json::from_reader(reader)?;
        if artifact.format_version != MODEL_ARTIFACT_VERSION {
            return Err(RecError::Artifact(format!(
                "model artifact format version {} is not supported (expected {})",
                artifact.format_version, MODEL_ARTIFACT_VERSION
            )));
        }
        crate::utils::validation::validate_model(&artifact.model, artifact.hyperparameters.factors)?;
        Ok(artifact)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationSource {
    Model,
    Popularity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationItem {
    pub item_id: String,
    pub item_index: u32,
    pub score: f32,
    pub source: RecommendationSource,
}
