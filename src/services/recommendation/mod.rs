use crate::algorithms::Scorer;
use crate::config::{ServingConfig, UnknownUserPolicy};
use crate::data::{ColumnRoles, Dataset, DatasetInfo, UNKNOWN_INDEX};
use crate::error::{EntityKind, RecError, Result};
use crate::models::{ModelArtifact, RecommendationItem, RecommendationSource};
use crate::services::training::{DATASET_INFO_FILE, MODEL_FILE, SERVING_FILE};
use crate::utils::top_k;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Training-set views needed at serving time: what each user already
/// consumed and how popular each item is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServingState {
    pub consumed: Vec<Vec<u32>>,
    pub popularity: Vec<u32>,
}

impl ServingState {
    pub fn from_dataset(train: &Dataset) -> Self {
        Self {
            consumed: train.user_consumed(),
            popularity: train.item_popularity(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        Ok(serde_json::from_reader(reader)?)
    }
}

pub struct RecommendationService {
    model: Arc<dyn Scorer>,
    info: Arc<DatasetInfo>,
    state: ServingState,
    /// Known items by descending popularity, ties by index.
    popular: Vec<(u32, f32)>,
    config: ServingConfig,
}

impl RecommendationService {
    pub fn new(model: Arc<dyn Scorer>, info: Arc<DatasetInfo>, state: ServingState, config: ServingConfig) -> Result<Self> {
        let users = info.user_index().table_size();
        let items = info.item_index().table_size();
        if model.n_user_rows() != users || model.n_item_rows() != items {
            return Err(RecError::Artifact(format!(
                "model has {} user / {} item rows but the dataset info expects {} / {}",
                model.n_user_rows(),
                model.n_item_rows(),
                users,
                items
            )));
        }
        if state.consumed.len() != users || state.popularity.len() != items {
            return Err(RecError::Artifact(
                "serving state does not match the dataset info".to_string(),
            ));
        }

        let popular = top_k(
            state
                .popularity
                .iter()
                .enumerate()
                .skip(1)
                .map(|(i, &count)| (i as u32, count as f32))
                .collect(),
            items,
        );

        info!("Recommendation service ready: {} users, {} items", info.n_users(), info.n_items());
        Ok(Self {
            model,
            info,
            state,
            popular,
            config,
        })
    }

    /// Loads the artifacts written by a training run from `dir`.
    pub fn from_dir(dir: impl AsRef<Path>, roles: &ColumnRoles, config: ServingConfig) -> Result<Self> {
        let dir = dir.as_ref();
        let info = Arc::new(DatasetInfo::load(dir.join(DATASET_INFO_FILE), roles)?);
        let artifact = ModelArtifact::load(dir.join(MODEL_FILE))?;
        let state = ServingState::load(dir.join(SERVING_FILE))?;
        info!(
            "Loaded {} model {} trained at {}",
            artifact.model.kind, artifact.artifact_id, artifact.created_at
        );
        Self::new(Arc::new(artifact.model), info, state, config)
    }

    pub fn config(&self) -> &ServingConfig {
        &self.config
    }

    /// Resolves a raw user id, or `None` when the popularity fallback applies.
    fn resolve_user(&self, user: &str) -> Result<Option<u32>> {
        match self.info.user_index().get(user) {
            Some(index) => Ok(Some(index)),
            None => match self.config.unknown_user {
                UnknownUserPolicy::Popular => {
                    debug!("Unknown user `{}`, serving popular items", user);
                    Ok(None)
                }
                UnknownUserPolicy::Error => Err(RecError::UnknownEntity {
                    kind: EntityKind::User,
                    id: user.to_string(),
                }),
            },
        }
    }

    fn seen(&self, user: u32) -> &[u32] {
        self.state
            .consumed
            .get(user as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn to_items(&self, ranked: Vec<(u32, f32)>, source: RecommendationSource) -> Vec<RecommendationItem> {
        ranked
            .into_iter()
            .filter_map(|(index, score)| {
                self.info.item_id(index).map(|id| RecommendationItem {
                    item_id: id.to_string(),
                    item_index: index,
                    score,
                    source,
                })
            })
            .collect()
    }

    /// Top `n` items for `user` over the full catalogue.
    pub fn recommend(&self, user: &str, n: usize, exclude_seen: bool) -> Result<Vec<RecommendationItem>> {
        let Some(user_index) = self.resolve_user(user)? else {
            let ranked = self.popular.iter().take(n).copied().collect();
            return Ok(self.to_items(ranked, RecommendationSource::Popularity));
        };
        Ok(self.to_items(self.rank_all(user_index, n, exclude_seen), RecommendationSource::Model))
    }

    /// Ranked `(item index, score)` pairs for a known user index.
    pub fn rank_all(&self, user: u32, n: usize, exclude_seen: bool) -> Vec<(u32, f32)> {
        let scores = self.model.score_all(user);
        let seen: &[u32] = if exclude_seen { self.seen(user) } else { &[] };
        let scored = scores
            .into_iter()
            .enumerate()
            .skip(1)
            .map(|(i, s)| (i as u32, s))
            .filter(|(i, _)| seen.binary_search(i).is_err())
            .collect();
        top_k(scored, n)
    }

    /// Scores only the supplied candidates; ids unknown to the index are
    /// skipped.
    pub fn recommend_from_candidates(
        &self,
        user: &str,
        candidates: &[String],
        n: usize,
        exclude_seen: bool,
    ) -> Result<Vec<RecommendationItem>> {
        let mut indices: Vec<u32> = candidates
            .iter()
            .filter_map(|id| {
                let index = self.info.item_index().get(id);
                if index.is_none() {
                    debug!("Skipping unknown candidate item `{}`", id);
                }
                index
            })
            .filter(|&i| i != UNKNOWN_INDEX)
            .collect();
        indices.sort_unstable();
        indices.dedup();

        let Some(user_index) = self.resolve_user(user)? else {
            let ranked = indices
                .iter()
                .map(|&i| (i, self.state.popularity[i as usize] as f32))
                .collect();
            return Ok(self.to_items(top_k(ranked, n), RecommendationSource::Popularity));
        };

        if exclude_seen {
            let seen = self.seen(user_index);
            indices.retain(|i| seen.binary_search(i).is_err());
        }
        let scores = self.model.score_subset(user_index, &indices);
        let ranked = top_k(indices.into_iter().zip(scores).collect(), n);
        Ok(self.to_items(ranked, RecommendationSource::Model))
    }
}
