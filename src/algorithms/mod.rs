pub mod als;
pub mod initializer;
pub mod optimizer;
pub mod sampler;
pub mod svd;

use crate::data::Dataset;
use crate::error::Result;
use crate::models::{FactorModel, Hyperparameters, TrainingReport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use als::AlsTrainer;
pub use sampler::{NegativeSampler, SamplingStats};
pub use svd::SvdTrainer;

/// Cooperative stop signal, checked by trainers before every epoch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A factorization strategy that fits a [`FactorModel`] from a dataset.
///
/// A failed `fit` leaves any previously fitted model in place.
pub trait Trainer: Send {
    fn fit(&mut self, dataset: &Dataset, cancel: &CancellationToken) -> Result<TrainingReport>;
    fn model(&self) -> Option<&FactorModel>;
    fn take_model(&mut self) -> Option<FactorModel>;
    fn hyperparameters(&self) -> Hyperparameters;

    /// Negative sampling totals from the last successful `fit`, when the
    /// trainer drew its own negatives.
    fn sampling_stats(&self) -> Option<&SamplingStats> {
        None
    }
}

/// Read-only scoring surface used by evaluation and serving.
pub trait Scorer: Send + Sync {
    /// Rows in the item table, sentinel included.
    fn n_item_rows(&self) -> usize;
    fn n_user_rows(&self) -> usize;
    fn predict(&self, user: u32, item: u32) -> f32;
    /// Scores for every item row in index order.
    fn score_all(&self, user: u32) -> Vec<f32>;

    fn score_subset(&self, user: u32, items: &[u32]) -> Vec<f32> {
        items.iter().map(|&item| self.predict(user, item)).collect()
    }
}

impl Scorer for FactorModel {
    fn n_item_rows(&self) -> usize {
        FactorModel::n_item_rows(self)
    }

    fn n_user_rows(&self) -> usize {
        FactorModel::n_user_rows(self)
    }

    fn predict(&self, user: u32, item: u32) -> f32 {
        FactorModel::predict(self, user, item)
    }

    fn score_all(&self, user: u32) -> Vec<f32> {
        FactorModel::score_all(self, user)
    }

    fn score_subset(&self, user: u32, items: &[u32]) -> Vec<f32> {
        FactorModel::score_subset(self, user, items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
