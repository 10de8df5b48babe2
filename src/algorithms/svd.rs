//! Biased matrix factorization (SVD) and its implicit-neighborhood variant
//! (SVD++) trained with sequential SGD.

use crate::algorithms::optimizer::{GradientGuard, Sgd};
use crate::algorithms::sampler::{NegativeSampler, SamplingStats};
use crate::algorithms::{CancellationToken, Trainer};
use crate::config::{SvdConfig, Task};
use crate::data::{Dataset, UNKNOWN_INDEX};
use crate::error::{RecError, Result};
use crate::models::{EncodedRecord, FactorModel, Hyperparameters, ModelKind, Phase, TrainingReport};
use crate::utils::validation::validate_svd_config;
use crate::utils::{dot, sigmoid};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::borrow::Cow;
use tracing::{debug, info, warn};

/// Mutable parameter arena for one `fit` call.
struct Params {
    k: usize,
    users: Vec<f32>,
    items: Vec<f32>,
    implicit: Option<Vec<f32>>,
    user_bias: Vec<f32>,
    item_bias: Vec<f32>,
    global_bias: f32,
}

fn row(data: &[f32], index: usize, k: usize) -> &[f32] {
    &data[index * k..(index + 1) * k]
}

fn row_mut(data: &mut [f32], index: usize, k: usize) -> &mut [f32] {
    &mut data[index * k..(index + 1) * k]
}

pub struct SvdTrainer {
    config: SvdConfig,
    plus_plus: bool,
    sampler: Option<NegativeSampler>,
    sampling: Option<SamplingStats>,
    model: Option<FactorModel>,
}

impl SvdTrainer {
    pub fn svd(config: SvdConfig) -> Self {
        Self {
            config,
            plus_plus: false,
            sampler: None,
            sampling: None,
            model: None,
        }
    }

    pub fn svd_plus_plus(config: SvdConfig) -> Self {
        Self {
            plus_plus: true,
            ..Self::svd(config)
        }
    }

    /// Draws fresh negatives from `sampler` before every epoch of a ranking
    /// fit. Rating fits ignore negatives and never call it.
    pub fn with_sampler(mut self, sampler: NegativeSampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn config(&self) -> &SvdConfig {
        &self.config
    }

    fn kind(&self) -> ModelKind {
        if self.plus_plus {
            ModelKind::SvdPlusPlus
        } else {
            ModelKind::Svd
        }
    }

    fn target(&self, record: &EncodedRecord) -> f32 {
        match self.config.task {
            Task::Rating => record.label,
            Task::Ranking => {
                if record.is_positive() {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    fn training_records<'a>(&self, dataset: &'a Dataset) -> Vec<&'a EncodedRecord> {
        dataset
            .records()
            .iter()
            .filter(|r| r.user_index != UNKNOWN_INDEX && r.item_index != UNKNOWN_INDEX)
            .filter(|r| self.config.task == Task::Ranking || !r.is_negative)
            .collect()
    }

    fn init_params(&self, dataset: &Dataset, rng: &mut StdRng) -> Params {
        let k = self.config.factors;
        let n_users = dataset.info().user_index().table_size();
        let n_items = dataset.info().item_index().table_size();
        let init = &self.config.init;

        let users = init.initialize_factors(rng, n_users, k).into_raw_vec();
        let items = init.initialize_factors(rng, n_items, k).into_raw_vec();
        let implicit = self
            .plus_plus
            .then(|| init.initialize_factors(rng, n_items, k).into_raw_vec());
        let global_bias = match self.config.task {
            Task::Rating => dataset.mean_label(),
            Task::Ranking => 0.0,
        };

        Params {
            k,
            users,
            items,
            implicit,
            user_bias: vec![0.0; n_users],
            item_bias: vec![0.0; n_items],
            global_bias,
        }
    }

    /// Runs one pass over `order`; returns the mean data loss.
    #[allow(clippy::too_many_arguments)]
    fn run_epoch(
        &self,
        params: &mut Params,
        records: &[&EncodedRecord],
        order: &[usize],
        consumed: &[Vec<u32>],
        guard: &mut GradientGuard,
        learning_rate: f32,
        epoch: usize,
    ) -> Result<f64> {
        let k = params.k;
        let sgd = Sgd::new(learning_rate, self.config.regularization);
        let mut implicit_sum = vec![0.0f32; k];
        let mut user_vector = vec![0.0f32; k];
        let mut grad_user = vec![0.0f32; k];
        let mut grad_item = vec![0.0f32; k];
        let mut total_loss = 0.0f64;

        for &position in order {
            let record = records[position];
            let u = record.user_index as usize;
            let i = record.item_index as usize;
            let neighbors = consumed.get(u).map(Vec::as_slice).unwrap_or(&[]);

            user_vector.copy_from_slice(row(&params.users, u, k));
            if let Some(implicit) = &params.implicit {
                implicit_sum.iter_mut().for_each(|v| *v = 0.0);
                if !neighbors.is_empty() {
                    for &j in neighbors {
                        for (s, y) in implicit_sum.iter_mut().zip(row(implicit, j as usize, k)) {
                            *s += y;
                        }
                    }
                    let norm = neighbors.len() as f32;
                    for (v, s) in user_vector.iter_mut().zip(&implicit_sum) {
                        *v += s / norm;
                    }
                }
            }

            let score = params.global_bias
                + params.user_bias[u]
                + params.item_bias[i]
                + dot(&user_vector, row(&params.items, i, k));
            let target = self.target(record);
            let error = match self.config.task {
                Task::Rating => target - score,
                Task::Ranking => target - sigmoid(score),
            };
            if !error.is_finite() {
                return Err(RecError::divergence(
                    epoch,
                    Phase::Sgd.to_string(),
                    format!(
                        "non-finite prediction error at record {} (user {}, item {})",
                        position, u, i
                    ),
                ));
            }
            total_loss += match self.config.task {
                Task::Rating => (error as f64).powi(2),
                Task::Ranking => {
                    let p = (sigmoid(score) as f64).clamp(1e-7, 1.0 - 1e-7);
                    if target > 0.0 {
                        -p.ln()
                    } else {
                        -(1.0 - p).ln()
                    }
                }
            };

            for (g, q) in grad_user.iter_mut().zip(row(&params.items, i, k)) {
                *g = error * q;
            }
            for (g, v) in grad_item.iter_mut().zip(&user_vector) {
                *g = error * v;
            }
            let mut grad_bias = [error, error];
            guard.clip(&mut [grad_user.as_mut_slice(), grad_item.as_mut_slice(), &mut grad_bias[..]]);
            if guard.tripped() {
                return Err(RecError::divergence(
                    epoch,
                    Phase::Sgd.to_string(),
                    format!(
                        "gradient norm limit exceeded on {} consecutive updates (last record {})",
                        guard.consecutive(),
                        position
                    ),
                ));
            }

            params.global_bias += learning_rate * grad_bias[0];
            sgd.step_scalar(&mut params.user_bias[u], grad_bias[0]);
            sgd.step_scalar(&mut params.item_bias[i], grad_bias[1]);
            sgd.step(row_mut(&mut params.users, u, k), &grad_user);
            sgd.step(row_mut(&mut params.items, i, k), &grad_item);
            if let Some(implicit) = params.implicit.as_mut() {
                if !neighbors.is_empty() {
                    let norm = neighbors.len() as f32;
                    grad_user.iter_mut().for_each(|g| *g /= norm);
                    for &j in neighbors {
                        sgd.step(row_mut(implicit, j as usize, k), &grad_user);
                    }
                }
            }
        }

        Ok(total_loss / order.len().max(1) as f64)
    }

    fn build_model(&self, params: Params, consumed: &[Vec<u32>]) -> Result<FactorModel> {
        let k = params.k;
        let n_users = params.user_bias.len();
        let n_items = params.item_bias.len();
        let shape = |rows: usize, data: Vec<f32>| {
            Array2::from_shape_vec((rows, k), data).map_err(|e| RecError::Artifact(e.to_string()))
        };

        let mut model = FactorModel::new(self.kind(), shape(n_users, params.users)?, shape(n_items, params.items)?);
        model.user_bias = Some(Array1::from(params.user_bias));
        model.item_bias = Some(Array1::from(params.item_bias));
        model.global_bias = params.global_bias;
        if let Some(implicit) = params.implicit {
            model.implicit_factors = Some(shape(n_items, implicit)?);
            model.refresh_user_implicit(consumed);
        }
        Ok(model)
    }
}

impl Trainer for SvdTrainer {
    fn fit(&mut self, dataset: &Dataset, cancel: &CancellationToken) -> Result<TrainingReport> {
        validate_svd_config(&self.config)?;
        let base_records = self.training_records(dataset);
        let sampler = match (&self.sampler, self.config.task) {
            (Some(sampler), Task::Ranking) => Some(sampler),
            (Some(_), Task::Rating) => {
                debug!("{} rating fit skips negative sampling", self.kind());
                None
            }
            (None, _) => None,
        };
        let mut sampling = sampler.map(|_| SamplingStats::default());
        let consumed = if self.plus_plus {
            dataset.user_consumed()
        } else {
            Vec::new()
        };

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut params = self.init_params(dataset, &mut rng);
        let mut guard = GradientGuard::new(self.config.max_grad_norm, self.config.guard_patience);
        let mut order: Vec<usize> = (0..base_records.len()).collect();

        info!(
            "Fitting {}: {} records, k={}, lr={}, task {:?}",
            self.kind(),
            base_records.len(),
            self.config.factors,
            self.config.learning_rate,
            self.config.task
        );

        let mut report = TrainingReport::start();
        let mut previous: Option<f64> = None;

        for epoch in 1..=self.config.epochs {
            if cancel.is_cancelled() {
                info!("{} cancelled before epoch {}", self.kind(), epoch);
                report.cancelled = true;
                break;
            }

            let resampled = match (sampler, sampling.as_mut()) {
                (Some(sampler), Some(totals)) => {
                    let (sampled, stats) = sampler.sample_epoch(dataset, dataset.info(), (epoch - 1) as u64)?;
                    totals.merge(&stats);
                    Some(sampled)
                }
                _ => None,
            };
            let records: Cow<'_, [&EncodedRecord]> = match &resampled {
                Some(sampled) => Cow::Owned(self.training_records(sampled)),
                None => Cow::Borrowed(&base_records[..]),
            };
            if order.len() != records.len() {
                order = (0..records.len()).collect();
            }

            let learning_rate = self.config.schedule.rate_at(self.config.learning_rate, epoch - 1);
            order.shuffle(&mut rng);
            let loss = self.run_epoch(&mut params, &records, &order, &consumed, &mut guard, learning_rate, epoch)?;

            report.record(epoch, Phase::Sgd, loss);
            report.epochs_completed = epoch;
            info!(
                "{} epoch {}/{}: loss {:.6} (lr {:.5})",
                self.kind(),
                epoch,
                self.config.epochs,
                loss,
                learning_rate
            );

            if let (Some(tolerance), Some(prev)) = (self.config.convergence_tolerance, previous) {
                let change = (prev - loss).abs() / prev.abs().max(f64::EPSILON);
                if change < tolerance {
                    info!("{} converged after {} epochs", self.kind(), epoch);
                    report.converged = true;
                    break;
                }
            }
            previous = Some(loss);
        }

        if guard.clipped_total() > 0 {
            warn!("Gradient clipping applied to {} updates", guard.clipped_total());
        }

        let model = self.build_model(params, &consumed)?;
        if !model.all_finite() {
            return Err(RecError::divergence(
                report.epochs_completed,
                Phase::Sgd.to_string(),
                "fitted parameters contain non-finite values",
            ));
        }
        debug!("{} global bias {:.4}", self.kind(), model.global_bias);
        self.model = Some(model);
        self.sampling = sampling;
        Ok(report.finish())
    }

    fn model(&self) -> Option<&FactorModel> {
        self.model.as_ref()
    }

    fn sampling_stats(&self) -> Option<&SamplingStats> {
        self.sampling.as_ref()
    }

    fn take_model(&mut self) -> Option<FactorModel> {
        self.model.take()
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters {
            kind: self.kind(),
            factors: self.config.factors,
            regularization: self.config.regularization,
            epochs: self.config.epochs,
            learning_rate: Some(self.config.learning_rate),
            alpha: None,
            seed: self.config.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::initializer::{self, InitializationMethod};
    use crate::algorithms::optimizer::LearningRateSchedule;
    use crate::config::SamplingConfig;
    use crate::data::{build_and_encode, ColumnRoles, RawTable};
    use crate::utils::metrics::{rmse, roc_auc};
    use rand::Rng;
    use std::sync::Arc;

    const RATING_NOISE: f32 = 0.1;

    /// Ratings from a rank-2 biased model with Gaussian label noise, plus the
    /// noise-free rating of every record in record order.
    fn noisy_ratings() -> (Dataset, Vec<f32>) {
        let mut rng = StdRng::seed_from_u64(17);
        let (n_users, n_items, k) = (30, 20, 2);
        let p: Vec<f32> = (0..n_users * k).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let q: Vec<f32> = (0..n_items * k).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let bu: Vec<f32> = (0..n_users).map(|_| rng.gen_range(-0.5..0.5)).collect();
        let bi: Vec<f32> = (0..n_items).map(|_| rng.gen_range(-0.5..0.5)).collect();
        let noise = initializer::normal(&mut rng, n_users * n_items, 0.0, RATING_NOISE);

        let mut rows = Vec::new();
        let mut truth = Vec::new();
        for u in 0..n_users {
            for i in 0..n_items {
                let rating = 3.0 + bu[u] + bi[i] + dot(row(&p, u, k), row(&q, i, k));
                let observed = rating + noise[u * n_items + i];
                rows.push(vec![format!("u{}", u), format!("i{}", i), observed.to_string()]);
                truth.push(rating);
            }
        }
        let table = RawTable::new(&["user", "item", "label"], rows);
        (build_and_encode(&table, &ColumnRoles::default()).unwrap().1, truth)
    }

    fn synthetic_ratings() -> Dataset {
        noisy_ratings().0
    }

    fn rating_config() -> SvdConfig {
        SvdConfig {
            factors: 2,
            learning_rate: 0.02,
            regularization: 0.0005,
            epochs: 400,
            init: InitializationMethod::Normal { std_dev: 0.1 },
            ..SvdConfig::default()
        }
    }

    fn predictions(model: &FactorModel, dataset: &Dataset) -> Vec<f32> {
        dataset
            .records()
            .iter()
            .map(|r| model.predict(r.user_index, r.item_index))
            .collect()
    }

    fn train_rmse(model: &FactorModel, dataset: &Dataset) -> f64 {
        let labels: Vec<f32> = dataset.records().iter().map(|r| r.label).collect();
        rmse(&predictions(model, dataset), &labels)
    }

    #[test]
    fn test_svd_recovers_known_model() {
        let (dataset, truth) = noisy_ratings();
        assert_eq!(truth.len(), dataset.len());
        let mean = dataset.mean_label();
        let baseline = rmse(&vec![mean; truth.len()], &truth);

        let mut trainer = SvdTrainer::svd(rating_config());
        let report = trainer.fit(&dataset, &CancellationToken::new()).unwrap();
        let model = trainer.model().unwrap();
        let to_truth = rmse(&predictions(model, &dataset), &truth);
        let to_labels = train_rmse(model, &dataset);

        assert_eq!(report.epochs_completed, 400);
        assert!(to_truth < 0.15, "rmse against noise-free ratings {}", to_truth);
        assert!(to_truth < 0.3 * baseline, "rmse {} baseline {}", to_truth, baseline);
        // the fit tracks the low-rank signal more closely than the noisy labels
        assert!(to_truth < to_labels, "truth {} labels {}", to_truth, to_labels);
        let first = report.history.first().unwrap().loss;
        assert!(report.final_loss().unwrap() < first);
    }

    #[test]
    fn test_svdpp_fits_and_is_self_contained() {
        let dataset = synthetic_ratings();
        let mut trainer = SvdTrainer::svd_plus_plus(SvdConfig {
            epochs: 60,
            ..rating_config()
        });
        trainer.fit(&dataset, &CancellationToken::new()).unwrap();
        let model = trainer.model().unwrap();
        assert_eq!(model.kind, ModelKind::SvdPlusPlus);
        assert!(model.implicit_factors.is_some());
        let aggregate = model.user_implicit.as_ref().unwrap();
        assert!(aggregate.row(0).iter().all(|&v| v == 0.0));
        let scores = model.score_all(3);
        assert!((scores[5] - model.predict(3, 5)).abs() < 1e-4);
        assert!(train_rmse(model, &dataset) < 0.6);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let dataset = synthetic_ratings();
        let config = SvdConfig {
            epochs: 5,
            ..rating_config()
        };
        let mut a = SvdTrainer::svd(config.clone());
        let mut b = SvdTrainer::svd(config);
        a.fit(&dataset, &CancellationToken::new()).unwrap();
        b.fit(&dataset, &CancellationToken::new()).unwrap();
        assert_eq!(a.model(), b.model());
    }

    #[test]
    fn test_non_finite_error_aborts() {
        let dataset = synthetic_ratings();
        let mut trainer = SvdTrainer::svd(SvdConfig {
            learning_rate: 1e20,
            epochs: 3,
            ..rating_config()
        });
        let err = trainer.fit(&dataset, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, RecError::NumericalDivergence { .. }));
        assert!(trainer.model().is_none());
    }

    #[test]
    fn test_gradient_guard_trips() {
        let dataset = synthetic_ratings();
        let mut trainer = SvdTrainer::svd(SvdConfig {
            max_grad_norm: Some(1e-9),
            guard_patience: 5,
            epochs: 2,
            ..rating_config()
        });
        let err = trainer.fit(&dataset, &CancellationToken::new()).unwrap_err();
        match err {
            RecError::NumericalDivergence { epoch, detail, .. } => {
                assert_eq!(epoch, 1);
                assert!(detail.contains("5 consecutive"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_decay_schedule_changes_training() {
        let dataset = synthetic_ratings();
        let base = SvdConfig {
            epochs: 5,
            ..rating_config()
        };
        let mut constant = SvdTrainer::svd(base.clone());
        let mut decayed = SvdTrainer::svd(SvdConfig {
            schedule: LearningRateSchedule::ExponentialDecay { decay_rate: 0.5 },
            ..base
        });
        let a = constant.fit(&dataset, &CancellationToken::new()).unwrap();
        let b = decayed.fit(&dataset, &CancellationToken::new()).unwrap();
        assert_eq!(a.history[0].loss, b.history[0].loss);
        assert_ne!(a.history[4].loss, b.history[4].loss);
    }

    /// Two user groups, each consuming its own half of the catalogue.
    fn block_preferences() -> Dataset {
        let mut rows = Vec::new();
        for u in 0..20 {
            for i in 0..12 {
                if (u < 10) == (i < 6) {
                    rows.push(vec![format!("u{}", u), format!("i{}", i), "1".to_string()]);
                }
            }
        }
        let table = RawTable::new(&["user", "item", "label"], rows);
        build_and_encode(&table, &ColumnRoles::default()).unwrap().1
    }

    fn ranking_config() -> SvdConfig {
        SvdConfig {
            task: Task::Ranking,
            factors: 4,
            learning_rate: 0.1,
            epochs: 150,
            ..SvdConfig::default()
        }
    }

    fn auc_on(model: &FactorModel, dataset: &Dataset) -> f64 {
        let positive: Vec<bool> = dataset.records().iter().map(|r| r.is_positive()).collect();
        roc_auc(&predictions(model, dataset), &positive)
    }

    #[test]
    fn test_ranking_task_separates_negatives() {
        let dataset = block_preferences();
        let info = Arc::clone(dataset.info());
        let sampled = NegativeSampler::new(SamplingConfig {
            num_neg: 2,
            ..SamplingConfig::default()
        })
        .sample(&dataset, &info, 2, 8)
        .unwrap();

        let mut trainer = SvdTrainer::svd(ranking_config());
        trainer.fit(&sampled, &CancellationToken::new()).unwrap();
        assert!(auc_on(trainer.model().unwrap(), &sampled) > 0.9);
        assert!(trainer.sampling_stats().is_none());
    }

    #[test]
    fn test_ranking_fit_redraws_negatives_every_epoch() {
        let dataset = block_preferences();
        let sampler = NegativeSampler::new(SamplingConfig {
            enabled: true,
            num_neg: 2,
            ..SamplingConfig::default()
        });
        let mut trainer = SvdTrainer::svd(ranking_config()).with_sampler(sampler.clone());
        let report = trainer.fit(&dataset, &CancellationToken::new()).unwrap();

        let positives = dataset.positives().count();
        let stats = trainer.sampling_stats().unwrap();
        assert_eq!(stats.rounds, report.epochs_completed);
        assert_eq!(stats.positives, positives * 150);
        assert_eq!(stats.negatives, positives * 2 * 150);

        // an independent draw from the same distribution
        let held_out = sampler
            .sample_with_stats(&dataset, dataset.info(), 2, 4242, 0)
            .unwrap()
            .0;
        assert!(auc_on(trainer.model().unwrap(), &held_out) > 0.9);
    }

    #[test]
    fn test_rating_fit_ignores_sampler() {
        let dataset = synthetic_ratings();
        let sampler = NegativeSampler::new(SamplingConfig {
            enabled: true,
            ..SamplingConfig::default()
        });
        let config = SvdConfig {
            epochs: 3,
            ..rating_config()
        };
        let mut plain = SvdTrainer::svd(config.clone());
        let mut sampled = SvdTrainer::svd(config).with_sampler(sampler);
        plain.fit(&dataset, &CancellationToken::new()).unwrap();
        sampled.fit(&dataset, &CancellationToken::new()).unwrap();
        assert_eq!(plain.model(), sampled.model());
        assert!(sampled.sampling_stats().is_none());
    }

    #[test]
    fn test_cancelled_run_keeps_completed_epochs() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut trainer = SvdTrainer::svd(rating_config());
        let report = trainer.fit(&synthetic_ratings(), &cancel).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.epochs_completed, 0);
        assert!(report.history.is_empty());
    }
}
