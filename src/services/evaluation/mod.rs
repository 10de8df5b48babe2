use crate::algorithms::Scorer;
use crate::config::EvaluationConfig;
use crate::data::{Dataset, UNKNOWN_INDEX};
use crate::error::Result;
use crate::utils::metrics::{self, MetricsCalculator};
use crate::utils::top_k;
use crate::utils::validation::validate_metric_names;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info, warn};

pub const METRIC_NAMES: [&str; 9] = [
    "rmse", "mae", "r2", "roc_auc", "log_loss", "precision", "recall", "map", "ndcg",
];

const RANKING_METRICS: [&str; 4] = ["precision", "recall", "map", "ndcg"];

#[derive(Debug, Default, Clone, Copy)]
struct RankingTotals {
    precision: f64,
    recall: f64,
    map: f64,
    ndcg: f64,
    users: usize,
}

pub struct EvaluationService {
    config: EvaluationConfig,
    train_consumed: Option<Vec<Vec<u32>>>,
}

impl EvaluationService {
    pub fn new(config: EvaluationConfig) -> Self {
        Self {
            config,
            train_consumed: None,
        }
    }

    /// Remembers training interactions so `exclude_train_consumed` can drop
    /// them from ranking candidates.
    pub fn with_train(mut self, train: &Dataset) -> Self {
        self.train_consumed = Some(train.user_consumed());
        self
    }

    pub fn evaluate<S: Scorer + ?Sized>(
        &self,
        model: &S,
        dataset: &Dataset,
        metric_names: &[String],
    ) -> Result<BTreeMap<String, f64>> {
        validate_metric_names(metric_names)?;
        let mut results = BTreeMap::new();
        let wants = |name: &str| metric_names.iter().any(|m| m == name);

        if ["rmse", "mae", "r2"].iter().any(|m| wants(m)) {
            let (preds, labels): (Vec<f32>, Vec<f32>) = dataset
                .records()
                .iter()
                .filter(|r| !r.is_negative)
                .map(|r| (model.predict(r.user_index, r.item_index), r.label))
                .unzip();
            if wants("rmse") {
                results.insert("rmse".to_string(), metrics::rmse(&preds, &labels));
            }
            if wants("mae") {
                results.insert("mae".to_string(), metrics::mae(&preds, &labels));
            }
            if wants("r2") {
                results.insert("r2".to_string(), metrics::r2(&preds, &labels));
            }
        }

        if wants("roc_auc") || wants("log_loss") {
            let scores: Vec<f32> = dataset
                .records()
                .iter()
                .map(|r| model.predict(r.user_index, r.item_index))
                .collect();
            if wants("roc_auc") {
                let positive: Vec<bool> = dataset.records().iter().map(|r| r.is_positive()).collect();
                let auc = metrics::roc_auc(&scores, &positive);
                if auc.is_nan() {
                    warn!("roc_auc is undefined: evaluation records contain a single class");
                }
                results.insert("roc_auc".to_string(), auc);
            }
            if wants("log_loss") {
                let labels: Vec<f32> = dataset
                    .records()
                    .iter()
                    .map(|r| if r.is_positive() { 1.0 } else { 0.0 })
                    .collect();
                results.insert("log_loss".to_string(), metrics::log_loss(&scores, &labels));
            }
        }

        if RANKING_METRICS.iter().any(|m| wants(m)) {
            let totals = self.ranking_totals(model, dataset);
            let mean = |sum: f64| {
                if totals.users == 0 {
                    f64::NAN
                } else {
                    sum / totals.users as f64
                }
            };
            for (name, sum) in [
                ("precision", totals.precision),
                ("recall", totals.recall),
                ("map", totals.map),
                ("ndcg", totals.ndcg),
            ] {
                if wants(name) {
                    results.insert(name.to_string(), mean(sum));
                }
            }
        }

        info!("Evaluation on {} records: {:?}", dataset.len(), results);
        Ok(results)
    }

    fn ranking_totals<S: Scorer + ?Sized>(&self, model: &S, dataset: &Dataset) -> RankingTotals {
        let cutoff = self.config.cutoff;
        let calculator = MetricsCalculator::new(cutoff);

        let mut users: BTreeSet<u32> = BTreeSet::new();
        let mut unknown = 0usize;
        for record in dataset.records() {
            if record.user_index == UNKNOWN_INDEX {
                unknown += 1;
            } else {
                users.insert(record.user_index);
            }
        }
        let relevant = dataset.user_consumed();

        let evaluated: Vec<u32> = users
            .iter()
            .copied()
            .filter(|&u| relevant.get(u as usize).is_some_and(|items| !items.is_empty()))
            .collect();
        let skipped = users.len() - evaluated.len();
        if skipped > 0 {
            warn!("Excluded {} users without positive interactions from ranking metrics", skipped);
        }
        if unknown > 0 {
            debug!("Skipped {} records with unknown users in ranking metrics", unknown);
        }

        let exclude = if self.config.exclude_train_consumed {
            self.train_consumed.as_deref()
        } else {
            None
        };

        evaluated
            .par_iter()
            .map(|&u| {
                let seen: &[u32] = exclude
                    .and_then(|c| c.get(u as usize))
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                let scored: Vec<(u32, f32)> = model
                    .score_all(u)
                    .into_iter()
                    .enumerate()
                    .skip(1)
                    .map(|(i, s)| (i as u32, s))
                    .filter(|(i, _)| seen.binary_search(i).is_err())
                    .collect();
                let ranked: Vec<u32> = top_k(scored, cutoff).into_iter().map(|(i, _)| i).collect();
                let relevant: HashSet<u32> = relevant[u as usize].iter().copied().collect();
                RankingTotals {
                    precision: calculator.precision_at_k(&ranked, &relevant),
                    recall: calculator.recall_at_k(&ranked, &relevant),
                    map: calculator.average_precision(&ranked, &relevant),
                    ndcg: calculator.ndcg_at_k(&ranked, &relevant),
                    users: 1,
                }
            })
            .reduce(RankingTotals::default, |a, b| RankingTotals {
                precision: a.precision + b.precision,
                recall: a.recall + b.recall,
                map: a.map + b.map,
                ndcg: a.ndcg + b.ndcg,
                users: a.users + b.users,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{build_and_encode, encode, ColumnRoles, RawTable};
    use crate::error::RecError;
    use crate::models::{FactorModel, ModelKind};
    use ndarray::array;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Two users, three items; item scores are 3, 2, 1 for everybody.
    fn fixture() -> (FactorModel, Dataset, Dataset) {
        let train = RawTable::new(
            &["user", "item", "label"],
            vec![vec!["a", "i1", "1"], vec!["b", "i2", "1"], vec!["a", "i3", "1"]],
        );
        let (info, train) = build_and_encode(&train, &ColumnRoles::default()).unwrap();
        let test = RawTable::new(
            &["user", "item", "label"],
            vec![
                vec!["a", "i2", "1"],
                vec!["b", "i1", "1"],
                vec!["b", "i3", "0"],
                vec!["ghost", "i1", "1"],
            ],
        );
        let test = encode(&test, &info).unwrap();
        let model = FactorModel::new(
            ModelKind::Als,
            array![[0.0], [1.0], [1.0]],
            array![[0.0], [3.0], [2.0], [1.0]],
        );
        (model, train, test)
    }

    #[test]
    fn test_rating_metrics_skip_negatives() {
        let (model, _, test) = fixture();
        let service = EvaluationService::new(EvaluationConfig::default());
        let results = service.evaluate(&model, &test, &names(&["rmse", "mae"])).unwrap();
        // predictions 2, 3, 1, 0 against labels 1, 1, 0, 1
        let expected_rmse = ((1.0 + 4.0 + 1.0 + 1.0) / 4.0f64).sqrt();
        assert!((results["rmse"] - expected_rmse).abs() < 1e-9);
        assert!((results["mae"] - 5.0 / 4.0).abs() < 1e-9);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_ranking_metrics_at_cutoff() {
        let (model, _, test) = fixture();
        let service = EvaluationService::new(EvaluationConfig {
            cutoff: 1,
            ..EvaluationConfig::default()
        });
        let results = service
            .evaluate(&model, &test, &names(&["precision", "recall", "ndcg", "map", "roc_auc"]))
            .unwrap();
        // both users get i1 on top; only b is relevant to it
        assert!((results["precision"] - 0.5).abs() < 1e-9);
        assert!((results["recall"] - 0.5).abs() < 1e-9);
        assert!((results["ndcg"] - 0.5).abs() < 1e-9);
        assert!((results["map"] - 0.5).abs() < 1e-9);
        // the unknown user's positive scores 0, below the single negative
        assert!((results["roc_auc"] - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_exclude_train_consumed() {
        let (model, train, test) = fixture();
        let service = EvaluationService::new(EvaluationConfig {
            cutoff: 1,
            exclude_train_consumed: true,
            ..EvaluationConfig::default()
        })
        .with_train(&train);
        let results = service.evaluate(&model, &test, &names(&["precision"])).unwrap();
        // a's top item is now i2 (i1, i3 were consumed in training); b still gets i1
        assert!((results["precision"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_metric_rejected() {
        let (model, _, test) = fixture();
        let service = EvaluationService::new(EvaluationConfig::default());
        let err = service.evaluate(&model, &test, &names(&["rmse", "coverage"])).unwrap_err();
        assert!(matches!(err, RecError::InvalidConfig(_)));
    }
}
