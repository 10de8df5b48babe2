//! Offline accuracy and ranking metrics.
//!
//! Pointwise metrics take parallel `predictions` / `labels` slices; ranking
//! metrics take one user's ranked list and relevant set.

use crate::utils::sigmoid;
use std::collections::HashSet;

pub fn rmse(predictions: &[f32], labels: &[f32]) -> f64 {
    if predictions.is_empty() {
        return f64::NAN;
    }
    let sse: f64 = predictions
        .iter()
        .zip(labels)
        .map(|(&p, &y)| (p as f64 - y as f64).powi(2))
        .sum();
    (sse / predictions.len() as f64).sqrt()
}

pub fn mae(predictions: &[f32], labels: &[f32]) -> f64 {
    if predictions.is_empty() {
        return f64::NAN;
    }
    let sum: f64 = predictions
        .iter()
        .zip(labels)
        .map(|(&p, &y)| (p as f64 - y as f64).abs())
        .sum();
    sum / predictions.len() as f64
}

/// Coefficient of determination. NaN when the labels have zero variance.
pub fn r2(predictions: &[f32], labels: &[f32]) -> f64 {
    if labels.is_empty() {
        return f64::NAN;
    }
    let mean = labels.iter().map(|&y| y as f64).sum::<f64>() / labels.len() as f64;
    let ss_tot: f64 = labels.iter().map(|&y| (y as f64 - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return f64::NAN;
    }
    let ss_res: f64 = predictions
        .iter()
        .zip(labels)
        .map(|(&p, &y)| (y as f64 - p as f64).powi(2))
        .sum();
    1.0 - ss_res / ss_tot
}

/// Area under the ROC curve via the rank-sum statistic, with tied scores
/// sharing their average rank. NaN when only one class is present.
pub fn roc_auc(scores: &[f32], positive: &[bool]) -> f64 {
    let n_pos = positive.iter().filter(|&&p| p).count();
    let n_neg = positive.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return f64::NAN;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum = 0.0f64;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // ranks are 1-based: positions start..end share (start+1 + end) / 2
        let avg_rank = (start + 1 + end) as f64 / 2.0;
        rank_sum += avg_rank * order[start..end].iter().filter(|&&i| positive[i]).count() as f64;
        start = end;
    }

    let n_pos = n_pos as f64;
    (rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64)
}

/// Binary cross-entropy of `sigmoid(score)` against `label > 0`.
pub fn log_loss(scores: &[f32], labels: &[f32]) -> f64 {
    const EPS: f64 = 1e-7;
    if scores.is_empty() {
        return f64::NAN;
    }
    let total: f64 = scores
        .iter()
        .zip(labels)
        .map(|(&s, &y)| {
            let p = (sigmoid(s) as f64).clamp(EPS, 1.0 - EPS);
            if y > 0.0 {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum();
    total / scores.len() as f64
}

/// Ranking metrics at a fixed cutoff for one user's ranked list.
#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    k: usize,
}

impl MetricsCalculator {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn hits(&self, recommended: &[u32], relevant: &HashSet<u32>) -> usize {
        recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant.contains(item))
            .count()
    }

    /// Hits in the top `k` divided by `k`.
    pub fn precision_at_k(&self, recommended: &[u32], relevant: &HashSet<u32>) -> f64 {
        if self.k == 0 {
            return 0.0;
        }
        self.hits(recommended, relevant) as f64 / self.k as f64
    }

    pub fn recall_at_k(&self, recommended: &[u32], relevant: &HashSet<u32>) -> f64 {
        if relevant.is_empty() {
            return 0.0;
        }
        self.hits(recommended, relevant) as f64 / relevant.len() as f64
    }

    /// Mean of precision@i over the hit positions `i` in the top `k`; zero
    /// without hits.
    pub fn average_precision(&self, recommended: &[u32], relevant: &HashSet<u32>) -> f64 {
        let mut found = 0usize;
        let mut precision_sum = 0.0;
        for (i, item) in recommended.iter().take(self.k).enumerate() {
            if relevant.contains(item) {
                found += 1;
                precision_sum += found as f64 / (i + 1) as f64;
            }
        }
        if found == 0 {
            0.0
        } else {
            precision_sum / found as f64
        }
    }

    /// Binary-relevance NDCG; the ideal list places `min(k, |relevant|)`
    /// hits first.
    pub fn ndcg_at_k(&self, recommended: &[u32], relevant: &HashSet<u32>) -> f64 {
        let dcg: f64 = recommended
            .iter()
            .take(self.k)
            .enumerate()
            .filter(|(_, item)| relevant.contains(item))
            .map(|(i, _)| 1.0 / ((i + 2) as f64).log2())
            .sum();
        let idcg: f64 = (0..self.k.min(relevant.len()))
            .map(|i| 1.0 / ((i + 2) as f64).log2())
            .sum();
        if idcg == 0.0 {
            0.0
        } else {
            dcg / idcg
        }
    }
}
