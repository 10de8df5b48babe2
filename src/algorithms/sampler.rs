//! Negative sampling for implicit feedback.
//!
//! Positives are processed in fixed-size chunks. Each chunk draws from its
//! own generator seeded by `(seed, epoch, chunk)`, so the output does not
//! depend on how many threads run the chunks.

use crate::config::SamplingConfig;
use crate::data::{Dataset, DatasetInfo};
use crate::error::{RecError, Result, SchemaError};
use crate::models::EncodedRecord;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Counts summed over every sampling round that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingStats {
    pub positives: usize,
    pub negatives: usize,
    /// Negatives accepted after `max_retries` without escaping the user's
    /// positive set.
    pub exhausted: usize,
    #[serde(default)]
    pub rounds: usize,
}

impl SamplingStats {
    pub fn merge(&mut self, other: &SamplingStats) {
        self.positives += other.positives;
        self.negatives += other.negatives;
        self.exhausted += other.exhausted;
        self.rounds += other.rounds;
    }
}

enum Candidates {
    Uniform { n_items: u32 },
    Popularity(WeightedIndex<f64>),
}

impl Candidates {
    fn draw(&self, rng: &mut StdRng) -> u32 {
        match self {
            Candidates::Uniform { n_items } => rng.gen_range(1..=*n_items),
            Candidates::Popularity(weights) => weights.sample(rng) as u32 + 1,
        }
    }
}

fn chunk_seed(seed: u64, epoch: u64, chunk: u64) -> u64 {
    // splitmix64 over the combined key
    let mut z = seed
        .wrapping_add(epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(chunk.wrapping_mul(0xD1B5_4A32_D192_ED03));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[derive(Debug, Clone)]
pub struct NegativeSampler {
    config: SamplingConfig,
}

impl NegativeSampler {
    pub fn new(config: SamplingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Appends `num_neg` negatives per positive record.
    pub fn sample(&self, dataset: &Dataset, info: &DatasetInfo, num_neg: usize, seed: u64) -> Result<Dataset> {
        self.sample_with_stats(dataset, info, num_neg, seed, 0)
            .map(|(sampled, _)| sampled)
    }

    /// Fresh negatives for one training epoch from the configured train seed.
    pub fn sample_epoch(&self, dataset: &Dataset, info: &DatasetInfo, epoch: u64) -> Result<(Dataset, SamplingStats)> {
        self.sample_with_stats(dataset, info, self.config.num_neg, self.config.train_seed, epoch)
    }

    /// Negatives for an evaluation set, drawn from the eval seed stream.
    ///
    /// `train_consumed` holds each user's sorted training positives; an eval
    /// negative never lands on those or on the user's eval positives.
    pub fn sample_eval(&self, dataset: &Dataset, info: &DatasetInfo, train_consumed: &[Vec<u32>]) -> Result<Dataset> {
        self.sample_excluding(
            dataset,
            info,
            self.config.num_neg,
            self.config.eval_seed,
            0,
            Some(train_consumed),
        )
        .map(|(sampled, _)| sampled)
    }

    pub fn sample_with_stats(
        &self,
        dataset: &Dataset,
        info: &DatasetInfo,
        num_neg: usize,
        seed: u64,
        epoch: u64,
    ) -> Result<(Dataset, SamplingStats)> {
        self.sample_excluding(dataset, info, num_neg, seed, epoch, None)
    }

    fn sample_excluding(
        &self,
        dataset: &Dataset,
        info: &DatasetInfo,
        num_neg: usize,
        seed: u64,
        epoch: u64,
        exclude: Option<&[Vec<u32>]>,
    ) -> Result<(Dataset, SamplingStats)> {
        if dataset.info().n_items() != info.n_items() || dataset.info().n_users() != info.n_users() {
            return Err(SchemaError::Mismatch {
                detail: "dataset was encoded with a different DatasetInfo".to_string(),
            }
            .into());
        }

        let positives: Vec<&EncodedRecord> = dataset.positives().collect();
        if positives.is_empty() || num_neg == 0 {
            return Ok((dataset.clone(), SamplingStats::default()));
        }
        if info.n_items() == 0 {
            return Err(RecError::InvalidConfig("cannot sample negatives without known items".to_string()));
        }

        let candidates = self.candidates(dataset, info)?;
        let mut consumed = dataset.user_consumed();
        if let Some(extra) = exclude {
            for (items, more) in consumed.iter_mut().zip(extra) {
                if !more.is_empty() {
                    items.extend_from_slice(more);
                    items.sort_unstable();
                    items.dedup();
                }
            }
        }
        let chunk_size = self.config.chunk_size.max(1);

        let run_chunk = |(chunk_index, chunk): (usize, &[&EncodedRecord])| {
            let mut rng = StdRng::seed_from_u64(chunk_seed(seed, epoch, chunk_index as u64));
            let mut negatives = Vec::with_capacity(chunk.len() * num_neg);
            let mut exhausted = 0usize;
            for record in chunk {
                let seen = consumed
                    .get(record.user_index as usize)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                for _ in 0..num_neg {
                    let (item, ok) = self.draw_negative(&candidates, seen, &mut rng);
                    if !ok {
                        exhausted += 1;
                    }
                    let mut sparse = record.sparse_codes.clone();
                    let mut dense = record.dense_values.clone();
                    info.item_features().apply(item, &mut sparse, &mut dense);
                    negatives.push(EncodedRecord::negative(record.user_index, item, sparse, dense));
                }
            }
            (negatives, exhausted)
        };

        let chunks: Vec<(Vec<EncodedRecord>, usize)> = if self.config.parallel {
            positives.par_chunks(chunk_size).enumerate().map(run_chunk).collect()
        } else {
            positives.chunks(chunk_size).enumerate().map(run_chunk).collect()
        };

        let mut stats = SamplingStats {
            positives: positives.len(),
            rounds: 1,
            ..SamplingStats::default()
        };
        let mut negatives = Vec::with_capacity(positives.len() * num_neg);
        for (chunk, exhausted) in chunks {
            stats.exhausted += exhausted;
            negatives.extend(chunk);
        }
        stats.negatives = negatives.len();

        if stats.exhausted > 0 {
            warn!(
                "Negative sampling hit the retry limit ({}) {} times; those negatives may be observed positives",
                self.config.max_retries, stats.exhausted
            );
        }
        info!(
            "Sampled {} negatives for {} positives (epoch {})",
            stats.negatives, stats.positives, epoch
        );

        Ok((dataset.with_appended(negatives), stats))
    }

    fn candidates(&self, dataset: &Dataset, info: &DatasetInfo) -> Result<Candidates> {
        let n_items = info.n_items() as u32;
        match self.config.popularity_exponent {
            None => Ok(Candidates::Uniform { n_items }),
            Some(exponent) => {
                let popularity = dataset.item_popularity();
                let weights: Vec<f64> = popularity
                    .iter()
                    .skip(1)
                    .map(|&count| (count as f64).max(1.0).powf(exponent))
                    .collect();
                debug!("Popularity-weighted sampling with exponent {}", exponent);
                let weights = WeightedIndex::new(weights)
                    .map_err(|e| RecError::InvalidConfig(format!("popularity weights: {}", e)))?;
                Ok(Candidates::Popularity(weights))
            }
        }
    }

    /// Returns the candidate and whether it escaped the positive set.
    fn draw_negative(&self, candidates: &Candidates, seen: &[u32], rng: &mut StdRng) -> (u32, bool) {
        let mut item = candidates.draw(rng);
        for _ in 0..self.config.max_retries {
            if seen.binary_search(&item).is_err() {
                return (item, true);
            }
            item = candidates.draw(rng);
        }
        (item, seen.binary_search(&item).is_err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{build_and_encode, encode, ColumnRoles, RawTable};
    use std::collections::HashSet;

    fn dataset() -> Dataset {
        let mut rows = Vec::new();
        for u in 0..20 {
            for i in 0..5 {
                if (u + i) % 3 == 0 {
                    rows.push(vec![format!("u{}", u), format!("i{}", i), "1".to_string()]);
                }
            }
        }
        for i in 5..40 {
            rows.push(vec!["u0".to_string(), format!("i{}", i), "0".to_string()]);
        }
        let table = RawTable::new(&["user", "item", "label"], rows);
        build_and_encode(&table, &ColumnRoles::default()).unwrap().1
    }

    fn config(parallel: bool, chunk_size: usize) -> SamplingConfig {
        SamplingConfig {
            enabled: true,
            parallel,
            chunk_size,
            ..SamplingConfig::default()
        }
    }

    #[test]
    fn test_reproducible_with_seed() {
        let data = dataset();
        let sampler = NegativeSampler::new(config(true, 4));
        let a = sampler.sample(&data, data.info(), 2, 99).unwrap();
        let b = sampler.sample(&data, data.info(), 2, 99).unwrap();
        let c = sampler.sample(&data, data.info(), 2, 100).unwrap();
        assert_eq!(a.records(), b.records());
        assert_ne!(a.records(), c.records());
    }

    #[test]
    fn test_thread_count_does_not_change_output() {
        let data = dataset();
        let parallel = NegativeSampler::new(config(true, 3)).sample(&data, data.info(), 3, 5).unwrap();
        let sequential = NegativeSampler::new(config(false, 3)).sample(&data, data.info(), 3, 5).unwrap();
        assert_eq!(parallel.records(), sequential.records());
    }

    #[test]
    fn test_negatives_avoid_positives() {
        let data = dataset();
        let sampler = NegativeSampler::new(config(true, 8));
        let (sampled, stats) = sampler.sample_with_stats(&data, data.info(), 4, 1, 0).unwrap();
        assert_eq!(stats.exhausted, 0);
        assert_eq!(stats.negatives, stats.positives * 4);
        assert_eq!(sampled.len(), data.len() + stats.negatives);

        let positives: HashSet<(u32, u32)> = data.positives().map(|r| (r.user_index, r.item_index)).collect();
        for record in &sampled.records()[data.len()..] {
            assert!(record.is_negative);
            assert_eq!(record.label, 0.0);
            assert!(record.item_index >= 1);
            assert!(!positives.contains(&(record.user_index, record.item_index)));
        }
        assert_eq!(&sampled.records()[..data.len()], data.records());
    }

    #[test]
    fn test_exhaustion_accepts_duplicate() {
        let table = RawTable::new(&["user", "item", "label"], vec![vec!["u", "only", "1"]]);
        let (info, data) = build_and_encode(&table, &ColumnRoles::default()).unwrap();
        let sampler = NegativeSampler::new(config(false, 16));
        let (sampled, stats) = sampler.sample_with_stats(&data, &info, 2, 0, 0).unwrap();
        assert_eq!(stats.exhausted, 2);
        assert_eq!(sampled.len(), 3);
    }

    #[test]
    fn test_epochs_and_eval_use_different_streams() {
        let data = dataset();
        let sampler = NegativeSampler::new(config(true, 4));
        let (e0, stats) = sampler.sample_epoch(&data, data.info(), 0).unwrap();
        let (e1, _) = sampler.sample_epoch(&data, data.info(), 1).unwrap();
        let eval = sampler.sample_eval(&data, data.info(), &[]).unwrap();
        assert_ne!(e0.records(), e1.records());
        assert_ne!(e0.records(), eval.records());
        assert_eq!(stats.rounds, 1);
    }

    #[test]
    fn test_eval_negatives_skip_training_positives() {
        let mut train_rows: Vec<Vec<String>> = ["a", "b", "c", "d", "e", "f", "g", "h"]
            .iter()
            .map(|i| vec!["u".to_string(), i.to_string(), "1".to_string()])
            .collect();
        for (user, item) in [("v", "i"), ("v", "j"), ("w", "k"), ("w", "l"), ("w", "m")] {
            train_rows.push(vec![user.to_string(), item.to_string(), "1".to_string()]);
        }
        let table = RawTable::new(&["user", "item", "label"], train_rows);
        let (info, train) = build_and_encode(&table, &ColumnRoles::default()).unwrap();
        let eval = encode(&RawTable::new(&["user", "item", "label"], vec![vec!["u", "i", "1"]]), &info).unwrap();

        let sampler = NegativeSampler::new(SamplingConfig {
            num_neg: 20,
            max_retries: 100,
            ..config(false, 8)
        });
        let train_consumed = train.user_consumed();
        let sampled = sampler.sample_eval(&eval, &info, &train_consumed).unwrap();
        assert_eq!(sampled.len(), 21);

        let u = info.user_index().encode("u");
        let forbidden: HashSet<u32> = train_consumed[u as usize]
            .iter()
            .copied()
            .chain([info.item_index().encode("i")])
            .collect();
        assert_eq!(forbidden.len(), 9);
        for record in &sampled.records()[eval.len()..] {
            assert!(record.is_negative);
            assert!(!forbidden.contains(&record.item_index), "item {}", record.item_index);
        }
    }

    #[test]
    fn test_popularity_weighting_prefers_popular_items() {
        let mut rows = Vec::new();
        for u in 0..50 {
            rows.push(vec![format!("fan{}", u), "hit".to_string(), "1".to_string()]);
        }
        for i in 0..9 {
            rows.push(vec![format!("x{}", i), format!("rare{}", i), "1".to_string()]);
        }
        let table = RawTable::new(&["user", "item", "label"], rows);
        let (info, data) = build_and_encode(&table, &ColumnRoles::default()).unwrap();
        let hit = info.item_index().encode("hit");

        // share of "hit" among negatives drawn for users who never consumed it
        let hit_share = |exponent: Option<f64>| {
            let sampler = NegativeSampler::new(SamplingConfig {
                popularity_exponent: exponent,
                ..config(false, 64)
            });
            let sampled = sampler.sample(&data, &info, 20, 3).unwrap();
            let fans: HashSet<u32> = (0..50).map(|u| info.user_index().encode(&format!("fan{}", u))).collect();
            let drawn: Vec<u32> = sampled.records()[data.len()..]
                .iter()
                .filter(|r| !fans.contains(&r.user_index))
                .map(|r| r.item_index)
                .collect();
            assert_eq!(drawn.len(), 9 * 20);
            drawn.iter().filter(|&&item| item == hit).count() as f64 / drawn.len() as f64
        };

        // weights 50 vs 1: about 50/58 of draws; uniform gives about 1/9
        let weighted = hit_share(Some(1.0));
        let uniform = hit_share(None);
        assert!(weighted > 0.7, "weighted share {}", weighted);
        assert!(uniform < 0.3, "uniform share {}", uniform);
        assert!(weighted > 2.0 * uniform);
    }

    #[test]
    fn test_negative_carries_item_side_features() {
        let table = RawTable::new(
            &["user", "item", "label", "genre"],
            vec![
                vec!["a", "m1", "1", "scifi"],
                vec!["b", "m2", "1", "drama"],
            ],
        );
        let roles = ColumnRoles::default().with_sparse(&["genre"]).with_item_side(&["genre"]);
        let (info, data) = build_and_encode(&table, &roles).unwrap();
        let sampler = NegativeSampler::new(config(false, 8));
        let sampled = sampler.sample(&data, &info, 1, 7).unwrap();
        for record in &sampled.records()[data.len()..] {
            let expected = &info.item_features().sparse[record.item_index as usize];
            assert_eq!(&record.sparse_codes, expected);
        }
    }
}
