use criterion::{black_box, criterion_group, criterion_main, Criterion};
use latentrec::algorithms::{AlsTrainer, CancellationToken, NegativeSampler, SvdTrainer, Trainer};
use latentrec::config::{AlsConfig, SamplingConfig, SvdConfig};
use latentrec::data::{build_and_encode, ColumnRoles, Dataset, RawTable};
use latentrec::services::{RecommendationService, ServingState};
use latentrec::utils::metrics::MetricsCalculator;
use latentrec::utils::top_k;
use std::collections::HashSet;
use std::sync::Arc;

/// 500 users over 200 items, 20 interactions each, ratings 1 to 5.
fn synthetic_table() -> RawTable {
    let mut rows = Vec::new();
    for user in 0..500u32 {
        for step in 0..20u32 {
            let item = (user * 7 + step * 13) % 200;
            let rating = 1 + (user + item) % 5;
            rows.push(vec![format!("u{}", user), format!("i{}", item), rating.to_string()]);
        }
    }
    RawTable::new(&["user", "item", "label"], rows)
}

fn synthetic_dataset() -> Dataset {
    let (_, dataset) = build_and_encode(&synthetic_table(), &ColumnRoles::default()).unwrap();
    dataset
}

fn benchmark_encoding(c: &mut Criterion) {
    let table = synthetic_table();
    let roles = ColumnRoles::default();

    c.bench_function("build_and_encode", |b| {
        b.iter(|| black_box(build_and_encode(&table, &roles).unwrap()));
    });
}

fn benchmark_training(c: &mut Criterion) {
    let dataset = synthetic_dataset();
    let cancel = CancellationToken::new();
    let mut group = c.benchmark_group("training");
    group.sample_size(10);

    group.bench_function("als_cg_epoch", |b| {
        b.iter(|| {
            let mut trainer = AlsTrainer::new(AlsConfig {
                factors: 32,
                epochs: 1,
                ..AlsConfig::default()
            });
            black_box(trainer.fit(&dataset, &cancel).unwrap());
        });
    });

    group.bench_function("svd_epoch", |b| {
        b.iter(|| {
            let mut trainer = SvdTrainer::svd(SvdConfig {
                factors: 32,
                epochs: 1,
                ..SvdConfig::default()
            });
            black_box(trainer.fit(&dataset, &cancel).unwrap());
        });
    });

    group.bench_function("svdpp_epoch", |b| {
        b.iter(|| {
            let mut trainer = SvdTrainer::svd_plus_plus(SvdConfig {
                factors: 32,
                epochs: 1,
                ..SvdConfig::default()
            });
            black_box(trainer.fit(&dataset, &cancel).unwrap());
        });
    });

    group.finish();
}

fn benchmark_sampling(c: &mut Criterion) {
    let dataset = synthetic_dataset();
    let info = Arc::clone(dataset.info());

    for (name, parallel) in [("sample_negatives_parallel", true), ("sample_negatives_sequential", false)] {
        let sampler = NegativeSampler::new(SamplingConfig {
            enabled: true,
            num_neg: 4,
            parallel,
            ..SamplingConfig::default()
        });
        c.bench_function(name, |b| {
            b.iter(|| black_box(sampler.sample_epoch(&dataset, &info, 0).unwrap()));
        });
    }
}

fn benchmark_recommendation(c: &mut Criterion) {
    let dataset = synthetic_dataset();
    let info = Arc::clone(dataset.info());
    let mut trainer = AlsTrainer::new(AlsConfig {
        factors: 32,
        epochs: 3,
        ..AlsConfig::default()
    });
    trainer.fit(&dataset, &CancellationToken::new()).unwrap();
    let model = trainer.take_model().unwrap();
    let service = RecommendationService::new(
        Arc::new(model),
        info,
        ServingState::from_dataset(&dataset),
        Default::default(),
    )
    .unwrap();

    c.bench_function("recommend_top10", |b| {
        b.iter(|| black_box(service.recommend("u42", 10, true).unwrap()));
    });

    let candidates: Vec<String> = (0..50).map(|i| format!("i{}", i * 3)).collect();
    c.bench_function("recommend_from_candidates", |b| {
        b.iter(|| black_box(service.recommend_from_candidates("u42", &candidates, 10, true).unwrap()));
    });
}

fn benchmark_utils(c: &mut Criterion) {
    let scores: Vec<(u32, f32)> = (0..10_000u32).map(|i| (i, ((i * 7919) % 1000) as f32 / 1000.0)).collect();
    c.bench_function("top_k", |b| {
        b.iter(|| black_box(top_k(scores.clone(), 10)));
    });

    let calculator = MetricsCalculator::new(10);
    let recommended: Vec<u32> = (1..=10).collect();
    let relevant: HashSet<u32> = [2, 5, 9, 40].into_iter().collect();
    c.bench_function("ndcg_at_k", |b| {
        b.iter(|| black_box(calculator.ndcg_at_k(&recommended, &relevant)));
    });
}

criterion_group!(
    benches,
    benchmark_encoding,
    benchmark_training,
    benchmark_sampling,
    benchmark_recommendation,
    benchmark_utils
);
criterion_main!(benches);
