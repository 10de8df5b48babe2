use latentrec::config::Algorithm;
use latentrec::data::RawTable;
use latentrec::services::{RecommendationService, TrainingService};
use latentrec::{init_tracing, Config};
use std::sync::Arc;

fn ratings() -> RawTable {
    let rows = [
        ("alice", "matrix", "5"),
        ("alice", "alien", "4"),
        ("alice", "amelie", "1"),
        ("bob", "matrix", "4"),
        ("bob", "terminator", "5"),
        ("bob", "notebook", "2"),
        ("carol", "amelie", "5"),
        ("carol", "notebook", "4"),
        ("carol", "alien", "1"),
        ("dave", "terminator", "4"),
        ("dave", "alien", "5"),
        ("erin", "notebook", "5"),
        ("erin", "amelie", "4"),
        ("erin", "matrix", "2"),
    ];
    RawTable::new(
        &["user", "item", "label"],
        rows.iter().map(|(u, i, l)| vec![*u, *i, *l]).collect(),
    )
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    println!("latentrec basic usage");

    // 1. Configure an SVD++ rating model
    let mut config = Config::default();
    config.training.algorithm = Algorithm::Svdpp;
    config.training.threads = 2;
    config.svd.factors = 4;
    config.svd.epochs = 60;
    config.evaluation.metrics = vec!["rmse".to_string(), "mae".to_string()];

    // 2. Train, holding out two ratings for evaluation
    let held_out = RawTable::new(
        &["user", "item", "label"],
        vec![vec!["dave", "matrix", "5"], vec!["carol", "matrix", "2"]],
    );
    let service = TrainingService::new(Arc::new(config.clone()))?;
    let outcome = service.run(&ratings(), Some(&held_out))?;

    let stats = outcome.stats();
    println!(
        "trained {} on {} users x {} items in {} epochs (final loss {:?})",
        stats.algorithm, stats.n_users, stats.n_items, stats.epochs_completed, stats.final_loss
    );
    if let Some(metrics) = &outcome.metrics {
        for (name, value) in metrics {
            println!("  {}: {:.4}", name, value);
        }
    }

    // 3. Serve recommendations straight from the outcome
    let recommender = RecommendationService::new(
        Arc::new(outcome.artifact.model.clone()),
        Arc::clone(&outcome.info),
        outcome.serving.clone(),
        config.serving.clone(),
    )?;

    for user in ["alice", "dave", "zoe"] {
        println!("\nrecommendations for {}:", user);
        for (rank, rec) in recommender.recommend(user, 3, true)?.iter().enumerate() {
            println!("  {}. {} ({:.3}, {:?})", rank + 1, rec.item_id, rec.score, rec.source);
        }
    }

    // 4. Rank a caller-supplied shortlist
    let shortlist = vec!["notebook".to_string(), "terminator".to_string(), "unreleased".to_string()];
    let ranked = recommender.recommend_from_candidates("alice", &shortlist, 2, true)?;
    println!("\nshortlist for alice: {:?}", ranked.iter().map(|r| &r.item_id).collect::<Vec<_>>());

    // 5. Single prediction
    let info = &outcome.info;
    let user = info.require_user("erin")?;
    let item = info.require_item("terminator")?;
    println!("\npredicted erin -> terminator: {:.3}", outcome.artifact.model.predict(user, item));

    Ok(())
}
