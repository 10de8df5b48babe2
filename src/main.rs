use anyhow::{Context, Result};
use clap::Parser;
use latentrec::config::UnknownUserPolicy;
use latentrec::services::RecommendationService;
use latentrec::{init_tracing, Config, RecommendationItem};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Print recommendations for one user from a trained artifact directory.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory written by `latentrec-trainer`.
    #[arg(short, long, default_value = "artifacts")]
    artifacts: PathBuf,

    #[arg(short, long)]
    config: Option<String>,

    #[arg(short, long)]
    user: String,

    #[arg(short, long)]
    n: Option<usize>,

    /// Comma-separated item ids to rank instead of the full catalogue.
    #[arg(long, value_delimiter = ',')]
    candidates: Option<Vec<String>>,

    /// Keep items the user already interacted with in training.
    #[arg(long)]
    include_seen: bool,

    /// Fail on unknown users instead of serving popular items.
    #[arg(long)]
    strict: bool,
}

#[derive(Debug, Serialize)]
struct Response {
    user: String,
    recommendations: Vec<RecommendationItem>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading config {}", path))?,
        None => Config::default(),
    };
    if args.strict {
        config.serving.unknown_user = UnknownUserPolicy::Error;
    }

    let service = RecommendationService::from_dir(&args.artifacts, &config.data.roles, config.serving.clone())
        .with_context(|| format!("loading artifacts from {}", args.artifacts.display()))?;

    let n = args.n.unwrap_or(config.serving.default_n);
    let exclude_seen = !args.include_seen;
    let recommendations = match &args.candidates {
        Some(candidates) => service.recommend_from_candidates(&args.user, candidates, n, exclude_seen)?,
        None => service.recommend(&args.user, n, exclude_seen)?,
    };
    info!("Produced {} recommendations for `{}`", recommendations.len(), args.user);

    let response = Response {
        user: args.user,
        recommendations,
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
