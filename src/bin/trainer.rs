use anyhow::{Context, Result};
use clap::Parser;
use latentrec::config::Algorithm;
use latentrec::data::RawTable;
use latentrec::services::TrainingService;
use latentrec::{init_tracing, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// Training interactions (delimited text with a header row).
    #[arg(short, long)]
    train: PathBuf,

    /// Held-out interactions to evaluate on.
    #[arg(short, long)]
    eval: Option<PathBuf>,

    /// Overrides `training.output_dir`.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Overrides `training.algorithm` (als, svd, svdpp).
    #[arg(short, long)]
    algorithm: Option<String>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn parse_algorithm(name: &str) -> Result<Algorithm> {
    match name.to_ascii_lowercase().as_str() {
        "als" => Ok(Algorithm::Als),
        "svd" => Ok(Algorithm::Svd),
        "svdpp" | "svd++" => Ok(Algorithm::Svdpp),
        other => anyhow::bail!("unknown algorithm `{}`", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing();

    info!("Starting latentrec trainer");

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("Config file not found, using default configuration");
        Config::default()
    };
    if let Some(name) = &args.algorithm {
        config.training.algorithm = parse_algorithm(name)?;
    }
    if let Some(output) = &args.output {
        config.training.output_dir = output.clone();
    }
    info!("Training configuration: {:?}", config.training);

    let delimiter = config.data.delimiter_byte()?;
    let train = RawTable::from_path(&args.train, delimiter)
        .with_context(|| format!("reading {}", args.train.display()))?;
    let eval = match &args.eval {
        Some(path) => Some(RawTable::from_path(path, delimiter).with_context(|| format!("reading {}", path.display()))?),
        None => None,
    };

    let output_dir = config.training.output_dir.clone();
    let service = Arc::new(TrainingService::new(Arc::new(config))?);
    let cancel = service.cancellation_token();

    let worker = Arc::clone(&service);
    let mut training = tokio::task::spawn_blocking(move || worker.run(&train, eval.as_ref()));

    let outcome = tokio::select! {
        result = &mut training => result??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, finishing the current epoch");
            cancel.cancel();
            training.await??
        }
    };

    info!("Training stats: {:?}", outcome.stats());
    if let Some(metrics) = &outcome.metrics {
        for (name, value) in metrics {
            info!("{}: {:.6}", name, value);
        }
    }
    outcome.save(&output_dir)?;
    Ok(())
}
