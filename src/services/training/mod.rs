use crate::algorithms::{AlsTrainer, CancellationToken, NegativeSampler, SamplingStats, SvdTrainer, Trainer};
use crate::config::{Algorithm, Config};
use crate::data::{build_and_encode, encode, DatasetInfo, RawTable};
use crate::error::{RecError, Result};
use crate::models::ModelArtifact;
use crate::services::evaluation::EvaluationService;
use crate::services::recommendation::ServingState;
use crate::utils::validation::validate_config;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub const DATASET_INFO_FILE: &str = "dataset_info.json";
pub const MODEL_FILE: &str = "model.json";
pub const SERVING_FILE: &str = "serving.json";
pub const METRICS_FILE: &str = "metrics.json";

#[derive(Debug, Clone, Serialize)]
pub struct TrainingStats {
    pub algorithm: String,
    pub n_users: usize,
    pub n_items: usize,
    pub n_train_records: usize,
    pub epochs_completed: usize,
    pub converged: bool,
    pub cancelled: bool,
    pub final_loss: Option<f64>,
    pub elapsed_ms: u64,
}

/// Everything one training run produces.
pub struct TrainingOutcome {
    pub info: Arc<DatasetInfo>,
    pub artifact: ModelArtifact,
    pub serving: ServingState,
    pub sampling: Option<SamplingStats>,
    pub metrics: Option<BTreeMap<String, f64>>,
}

impl TrainingOutcome {
    pub fn stats(&self) -> TrainingStats {
        let report = &self.artifact.report;
        TrainingStats {
            algorithm: self.artifact.model.kind.to_string(),
            n_users: self.info.n_users(),
            n_items: self.info.n_items(),
            n_train_records: self.info.n_train_records(),
            epochs_completed: report.epochs_completed,
            converged: report.converged,
            cancelled: report.cancelled,
            final_loss: report.final_loss(),
            elapsed_ms: report.elapsed_ms,
        }
    }

    /// Writes the dataset info, model, serving state and metrics under `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        self.info.save(dir.join(DATASET_INFO_FILE))?;
        self.artifact.save(dir.join(MODEL_FILE))?;
        self.serving.save(dir.join(SERVING_FILE))?;
        if let Some(metrics) = &self.metrics {
            let writer = BufWriter::new(File::create(dir.join(METRICS_FILE))?);
            serde_json::to_writer_pretty(writer, metrics)?;
        }
        info!("Artifacts written to {}", dir.display());
        Ok(())
    }
}

pub struct TrainingService {
    config: Arc<Config>,
    cancel: CancellationToken,
}

impl TrainingService {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        validate_config(&config)?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token that stops training before the next epoch once cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// SGD trainers get a sampler for per-epoch negatives when sampling is on.
    pub fn build_trainer(&self) -> Box<dyn Trainer> {
        let svd = match self.config.training.algorithm {
            Algorithm::Als => return Box::new(AlsTrainer::new(self.config.als.clone())),
            Algorithm::Svd => SvdTrainer::svd(self.config.svd.clone()),
            Algorithm::Svdpp => SvdTrainer::svd_plus_plus(self.config.svd.clone()),
        };
        if self.config.sampling.enabled {
            Box::new(svd.with_sampler(NegativeSampler::new(self.config.sampling.clone())))
        } else {
            Box::new(svd)
        }
    }

    /// Encode, sample, fit and (optionally) evaluate on a dedicated thread pool.
    pub fn run(&self, train: &RawTable, eval: Option<&RawTable>) -> Result<TrainingOutcome> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.training.threads)
            .build()?;
        pool.install(|| self.run_in_pool(train, eval))
    }

    fn run_in_pool(&self, train: &RawTable, eval: Option<&RawTable>) -> Result<TrainingOutcome> {
        let config = &self.config;
        let (info, dataset) = build_and_encode(train, &config.data.roles)?;
        info!("Training set: {:?}", dataset.stats());

        if config.sampling.enabled && config.training.algorithm == Algorithm::Als {
            debug!("ALS treats unobserved pairs as negatives; skipping training negatives");
        }

        let mut trainer = self.build_trainer();
        let report = trainer.fit(&dataset, &self.cancel)?;
        let sampling = trainer.sampling_stats().cloned();
        let hyperparameters = trainer.hyperparameters();
        let model = trainer
            .take_model()
            .ok_or_else(|| RecError::Artifact("trainer finished without a model".to_string()))?;

        let metrics = match eval {
            Some(table) => {
                let mut eval_set = encode(table, &info)?;
                if config.sampling.enabled {
                    let sampler = NegativeSampler::new(config.sampling.clone());
                    eval_set = sampler.sample_eval(&eval_set, &info, &dataset.user_consumed())?;
                }
                let evaluator = EvaluationService::new(config.evaluation.clone()).with_train(&dataset);
                Some(evaluator.evaluate(&model, &eval_set, &config.evaluation.metrics)?)
            }
            None => None,
        };

        Ok(TrainingOutcome {
            serving: ServingState::from_dataset(&dataset),
            artifact: ModelArtifact::new(model, hyperparameters, report),
            info,
            sampling,
            metrics,
        })
    }
}
