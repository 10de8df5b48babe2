use crate::algorithms::initializer::InitializationMethod;
use crate::algorithms::optimizer::LearningRateSchedule;
use crate::data::ColumnRoles;
use crate::error::{RecError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data: DataConfig,
    pub training: TrainingConfig,
    pub als: AlsConfig,
    pub svd: SvdConfig,
    pub sampling: SamplingConfig,
    pub evaluation: EvaluationConfig,
    pub serving: ServingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Als,
    Svd,
    Svdpp,
}

/// `Rating` fits explicit labels with squared error; `Ranking` treats labels
/// as implicit feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Rating,
    Ranking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Solver {
    ConjugateGradient,
    Cholesky,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownUserPolicy {
    Popular,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub delimiter: char,
    pub roles: ColumnRoles,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            roles: ColumnRoles::default(),
        }
    }
}

impl DataConfig {
    pub fn delimiter_byte(&self) -> Result<u8> {
        u8::try_from(self.delimiter).map_err(|_| {
            RecError::InvalidConfig(format!("delimiter `{}` is not a single-byte character", self.delimiter))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub algorithm: Algorithm,
    pub threads: usize,
    pub output_dir: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Als,
            threads: num_cpus::get(),
            output_dir: PathBuf::from("artifacts"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlsConfig {
    pub factors: usize,
    pub regularization: f32,
    pub alpha: f32,
    pub epochs: usize,
    pub cg_steps: usize,
    pub cg_tolerance: f32,
    pub convergence_tolerance: Option<f64>,
    pub scale_regularization: bool,
    pub solver: Solver,
    pub task: Task,
    pub seed: u64,
    pub init: InitializationMethod,
}

impl Default for AlsConfig {
    fn default() -> Self {
        Self {
            factors: 16,
            regularization: 0.01,
            alpha: 10.0,
            epochs: 20,
            cg_steps: 3,
            cg_tolerance: 1e-10,
            convergence_tolerance: None,
            scale_regularization: false,
            solver: Solver::ConjugateGradient,
            task: Task::Ranking,
            seed: 42,
            init: InitializationMethod::Normal { std_dev: 0.01 },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SvdConfig {
    pub factors: usize,
    pub learning_rate: f32,
    pub regularization: f32,
    pub epochs: usize,
    pub schedule: LearningRateSchedule,
    pub max_grad_norm: Option<f32>,
    pub guard_patience: usize,
    pub task: Task,
    pub seed: u64,
    pub init: InitializationMethod,
    pub convergence_tolerance: Option<f64>,
}

impl Default for SvdConfig {
    fn default() -> Self {
        Self {
            factors: 16,
            learning_rate: 0.01,
            regularization: 0.02,
            epochs: 20,
            schedule: LearningRateSchedule::Constant,
            max_grad_norm: None,
            guard_patience: 100,
            task: Task::Rating,
            seed: 42,
            init: InitializationMethod::Normal { std_dev: 0.1 },
            convergence_tolerance: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub enabled: bool,
    pub num_neg: usize,
    pub popularity_exponent: Option<f64>,
    pub max_retries: usize,
    pub train_seed: u64,
    pub eval_seed: u64,
    pub parallel: bool,
    pub chunk_size: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            num_neg: 1,
            popularity_exponent: None,
            max_retries: 10,
            train_seed: 2024,
            eval_seed: 4048,
            parallel: true,
            chunk_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub cutoff: usize,
    pub metrics: Vec<String>,
    pub exclude_train_consumed: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            cutoff: 10,
            metrics: vec!["rmse".to_string(), "roc_auc".to_string(), "ndcg".to_string()],
            exclude_train_consumed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    pub unknown_user: UnknownUserPolicy,
    pub default_n: usize,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            unknown_user: UnknownUserPolicy::Popular,
            default_n: 10,
        }
    }
}

impl Config {
    /// Reads a TOML/JSON/YAML file layered with `LATENTREC_*` environment
    /// variables (`__` separates nested keys).
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("LATENTREC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| RecError::InvalidConfig(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| RecError::InvalidConfig(e.to_string()))?;
        crate::utils::validation::validate_config(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(crate::utils::validation::validate_config(&config).is_ok());
        assert_eq!(config.als.cg_steps, 3);
        assert_eq!(config.serving.unknown_user, UnknownUserPolicy::Popular);
        assert_ne!(config.sampling.train_seed, config.sampling.eval_seed);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[training]\nalgorithm = \"svdpp\"\n\n[svd]\nfactors = 4\nschedule = {{ type = \"step_decay\", step_size = 5, factor = 0.5 }}\n"
        )
        .unwrap();
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.training.algorithm, Algorithm::Svdpp);
        assert_eq!(config.svd.factors, 4);
        assert_eq!(
            config.svd.schedule,
            LearningRateSchedule::StepDecay {
                step_size: 5,
                factor: 0.5
            }
        );
        assert_eq!(config.als.factors, AlsConfig::default().factors);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[als]\nfactors = 0").unwrap();
        let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, RecError::InvalidConfig(_)));
    }
}
