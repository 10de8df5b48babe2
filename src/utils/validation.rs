use crate::algorithms::initializer::InitializationMethod;
use crate::config::{AlsConfig, Config, EvaluationConfig, SamplingConfig, SvdConfig};
use crate::error::{RecError, Result};
use crate::models::FactorModel;
use crate::services::evaluation::METRIC_NAMES;

fn invalid(message: impl Into<String>) -> RecError {
    RecError::InvalidConfig(message.into())
}

/// Rejects initializer parameters the random draws cannot honour.
pub fn validate_init(section: &str, method: &InitializationMethod) -> Result<()> {
    match *method {
        InitializationMethod::Normal { std_dev } => {
            if !(std_dev >= 0.0 && std_dev.is_finite()) {
                return Err(invalid(format!(
                    "{}.init.std_dev must be a non-negative number, got {}",
                    section, std_dev
                )));
            }
        }
        InitializationMethod::Uniform { low, high } => {
            if !(low.is_finite() && high.is_finite()) {
                return Err(invalid(format!("{}.init bounds must be finite", section)));
            }
            if low >= high {
                return Err(invalid(format!(
                    "{}.init.low must be below init.high, got [{}, {})",
                    section, low, high
                )));
            }
        }
        InitializationMethod::XavierUniform | InitializationMethod::Zeros => {}
    }
    Ok(())
}

pub fn validate_als_config(config: &AlsConfig) -> Result<()> {
    if config.factors == 0 {
        return Err(invalid("als.factors must be greater than 0"));
    }
    if !(config.regularization >= 0.0 && config.regularization.is_finite()) {
        return Err(invalid("als.regularization must be a non-negative number"));
    }
    if !(config.alpha >= 0.0 && config.alpha.is_finite()) {
        return Err(invalid("als.alpha must be a non-negative number"));
    }
    if config.cg_steps == 0 {
        return Err(invalid("als.cg_steps must be greater than 0"));
    }
    if !(config.cg_tolerance >= 0.0) {
        return Err(invalid("als.cg_tolerance must be non-negative"));
    }
    if let Some(tol) = config.convergence_tolerance {
        if !(tol > 0.0) {
            return Err(invalid("als.convergence_tolerance must be positive"));
        }
    }
    validate_init("als", &config.init)
}

pub fn validate_svd_config(config: &SvdConfig) -> Result<()> {
    if config.factors == 0 {
        return Err(invalid("svd.factors must be greater than 0"));
    }
    if !(config.learning_rate > 0.0 && config.learning_rate.is_finite()) {
        return Err(invalid("svd.learning_rate must be a positive number"));
    }
    if !(config.regularization >= 0.0 && config.regularization.is_finite()) {
        return Err(invalid("svd.regularization must be a non-negative number"));
    }
    if let Some(max_norm) = config.max_grad_norm {
        if !(max_norm > 0.0) {
            return Err(invalid("svd.max_grad_norm must be positive"));
        }
        if config.guard_patience == 0 {
            return Err(invalid("svd.guard_patience must be greater than 0 when a gradient limit is set"));
        }
    }
    if let Some(tol) = config.convergence_tolerance {
        if !(tol > 0.0) {
            return Err(invalid("svd.convergence_tolerance must be positive"));
        }
    }
    validate_init("svd", &config.init)
}

pub fn validate_sampling_config(config: &SamplingConfig) -> Result<()> {
    if config.enabled && config.num_neg == 0 {
        return Err(invalid("sampling.num_neg must be greater than 0 when sampling is enabled"));
    }
    if config.chunk_size == 0 {
        return Err(invalid("sampling.chunk_size must be greater than 0"));
    }
    if let Some(exponent) = config.popularity_exponent {
        if !exponent.is_finite() {
            return Err(invalid("sampling.popularity_exponent must be finite"));
        }
    }
    if config.train_seed == config.eval_seed {
        return Err(invalid("sampling.train_seed and sampling.eval_seed must differ"));
    }
    Ok(())
}

pub fn validate_metric_names(names: &[String]) -> Result<()> {
    for name in names {
        if !METRIC_NAMES.contains(&name.as_str()) {
            return Err(invalid(format!(
                "unknown metric `{}` (expected one of {})",
                name,
                METRIC_NAMES.join(", ")
            )));
        }
    }
    Ok(())
}

pub fn validate_evaluation_config(config: &EvaluationConfig) -> Result<()> {
    if config.cutoff == 0 {
        return Err(invalid("evaluation.cutoff must be greater than 0"));
    }
    validate_metric_names(&config.metrics)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.training.threads == 0 {
        return Err(invalid("training.threads must be greater than 0"));
    }
    config.data.delimiter_byte()?;
    config.data.roles.validate()?;
    validate_als_config(&config.als)?;
    validate_svd_config(&config.svd)?;
    validate_sampling_config(&config.sampling)?;
    validate_evaluation_config(&config.evaluation)?;
    Ok(())
}

/// Shape and finiteness checks for a loaded model.
pub fn validate_model(model: &FactorModel, factors: usize) -> Result<()> {
    let shape_error = |what: &str| RecError::Artifact(format!("inconsistent model shape: {}", what));

    if model.user_factors.ncols() != factors || model.item_factors.ncols() != factors {
        return Err(shape_error("factor columns differ from hyperparameters.factors"));
    }
    if model.n_user_rows() == 0 || model.n_item_rows() == 0 {
        return Err(shape_error("factor tables must contain the sentinel row"));
    }
    if let Some(bias) = &model.user_bias {
        if bias.len() != model.n_user_rows() {
            return Err(shape_error("user bias length"));
        }
    }
    if let Some(bias) = &model.item_bias {
        if bias.len() != model.n_item_rows() {
            return Err(shape_error("item bias length"));
        }
    }
    if let Some(implicit) = &model.implicit_factors {
        if implicit.dim() != model.item_factors.dim() {
            return Err(shape_error("implicit factors"));
        }
    }
    if let Some(aggregate) = &model.user_implicit {
        if aggregate.dim() != model.user_factors.dim() {
            return Err(shape_error("user implicit aggregate"));
        }
    }
    if !model.all_finite() {
        return Err(RecError::Artifact("model contains non-finite parameters".to_string()));
    }
    Ok(())
}
