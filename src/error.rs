use std::fmt;

pub type Result<T> = std::result::Result<T, RecError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    User,
    Item,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::User => write!(f, "user"),
            EntityKind::Item => write!(f, "item"),
        }
    }
}

/// Problems with the shape or content of input rows and persisted schemas.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("missing required column `{column}` (role {role})")]
    MissingColumn { column: String, role: &'static str },

    #[error("row {row}: missing field for column `{column}`")]
    MissingField { row: usize, column: String },

    #[error("row {row}: column `{column}` has non-numeric value `{value}`")]
    InvalidNumber {
        row: usize,
        column: String,
        value: String,
    },

    #[error("column `{column}` declared with more than one role")]
    DuplicateRole { column: String },

    #[error("side column `{column}` is not declared as a sparse or dense feature")]
    UndeclaredSideColumn { column: String },

    #[error("persisted schema does not match the current column roles: {detail}")]
    Mismatch { detail: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RecError {
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("unknown {kind} `{id}`")]
    UnknownEntity { kind: EntityKind, id: String },

    #[error("numerical divergence at epoch {epoch} ({phase}): {detail}")]
    NumericalDivergence {
        epoch: usize,
        phase: String,
        detail: String,
    },

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl RecError {
    pub fn divergence(epoch: usize, phase: impl Into<String>, detail: impl Into<String>) -> Self {
        RecError::NumericalDivergence {
            epoch,
            phase: phase.into(),
            detail: detail.into(),
        }
    }
}
