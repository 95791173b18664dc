//! Crate-wide error type.
//!
//! Every variant except the wrapped I/O family is a fatal precondition or
//! numeric failure: the trial stops and the error is reported as-is. Failures
//! while estimating a single query never travel through this type; they are
//! folded into `QueryOutcome::Unsupported` by the evaluation loop.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CardEstError>;

#[derive(Debug, Error)]
pub enum CardEstError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid setting `{key}`: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("dataset `{0}` is not in the list of available datasets")]
    UnsupportedDataset(String),

    #[error("expected exactly one checkpoint for `{pattern}`, found {found}")]
    CheckpointNotFound { pattern: String, found: usize },

    #[error("malformed ordering: {0}")]
    MalformedOrdering(String),

    #[error("no learning-rate policy configured (constant_lr, lr_scheduler or warmups)")]
    NoLearningRatePolicy,

    #[error("assertion thresholds breached:\n{0}")]
    AssertionFailed(String),

    #[error("non-finite loss {value} at epoch {epoch}, step {step}")]
    NonFiniteLoss { epoch: usize, step: usize, value: f64 },

    #[error("unknown column `{0}`")]
    UnknownColumn(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("tensor data error: {0}")]
    TensorData(String),

    #[error("record error: {0}")]
    Record(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),
}

impl CardEstError {
    pub fn invalid_setting(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a burn `TensorData` conversion failure.
    pub fn tensor_data(err: impl std::fmt::Debug) -> Self {
        Self::TensorData(format!("{err:?}"))
    }

    /// Wrap a burn recorder failure (save/load of model or optimizer records).
    pub fn record(err: impl std::fmt::Debug) -> Self {
        Self::Record(format!("{err:?}"))
    }
}
