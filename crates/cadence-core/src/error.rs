use thiserror::Error;

use crate::types::{ActionType, QuotaWindow};

/// Top-level error type for the cadence engine.
///
/// Subsystem crates define their own error types and convert into this one
/// where they cross into configuration or process-level concerns.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "{action_type} {window} limit {requested} exceeds the hard safety ceiling of {max}"
    )]
    CeilingAboveHardLimit {
        action_type: ActionType,
        window: QuotaWindow,
        requested: u32,
        max: u32,
    },

    #[error("API error: {0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<toml::de::Error> for CadenceError {
    fn from(err: toml::de::Error) -> Self {
        CadenceError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for CadenceError {
    fn from(err: toml::ser::Error) -> Self {
        CadenceError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for CadenceError {
    fn from(err: serde_json::Error) -> Self {
        CadenceError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for cadence operations.
pub type Result<T> = std::result::Result<T, CadenceError>;
