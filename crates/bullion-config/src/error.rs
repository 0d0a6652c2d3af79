//! Configuration errors.

use crate::ConfigValidationError;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The configuration loaded but is not usable.
    #[error("Invalid configuration: {}", join_errors(.0))]
    Invalid(Vec<ConfigValidationError>),
}

fn join_errors(errors: &[ConfigValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<ConfigError> for bullion::JobError {
    fn from(err: ConfigError) -> Self {
        bullion::JobError::Configuration(err.to_string())
    }
}
