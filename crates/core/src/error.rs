use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown domain event type: {0}")]
    UnknownEventType(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
