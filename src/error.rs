use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    InsufficientFunds(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Storage error: {message}")]
    Storage { message: String, retryable: bool },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Deployment descriptor error: {0}")]
    Deploy(String),

    #[error("YAML deserialization failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ExchangeError {
    pub fn storage(message: impl Into<String>) -> Self {
        ExchangeError::Storage {
            message: message.into(),
            retryable: false,
        }
    }

    /// Transient storage failures (deadlocks, serialization conflicts) that
    /// are safe to retry as a whole unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Storage { retryable: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
