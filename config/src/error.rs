use alloc::string::String;
use thiserror::Error;

/// Errors raised while decoding, encoding or persisting configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("invalid value for {0}")]
    InvalidValue(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("config is not a JSON object")]
    NotAnObject,
}

impl ConfigError {
    pub fn parse_error(msg: &str) -> Self {
        ConfigError::ParseError(String::from(msg))
    }

    pub fn invalid_value(key: &str) -> Self {
        ConfigError::InvalidValue(String::from(key))
    }

    pub fn storage_error(msg: &str) -> Self {
        ConfigError::StorageError(String::from(msg))
    }

    pub fn serialization_error(msg: &str) -> Self {
        ConfigError::SerializationError(String::from(msg))
    }
}
