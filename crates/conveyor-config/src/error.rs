//! Build definition parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Kdl(#[from] kdl::KdlError),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for conveyor_core::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::LimitExceeded(msg) => conveyor_core::Error::LimitExceeded(msg),
            other => conveyor_core::Error::ValidationFailed(other.to_string()),
        }
    }
}
