use thiserror::Error;

use crate::context::ContextError;
use crate::core::GraphError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid workflow: {0}")]
    Graph(#[from] GraphError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported definition format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
}

pub type Result<T> = std::result::Result<T, Error>;
