use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {0}: {1}")]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Duplicate kind: {0}")]
    DuplicateKind(String),

    #[error("Unknown kind: {0}")]
    UnknownKind(String),

    #[error("Registry is frozen: {0}")]
    FrozenRegistry(String),

    #[error("Invalid preset reference: {0}")]
    InvalidPreset(String),

    #[error("Base middleware marker may appear at most once per chain")]
    DuplicateBaseMarker,

    #[error("target path must have a base URL")]
    MissingBaseUrl,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
