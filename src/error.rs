//! Error types for Dominator

use thiserror::Error;

/// Result type for Dominator operations
pub type Result<T> = std::result::Result<T, DominatorError>;

/// Dominator error types
#[derive(Error, Debug)]
pub enum DominatorError {
    /// Non-success answer from a Docker engine
    #[error("Docker API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Docker stream error: {0}")]
    Stream(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Volume error: {0}")]
    Volume(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Shipment error: {0}")]
    Shipment(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Docker socket error: {0}")]
    Transport(#[from] hyper::Error),
}

impl DominatorError {
    /// HTTP status of a Docker API error, if this is one
    pub fn status(&self) -> Option<u16> {
        match self {
            DominatorError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the engine's explanation mentions `needle`
    pub fn explains(&self, needle: &str) -> bool {
        match self {
            DominatorError::Api { message, .. } => message.contains(needle),
            _ => false,
        }
    }
}
