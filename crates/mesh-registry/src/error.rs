//! Error types for the registry crates

use thiserror::Error;

/// Registry error type
#[derive(Error, Debug)]
pub enum Error {
    /// Wire-layer error
    #[error("wire error: {0}")]
    Wire(#[from] mesh_wire::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The registry connection dropped while a reply was outstanding
    #[error("registry connection lost")]
    ConnectionLost,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
