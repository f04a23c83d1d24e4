//! Error types for the bus crates

use thiserror::Error;

/// Bus error type
#[derive(Error, Debug)]
pub enum Error {
    /// Wire-layer error
    #[error("wire error: {0}")]
    Wire(#[from] mesh_wire::Error),

    /// Registry client error
    #[error("registry error: {0}")]
    Registry(#[from] mesh_registry::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Connect-with-retry exhausted its attempts
    #[error("connection to {host}:{port} did not come up within the retry window")]
    ConnectTimedOut {
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// The bus has no send path for this packet type
    #[error("no send path for {0} packets")]
    UnsupportedSend(&'static str),

    /// Broker back-end failure
    #[error("broker error: {0}")]
    Broker(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
