//! Error types for the wire layer

use thiserror::Error;

/// Wire-layer error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame length exceeds the protocol limit
    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    /// Peer closed the connection at a frame boundary
    #[error("connection closed by peer")]
    Closed,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
