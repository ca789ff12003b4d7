//! Error types for the capture relay.

use thiserror::Error;

/// Errors surfaced by the capture and encode pipeline.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Connecting to the capture service over the inherited handle failed.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// The capture service refused the stream connect request.
    #[error("Stream connect failed: {0}")]
    StreamConnect(String),

    /// The transport link to the capture service broke or was misused.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Encoder creation or frame encoding failed.
    #[error("Encoder error: {0}")]
    Encoder(String),
}

impl RelayError {
    /// Process exit status reported for this error.
    ///
    /// Connect failures exit with -2 and stream connect failures with -3,
    /// matching the return convention of the capture entry point. Everything
    /// else maps to the conventional generic failure status.
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::Connect(_) => -2,
            RelayError::StreamConnect(_) => -3,
            _ => 1,
        }
    }
}

/// Convenience result type used across the crate.
pub type Result<T> = std::result::Result<T, RelayError>;
