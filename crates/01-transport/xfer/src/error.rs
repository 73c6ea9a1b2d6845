//! Error surface for endpoint resolution, memory services and drivers.

use thiserror::Error;

/// Convenience result alias for fallible xfer operations.
pub type XferResult<T, E = XferError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum XferError {
    #[error("unsupported endpoint protocol `{0}`")]
    UnsupportedEndpoint(String),

    #[error("malformed endpoint `{uri}`: {reason}")]
    BadEndpoint { uri: String, reason: &'static str },

    #[error("endpoints `{from}` and `{to}` are not compatible")]
    IncompatibleEndpoints { from: String, to: String },

    #[error("mailbox {requested} exceeds the configured maximum {max}")]
    MailboxesExhausted { requested: u16, max: u16 },

    #[error("failed to map `{endpoint}`: {reason}")]
    MapFailed { endpoint: String, reason: String },

    #[error("range at {offset} of {len} bytes is outside a {size} byte window")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("flag offset {0} is not 8-byte aligned")]
    Misaligned(u64),

    #[error("memory services for `{0}` are closed")]
    Closed(String),

    #[error("descriptor decode failed: {0}")]
    Descriptor(&'static str),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("unknown transfer template {0}")]
    UnknownTemplate(u32),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl XferError {
    pub fn transfer(msg: impl Into<String>) -> Self {
        XferError::Transfer(msg.into())
    }

    pub fn map_failed(endpoint: impl ToString, reason: impl ToString) -> Self {
        XferError::MapFailed {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }
}
