//! Error taxonomy for circuits, ports and the container runtime.

use thiserror::Error;
use xfer::XferError;

use crate::CircuitId;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

/// How far an error reaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// The caller can fix its input or retry later.
    ApplicationRecoverable,
    /// The affected application instance has to stop.
    ApplicationFatal,
    /// Shared state of the whole container is suspect; tear everything down.
    ContainerFatal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Resource,
    Lifecycle,
    Internal,
    Mapping,
    Driver,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),

    #[error("bad connection cookie: {0}")]
    BadConnectionCookie(String),

    #[error("port {0} is already connected")]
    PortAlreadyConnected(String),

    #[error("bad port configuration: {0}")]
    BadPortConfig(String),

    #[error("no free buffers on {0}")]
    NoMoreBuffers(String),

    #[error("out of memory for {0}")]
    NoMoreMemory(String),

    #[error("endpoint count exceeded (mailbox {requested} > {max})")]
    EndpointCountExceeded { requested: u16, max: u16 },

    #[error("circuit {0} is disconnecting")]
    CircuitDisconnecting(CircuitId),

    #[error("circuit {0} not found")]
    CircuitNotFound(CircuitId),

    #[error("server not responding: {0}")]
    ServerNotResponding(String),

    #[error("buffer {0} is not owned by the caller")]
    BufferNotOwned(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("mapping failed for `{endpoint}`: {reason}")]
    MappingFailed { endpoint: String, reason: String },

    #[error("driver error: {0}")]
    Driver(XferError),
}

impl TransportError {
    pub fn bad_config(msg: impl Into<String>) -> Self {
        TransportError::BadPortConfig(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        TransportError::Internal(msg.into())
    }

    pub fn category(&self) -> ErrorCategory {
        use TransportError::*;
        match self {
            UnsupportedEndpoint(_)
            | BadConnectionCookie(_)
            | PortAlreadyConnected(_)
            | BadPortConfig(_) => ErrorCategory::Configuration,
            NoMoreBuffers(_) | NoMoreMemory(_) | EndpointCountExceeded { .. } => {
                ErrorCategory::Resource
            }
            CircuitDisconnecting(_) | CircuitNotFound(_) | ServerNotResponding(_) => {
                ErrorCategory::Lifecycle
            }
            BufferNotOwned(_) | Internal(_) => ErrorCategory::Internal,
            MappingFailed { .. } => ErrorCategory::Mapping,
            Driver(_) => ErrorCategory::Driver,
        }
    }

    pub fn severity(&self) -> Severity {
        match self.category() {
            ErrorCategory::Configuration | ErrorCategory::Resource | ErrorCategory::Lifecycle => {
                Severity::ApplicationRecoverable
            }
            ErrorCategory::Internal | ErrorCategory::Driver => Severity::ApplicationFatal,
            ErrorCategory::Mapping => Severity::ContainerFatal,
        }
    }
}

impl From<XferError> for TransportError {
    fn from(err: XferError) -> Self {
        match err {
            XferError::UnsupportedEndpoint(protocol) => TransportError::UnsupportedEndpoint(protocol),
            XferError::IncompatibleEndpoints { from, to } => {
                TransportError::UnsupportedEndpoint(format!("{from} cannot reach {to}"))
            }
            XferError::BadEndpoint { uri, reason } => {
                TransportError::BadPortConfig(format!("endpoint `{uri}`: {reason}"))
            }
            XferError::MailboxesExhausted { requested, max } => {
                TransportError::EndpointCountExceeded { requested, max }
            }
            XferError::MapFailed { endpoint, reason } => {
                TransportError::MappingFailed { endpoint, reason }
            }
            XferError::Closed(endpoint) => {
                TransportError::Internal(format!("memory services for {endpoint} used after close"))
            }
            XferError::Descriptor(reason) => TransportError::BadConnectionCookie(reason.into()),
            err @ (XferError::OutOfBounds { .. }
            | XferError::Misaligned(_)
            | XferError::UnknownTemplate(_)) => TransportError::Internal(err.to_string()),
            other => TransportError::Driver(other),
        }
    }
}
