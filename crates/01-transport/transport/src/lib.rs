//! Circuits, ports and buffer flow on top of the `xfer` drivers.
//!
//! This crate is the top half of the dataplane:
//! * [`ConnectionMetaData`] – which port sets meet, and how data is split between them.
//! * [`DataDistribution`] – per-message routing and byte ranges for each destination rank.
//! * [`choose_roles`] – push/pull role negotiation between an output and an input.
//! * [`Circuit`] – one connection's ports, buffer ownership and transfer templates.
//! * [`Buffer`] – the caller's exclusive claim on one slot.
//! * [`Runtime`] – the process-wide owner of drivers, circuits and completion events.
//! * [`TransportError`] – error surface with a category and severity per failure.

mod buffer;
mod circuit;
mod config;
mod distribution;
mod error;
mod layout;
mod metadata;
mod port;
mod role;
mod runtime;

pub use buffer::{Buffer, BufferId, BufferState, MetaRecord, PortRef, META_RECORD_SIZE};
pub use circuit::{Circuit, CircuitId, CircuitState};
pub use config::{
    TransportConfig, DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE, DEFAULT_EVENT_WAIT,
    ENV_BUFFER_COUNT, ENV_BUFFER_SIZE,
};
pub use distribution::{
    block_range, BufferInfo, BufferRange, DataDistribution, DestinationGeometry, SourceGeometry,
};
pub use error::{ErrorCategory, Severity, TransportError, TransportResult};
pub use metadata::{ConnectionMetaData, PortMetaData, PortSetMetaData};
pub use role::{choose_roles, NegotiatedRoles, RoleOffer};
pub use runtime::Runtime;
