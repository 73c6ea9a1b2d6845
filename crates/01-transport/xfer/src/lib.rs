//! Endpoint addressing, shared-memory services and transfer drivers.
//!
//! This crate is the bottom half of the dataplane:
//! * [`EndPoint`] – canonical resource addresses and their parser.
//! * [`DriverRegistry`] / [`XferFactory`] – per-protocol drivers owned by the caller.
//! * [`SmemServices`] / [`MemoryWindow`] – mapped memory with a typed closed state.
//! * [`XferServices`] / [`XferRequest`] – ordered copies ending in a flag write.
//! * [`TransferTemplateManager`] – precompiled transfers with a bounded in-flight count.
//! * [`EventManager`] – completion events for drivers that signal through the OS.
//! * [`Descriptors`] – the wire form of a port's buffer geometry.

mod config;
mod descriptor;
mod driver;
pub mod drivers;
mod endpoint;
mod error;
mod event;
mod registry;
mod request;
mod smem;
mod template;
mod window;

pub use config::{
    XferConfig, DEFAULT_MAILBOX_BASE, DEFAULT_MAX_MAILBOX, DEFAULT_MAX_TX_TEMPLATES,
    DEFAULT_SMB_SIZE,
};
pub use descriptor::{
    Desc, DescriptorType, Descriptors, OutOfBand, PortOptions, PortRole, DESCRIPTOR_WIRE_SIZE,
    MAX_ROLE, OEP_LEN,
};
pub use driver::{DriverCaps, XferFactory};
pub use endpoint::EndPoint;
pub use error::{XferError, XferResult};
pub use event::{EventManager, EventSink};
pub use registry::DriverRegistry;
pub use request::{StartOutcome, XferFlags, XferOp, XferRequest, XferServices, XferStatus};
pub use smem::{Mapping, SmemHandle, SmemServices};
pub use template::{ServicesId, TemplateId, TransferTemplate, TransferTemplateManager};
pub use window::{MemoryWindow, FLAG_SIZE, WINDOW_ALIGNMENT};
