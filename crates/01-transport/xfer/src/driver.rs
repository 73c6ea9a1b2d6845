//! Driver plug-in surface.

use std::sync::Arc;

use crate::request::XferServices;
use crate::smem::SmemServices;
use crate::{EndPoint, XferResult};

/// What a driver can do beyond plain pushes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverCaps {
    /// The local side can read remote memory directly, which passive peers
    /// rely on.
    pub remote_read: bool,
    /// Flags landing in local memory are announced through an event sink.
    pub event_driven: bool,
}

/// One factory per endpoint protocol.
pub trait XferFactory: Send + Sync {
    fn protocol(&self) -> &'static str;

    fn capabilities(&self) -> DriverCaps;

    /// Creates the resource for a local endpoint or attaches to a remote one.
    fn create_smem(&self, endpoint: &EndPoint) -> XferResult<Arc<dyn SmemServices>>;

    fn create_xfer_services(
        &self,
        source: &Arc<dyn SmemServices>,
        target: &Arc<dyn SmemServices>,
    ) -> XferResult<Box<dyn XferServices>>;

    /// Mints the driver-private address for a new local endpoint.
    fn allocate_endpoint(&self, size: u64, mailbox: u16, max_count: u16) -> XferResult<String>;
}
