//! Shared-memory services: the per-endpoint view of a mapped resource.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::event::EventSink;
use crate::window::MemoryWindow;
use crate::{EndPoint, XferError, XferResult};

/// Handle to the memory behind a set of services.
pub type SmemHandle = Arc<MemoryWindow>;

pub trait SmemServices: Send + Sync + fmt::Debug {
    fn endpoint(&self) -> &EndPoint;

    /// Maps `len` bytes starting at `offset`.
    fn map(&self, offset: u64, len: u64) -> XferResult<Mapping>;

    fn unmap(&self, mapping: Mapping) -> XferResult<()>;

    /// The memory this process can touch directly.
    fn handle(&self) -> XferResult<SmemHandle>;

    /// Releases the resource. Every later call reports [`XferError::Closed`].
    fn close(&self) -> XferResult<()>;

    fn is_closed(&self) -> bool;

    /// Translates a local offset into the form a peer must use.
    fn externalize_offset(&self, local: u64) -> u64 {
        local
    }

    /// Drives receive-side progress. Returns the amount of work done.
    fn poll(&self) -> XferResult<usize> {
        Ok(0)
    }

    /// Registers the sink posted whenever a flag lands in this memory.
    fn set_event_sink(&self, _sink: EventSink) {}

    fn as_any(&self) -> &dyn Any;
}

/// A mapped, bounds-checked range of a [`MemoryWindow`].
///
/// Offsets passed to the accessors are relative to the start of the range.
#[derive(Clone, Debug)]
pub struct Mapping {
    window: SmemHandle,
    offset: u64,
    len: u64,
}

impl Mapping {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn window(&self) -> &SmemHandle {
        &self.window
    }

    fn absolute(&self, at: u64, len: u64) -> XferResult<u64> {
        match at.checked_add(len) {
            Some(end) if end <= self.len => Ok(self.offset + at),
            _ => Err(XferError::OutOfBounds {
                offset: at,
                len,
                size: self.len,
            }),
        }
    }

    pub fn write(&self, at: u64, bytes: &[u8]) -> XferResult<()> {
        let abs = self.absolute(at, bytes.len() as u64)?;
        self.window.write(abs, bytes)
    }

    pub fn read(&self, at: u64, out: &mut [u8]) -> XferResult<()> {
        let abs = self.absolute(at, out.len() as u64)?;
        self.window.read(abs, out)
    }

    pub fn load_flag(&self, at: u64) -> XferResult<u64> {
        let abs = self.absolute(at, crate::window::FLAG_SIZE)?;
        self.window.load_flag(abs)
    }

    pub fn store_flag(&self, at: u64, value: u64) -> XferResult<()> {
        let abs = self.absolute(at, crate::window::FLAG_SIZE)?;
        self.window.store_flag(abs, value)
    }

    /// # Safety
    ///
    /// See [`MemoryWindow::slice`].
    pub unsafe fn slice(&self, at: u64, len: u64) -> XferResult<&[u8]> {
        let abs = self.absolute(at, len)?;
        self.window.slice(abs, len)
    }

    /// # Safety
    ///
    /// See [`MemoryWindow::slice_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, at: u64, len: u64) -> XferResult<&mut [u8]> {
        let abs = self.absolute(at, len)?;
        self.window.slice_mut(abs, len)
    }
}

#[derive(Debug)]
enum SmemState {
    Open { window: Option<SmemHandle>, mapped: usize },
    Closed,
}

/// Open/closed bookkeeping shared by the bundled drivers.
#[derive(Debug)]
pub(crate) struct SmemCore {
    endpoint: EndPoint,
    state: Mutex<SmemState>,
}

impl SmemCore {
    pub(crate) fn new(endpoint: EndPoint, window: Option<MemoryWindow>) -> Self {
        Self {
            endpoint,
            state: Mutex::new(SmemState::Open {
                window: window.map(Arc::new),
                mapped: 0,
            }),
        }
    }

    pub(crate) fn endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    fn closed(&self) -> XferError {
        XferError::Closed(self.endpoint.to_string())
    }

    pub(crate) fn handle(&self) -> XferResult<SmemHandle> {
        match &*self.state.lock() {
            SmemState::Open {
                window: Some(window),
                ..
            } => Ok(Arc::clone(window)),
            SmemState::Open { window: None, .. } => Err(XferError::Unsupported(
                "remote memory of this driver is not directly addressable",
            )),
            SmemState::Closed => Err(self.closed()),
        }
    }

    pub(crate) fn map(&self, offset: u64, len: u64) -> XferResult<Mapping> {
        let mut state = self.state.lock();
        match &mut *state {
            SmemState::Open {
                window: Some(window),
                mapped,
            } => {
                let size = window.len() as u64;
                match offset.checked_add(len) {
                    Some(end) if end <= size => {}
                    _ => return Err(XferError::OutOfBounds { offset, len, size }),
                }
                *mapped += 1;
                Ok(Mapping {
                    window: Arc::clone(window),
                    offset,
                    len,
                })
            }
            SmemState::Open { window: None, .. } => Err(XferError::Unsupported(
                "remote memory of this driver cannot be mapped",
            )),
            SmemState::Closed => Err(self.closed()),
        }
    }

    pub(crate) fn unmap(&self, mapping: Mapping) -> XferResult<()> {
        let mut state = self.state.lock();
        match &mut *state {
            SmemState::Open { mapped, .. } => {
                *mapped = mapped.saturating_sub(1);
                drop(mapping);
                Ok(())
            }
            SmemState::Closed => Err(self.closed()),
        }
    }

    /// Transitions to closed. Returns `false` when already closed.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SmemState::Closed) {
            SmemState::Open { mapped, .. } => {
                if mapped > 0 {
                    debug!(endpoint = %self.endpoint, mapped, "closing with live mappings");
                }
                true
            }
            SmemState::Closed => false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), SmemState::Closed)
    }
}
