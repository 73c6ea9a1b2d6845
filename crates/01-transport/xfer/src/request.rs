//! Transfer requests and the per-pair services that execute them.

use std::any::Any;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use smallvec::SmallVec;

use crate::{EndPoint, XferResult};

/// Bit flags qualifying a single copy operation.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct XferFlags(u32);

impl XferFlags {
    pub const NONE: XferFlags = XferFlags(0);
    /// Payload bytes.
    pub const DATA: XferFlags = XferFlags(0x1);
    /// Per-buffer metadata record.
    pub const METADATA: XferFlags = XferFlags(0x2);
    /// Flag word; becomes visible only after every earlier op of the request.
    pub const FLAG: XferFlags = XferFlags(0x4);
    /// Length may be trimmed to the message length when the request starts.
    pub const SIZE_MODIFIABLE: XferFlags = XferFlags(0x8);
    /// Ask the target side to raise a completion event.
    pub const WAKEUP: XferFlags = XferFlags(0x10);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        XferFlags(bits & 0x1f)
    }

    pub const fn contains(self, other: XferFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for XferFlags {
    type Output = XferFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        XferFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for XferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for XferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (XferFlags::DATA, "DATA"),
            (XferFlags::METADATA, "METADATA"),
            (XferFlags::FLAG, "FLAG"),
            (XferFlags::SIZE_MODIFIABLE, "SIZE_MODIFIABLE"),
            (XferFlags::WAKEUP, "WAKEUP"),
        ];
        let mut first = true;
        write!(f, "XferFlags(")?;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

/// One copy from the source memory to the target memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XferOp {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub length: u64,
    pub flags: XferFlags,
    /// Position of this op's first byte within the message it carries.
    /// Only meaningful with [`XferFlags::SIZE_MODIFIABLE`].
    pub message_offset: u64,
}

impl XferOp {
    /// Length to move when the message being sent is `message_length` bytes.
    pub fn effective_length(&self, message_length: Option<u64>) -> u64 {
        match message_length {
            Some(total) if self.flags.contains(XferFlags::SIZE_MODIFIABLE) => self
                .length
                .min(total.saturating_sub(self.message_offset)),
            _ => self.length,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The driver cannot take more work right now; nothing was started.
    Busy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XferStatus {
    /// Built but never started, or released back to idle.
    Idle,
    Pending,
    Done,
    Error,
}

/// A schedulable batch of ops executed in order by one [`XferServices`].
pub struct XferRequest {
    ops: SmallVec<[XferOp; 4]>,
    status: XferStatus,
    driver: Option<Box<dyn Any + Send>>,
}

impl fmt::Debug for XferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XferRequest")
            .field("ops", &self.ops)
            .field("status", &self.status)
            .finish()
    }
}

impl XferRequest {
    pub fn new(op: XferOp) -> Self {
        let mut ops = SmallVec::new();
        ops.push(op);
        Self::from_ops(ops)
    }

    pub fn from_ops(ops: SmallVec<[XferOp; 4]>) -> Self {
        Self {
            ops,
            status: XferStatus::Idle,
            driver: None,
        }
    }

    pub fn ops(&self) -> &[XferOp] {
        &self.ops
    }

    pub fn status(&self) -> XferStatus {
        self.status
    }

    pub fn set_status(&mut self, status: XferStatus) {
        self.status = status;
    }

    /// Driver-private progress state, if the driver stored any.
    pub fn driver_state_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.driver.as_mut().and_then(|state| state.downcast_mut())
    }

    pub fn set_driver_state<T: Any + Send>(&mut self, state: T) {
        self.driver = Some(Box::new(state));
    }

    pub fn clear_driver_state(&mut self) {
        self.driver = None;
    }

    /// True when the last op writes a flag, so completion of the request is
    /// observable by the target.
    pub fn ends_with_flag(&self) -> bool {
        self.ops
            .last()
            .map(|op| op.flags.contains(XferFlags::FLAG))
            .unwrap_or(false)
    }
}

/// Copy and flag mechanism between one source and one target memory.
pub trait XferServices: Send {
    fn source(&self) -> &EndPoint;

    fn target(&self) -> &EndPoint;

    fn create_request(&self, src_offset: u64, dst_offset: u64, length: u64, flags: XferFlags) -> XferRequest {
        XferRequest::new(XferOp {
            src_offset,
            dst_offset,
            length,
            flags,
            message_offset: 0,
        })
    }

    /// Concatenates requests into one unit; order is preserved.
    fn group(&self, requests: Vec<XferRequest>) -> XferRequest {
        let ops = requests
            .into_iter()
            .flat_map(|request| request.ops.into_iter())
            .collect();
        XferRequest::from_ops(ops)
    }

    /// True when a [`XferServices::start`] would report busy.
    fn is_busy(&self) -> bool {
        false
    }

    /// Starts `request`, trimming size-modifiable ops to `message_length`.
    fn start(&mut self, request: &mut XferRequest, message_length: Option<u64>) -> XferResult<StartOutcome>;

    fn status(&mut self, request: &mut XferRequest) -> XferResult<XferStatus>;

    fn release(&mut self, request: XferRequest) {
        drop(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let flags = XferFlags::DATA | XferFlags::SIZE_MODIFIABLE;
        assert!(flags.contains(XferFlags::DATA));
        assert!(flags.contains(XferFlags::SIZE_MODIFIABLE));
        assert!(!flags.contains(XferFlags::FLAG));
        assert_eq!(format!("{flags:?}"), "XferFlags(DATA | SIZE_MODIFIABLE)");
        assert_eq!(XferFlags::from_bits(0xff).bits(), 0x1f);
    }

    #[test]
    fn size_modifiable_ops_clamp_to_message() {
        let op = XferOp {
            src_offset: 0,
            dst_offset: 0,
            length: 100,
            flags: XferFlags::DATA | XferFlags::SIZE_MODIFIABLE,
            message_offset: 100,
        };
        assert_eq!(op.effective_length(Some(150)), 50);
        assert_eq!(op.effective_length(Some(80)), 0);
        assert_eq!(op.effective_length(Some(500)), 100);
        assert_eq!(op.effective_length(None), 100);

        let fixed = XferOp {
            flags: XferFlags::METADATA,
            ..op
        };
        assert_eq!(fixed.effective_length(Some(0)), 100);
    }

    #[test]
    fn driver_state_downcasts() {
        let mut request = XferRequest::new(XferOp {
            src_offset: 0,
            dst_offset: 0,
            length: 8,
            flags: XferFlags::FLAG,
            message_offset: 0,
        });
        assert!(request.ends_with_flag());
        request.set_driver_state(3u32);
        assert_eq!(request.driver_state_mut::<u32>().copied(), Some(3));
        assert!(request.driver_state_mut::<u64>().is_none());
        request.clear_driver_state();
        assert!(request.driver_state_mut::<u32>().is_none());
    }
}
