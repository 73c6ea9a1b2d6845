//! Programmed-I/O driver over file-backed shared memory.
//!
//! Every endpoint is a file under the configured SMB directory. The process
//! that allocates the endpoint creates and sizes the file; every other user
//! maps the same file. Transfers are synchronous CPU copies, so a request is
//! complete as soon as `start` returns.

use std::any::Any;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::driver::{DriverCaps, XferFactory};
use crate::event::EventSink;
use crate::request::{StartOutcome, XferFlags, XferRequest, XferServices, XferStatus};
use crate::smem::{Mapping, SmemCore, SmemHandle, SmemServices};
use crate::window::{MemoryWindow, FLAG_SIZE};
use crate::{EndPoint, XferConfig, XferError, XferResult};

pub const PIO_PROTOCOL: &str = "ocpi-smb-pio";

pub struct PioFactory {
    config: XferConfig,
    instance: u64,
    minted: AtomicU32,
}

impl PioFactory {
    pub fn new(config: XferConfig) -> Self {
        let instance = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            config,
            instance,
            minted: AtomicU32::new(0),
        }
    }

    fn path_for(&self, endpoint: &EndPoint) -> PathBuf {
        self.config.smb_dir.join(endpoint.address())
    }
}

impl XferFactory for PioFactory {
    fn protocol(&self) -> &'static str {
        PIO_PROTOCOL
    }

    fn capabilities(&self) -> DriverCaps {
        DriverCaps {
            remote_read: true,
            event_driven: false,
        }
    }

    fn create_smem(&self, endpoint: &EndPoint) -> XferResult<Arc<dyn SmemServices>> {
        let path = self.path_for(endpoint);
        let smem = if endpoint.is_local() {
            PioSmem::create(endpoint.clone(), path)?
        } else {
            PioSmem::attach(endpoint.clone(), path)?
        };
        Ok(Arc::new(smem))
    }

    fn create_xfer_services(
        &self,
        source: &Arc<dyn SmemServices>,
        target: &Arc<dyn SmemServices>,
    ) -> XferResult<Box<dyn XferServices>> {
        Ok(Box::new(PioXferServices {
            source: Arc::clone(source),
            target: Arc::clone(target),
        }))
    }

    fn allocate_endpoint(&self, _size: u64, mailbox: u16, _max_count: u16) -> XferResult<String> {
        let minted = self.minted.fetch_add(1, Ordering::Relaxed);
        Ok(format!(
            "smb-{}-{:x}-{}-{}",
            std::process::id(),
            self.instance,
            mailbox,
            minted
        ))
    }
}

#[derive(Debug)]
pub struct PioSmem {
    core: SmemCore,
    path: PathBuf,
    owner: bool,
    sink: Mutex<Option<EventSink>>,
}

impl PioSmem {
    fn create(endpoint: EndPoint, path: PathBuf) -> XferResult<Self> {
        let fail = |reason: std::io::Error| XferError::map_failed(&endpoint, reason);
        if endpoint.size() == 0 {
            return Err(XferError::map_failed(&endpoint, "zero-sized endpoint"));
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(fail)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(fail)?;
        file.set_len(endpoint.size()).map_err(fail)?;
        let window = MemoryWindow::map_file(&file, endpoint.size() as usize)
            .map_err(|e| XferError::map_failed(&endpoint, e))?;
        debug!(%endpoint, path = %path.display(), "created shared memory block");
        Ok(Self {
            core: SmemCore::new(endpoint, Some(window)),
            path,
            owner: true,
            sink: Mutex::new(None),
        })
    }

    fn attach(endpoint: EndPoint, path: PathBuf) -> XferResult<Self> {
        let fail = |reason: std::io::Error| XferError::map_failed(&endpoint, reason);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(fail)?;
        let on_disk = file.metadata().map_err(fail)?.len();
        let len = on_disk.min(endpoint.size());
        if len == 0 {
            return Err(XferError::map_failed(&endpoint, "shared memory block is empty"));
        }
        let window = MemoryWindow::map_file(&file, len as usize)
            .map_err(|e| XferError::map_failed(&endpoint, e))?;
        debug!(%endpoint, path = %path.display(), "attached shared memory block");
        Ok(Self {
            core: SmemCore::new(endpoint, Some(window)),
            path,
            owner: false,
            sink: Mutex::new(None),
        })
    }

    fn notify(&self) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.post();
        }
    }

    fn remove_backing_file(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "failed to remove shared memory block");
            }
        }
    }
}

impl SmemServices for PioSmem {
    fn endpoint(&self) -> &EndPoint {
        self.core.endpoint()
    }

    fn map(&self, offset: u64, len: u64) -> XferResult<Mapping> {
        self.core.map(offset, len)
    }

    fn unmap(&self, mapping: Mapping) -> XferResult<()> {
        self.core.unmap(mapping)
    }

    fn handle(&self) -> XferResult<SmemHandle> {
        self.core.handle()
    }

    fn close(&self) -> XferResult<()> {
        if !self.core.close() {
            return Err(XferError::Closed(self.endpoint().to_string()));
        }
        if self.owner {
            self.remove_backing_file();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn set_event_sink(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for PioSmem {
    fn drop(&mut self) {
        if self.owner && self.core.close() {
            self.remove_backing_file();
        }
    }
}

pub struct PioXferServices {
    source: Arc<dyn SmemServices>,
    target: Arc<dyn SmemServices>,
}

impl PioXferServices {
    fn execute(&self, request: &XferRequest, message_length: Option<u64>) -> XferResult<()> {
        let src = self.source.handle()?;
        let dst = self.target.handle()?;
        let mut wakeup = false;
        for op in request.ops() {
            if op.flags.contains(XferFlags::FLAG) {
                if op.length != FLAG_SIZE {
                    return Err(XferError::transfer(format!(
                        "flag op must move {FLAG_SIZE} bytes, got {}",
                        op.length
                    )));
                }
                fence(Ordering::Release);
                let value = src.load_flag(op.src_offset)?;
                dst.store_flag(op.dst_offset, value)?;
            } else {
                let len = op.effective_length(message_length);
                if len > 0 {
                    src.copy_to(op.src_offset, &dst, op.dst_offset, len)?;
                }
            }
            wakeup |= op.flags.contains(XferFlags::WAKEUP);
        }
        if wakeup {
            if let Some(target) = self.target.as_any().downcast_ref::<PioSmem>() {
                target.notify();
            }
        }
        Ok(())
    }
}

impl XferServices for PioXferServices {
    fn source(&self) -> &EndPoint {
        self.source.endpoint()
    }

    fn target(&self) -> &EndPoint {
        self.target.endpoint()
    }

    fn start(&mut self, request: &mut XferRequest, message_length: Option<u64>) -> XferResult<StartOutcome> {
        trace!(ops = request.ops().len(), ?message_length, "pio transfer");
        match self.execute(request, message_length) {
            Ok(()) => {
                request.set_status(XferStatus::Done);
                Ok(StartOutcome::Started)
            }
            Err(err) => {
                request.set_status(XferStatus::Error);
                Err(err)
            }
        }
    }

    fn status(&mut self, request: &mut XferRequest) -> XferResult<XferStatus> {
        Ok(request.status())
    }
}
