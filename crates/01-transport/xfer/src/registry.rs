//! Protocol registry and endpoint cache.
//!
//! The registry is an ordinary value owned by whoever runs the dataplane;
//! nothing here is process-global. Mailbox numbers are assigned under the
//! registry lock, which is the only non-pure part of endpoint handling.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::driver::XferFactory;
use crate::drivers::{DatagramFactory, PioFactory};
use crate::request::XferServices;
use crate::smem::SmemServices;
use crate::{EndPoint, XferConfig, XferError, XferResult};

struct RegistryInner {
    factories: BTreeMap<String, Arc<dyn XferFactory>>,
    endpoints: HashMap<String, EndPoint>,
    smems: HashMap<String, Weak<dyn SmemServices>>,
    next_mailbox: u16,
}

pub struct DriverRegistry {
    config: XferConfig,
    inner: Mutex<RegistryInner>,
}

impl DriverRegistry {
    pub fn new(config: XferConfig) -> Self {
        let next_mailbox = config.mailbox_base;
        Self {
            config,
            inner: Mutex::new(RegistryInner {
                factories: BTreeMap::new(),
                endpoints: HashMap::new(),
                smems: HashMap::new(),
                next_mailbox,
            }),
        }
    }

    /// Registry with the shared-memory and datagram drivers installed.
    pub fn with_default_drivers(config: XferConfig) -> Self {
        let registry = Self::new(config.clone());
        registry.register(Arc::new(PioFactory::new(config.clone())));
        registry.register(Arc::new(DatagramFactory::new(config)));
        registry
    }

    pub fn config(&self) -> &XferConfig {
        &self.config
    }

    /// Installs `factory`, replacing any factory for the same protocol.
    pub fn register(&self, factory: Arc<dyn XferFactory>) {
        let protocol = factory.protocol().to_string();
        debug!(%protocol, "registering transfer driver");
        self.inner.lock().factories.insert(protocol, factory);
    }

    pub fn protocols(&self) -> Vec<String> {
        self.inner.lock().factories.keys().cloned().collect()
    }

    pub fn factory(&self, protocol: &str) -> XferResult<Arc<dyn XferFactory>> {
        self.inner
            .lock()
            .factories
            .get(protocol)
            .cloned()
            .ok_or_else(|| XferError::UnsupportedEndpoint(protocol.to_string()))
    }

    /// Resolves `uri` to a cached endpoint, rejecting unknown protocols.
    pub fn endpoint(&self, uri: &str) -> XferResult<EndPoint> {
        let parsed = EndPoint::parse(uri)?;
        let canonical = parsed.canonical();
        let mut inner = self.inner.lock();
        if !inner.factories.contains_key(parsed.protocol()) {
            return Err(XferError::UnsupportedEndpoint(parsed.protocol().to_string()));
        }
        Ok(inner
            .endpoints
            .entry(canonical)
            .or_insert(parsed)
            .clone())
    }

    /// Mints a fresh local endpoint for `protocol`, assigning the next mailbox.
    pub fn allocate_local_endpoint(
        &self,
        protocol: &str,
        requested_size: Option<u64>,
    ) -> XferResult<EndPoint> {
        let mut inner = self.inner.lock();
        let factory = inner
            .factories
            .get(protocol)
            .cloned()
            .ok_or_else(|| XferError::UnsupportedEndpoint(protocol.to_string()))?;

        let mailbox = inner.next_mailbox;
        let max = self.config.max_mailbox;
        if mailbox > max {
            return Err(XferError::MailboxesExhausted {
                requested: mailbox,
                max,
            });
        }
        let size = requested_size.unwrap_or(self.config.smb_size);
        let address = factory.allocate_endpoint(size, mailbox, max)?;
        inner.next_mailbox = mailbox.saturating_add(1);

        let endpoint = EndPoint::new(protocol, address, size, mailbox, max).into_local();
        debug!(%endpoint, "allocated local endpoint");
        inner
            .endpoints
            .insert(endpoint.canonical(), endpoint.clone());
        Ok(endpoint)
    }

    /// Drops `endpoint` from the cache once no circuit refers to it.
    pub fn forget(&self, endpoint: &EndPoint) {
        let key = endpoint.canonical();
        let mut inner = self.inner.lock();
        inner.endpoints.remove(&key);
        inner.smems.remove(&key);
    }

    pub fn cached_endpoints(&self) -> usize {
        self.inner.lock().endpoints.len()
    }

    /// Memory services for `endpoint`, shared with any other live user of
    /// the same endpoint in this process.
    pub fn smem(&self, endpoint: &EndPoint) -> XferResult<Arc<dyn SmemServices>> {
        let key = endpoint.canonical();
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.smems.get(&key).and_then(Weak::upgrade) {
            if !existing.is_closed() {
                return Ok(existing);
            }
        }
        let factory = inner
            .factories
            .get(endpoint.protocol())
            .cloned()
            .ok_or_else(|| XferError::UnsupportedEndpoint(endpoint.protocol().to_string()))?;
        let smem = factory.create_smem(endpoint)?;
        inner.smems.retain(|_, weak| weak.strong_count() > 0);
        inner.smems.insert(key, Arc::downgrade(&smem));
        Ok(smem)
    }

    pub fn create_xfer_services(
        &self,
        source: &Arc<dyn SmemServices>,
        target: &Arc<dyn SmemServices>,
    ) -> XferResult<Box<dyn XferServices>> {
        let (from, to) = (source.endpoint(), target.endpoint());
        if !from.is_compatible(to) {
            return Err(XferError::IncompatibleEndpoints {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.factory(from.protocol())?
            .create_xfer_services(source, target)
    }
}
