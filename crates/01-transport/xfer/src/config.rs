//! Driver-level configuration.
//!
//! Values default to the stock dataplane settings and can be overridden
//! through the `OCPI_*` environment variables the drivers have always honoured.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

/// Default shared-memory block size for a newly allocated local endpoint.
pub const DEFAULT_SMB_SIZE: u64 = 3 * 1024 * 1024;
/// First mailbox number handed out by endpoint allocation.
pub const DEFAULT_MAILBOX_BASE: u16 = 1;
/// Highest mailbox number endpoint allocation may hand out.
pub const DEFAULT_MAX_MAILBOX: u16 = 256;
/// Upper bound on concurrently outstanding transfer templates.
pub const DEFAULT_MAX_TX_TEMPLATES: usize = 64;

pub const ENV_SMB_SIZE: &str = "OCPI_SMB_SIZE";
pub const ENV_MAILBOX: &str = "OCPI_TRANSFER_MAILBOX";
pub const ENV_MAX_MAILBOX: &str = "OCPI_MAX_MAILBOX";
pub const ENV_SMB_DIR: &str = "OCPI_SMB_DIR";
pub const ENV_IP_ADDR: &str = "OCPI_TRANSFER_IP_ADDR";
pub const ENV_PORT: &str = "OCPI_TRANSFER_PORT";
pub const ENV_MAX_TX_TEMPLATES: &str = "OCPI_MAX_TX_TEMPLATES";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XferConfig {
    /// Size of the shared-memory block behind each local endpoint.
    pub smb_size: u64,
    pub mailbox_base: u16,
    pub max_mailbox: u16,
    /// Directory holding the files that back `ocpi-smb-pio` endpoints.
    pub smb_dir: PathBuf,
    /// Interface the datagram driver binds local endpoints to.
    pub udp_address: IpAddr,
    /// Port for the first datagram endpoint; `0` picks an ephemeral port.
    pub udp_port: u16,
    pub max_tx_templates: usize,
}

impl Default for XferConfig {
    fn default() -> Self {
        Self {
            smb_size: DEFAULT_SMB_SIZE,
            mailbox_base: DEFAULT_MAILBOX_BASE,
            max_mailbox: DEFAULT_MAX_MAILBOX,
            smb_dir: std::env::temp_dir().join("ocpi-smb"),
            udp_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port: 0,
            max_tx_templates: DEFAULT_MAX_TX_TEMPLATES,
        }
    }
}

impl XferConfig {
    /// Builds a configuration from defaults overlaid with the environment.
    pub fn from_env() -> Self {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    /// Applies overrides produced by `lookup`, ignoring values that fail to parse.
    pub fn overlay_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(size) = parse_var(&lookup, ENV_SMB_SIZE) {
            self.smb_size = size;
        }
        if let Some(base) = parse_var(&lookup, ENV_MAILBOX) {
            self.mailbox_base = base;
        }
        if let Some(max) = parse_var(&lookup, ENV_MAX_MAILBOX) {
            self.max_mailbox = max;
        }
        if let Some(dir) = lookup(ENV_SMB_DIR) {
            self.smb_dir = PathBuf::from(dir);
        }
        if let Some(addr) = parse_var(&lookup, ENV_IP_ADDR) {
            self.udp_address = addr;
        }
        if let Some(port) = parse_var(&lookup, ENV_PORT) {
            self.udp_port = port;
        }
        if let Some(max) = parse_var(&lookup, ENV_MAX_TX_TEMPLATES) {
            self.max_tx_templates = max;
        }
        self
    }

    pub fn with_smb_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.smb_dir = dir.into();
        self
    }

    pub fn with_smb_size(mut self, size: u64) -> Self {
        self.smb_size = size;
        self
    }

    pub fn with_mailbox_range(mut self, base: u16, max: u16) -> Self {
        self.mailbox_base = base;
        self.max_mailbox = max;
        self
    }

    pub fn with_udp_address(mut self, address: IpAddr, port: u16) -> Self {
        self.udp_address = address;
        self.udp_port = port;
        self
    }

    pub fn with_max_tx_templates(mut self, max: usize) -> Self {
        self.max_tx_templates = max;
        self
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
