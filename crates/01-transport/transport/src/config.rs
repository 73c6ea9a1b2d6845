//! Container-level configuration: driver settings plus port defaults.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use xfer::drivers::PIO_PROTOCOL;
use xfer::XferConfig;

pub const DEFAULT_BUFFER_COUNT: u32 = 2;
pub const DEFAULT_BUFFER_SIZE: u32 = 2048;
pub const DEFAULT_EVENT_WAIT: Duration = Duration::from_millis(1);

pub const ENV_BUFFER_COUNT: &str = "OCPI_BUFFER_COUNT";
pub const ENV_BUFFER_SIZE: &str = "OCPI_BUFFER_SIZE";

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub xfer: XferConfig,
    /// Buffer count used by port sets that do not choose their own.
    pub buffer_count: u32,
    /// Buffer length in bytes used by port sets that do not choose their own.
    pub buffer_size: u32,
    /// Upper bound on the blocking part of a run call.
    pub event_wait: Duration,
    /// Protocol for ports whose metadata names none.
    pub default_protocol: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            xfer: XferConfig::default(),
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            event_wait: DEFAULT_EVENT_WAIT,
            default_protocol: PIO_PROTOCOL.to_string(),
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> Self {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    pub fn overlay_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(count) = parse_var(&lookup, ENV_BUFFER_COUNT) {
            self.buffer_count = count;
        }
        if let Some(size) = parse_var(&lookup, ENV_BUFFER_SIZE) {
            self.buffer_size = size;
        }
        self.xfer = self.xfer.overlay_env(lookup);
        self
    }

    pub fn with_xfer(mut self, xfer: XferConfig) -> Self {
        self.xfer = xfer;
        self
    }

    pub fn with_buffers(mut self, count: u32, size: u32) -> Self {
        self.buffer_count = count;
        self.buffer_size = size;
        self
    }

    pub fn with_event_wait(mut self, wait: Duration) -> Self {
        self.event_wait = wait;
        self
    }

    pub fn with_default_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.default_protocol = protocol.into();
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_defaults_follow_the_environment() {
        let cfg = TransportConfig::default().overlay_env(|key| match key {
            ENV_BUFFER_COUNT => Some("6".into()),
            ENV_BUFFER_SIZE => Some("0x40".into()),
            "OCPI_SMB_SIZE" => Some("8192".into()),
            _ => None,
        });
        assert_eq!(cfg.buffer_count, 6);
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(cfg.xfer.smb_size, 8192);
        assert_eq!(cfg.default_protocol, PIO_PROTOCOL);
    }
}
