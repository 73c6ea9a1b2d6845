//! Endpoint addressing.
//!
//! An endpoint names one shared resource reachable through a driver. Its
//! canonical string `<protocol>://<address>:<size>.<mailbox>.<max_count>` is
//! what crosses process boundaries; the address portion is private to the
//! driver, the trailing group is common to every protocol.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::{XferError, XferResult};

const SCHEME_SEPARATOR: &str = "://";

#[derive(Clone, Debug)]
pub struct EndPoint {
    protocol: String,
    address: String,
    size: u64,
    mailbox: u16,
    max_count: u16,
    local: bool,
}

impl EndPoint {
    pub fn new(
        protocol: impl Into<String>,
        address: impl Into<String>,
        size: u64,
        mailbox: u16,
        max_count: u16,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            address: address.into(),
            size,
            mailbox,
            max_count,
            local: false,
        }
    }

    /// Parses a canonical endpoint string.
    pub fn parse(uri: &str) -> XferResult<Self> {
        let bad = |reason| XferError::BadEndpoint {
            uri: uri.to_string(),
            reason,
        };

        let (protocol, rest) = uri
            .split_once(SCHEME_SEPARATOR)
            .ok_or_else(|| bad("missing `://` separator"))?;
        if protocol.is_empty() {
            return Err(bad("empty protocol"));
        }
        let (address, tail) = rest
            .rsplit_once(':')
            .ok_or_else(|| bad("missing `:<size>.<mailbox>.<max>` suffix"))?;
        if address.is_empty() {
            return Err(bad("empty address"));
        }

        let mut fields = tail.split('.');
        let size = fields
            .next()
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or_else(|| bad("invalid size field"))?;
        let mailbox = fields
            .next()
            .and_then(|f| f.parse::<u16>().ok())
            .ok_or_else(|| bad("invalid mailbox field"))?;
        let max_count = fields
            .next()
            .and_then(|f| f.parse::<u16>().ok())
            .ok_or_else(|| bad("invalid max count field"))?;
        if fields.next().is_some() {
            return Err(bad("trailing fields after max count"));
        }
        if mailbox > max_count {
            return Err(bad("mailbox exceeds max count"));
        }

        Ok(Self::new(protocol, address, size, mailbox, max_count))
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Driver-private locator.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mailbox(&self) -> u16 {
        self.mailbox
    }

    pub fn max_count(&self) -> u16 {
        self.max_count
    }

    /// True when this process owns (created) the resource behind the endpoint.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub(crate) fn into_local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Two endpoints can exchange data when one driver serves both.
    pub fn is_compatible(&self, other: &EndPoint) -> bool {
        self.protocol == other.protocol
    }

    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}:{}.{}.{}",
            self.protocol, SCHEME_SEPARATOR, self.address, self.size, self.mailbox, self.max_count
        )
    }
}

impl FromStr for EndPoint {
    type Err = XferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndPoint::parse(s)
    }
}

// Identity is the canonical string; locality is a per-process view.
impl PartialEq for EndPoint {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol
            && self.address == other.address
            && self.size == other.size
            && self.mailbox == other.mailbox
            && self.max_count == other.max_count
    }
}

impl Eq for EndPoint {}

impl Hash for EndPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.address.hash(state);
        self.size.hash(state);
        self.mailbox.hash(state);
        self.max_count.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_pio_endpoint() {
        let ep = EndPoint::parse("ocpi-smb-pio://smb-42:3145728.3.16").expect("parse");
        assert_eq!(ep.protocol(), "ocpi-smb-pio");
        assert_eq!(ep.address(), "smb-42");
        assert_eq!(ep.size(), 3_145_728);
        assert_eq!(ep.mailbox(), 3);
        assert_eq!(ep.max_count(), 16);
        assert!(!ep.is_local());
    }

    #[test]
    fn datagram_address_keeps_its_separator() {
        let ep = EndPoint::parse("ocpi-udp://127.0.0.1;40001:65536.1.8").expect("parse");
        assert_eq!(ep.address(), "127.0.0.1;40001");
        assert_eq!(ep.to_string(), "ocpi-udp://127.0.0.1;40001:65536.1.8");
    }

    #[test]
    fn ipv6_locators_split_on_last_colon() {
        let ep = EndPoint::parse("ocpi-udp://::1;40001:4096.2.4").expect("parse");
        assert_eq!(ep.address(), "::1;40001");
        assert_eq!(ep.size(), 4096);
    }

    #[test]
    fn malformed_uris_are_rejected() {
        for uri in [
            "ocpi-smb-pio:smb:1.1.1",
            "://smb:1.1.1",
            "ocpi-smb-pio://:1.1.1",
            "ocpi-smb-pio://smb",
            "ocpi-smb-pio://smb:1.1",
            "ocpi-smb-pio://smb:1.1.1.1",
            "ocpi-smb-pio://smb:x.1.1",
            "ocpi-smb-pio://smb:1.9.4",
        ] {
            assert!(
                matches!(EndPoint::parse(uri), Err(XferError::BadEndpoint { .. })),
                "expected {uri} to be rejected"
            );
        }
    }

    #[test]
    fn locality_does_not_affect_identity() {
        let remote = EndPoint::parse("ocpi-smb-pio://smb:64.1.2").expect("parse");
        let local = remote.clone().into_local();
        assert_eq!(remote, local);
        assert!(local.is_local());
    }

    proptest! {
        /// Formatting then parsing reproduces an equal endpoint and string.
        #[test]
        fn canonical_string_round_trips(
            protocol in "[a-z][a-z-]{0,12}",
            address in "[A-Za-z0-9_;.-]{1,24}",
            size in any::<u64>(),
            max_count in 1u16..=u16::MAX,
            mailbox_frac in 0.0f64..1.0,
        ) {
            let mailbox = (f64::from(max_count) * mailbox_frac) as u16;
            let ep = EndPoint::new(protocol, address, size, mailbox, max_count);
            let text = ep.to_string();
            let parsed = EndPoint::parse(&text).expect("round trip");
            prop_assert_eq!(&parsed, &ep);
            prop_assert_eq!(parsed.to_string(), text);
        }
    }
}
