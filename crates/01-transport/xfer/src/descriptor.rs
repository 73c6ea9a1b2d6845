//! Port descriptors exchanged between the two halves of a connection.
//!
//! The layout is fixed little-endian with no padding so that producers and
//! consumers built separately agree byte for byte.

use std::fmt;

use crate::{XferError, XferResult};

pub const DESCRIPTOR_WIRE_SIZE: usize = 228;
pub const OEP_LEN: usize = 128;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorType {
    ConsumerDesc = 0,
    ConsumerFlowControlDesc = 1,
    ProducerDesc = 2,
}

impl DescriptorType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(DescriptorType::ConsumerDesc),
            1 => Some(DescriptorType::ConsumerFlowControlDesc),
            2 => Some(DescriptorType::ProducerDesc),
            _ => None,
        }
    }
}

/// Which side initiates data movement and flow-control signalling.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortRole {
    /// Moves the data.
    ActiveMessage = 0,
    /// Only sends or receives doorbells.
    ActiveFlowControl = 1,
    /// Does everything while the peer stays passive.
    ActiveOnly = 2,
    /// Never initiates anything.
    Passive = 3,
    NoRole = -1,
}

/// Number of real roles; also the first option bit above the role bits.
pub const MAX_ROLE: u32 = 4;

impl PortRole {
    pub const ALL: [PortRole; 4] = [
        PortRole::ActiveMessage,
        PortRole::ActiveFlowControl,
        PortRole::ActiveOnly,
        PortRole::Passive,
    ];

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(PortRole::ActiveMessage),
            1 => Some(PortRole::ActiveFlowControl),
            2 => Some(PortRole::ActiveOnly),
            3 => Some(PortRole::Passive),
            -1 => Some(PortRole::NoRole),
            _ => None,
        }
    }

    /// The role the other side must take.
    pub fn complement(self) -> PortRole {
        match self {
            PortRole::ActiveMessage => PortRole::ActiveFlowControl,
            PortRole::ActiveFlowControl => PortRole::ActiveMessage,
            PortRole::ActiveOnly => PortRole::Passive,
            PortRole::Passive => PortRole::ActiveOnly,
            PortRole::NoRole => PortRole::NoRole,
        }
    }

    pub fn bit(self) -> u32 {
        match self {
            PortRole::NoRole => 0,
            role => 1 << (role as i32 as u32),
        }
    }
}

/// Option word carried in a descriptor: supported-role bits plus modifiers.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PortOptions(u32);

impl PortOptions {
    /// The role in the descriptor is not negotiable.
    pub const MANDATED_ROLE: u32 = 1 << MAX_ROLE;
    /// Flow-control feedback is a running count rather than per-slot flags.
    pub const FEEDBACK_IS_COUNT: u32 = 1 << (MAX_ROLE + 1);

    pub const fn from_bits(bits: u32) -> Self {
        PortOptions(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn supporting(roles: &[PortRole]) -> Self {
        PortOptions(roles.iter().fold(0, |bits, role| bits | role.bit()))
    }

    pub fn supports(self, role: PortRole) -> bool {
        role != PortRole::NoRole && self.0 & role.bit() != 0
    }

    pub fn supported_roles(self) -> impl Iterator<Item = PortRole> {
        PortRole::ALL.into_iter().filter(move |role| self.supports(*role))
    }

    pub fn with(self, bits: u32) -> Self {
        PortOptions(self.0 | bits)
    }

    pub fn without(self, bits: u32) -> Self {
        PortOptions(self.0 & !bits)
    }

    pub fn has(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn mandated(self) -> bool {
        self.has(Self::MANDATED_ROLE)
    }

    pub fn feedback_is_count(self) -> bool {
        self.has(Self::FEEDBACK_IS_COUNT)
    }
}

impl fmt::Debug for PortOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortOptions")
            .field("roles", &self.supported_roles().collect::<Vec<_>>())
            .field("mandated", &self.mandated())
            .field("feedback_is_count", &self.feedback_is_count())
            .finish()
    }
}

/// Out-of-band identity of the port that produced a descriptor.
#[derive(Clone, PartialEq, Eq)]
pub struct OutOfBand {
    pub port_id: u64,
    pub oep: [u8; OEP_LEN],
}

impl OutOfBand {
    /// Stores `endpoint` NUL-padded; fails when it does not fit with a
    /// terminator.
    pub fn new(port_id: u64, endpoint: &str) -> XferResult<Self> {
        let bytes = endpoint.as_bytes();
        if bytes.len() >= OEP_LEN {
            return Err(XferError::Descriptor("endpoint string exceeds 127 bytes"));
        }
        let mut oep = [0u8; OEP_LEN];
        oep[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { port_id, oep })
    }

    pub fn endpoint(&self) -> XferResult<&str> {
        let end = self.oep.iter().position(|&b| b == 0).unwrap_or(OEP_LEN);
        std::str::from_utf8(&self.oep[..end])
            .map_err(|_| XferError::Descriptor("endpoint string is not utf-8"))
    }
}

impl Default for OutOfBand {
    fn default() -> Self {
        Self {
            port_id: 0,
            oep: [0u8; OEP_LEN],
        }
    }
}

impl fmt::Debug for OutOfBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutOfBand")
            .field("port_id", &self.port_id)
            .field("oep", &self.endpoint().unwrap_or("<invalid>"))
            .finish()
    }
}

/// Buffer geometry and flag regions of one port.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Desc {
    pub n_buffers: u32,
    pub data_buffer_base_addr: u64,
    pub data_buffer_pitch: u32,
    pub data_buffer_size: u32,
    pub meta_data_base_addr: u64,
    pub meta_data_pitch: u32,
    pub full_flag_base_addr: u64,
    pub full_flag_size: u32,
    pub full_flag_pitch: u32,
    pub full_flag_value: u64,
    pub empty_flag_base_addr: u64,
    pub empty_flag_size: u32,
    pub empty_flag_pitch: u32,
    pub empty_flag_value: u64,
    pub oob: OutOfBand,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptors {
    pub kind: DescriptorType,
    pub role: PortRole,
    pub options: PortOptions,
    pub desc: Desc,
}

struct Writer<'a> {
    out: &'a mut [u8; DESCRIPTOR_WIRE_SIZE],
    at: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.out[self.at..self.at + bytes.len()].copy_from_slice(bytes);
        self.at += bytes.len();
    }

    fn u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut raw = [0u8; N];
        raw.copy_from_slice(&self.bytes[self.at..self.at + N]);
        self.at += N;
        raw
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }
}

impl Descriptors {
    pub fn encode(&self) -> [u8; DESCRIPTOR_WIRE_SIZE] {
        let mut out = [0u8; DESCRIPTOR_WIRE_SIZE];
        let mut w = Writer { out: &mut out, at: 0 };
        let d = &self.desc;
        w.u32(self.kind as u32);
        w.i32(self.role as i32);
        w.u32(self.options.bits());
        w.u32(d.n_buffers);
        w.u64(d.data_buffer_base_addr);
        w.u32(d.data_buffer_pitch);
        w.u32(d.data_buffer_size);
        w.u64(d.meta_data_base_addr);
        w.u32(d.meta_data_pitch);
        w.u64(d.full_flag_base_addr);
        w.u32(d.full_flag_size);
        w.u32(d.full_flag_pitch);
        w.u64(d.full_flag_value);
        w.u64(d.empty_flag_base_addr);
        w.u32(d.empty_flag_size);
        w.u32(d.empty_flag_pitch);
        w.u64(d.empty_flag_value);
        w.u64(d.oob.port_id);
        w.put(&d.oob.oep);
        debug_assert_eq!(w.at, DESCRIPTOR_WIRE_SIZE);
        out
    }

    pub fn decode(bytes: &[u8]) -> XferResult<Self> {
        if bytes.len() != DESCRIPTOR_WIRE_SIZE {
            return Err(XferError::Descriptor("descriptor must be 228 bytes"));
        }
        let mut r = Reader { bytes, at: 0 };
        let kind = DescriptorType::from_u32(r.u32())
            .ok_or(XferError::Descriptor("unknown descriptor type"))?;
        let role = PortRole::from_i32(r.i32()).ok_or(XferError::Descriptor("unknown port role"))?;
        let options = PortOptions::from_bits(r.u32());
        let desc = Desc {
            n_buffers: r.u32(),
            data_buffer_base_addr: r.u64(),
            data_buffer_pitch: r.u32(),
            data_buffer_size: r.u32(),
            meta_data_base_addr: r.u64(),
            meta_data_pitch: r.u32(),
            full_flag_base_addr: r.u64(),
            full_flag_size: r.u32(),
            full_flag_pitch: r.u32(),
            full_flag_value: r.u64(),
            empty_flag_base_addr: r.u64(),
            empty_flag_size: r.u32(),
            empty_flag_pitch: r.u32(),
            empty_flag_value: r.u64(),
            oob: OutOfBand {
                port_id: r.u64(),
                oep: r.take(),
            },
        };
        desc.oob.endpoint()?;
        Ok(Self {
            kind,
            role,
            options,
            desc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Descriptors {
        Descriptors {
            kind: DescriptorType::ProducerDesc,
            role: PortRole::ActiveMessage,
            options: PortOptions::supporting(&[PortRole::ActiveMessage, PortRole::ActiveOnly])
                .with(PortOptions::FEEDBACK_IS_COUNT),
            desc: Desc {
                n_buffers: 4,
                data_buffer_base_addr: 0x1000,
                data_buffer_pitch: 64,
                data_buffer_size: 64,
                meta_data_base_addr: 0x2000,
                meta_data_pitch: 16,
                full_flag_base_addr: 0x3000,
                full_flag_size: 8,
                full_flag_pitch: 8,
                full_flag_value: 1,
                empty_flag_base_addr: 0x4000,
                empty_flag_size: 8,
                empty_flag_pitch: 0,
                empty_flag_value: 1,
                oob: OutOfBand::new(7, "ocpi-smb-pio://smb-1:4096.1.8").expect("oob"),
            },
        }
    }

    #[test]
    fn field_offsets_match_the_wire_layout() {
        let bytes = sample().encode();
        assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &(0b0101u32 | 1 << 5).to_le_bytes());
        assert_eq!(&bytes[12..16], &4u32.to_le_bytes());
        assert_eq!(&bytes[16..24], &0x1000u64.to_le_bytes());
        assert_eq!(&bytes[32..40], &0x2000u64.to_le_bytes());
        assert_eq!(&bytes[44..52], &0x3000u64.to_le_bytes());
        assert_eq!(&bytes[60..68], &1u64.to_le_bytes());
        assert_eq!(&bytes[68..76], &0x4000u64.to_le_bytes());
        assert_eq!(&bytes[92..100], &7u64.to_le_bytes());
        assert_eq!(&bytes[100..112], b"ocpi-smb-pio");
        assert_eq!(bytes[DESCRIPTOR_WIRE_SIZE - 1], 0);
    }

    #[test]
    fn decode_inverts_encode() {
        let desc = sample();
        let decoded = Descriptors::decode(&desc.encode()).expect("decode");
        assert_eq!(decoded, desc);
        assert_eq!(
            decoded.desc.oob.endpoint().expect("oep"),
            "ocpi-smb-pio://smb-1:4096.1.8"
        );
    }

    #[test]
    fn malformed_descriptors_are_rejected() {
        let mut bytes = sample().encode();
        assert!(Descriptors::decode(&bytes[..100]).is_err());
        bytes[0] = 9;
        assert!(matches!(
            Descriptors::decode(&bytes),
            Err(XferError::Descriptor(_))
        ));
    }

    #[test]
    fn oversized_endpoint_strings_are_rejected() {
        let long = "x".repeat(OEP_LEN);
        assert!(OutOfBand::new(1, &long).is_err());
        assert!(OutOfBand::new(1, &long[..OEP_LEN - 1]).is_ok());
    }

    #[test]
    fn roles_pair_up() {
        for role in PortRole::ALL {
            assert_eq!(role.complement().complement(), role);
        }
        let opts = PortOptions::supporting(&[PortRole::Passive]).with(PortOptions::MANDATED_ROLE);
        assert!(opts.supports(PortRole::Passive));
        assert!(!opts.supports(PortRole::ActiveOnly));
        assert!(opts.mandated());
        assert!(!opts.feedback_is_count());
    }
}
