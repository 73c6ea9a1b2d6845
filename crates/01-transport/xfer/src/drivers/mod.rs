//! Bundled reference drivers.

mod datagram;
mod pio;

pub use datagram::{
    DatagramFactory, DatagramSmem, DatagramXferServices, PacketHeader, PacketKind,
    DATAGRAM_PROTOCOL, MAX_DATAGRAM, MAX_PAYLOAD, PACKET_HEADER_SIZE,
};
pub use pio::{PioFactory, PioSmem, PioXferServices, PIO_PROTOCOL};
