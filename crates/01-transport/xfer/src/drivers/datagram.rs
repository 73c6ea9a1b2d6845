//! Datagram driver over UDP.
//!
//! The memory behind a datagram endpoint lives only in the process that owns
//! it. Peers write into it by sending packets: each transfer is cut into
//! data packets of at most [`MAX_DATAGRAM`] bytes followed by one packet per
//! flag op. The receiver applies data immediately but holds a flag back until
//! every data packet of its transfer has landed, so a flag never becomes
//! visible ahead of the payload it guards. Lost packets are not retransmitted;
//! a transfer that loses a data packet never raises its flag.

use std::any::Any;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::driver::{DriverCaps, XferFactory};
use crate::event::EventSink;
use crate::request::{StartOutcome, XferFlags, XferRequest, XferServices, XferStatus};
use crate::smem::{Mapping, SmemCore, SmemHandle, SmemServices};
use crate::window::{MemoryWindow, FLAG_SIZE};
use crate::{EndPoint, XferConfig, XferError, XferResult};

pub const DATAGRAM_PROTOCOL: &str = "ocpi-udp";
/// Largest packet put on the wire, header included.
pub const MAX_DATAGRAM: usize = 1500;
pub const PACKET_HEADER_SIZE: usize = 32;
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - PACKET_HEADER_SIZE;

const PACKET_MAGIC: u32 = 0x4F43_5055;
const LOCATOR_SEPARATOR: char = ';';
/// Transfers a peer may complete past a partial one before the partial one
/// is treated as lost.
const STALE_TRANSFERS: u64 = 64;

#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Data = 1,
    Flag = 2,
}

impl PacketKind {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(PacketKind::Data),
            2 => Some(PacketKind::Flag),
            _ => None,
        }
    }
}

/// Self-contained header at the front of every packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    /// Number of data packets in the whole transfer.
    pub data_packets: u16,
    pub transfer_id: u64,
    pub dst_offset: u64,
    pub length: u32,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut out = [0u8; PACKET_HEADER_SIZE];
        out[0..4].copy_from_slice(&PACKET_MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&(self.kind as u16).to_le_bytes());
        out[6..8].copy_from_slice(&self.data_packets.to_le_bytes());
        out[8..16].copy_from_slice(&self.transfer_id.to_le_bytes());
        out[16..24].copy_from_slice(&self.dst_offset.to_le_bytes());
        out[24..28].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> XferResult<Self> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(XferError::transfer("short datagram"));
        }
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at = |at: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(raw)
        };
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        if u32_at(0) != PACKET_MAGIC {
            return Err(XferError::transfer("bad datagram magic"));
        }
        let kind = PacketKind::from_u16(u16_at(4))
            .ok_or_else(|| XferError::transfer("unknown datagram kind"))?;
        Ok(Self {
            kind,
            data_packets: u16_at(6),
            transfer_id: u64_at(8),
            dst_offset: u64_at(16),
            length: u32_at(24),
        })
    }

    fn packet(&self, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
        packet.extend_from_slice(&self.encode());
        packet.extend_from_slice(payload);
        packet
    }
}

fn parse_locator(endpoint: &EndPoint) -> XferResult<SocketAddr> {
    let bad = |reason| XferError::BadEndpoint {
        uri: endpoint.to_string(),
        reason,
    };
    let (ip, port) = endpoint
        .address()
        .split_once(LOCATOR_SEPARATOR)
        .ok_or_else(|| bad("datagram address must be `<ip>;<port>`"))?;
    let ip: IpAddr = ip.parse().map_err(|_| bad("invalid ip address"))?;
    let port: u16 = port.parse().map_err(|_| bad("invalid port"))?;
    Ok(SocketAddr::new(ip, port))
}

pub struct DatagramFactory {
    config: XferConfig,
    reserved: Mutex<HashMap<String, UdpSocket>>,
}

impl DatagramFactory {
    pub fn new(config: XferConfig) -> Self {
        Self {
            config,
            reserved: Mutex::new(HashMap::new()),
        }
    }
}

impl XferFactory for DatagramFactory {
    fn protocol(&self) -> &'static str {
        DATAGRAM_PROTOCOL
    }

    fn capabilities(&self) -> DriverCaps {
        DriverCaps {
            remote_read: false,
            event_driven: true,
        }
    }

    fn create_smem(&self, endpoint: &EndPoint) -> XferResult<Arc<dyn SmemServices>> {
        let smem = if endpoint.is_local() {
            let socket = match self.reserved.lock().remove(endpoint.address()) {
                Some(socket) => socket,
                None => UdpSocket::bind(parse_locator(endpoint)?)
                    .map_err(|e| XferError::map_failed(endpoint, e))?,
            };
            DatagramSmem::local(endpoint.clone(), socket)?
        } else {
            DatagramSmem::remote(endpoint.clone())?
        };
        Ok(Arc::new(smem))
    }

    fn create_xfer_services(
        &self,
        source: &Arc<dyn SmemServices>,
        target: &Arc<dyn SmemServices>,
    ) -> XferResult<Box<dyn XferServices>> {
        let peer = target
            .as_any()
            .downcast_ref::<DatagramSmem>()
            .ok_or(XferError::Unsupported("datagram target must be datagram memory"))?
            .peer_addr()?;
        let local_source = source
            .as_any()
            .downcast_ref::<DatagramSmem>()
            .map(|smem| smem.socket.is_some())
            .unwrap_or(false);
        if !local_source {
            return Err(XferError::Unsupported(
                "datagram transfers must originate from local memory",
            ));
        }
        Ok(Box::new(DatagramXferServices {
            source: Arc::clone(source),
            target: Arc::clone(target),
            peer,
            stalled: 0,
        }))
    }

    fn allocate_endpoint(&self, _size: u64, mailbox: u16, _max_count: u16) -> XferResult<String> {
        let port = match self.config.udp_port {
            0 => 0,
            base => base.saturating_add(mailbox.saturating_sub(self.config.mailbox_base)),
        };
        let socket = UdpSocket::bind(SocketAddr::new(self.config.udp_address, port))?;
        let bound = socket.local_addr()?;
        let address = format!("{}{}{}", bound.ip(), LOCATOR_SEPARATOR, bound.port());
        debug!(%address, "reserved datagram socket");
        self.reserved.lock().insert(address.clone(), socket);
        Ok(address)
    }
}

#[derive(Debug, Default)]
struct ReceiveState {
    received: HashMap<(SocketAddr, u64), u32>,
    deferred: Vec<(SocketAddr, PacketHeader, u64)>,
    /// Newest transfer per peer whose flag has landed.
    landed: HashMap<SocketAddr, u64>,
}

impl ReceiveState {
    /// Forgets `transfer_id` from `peer`, and any partial transfer from the
    /// same peer that has fallen [`STALE_TRANSFERS`] behind it.
    fn retire(&mut self, peer: SocketAddr, transfer_id: u64) {
        self.received.remove(&(peer, transfer_id));
        let newest = self.landed.entry(peer).or_insert(transfer_id);
        *newest = (*newest).max(transfer_id);
        let horizon = newest.saturating_sub(STALE_TRANSFERS);
        let stale = |from: &SocketAddr, id: u64| *from == peer && id < horizon;
        let before = self.received.len() + self.deferred.len();
        self.received.retain(|(from, id), _| !stale(from, *id));
        self.deferred.retain(|(from, header, _)| !stale(from, header.transfer_id));
        let dropped = before - self.received.len() - self.deferred.len();
        if dropped > 0 {
            debug!(%peer, dropped, "dropping incomplete datagram transfers");
        }
    }
}

#[derive(Debug)]
pub struct DatagramSmem {
    core: SmemCore,
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
    next_transfer: AtomicU64,
    receive: Mutex<ReceiveState>,
    sink: Mutex<Option<EventSink>>,
}

impl DatagramSmem {
    fn local(endpoint: EndPoint, socket: UdpSocket) -> XferResult<Self> {
        socket
            .set_nonblocking(true)
            .map_err(|e| XferError::map_failed(&endpoint, e))?;
        let window = MemoryWindow::owned(endpoint.size() as usize)?;
        debug!(%endpoint, "opened datagram memory");
        Ok(Self {
            core: SmemCore::new(endpoint, Some(window)),
            socket: Some(socket),
            peer: None,
            next_transfer: AtomicU64::new(1),
            receive: Mutex::new(ReceiveState::default()),
            sink: Mutex::new(None),
        })
    }

    fn remote(endpoint: EndPoint) -> XferResult<Self> {
        let peer = parse_locator(&endpoint)?;
        Ok(Self {
            core: SmemCore::new(endpoint, None),
            socket: None,
            peer: Some(peer),
            next_transfer: AtomicU64::new(1),
            receive: Mutex::new(ReceiveState::default()),
            sink: Mutex::new(None),
        })
    }

    /// Address packets for this memory must be sent to.
    pub fn peer_addr(&self) -> XferResult<SocketAddr> {
        match (&self.socket, self.peer) {
            (Some(socket), _) => Ok(socket.local_addr()?),
            (None, Some(peer)) => Ok(peer),
            (None, None) => Err(XferError::Unsupported("datagram memory without address")),
        }
    }

    fn socket(&self) -> XferResult<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or(XferError::Unsupported("remote datagram memory has no socket"))
    }

    fn apply_flag(&self, window: &MemoryWindow, header: &PacketHeader, value: u64) -> XferResult<()> {
        window.store_flag(header.dst_offset, value)?;
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.post();
        }
        Ok(())
    }

    fn receive_packet(&self, window: &MemoryWindow, from: SocketAddr, packet: &[u8]) -> XferResult<()> {
        let header = PacketHeader::decode(packet)?;
        let payload = &packet[PACKET_HEADER_SIZE..];
        if payload.len() != header.length as usize {
            return Err(XferError::transfer("datagram length mismatch"));
        }
        let key = (from, header.transfer_id);
        let mut state = self.receive.lock();
        match header.kind {
            PacketKind::Data => {
                window.write(header.dst_offset, payload)?;
                let count = state.received.entry(key).or_insert(0);
                *count += 1;
                let count = *count;
                let mut ready = Vec::new();
                state.deferred.retain(|(peer, deferred, value)| {
                    let due = (*peer, deferred.transfer_id) == key
                        && count >= u32::from(deferred.data_packets);
                    if due {
                        ready.push((*deferred, *value));
                    }
                    !due
                });
                if !ready.is_empty() {
                    state.retire(from, header.transfer_id);
                }
                drop(state);
                for (deferred, value) in ready {
                    self.apply_flag(window, &deferred, value)?;
                }
            }
            PacketKind::Flag => {
                if payload.len() != FLAG_SIZE as usize {
                    return Err(XferError::transfer("flag datagram must carry 8 bytes"));
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(payload);
                let value = u64::from_le_bytes(raw);
                let seen = state.received.get(&key).copied().unwrap_or(0);
                if seen >= u32::from(header.data_packets) {
                    state.retire(from, header.transfer_id);
                    drop(state);
                    self.apply_flag(window, &header, value)?;
                } else {
                    trace!(transfer = header.transfer_id, seen, "deferring flag");
                    state.deferred.push((from, header, value));
                }
            }
        }
        Ok(())
    }
}

impl SmemServices for DatagramSmem {
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
        if self.core.close() {
            Ok(())
        } else {
            Err(XferError::Closed(self.endpoint().to_string()))
        }
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn poll(&self) -> XferResult<usize> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(0);
        };
        let window = self.core.handle()?;
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut work = 0;
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if let Err(err) = self.receive_packet(&window, from, &buf[..len]) {
                        warn!(%from, %err, "dropping datagram");
                    }
                    work += 1;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(work)
    }

    fn set_event_sink(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Packets of a started request that the socket did not accept yet.
struct Backlog(Vec<Vec<u8>>);

pub struct DatagramXferServices {
    source: Arc<dyn SmemServices>,
    target: Arc<dyn SmemServices>,
    peer: SocketAddr,
    stalled: usize,
}

impl DatagramXferServices {
    fn source_smem(&self) -> XferResult<&DatagramSmem> {
        self.source
            .as_any()
            .downcast_ref::<DatagramSmem>()
            .ok_or(XferError::Unsupported("datagram source must be datagram memory"))
    }

    fn build_packets(&self, request: &XferRequest, message_length: Option<u64>) -> XferResult<Vec<Vec<u8>>> {
        let smem = self.source_smem()?;
        let window = smem.handle()?;
        let transfer_id = smem.next_transfer.fetch_add(1, Ordering::Relaxed);

        let mut data = Vec::new();
        let mut flags = Vec::new();
        for op in request.ops() {
            if op.flags.contains(XferFlags::FLAG) {
                if op.length != FLAG_SIZE {
                    return Err(XferError::transfer("flag op must move 8 bytes"));
                }
                let value = window.load_flag(op.src_offset)?;
                flags.push((op.dst_offset, value));
                continue;
            }
            let len = op.effective_length(message_length);
            let mut sent = 0u64;
            while sent < len {
                let chunk = (len - sent).min(MAX_PAYLOAD as u64);
                let bytes = window.read_vec(op.src_offset + sent, chunk)?;
                data.push((op.dst_offset + sent, bytes));
                sent += chunk;
            }
        }

        let data_packets = u16::try_from(data.len())
            .map_err(|_| XferError::transfer("transfer exceeds datagram packet budget"))?;
        let mut packets = Vec::with_capacity(data.len() + flags.len());
        for (dst_offset, bytes) in data {
            let header = PacketHeader {
                kind: PacketKind::Data,
                data_packets,
                transfer_id,
                dst_offset,
                length: bytes.len() as u32,
            };
            packets.push(header.packet(&bytes));
        }
        for (dst_offset, value) in flags {
            let header = PacketHeader {
                kind: PacketKind::Flag,
                data_packets,
                transfer_id,
                dst_offset,
                length: FLAG_SIZE as u32,
            };
            packets.push(header.packet(&value.to_le_bytes()));
        }
        Ok(packets)
    }

    /// Sends from the front of `packets`; returns how many were accepted.
    fn send(&self, packets: &[Vec<u8>]) -> XferResult<usize> {
        let socket = self.source_smem()?.socket()?;
        for (sent, packet) in packets.iter().enumerate() {
            match socket.send_to(packet, self.peer) {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(sent),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(packets.len())
    }
}

impl XferServices for DatagramXferServices {
    fn source(&self) -> &EndPoint {
        self.source.endpoint()
    }

    fn target(&self) -> &EndPoint {
        self.target.endpoint()
    }

    fn is_busy(&self) -> bool {
        self.stalled > 0
    }

    fn start(&mut self, request: &mut XferRequest, message_length: Option<u64>) -> XferResult<StartOutcome> {
        if self.is_busy() {
            return Ok(StartOutcome::Busy);
        }
        let packets = match self.build_packets(request, message_length) {
            Ok(packets) => packets,
            Err(err) => {
                request.set_status(XferStatus::Error);
                return Err(err);
            }
        };
        let sent = match self.send(&packets) {
            Ok(sent) => sent,
            Err(err) => {
                request.set_status(XferStatus::Error);
                return Err(err);
            }
        };
        if sent == 0 && !packets.is_empty() {
            return Ok(StartOutcome::Busy);
        }
        trace!(packets = packets.len(), sent, peer = %self.peer, "datagram transfer");
        if sent < packets.len() {
            request.set_driver_state(Backlog(packets[sent..].to_vec()));
            request.set_status(XferStatus::Pending);
            self.stalled += 1;
        } else {
            request.set_status(XferStatus::Done);
        }
        Ok(StartOutcome::Started)
    }

    fn status(&mut self, request: &mut XferRequest) -> XferResult<XferStatus> {
        if request.status() != XferStatus::Pending {
            return Ok(request.status());
        }
        let Some(backlog) = request.driver_state_mut::<Backlog>() else {
            return Ok(request.status());
        };
        let packets = std::mem::take(&mut backlog.0);
        let sent = self.send(&packets)?;
        if sent < packets.len() {
            if let Some(backlog) = request.driver_state_mut::<Backlog>() {
                backlog.0 = packets[sent..].to_vec();
            }
            return Ok(XferStatus::Pending);
        }
        request.clear_driver_state();
        request.set_status(XferStatus::Done);
        self.stalled = self.stalled.saturating_sub(1);
        Ok(XferStatus::Done)
    }

    fn release(&mut self, mut request: XferRequest) {
        if request.driver_state_mut::<Backlog>().is_some() {
            self.stalled = self.stalled.saturating_sub(1);
        }
        drop(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventManager;
    use crate::request::XferOp;
    use smallvec::smallvec;
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};

    fn factory() -> DatagramFactory {
        DatagramFactory::new(
            XferConfig::default().with_udp_address(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        )
    }

    fn local(factory: &DatagramFactory, mailbox: u16, size: u64) -> Arc<dyn SmemServices> {
        let address = factory.allocate_endpoint(size, mailbox, 16).expect("address");
        let ep = EndPoint::new(DATAGRAM_PROTOCOL, address, size, mailbox, 16).into_local();
        factory.create_smem(&ep).expect("create")
    }

    fn poll_until<F: Fn() -> bool>(smem: &Arc<dyn SmemServices>, done: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            smem.poll().expect("poll");
            assert!(Instant::now() < deadline, "timed out waiting for datagrams");
            std::thread::yield_now();
        }
    }

    #[test]
    fn header_layout_is_little_endian() {
        let header = PacketHeader {
            kind: PacketKind::Flag,
            data_packets: 3,
            transfer_id: 0x0102_0304_0506_0708,
            dst_offset: 64,
            length: 8,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], &PACKET_MAGIC.to_le_bytes());
        assert_eq!(&bytes[4..6], &[2, 0]);
        assert_eq!(&bytes[6..8], &[3, 0]);
        assert_eq!(bytes[8], 0x08);
        assert_eq!(PacketHeader::decode(&bytes).expect("decode"), header);
        assert!(PacketHeader::decode(&bytes[..16]).is_err());
    }

    #[test]
    fn large_transfer_lands_before_its_flag() {
        let factory = factory();
        let src = local(&factory, 1, 16 * 1024);
        let dst = local(&factory, 2, 16 * 1024);
        let mut events = EventManager::new();
        dst.set_event_sink(events.sink(4));

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let src_mem = src.handle().expect("src");
        src_mem.write(0, &payload).expect("payload");
        src_mem.store_flag(8192, 77).expect("flag source");

        let mut services = factory.create_xfer_services(&src, &dst).expect("services");
        let mut request = XferRequest::from_ops(smallvec![
            XferOp {
                src_offset: 0,
                dst_offset: 100,
                length: payload.len() as u64,
                flags: XferFlags::DATA,
                message_offset: 0,
            },
            XferOp {
                src_offset: 8192,
                dst_offset: 12288,
                length: FLAG_SIZE,
                flags: XferFlags::FLAG,
                message_offset: 0,
            },
        ]);
        assert_eq!(
            services.start(&mut request, None).expect("start"),
            StartOutcome::Started
        );

        let dst_mem = dst.handle().expect("dst");
        poll_until(&dst, || dst_mem.load_flag(12288).expect("flag") == 77);
        assert_eq!(
            dst_mem.read_vec(100, payload.len() as u64).expect("read"),
            payload
        );
        assert_eq!(events.wait(4, 4, Duration::from_millis(100)), Some(4));
    }

    #[test]
    fn flag_waits_for_missing_data() {
        let factory = factory();
        let dst = local(&factory, 3, 4096);
        let smem = dst
            .as_any()
            .downcast_ref::<DatagramSmem>()
            .expect("datagram smem");
        let window = dst.handle().expect("window");
        let from: SocketAddr = "127.0.0.1:9".parse().expect("addr");

        let flag = PacketHeader {
            kind: PacketKind::Flag,
            data_packets: 1,
            transfer_id: 5,
            dst_offset: 1024,
            length: 8,
        };
        smem.receive_packet(&window, from, &flag.packet(&1u64.to_le_bytes()))
            .expect("flag");
        assert_eq!(window.load_flag(1024).expect("flag"), 0, "flag must be held back");

        let data = PacketHeader {
            kind: PacketKind::Data,
            data_packets: 1,
            transfer_id: 5,
            dst_offset: 0,
            length: 4,
        };
        smem.receive_packet(&window, from, &data.packet(b"late"))
            .expect("data");
        assert_eq!(window.load_flag(1024).expect("flag"), 1);
        assert_eq!(window.read_vec(0, 4).expect("read"), b"late");
    }

    #[test]
    fn lost_transfers_are_forgotten_once_newer_ones_land() {
        let factory = factory();
        let dst = local(&factory, 4, 4096);
        let smem = dst
            .as_any()
            .downcast_ref::<DatagramSmem>()
            .expect("datagram smem");
        let window = dst.handle().expect("window");
        let from: SocketAddr = "127.0.0.1:9".parse().expect("addr");
        let other: SocketAddr = "127.0.0.1:10".parse().expect("addr");
        let packet = |kind: PacketKind, transfer_id: u64, data_packets: u16| {
            let header = PacketHeader {
                kind,
                data_packets,
                transfer_id,
                dst_offset: if kind == PacketKind::Flag { 2048 } else { 0 },
                length: 8,
            };
            header.packet(&transfer_id.to_le_bytes())
        };

        // Transfer 1 loses its second data packet; the other peer loses a flag.
        smem.receive_packet(&window, from, &packet(PacketKind::Data, 1, 2))
            .expect("data");
        smem.receive_packet(&window, from, &packet(PacketKind::Flag, 1, 2))
            .expect("flag");
        smem.receive_packet(&window, other, &packet(PacketKind::Data, 1, 1))
            .expect("data");
        {
            let state = smem.receive.lock();
            assert_eq!(state.received.len(), 2);
            assert_eq!(state.deferred.len(), 1);
        }

        for id in 2..=STALE_TRANSFERS + 2 {
            smem.receive_packet(&window, from, &packet(PacketKind::Data, id, 1))
                .expect("data");
            smem.receive_packet(&window, from, &packet(PacketKind::Flag, id, 1))
                .expect("flag");
        }
        assert_eq!(window.load_flag(2048).expect("flag"), STALE_TRANSFERS + 2);

        let state = smem.receive.lock();
        assert!(state.deferred.is_empty());
        assert_eq!(
            state.received.keys().copied().collect::<Vec<_>>(),
            vec![(other, 1)]
        );
    }

    #[test]
    fn remote_memory_is_not_mappable() {
        let factory = factory();
        let ep = EndPoint::parse("ocpi-udp://127.0.0.1;9:4096.1.2").expect("parse");
        let remote = factory.create_smem(&ep).expect("remote");
        assert!(matches!(remote.map(0, 8), Err(XferError::Unsupported(_))));
        assert!(factory.create_xfer_services(&remote, &remote).is_err());
    }

    #[test]
    fn bad_locators_are_rejected() {
        let ep = EndPoint::parse("ocpi-udp://localhost:4096.1.2").expect("parse");
        assert!(matches!(
            factory().create_smem(&ep),
            Err(XferError::BadEndpoint { .. })
        ));
    }
}
