//! Buffer handles and per-slot ownership state.
//!
//! Slot memory never moves for the life of a circuit; what moves is
//! ownership. A [`Buffer`] is the caller's proof of ownership: it cannot be
//! cloned, and handing it back to the circuit ends the caller's claim.

use std::fmt;

use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Owned by the pool.
    Empty,
    /// Owned by the producer's worker.
    Filling,
    /// Owned by the transport until every destination has taken the data.
    InFlight,
    /// Holds a message the consumer has not claimed yet.
    Full,
    /// Owned by the consumer's worker.
    Draining,
}

/// Which port of a circuit a buffer belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortRef {
    Output { rank: u32 },
    /// `set` indexes the connection's port sets.
    Input { set: usize, rank: u32 },
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRef::Output { rank } => write!(f, "output[{rank}]"),
            PortRef::Input { set, rank } => write!(f, "input[{set}.{rank}]"),
        }
    }
}

/// Slot address. Output ports have a single lane; input ports have one lane
/// per source rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId {
    pub port: PortRef,
    pub lane: u32,
    pub slot: u32,
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.port, self.lane, self.slot)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    id: BufferId,
    generation: u64,
    capacity: u32,
    byte_length: u32,
    opcode: u32,
    eom: bool,
    sequence: u64,
}

impl Buffer {
    pub(crate) fn new(id: BufferId, generation: u64, capacity: u32) -> Self {
        Self {
            id,
            generation,
            capacity,
            byte_length: 0,
            opcode: 0,
            eom: false,
            sequence: 0,
        }
    }

    pub(crate) fn with_message(mut self, meta: MetaRecord) -> Self {
        self.byte_length = meta.length;
        self.opcode = meta.opcode;
        self.eom = meta.eom;
        self.sequence = u64::from(meta.sequence);
        self
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn port(&self) -> PortRef {
        self.id.port
    }

    pub fn slot(&self) -> u32 {
        self.id.slot
    }

    pub fn lane(&self) -> u32 {
        self.id.lane
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn byte_length(&self) -> u32 {
        self.byte_length
    }

    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    pub fn is_end_of_message(&self) -> bool {
        self.eom
    }

    /// Sequence number the producer stamped on the message (input buffers).
    /// Only the low 32 bits travel, so this wraps every 2^32 messages.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_byte_length(&mut self, length: u32) {
        self.byte_length = length;
    }

    pub(crate) fn set_opcode(&mut self, opcode: u32) {
        self.opcode = opcode;
    }

    pub(crate) fn set_eom(&mut self, eom: bool) {
        self.eom = eom;
    }
}

pub const META_RECORD_SIZE: u64 = 16;

/// Per-slot metadata as it sits in memory: `length, opcode, eom, sequence`,
/// each a little-endian u32.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetaRecord {
    pub length: u32,
    pub opcode: u32,
    pub eom: bool,
    /// Low 32 bits of the producer's sequence; see [`MetaRecord::wrap_sequence`].
    pub sequence: u32,
}

impl MetaRecord {
    /// The record's view of a producer sequence, which wraps at 2^32.
    pub fn wrap_sequence(sequence: u64) -> u32 {
        (sequence & u64::from(u32::MAX)) as u32
    }

    pub fn encode(&self) -> [u8; META_RECORD_SIZE as usize] {
        let mut out = [0u8; META_RECORD_SIZE as usize];
        out[0..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..8].copy_from_slice(&self.opcode.to_le_bytes());
        out[8..12].copy_from_slice(&u32::from(self.eom).to_le_bytes());
        out[12..16].copy_from_slice(&self.sequence.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; META_RECORD_SIZE as usize]) -> Self {
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Self {
            length: word(0),
            opcode: word(4),
            eom: word(8) != 0,
            sequence: word(12),
        }
    }
}

/// Ownership and bookkeeping for one slot.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) state: BufferState,
    generation: u64,
    pub(crate) length: u32,
    pub(crate) opcode: u32,
    pub(crate) eom: bool,
    pub(crate) sequence: u64,
    /// Destinations this message still has to be started towards.
    pub(crate) remaining: SmallVec<[usize; 4]>,
    /// Started templates that have not completed.
    pub(crate) pending: u32,
    /// Released by the consumer but not yet covered by a feedback count.
    pub(crate) feedback_due: bool,
}

impl Slot {
    pub(crate) fn new() -> Self {
        Self {
            state: BufferState::Empty,
            generation: 0,
            length: 0,
            opcode: 0,
            eom: false,
            sequence: 0,
            remaining: SmallVec::new(),
            pending: 0,
            feedback_due: false,
        }
    }

    /// Moves the slot to `state` under a fresh generation, invalidating any
    /// handle issued earlier.
    pub(crate) fn claim(&mut self, state: BufferState) -> u64 {
        self.generation += 1;
        self.state = state;
        self.generation
    }

    pub(crate) fn is_held_by(&self, buffer: &Buffer, state: BufferState) -> bool {
        self.state == state && self.generation == buffer.generation()
    }

    /// True once every destination was started and every start completed.
    pub(crate) fn is_delivered(&self) -> bool {
        self.remaining.is_empty() && self.pending == 0
    }
}

/// A fixed ring of slots handed out strictly in order.
#[derive(Debug)]
pub(crate) struct SlotRing {
    slots: Vec<Slot>,
    cursor: u32,
}

impl SlotRing {
    pub(crate) fn new(count: u32) -> Self {
        Self {
            slots: (0..count).map(|_| Slot::new()).collect(),
            cursor: 0,
        }
    }

    pub(crate) fn len(&self) -> u32 {
        self.slots.len() as u32
    }

    pub(crate) fn get(&self, slot: u32) -> Option<&Slot> {
        self.slots.get(slot as usize)
    }

    pub(crate) fn get_mut(&mut self, slot: u32) -> Option<&mut Slot> {
        self.slots.get_mut(slot as usize)
    }

    /// The slot at the cursor, if it is in `state`.
    pub(crate) fn peek(&self, state: BufferState) -> Option<u32> {
        let slot = self.slots.get(self.cursor as usize)?;
        (slot.state == state).then_some(self.cursor)
    }

    pub(crate) fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.len().max(1);
    }

    pub(crate) fn states(&self) -> Vec<BufferState> {
        self.slots.iter().map(|slot| slot.state).collect()
    }

    pub(crate) fn count(&self, state: BufferState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(slot: u32) -> BufferId {
        BufferId {
            port: PortRef::Output { rank: 0 },
            lane: 0,
            slot,
        }
    }

    #[test]
    fn metadata_record_layout_is_fixed() {
        let record = MetaRecord {
            length: 0x0102_0304,
            opcode: 9,
            eom: true,
            sequence: 77,
        };
        let bytes = record.encode();
        assert_eq!(&bytes[0..4], &[4, 3, 2, 1]);
        assert_eq!(&bytes[8..12], &[1, 0, 0, 0]);
        assert_eq!(MetaRecord::decode(&bytes), record);
    }

    #[test]
    fn record_sequences_wrap() {
        assert_eq!(MetaRecord::wrap_sequence(77), 77);
        assert_eq!(MetaRecord::wrap_sequence(u64::from(u32::MAX)), u32::MAX);
        assert_eq!(MetaRecord::wrap_sequence(1 << 32), 0);
        assert_eq!(MetaRecord::wrap_sequence((5 << 32) + 9), 9);
    }

    #[test]
    fn ring_hands_out_slots_in_order() {
        let mut ring = SlotRing::new(3);
        let mut handed = Vec::new();
        while let Some(slot) = ring.peek(BufferState::Empty) {
            ring.get_mut(slot).expect("slot").claim(BufferState::Filling);
            ring.advance();
            handed.push(slot);
        }
        assert_eq!(handed, vec![0, 1, 2]);
        assert_eq!(ring.count(BufferState::Filling), 3);

        ring.get_mut(1).expect("slot").claim(BufferState::Empty);
        assert_eq!(ring.peek(BufferState::Empty), None, "cursor waits on slot 0");
        ring.get_mut(0).expect("slot").claim(BufferState::Empty);
        assert_eq!(ring.peek(BufferState::Empty), Some(0));
    }

    #[test]
    fn stale_handles_lose_ownership() {
        let mut slot = Slot::new();
        let generation = slot.claim(BufferState::Filling);
        let buffer = Buffer::new(id(0), generation, 64);
        assert!(slot.is_held_by(&buffer, BufferState::Filling));

        slot.claim(BufferState::Empty);
        slot.claim(BufferState::Filling);
        assert!(!slot.is_held_by(&buffer, BufferState::Filling));
    }

    #[test]
    fn buffer_ids_render_their_port() {
        let input = BufferId {
            port: PortRef::Input { set: 1, rank: 2 },
            lane: 3,
            slot: 0,
        };
        assert_eq!(input.to_string(), "input[1.2]/3#0");
        assert_eq!(id(4).to_string(), "output[0]/0#4");
    }
}
