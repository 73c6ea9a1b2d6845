//! Output and input ports: local memory, peer views and templates.
//!
//! An output port keeps one [`Destination`] per input port it feeds. An input
//! port keeps one [`Lane`] per source rank, each with its own ring of slots
//! and its own flow-control feedback towards that producer.

use std::collections::VecDeque;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};
use xfer::{
    Desc, DescriptorType, Descriptors, DriverRegistry, EndPoint, Mapping, OutOfBand, PortOptions,
    PortRole, ServicesId, SmemServices, TemplateId, TransferTemplate, TransferTemplateManager,
    XferFlags, XferOp, XferRequest, FLAG_SIZE,
};

use crate::buffer::{BufferState, MetaRecord, Slot, SlotRing, META_RECORD_SIZE};
use crate::distribution::{BufferInfo, DestinationGeometry, SourceGeometry};
use crate::layout::{endpoint_size, InputLayout, OutputLayout, EMPTY_FLAG, FULL_FLAG};
use crate::{DataDistribution, TransportError, TransportResult};

/// A port's own endpoint and the mapping covering all of it.
pub(crate) struct LocalMemory {
    pub(crate) endpoint: EndPoint,
    pub(crate) smem: Arc<dyn SmemServices>,
    pub(crate) mapping: Mapping,
}

impl LocalMemory {
    pub(crate) fn allocate(registry: &DriverRegistry, protocol: &str, total: u64) -> TransportResult<Self> {
        let size = endpoint_size(total)
            .ok_or_else(|| TransportError::NoMoreMemory(format!("{total} byte {protocol} endpoint")))?;
        let endpoint = registry.allocate_local_endpoint(protocol, Some(size))?;
        let smem = registry.smem(&endpoint)?;
        let mapping = smem.map(0, size)?;
        debug!(%endpoint, "allocated port memory");
        Ok(Self {
            endpoint,
            smem,
            mapping,
        })
    }

    fn externalize(&self, local: u64) -> u64 {
        self.smem.externalize_offset(local)
    }

    fn out_of_band(&self, port_id: u64) -> TransportResult<OutOfBand> {
        Ok(OutOfBand::new(port_id, &self.endpoint.to_string())?)
    }

    fn close(self, registry: &DriverRegistry) {
        if let Err(err) = self.smem.unmap(self.mapping) {
            debug!(endpoint = %self.endpoint, %err, "unmap after close");
        }
        if let Err(err) = self.smem.close() {
            debug!(endpoint = %self.endpoint, %err, "memory already closed");
        }
        registry.forget(&self.endpoint);
    }
}

fn slot_at(ring: &SlotRing, slot: u32) -> TransportResult<&Slot> {
    ring.get(slot)
        .ok_or_else(|| TransportError::internal(format!("slot {slot} out of range")))
}

fn slot_at_mut(ring: &mut SlotRing, slot: u32) -> TransportResult<&mut Slot> {
    ring.get_mut(slot)
        .ok_or_else(|| TransportError::internal(format!("slot {slot} out of range")))
}

/// The producer's view of one input port.
pub(crate) struct Destination {
    pub(crate) geometry: DestinationGeometry,
    ranges: BufferInfo,
    /// The output's role towards this destination.
    pub(crate) role: PortRole,
    feedback_is_count: bool,
    remote: Desc,
    target: Arc<dyn SmemServices>,
    services: ServicesId,
    /// The consumer's full flags for this lane, read directly when the
    /// consumer is passive.
    full_flags: Option<Mapping>,
    next_slot: u32,
    sent: u64,
    templates: Vec<Option<TemplateId>>,
}

pub(crate) struct OutputPort {
    pub(crate) rank: u32,
    pub(crate) geometry: SourceGeometry,
    pub(crate) memory: LocalMemory,
    layout: OutputLayout,
    pub(crate) ring: SlotRing,
    pub(crate) sequence: u64,
    pub(crate) queue: VecDeque<u32>,
    pub(crate) destinations: Vec<Destination>,
}

impl OutputPort {
    pub(crate) fn new(geometry: SourceGeometry, memory: LocalMemory, layout: OutputLayout) -> TransportResult<Self> {
        memory
            .mapping
            .store_flag(layout.full_value_offset(), FULL_FLAG)?;
        Ok(Self {
            rank: geometry.rank,
            geometry,
            memory,
            layout,
            ring: SlotRing::new(layout.buffer_count),
            sequence: 0,
            queue: VecDeque::new(),
            destinations: Vec::new(),
        })
    }

    pub(crate) fn slot(&self, slot: u32) -> TransportResult<&Slot> {
        slot_at(&self.ring, slot)
    }

    pub(crate) fn slot_mut(&mut self, slot: u32) -> TransportResult<&mut Slot> {
        slot_at_mut(&mut self.ring, slot)
    }

    pub(crate) fn data_offset(&self, slot: u32) -> u64 {
        self.layout.data_offset(slot)
    }

    /// Destinations taking part in message `sequence`.
    pub(crate) fn targets(&self, distribution: DataDistribution, sequence: u64) -> SmallVec<[usize; 4]> {
        self.destinations
            .iter()
            .enumerate()
            .filter(|(_, dest)| distribution.targets(sequence, &self.geometry, &dest.geometry))
            .map(|(index, _)| index)
            .collect()
    }

    pub(crate) fn producer_descriptor(&self, dst: usize, role: PortRole, options: PortOptions) -> TransportResult<Descriptors> {
        let count = options.feedback_is_count();
        let layout = &self.layout;
        let memory = &self.memory;
        Ok(Descriptors {
            kind: DescriptorType::ProducerDesc,
            role,
            options,
            desc: Desc {
                n_buffers: layout.buffer_count,
                data_buffer_base_addr: memory.externalize(layout.data_offset(0)),
                data_buffer_pitch: layout.pitch as u32,
                data_buffer_size: self.geometry.buffer_length,
                meta_data_base_addr: memory.externalize(layout.meta_offset(0, dst)),
                meta_data_pitch: layout.meta_pitch() as u32,
                full_flag_base_addr: memory.externalize(layout.full_value_offset()),
                full_flag_size: FLAG_SIZE as u32,
                full_flag_pitch: 0,
                full_flag_value: FULL_FLAG,
                empty_flag_base_addr: memory.externalize(layout.empty_flag_offset(dst, 0)),
                empty_flag_size: FLAG_SIZE as u32,
                empty_flag_pitch: if count { 0 } else { FLAG_SIZE as u32 },
                empty_flag_value: EMPTY_FLAG,
                oob: memory.out_of_band(u64::from(self.rank))?,
            },
        })
    }

    /// Records the consumer described by `consumer` as destination `input`.
    pub(crate) fn add_destination(
        &mut self,
        input: usize,
        geometry: DestinationGeometry,
        distribution: DataDistribution,
        consumer: &Descriptors,
        target: Arc<dyn SmemServices>,
        services: ServicesId,
    ) -> TransportResult<usize> {
        let role = consumer.role.complement();
        let remote = consumer.desc.clone();
        let index = self.destinations.len();
        let feedback_is_count = consumer.options.feedback_is_count();

        let full_flags = match role {
            PortRole::ActiveOnly => Some(target.map(
                remote.full_flag_base_addr,
                u64::from(remote.n_buffers) * u64::from(remote.full_flag_pitch),
            )?),
            _ => None,
        };
        if !feedback_is_count {
            for dst_slot in 0..remote.n_buffers {
                self.memory
                    .mapping
                    .store_flag(self.layout.empty_flag_offset(index, dst_slot), EMPTY_FLAG)?;
            }
        }

        let templates = vec![None; (self.layout.buffer_count * remote.n_buffers) as usize];
        debug!(
            output = self.rank,
            input,
            peer = %target.endpoint(),
            ?role,
            feedback_is_count,
            "destination attached"
        );
        self.destinations.push(Destination {
            geometry,
            ranges: distribution.ranges(&self.geometry, &geometry),
            role,
            feedback_is_count,
            remote,
            target,
            services,
            full_flags,
            next_slot: 0,
            sent: 0,
            templates,
        });
        Ok(index)
    }

    fn destination(&self, dst: usize) -> TransportResult<&Destination> {
        self.destinations
            .get(dst)
            .ok_or_else(|| TransportError::internal(format!("destination {dst} out of range")))
    }

    fn destination_mut(&mut self, dst: usize) -> TransportResult<&mut Destination> {
        self.destinations
            .get_mut(dst)
            .ok_or_else(|| TransportError::internal(format!("destination {dst} out of range")))
    }

    /// True when the destination's next slot may be written.
    pub(crate) fn destination_free(&self, dst: usize) -> TransportResult<bool> {
        let dest = self.destination(dst)?;
        if let Some(full_flags) = &dest.full_flags {
            let at = u64::from(dest.next_slot) * u64::from(dest.remote.full_flag_pitch);
            return Ok(full_flags.load_flag(at)? == 0);
        }
        let mapping = &self.memory.mapping;
        if dest.feedback_is_count {
            let released = mapping.load_flag(self.layout.release_count_offset(dst))?;
            return Ok(dest.sent.saturating_sub(released) < u64::from(dest.remote.n_buffers));
        }
        let flag = mapping.load_flag(self.layout.empty_flag_offset(dst, dest.next_slot))?;
        Ok(flag == EMPTY_FLAG)
    }

    /// Template moving `slot` into the destination's next slot, built on
    /// first use.
    pub(crate) fn transfer_template(
        &mut self,
        slot: u32,
        dst: usize,
        manager: &mut TransferTemplateManager,
    ) -> TransportResult<TemplateId> {
        let layout = self.layout;
        let dest = self.destination_mut(dst)?;
        let dst_slot = dest.next_slot;
        let key = (slot * dest.remote.n_buffers + dst_slot) as usize;
        if let Some(Some(id)) = dest.templates.get(key) {
            return Ok(*id);
        }

        let remote = &dest.remote;
        let dst_slot = u64::from(dst_slot);
        let mut ops: SmallVec<[XferOp; 4]> = dest
            .ranges
            .ranges()
            .iter()
            .map(|range| XferOp {
                src_offset: layout.data_offset(slot) + u64::from(range.src_offset),
                dst_offset: remote.data_buffer_base_addr
                    + dst_slot * u64::from(remote.data_buffer_pitch)
                    + u64::from(range.dst_offset),
                length: u64::from(range.length),
                flags: XferFlags::DATA | XferFlags::SIZE_MODIFIABLE,
                message_offset: u64::from(range.src_offset),
            })
            .collect();
        ops.push(XferOp {
            src_offset: layout.meta_offset(slot, dst),
            dst_offset: remote.meta_data_base_addr + dst_slot * u64::from(remote.meta_data_pitch),
            length: META_RECORD_SIZE,
            flags: XferFlags::METADATA,
            message_offset: 0,
        });
        ops.push(XferOp {
            src_offset: layout.full_value_offset(),
            dst_offset: remote.full_flag_base_addr + dst_slot * u64::from(remote.full_flag_pitch),
            length: FLAG_SIZE,
            flags: XferFlags::FLAG | XferFlags::WAKEUP,
            message_offset: 0,
        });

        let id = manager.add(TransferTemplate::new().with_step(dest.services, XferRequest::from_ops(ops)))?;
        if let Some(entry) = dest.templates.get_mut(key) {
            *entry = Some(id);
        }
        trace!(output = self.rank, slot, dst, dst_slot, template = id.0, "compiled transfer");
        Ok(id)
    }

    /// Writes the metadata record `dst` will receive for `slot`.
    pub(crate) fn stage_metadata(&self, slot: u32, dst: usize) -> TransportResult<()> {
        let dest = self.destination(dst)?;
        let state = self.slot(slot)?;
        let record = MetaRecord {
            length: dest.ranges.delivered_length(state.length),
            opcode: state.opcode,
            eom: state.eom,
            sequence: MetaRecord::wrap_sequence(state.sequence),
        };
        self.memory
            .mapping
            .write(self.layout.meta_offset(slot, dst), &record.encode())?;
        Ok(())
    }

    /// Takes the destination's next slot before the transfer starts.
    pub(crate) fn begin_send(&self, dst: usize) -> TransportResult<()> {
        let dest = self.destination(dst)?;
        if dest.full_flags.is_none() && !dest.feedback_is_count {
            self.memory
                .mapping
                .store_flag(self.layout.empty_flag_offset(dst, dest.next_slot), 0)?;
        }
        Ok(())
    }

    /// Gives the slot back after a start that reported busy.
    pub(crate) fn abort_send(&self, dst: usize) -> TransportResult<()> {
        let dest = self.destination(dst)?;
        if dest.full_flags.is_none() && !dest.feedback_is_count {
            self.memory
                .mapping
                .store_flag(self.layout.empty_flag_offset(dst, dest.next_slot), EMPTY_FLAG)?;
        }
        Ok(())
    }

    pub(crate) fn finish_send(&mut self, dst: usize) -> TransportResult<()> {
        let dest = self.destination_mut(dst)?;
        dest.next_slot = (dest.next_slot + 1) % dest.remote.n_buffers.max(1);
        dest.sent += 1;
        Ok(())
    }

    pub(crate) fn close(mut self, registry: &DriverRegistry) {
        for dest in self.destinations.drain(..) {
            if let Some(mapping) = dest.full_flags {
                if let Err(err) = dest.target.unmap(mapping) {
                    trace!(%err, "peer flags already unmapped");
                }
            }
        }
        self.memory.close(registry);
    }
}

/// Flow-control feedback from one lane back to its producer.
pub(crate) struct Feedback {
    pub(crate) role: PortRole,
    count: bool,
    producer: Desc,
    services: Option<ServicesId>,
    doorbells: Vec<Option<TemplateId>>,
    released: u64,
    release_cursor: u32,
    /// A count doorbell is waiting in the circuit's queue.
    queued: bool,
}

impl Feedback {
    pub(crate) fn new(producer: &Descriptors, services: Option<ServicesId>) -> Self {
        let role = producer.role.complement();
        let count = role == PortRole::ActiveFlowControl && producer.options.feedback_is_count();
        let doorbells = if count { 1 } else { producer.desc.n_buffers as usize };
        Self {
            role,
            count,
            producer: producer.desc.clone(),
            services,
            doorbells: vec![None; doorbells],
            released: 0,
            release_cursor: 0,
            queued: false,
        }
    }
}

pub(crate) struct Lane {
    pub(crate) ring: SlotRing,
    pub(crate) feedback: Option<Feedback>,
}

/// A doorbell that still has to be rung. `slot` is `None` for a count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Doorbell {
    pub(crate) input: usize,
    pub(crate) lane: u32,
    pub(crate) slot: Option<u32>,
}

pub(crate) struct InputPort {
    pub(crate) set: usize,
    pub(crate) rank: u32,
    pub(crate) buffer_length: u32,
    pub(crate) memory: LocalMemory,
    layout: InputLayout,
    pub(crate) lanes: Vec<Lane>,
    pub(crate) ready: VecDeque<(u32, u32)>,
}

impl InputPort {
    pub(crate) fn new(set: usize, rank: u32, buffer_length: u32, memory: LocalMemory, layout: InputLayout) -> TransportResult<Self> {
        for lane in 0..layout.lanes {
            for slot in 0..layout.buffer_count {
                memory
                    .mapping
                    .store_flag(layout.empty_source_offset(lane, slot), EMPTY_FLAG)?;
            }
        }
        Ok(Self {
            set,
            rank,
            buffer_length,
            memory,
            layout,
            lanes: (0..layout.lanes)
                .map(|_| Lane {
                    ring: SlotRing::new(layout.buffer_count),
                    feedback: None,
                })
                .collect(),
            ready: VecDeque::new(),
        })
    }

    fn lane(&self, lane: u32) -> TransportResult<&Lane> {
        self.lanes
            .get(lane as usize)
            .ok_or_else(|| TransportError::internal(format!("lane {lane} out of range")))
    }

    fn lane_mut(&mut self, lane: u32) -> TransportResult<&mut Lane> {
        self.lanes
            .get_mut(lane as usize)
            .ok_or_else(|| TransportError::internal(format!("lane {lane} out of range")))
    }

    pub(crate) fn slot_mut(&mut self, lane: u32, slot: u32) -> TransportResult<&mut Slot> {
        slot_at_mut(&mut self.lane_mut(lane)?.ring, slot)
    }

    pub(crate) fn slot(&self, lane: u32, slot: u32) -> TransportResult<&Slot> {
        slot_at(&self.lane(lane)?.ring, slot)
    }

    pub(crate) fn data_offset(&self, lane: u32, slot: u32) -> u64 {
        self.layout.data_offset(lane, slot)
    }

    pub(crate) fn port_id(&self) -> u64 {
        (self.set as u64) << 32 | u64::from(self.rank)
    }

    /// Describes lane `lane` to the producer of that source rank.
    pub(crate) fn consumer_descriptor(&self, lane: u32, role: PortRole, options: PortOptions) -> TransportResult<Descriptors> {
        let count = role == PortRole::ActiveFlowControl && options.feedback_is_count();
        let options = if count {
            options
        } else {
            options.without(PortOptions::FEEDBACK_IS_COUNT)
        };
        let layout = &self.layout;
        let memory = &self.memory;
        let empty_source = if count {
            layout.count_source_offset(lane)
        } else {
            layout.empty_source_offset(lane, 0)
        };
        Ok(Descriptors {
            kind: match role {
                PortRole::ActiveFlowControl => DescriptorType::ConsumerFlowControlDesc,
                _ => DescriptorType::ConsumerDesc,
            },
            role,
            options,
            desc: Desc {
                n_buffers: layout.buffer_count,
                data_buffer_base_addr: memory.externalize(layout.data_offset(lane, 0)),
                data_buffer_pitch: layout.pitch as u32,
                data_buffer_size: self.buffer_length,
                meta_data_base_addr: memory.externalize(layout.meta_offset(lane, 0)),
                meta_data_pitch: META_RECORD_SIZE as u32,
                full_flag_base_addr: memory.externalize(layout.full_offset(lane, 0)),
                full_flag_size: FLAG_SIZE as u32,
                full_flag_pitch: FLAG_SIZE as u32,
                full_flag_value: FULL_FLAG,
                empty_flag_base_addr: memory.externalize(empty_source),
                empty_flag_size: FLAG_SIZE as u32,
                empty_flag_pitch: if count { 0 } else { FLAG_SIZE as u32 },
                empty_flag_value: EMPTY_FLAG,
                oob: memory.out_of_band(self.port_id())?,
            },
        })
    }

    pub(crate) fn attach_feedback(&mut self, lane: u32, feedback: Feedback) -> TransportResult<()> {
        debug!(
            set = self.set,
            rank = self.rank,
            lane,
            role = ?feedback.role,
            count = feedback.count,
            "feedback attached"
        );
        self.lane_mut(lane)?.feedback = Some(feedback);
        Ok(())
    }

    /// Moves every newly landed message to the ready queue, oldest first
    /// within each lane.
    pub(crate) fn detect_full(&mut self) -> TransportResult<usize> {
        let mut found = 0;
        let mapping = &self.memory.mapping;
        let layout = &self.layout;
        for (lane_index, lane) in self.lanes.iter_mut().enumerate() {
            let lane_index = lane_index as u32;
            while let Some(slot) = lane.ring.peek(BufferState::Empty) {
                if mapping.load_flag(layout.full_offset(lane_index, slot))? == 0 {
                    break;
                }
                let mut raw = [0u8; META_RECORD_SIZE as usize];
                mapping.read(layout.meta_offset(lane_index, slot), &mut raw)?;
                let record = MetaRecord::decode(&raw);
                let state = slot_at_mut(&mut lane.ring, slot)?;
                state.claim(BufferState::Full);
                state.length = record.length.min(self.buffer_length);
                state.opcode = record.opcode;
                state.eom = record.eom;
                state.sequence = u64::from(record.sequence);
                lane.ring.advance();
                self.ready.push_back((lane_index, slot));
                found += 1;
            }
        }
        if found > 0 {
            trace!(set = self.set, rank = self.rank, found, "messages landed");
        }
        Ok(found)
    }

    /// Returns `slot` of `lane` to the producer. The local full flag is
    /// cleared first; a passive lane needs nothing more.
    pub(crate) fn release_slot(&mut self, input: usize, lane: u32, slot: u32) -> TransportResult<Option<Doorbell>> {
        let full_at = self.layout.full_offset(lane, slot);
        let count_at = self.layout.count_source_offset(lane);
        let empty_at = self.layout.empty_source_offset(lane, slot);
        self.memory.mapping.store_flag(full_at, 0)?;

        let mapping = &self.memory.mapping;
        let entry = self
            .lanes
            .get_mut(lane as usize)
            .ok_or_else(|| TransportError::internal(format!("lane {lane} out of range")))?;
        let ring = &mut entry.ring;
        let feedback = entry
            .feedback
            .as_mut()
            .ok_or_else(|| TransportError::internal("lane released before connect"))?;

        match feedback.role {
            PortRole::Passive => {
                slot_at_mut(ring, slot)?.claim(BufferState::Empty);
                Ok(None)
            }
            _ if feedback.count => {
                let state = slot_at_mut(ring, slot)?;
                state.claim(BufferState::Empty);
                state.feedback_due = true;
                let len = ring.len().max(1);
                loop {
                    let cursor = feedback.release_cursor;
                    let due = slot_at_mut(ring, cursor)?;
                    if !due.feedback_due {
                        break;
                    }
                    due.feedback_due = false;
                    feedback.released += 1;
                    feedback.release_cursor = (cursor + 1) % len;
                }
                mapping.store_flag(count_at, feedback.released)?;
                if feedback.queued {
                    return Ok(None);
                }
                feedback.queued = true;
                Ok(Some(Doorbell {
                    input,
                    lane,
                    slot: None,
                }))
            }
            _ => {
                slot_at_mut(ring, slot)?.claim(BufferState::Empty);
                mapping.store_flag(empty_at, EMPTY_FLAG)?;
                Ok(Some(Doorbell {
                    input,
                    lane,
                    slot: Some(slot),
                }))
            }
        }
    }

    /// Template for `bell`, built on first use.
    pub(crate) fn doorbell_template(&mut self, bell: Doorbell, manager: &mut TransferTemplateManager) -> TransportResult<TemplateId> {
        let layout = self.layout;
        let feedback = self
            .lane_mut(bell.lane)?
            .feedback
            .as_mut()
            .ok_or_else(|| TransportError::internal("doorbell before connect"))?;
        let services = feedback
            .services
            .ok_or_else(|| TransportError::internal("passive lane has no doorbell"))?;
        let index = bell.slot.unwrap_or(0) as usize;
        if let Some(Some(id)) = feedback.doorbells.get(index) {
            return Ok(*id);
        }

        let (src_offset, dst_offset) = match bell.slot {
            Some(slot) => (
                layout.empty_source_offset(bell.lane, slot),
                feedback.producer.empty_flag_base_addr
                    + u64::from(slot) * u64::from(feedback.producer.empty_flag_pitch),
            ),
            None => (
                layout.count_source_offset(bell.lane),
                feedback.producer.empty_flag_base_addr,
            ),
        };
        let request = XferRequest::new(XferOp {
            src_offset,
            dst_offset,
            length: FLAG_SIZE,
            flags: XferFlags::FLAG | XferFlags::WAKEUP,
            message_offset: 0,
        });
        let id = manager.add(TransferTemplate::new().with_step(services, request))?;
        if let Some(entry) = feedback.doorbells.get_mut(index) {
            *entry = Some(id);
        }
        trace!(lane = bell.lane, slot = ?bell.slot, template = id.0, "compiled doorbell");
        Ok(id)
    }

    pub(crate) fn doorbell_started(&mut self, bell: Doorbell) {
        if bell.slot.is_none() {
            if let Some(feedback) = self
                .lanes
                .get_mut(bell.lane as usize)
                .and_then(|lane| lane.feedback.as_mut())
            {
                feedback.queued = false;
            }
        }
    }

    pub(crate) fn states(&self) -> Vec<BufferState> {
        self.lanes.iter().flat_map(|lane| lane.ring.states()).collect()
    }

    pub(crate) fn count(&self, state: BufferState) -> usize {
        self.lanes.iter().map(|lane| lane.ring.count(state)).sum()
    }

    pub(crate) fn close(self, registry: &DriverRegistry) {
        self.memory.close(registry);
    }
}
