//! Circuits: one connection's ports, templates and buffer flow.
//!
//! A circuit is built from [`ConnectionMetaData`] in one step. Both halves of
//! the connection live in the same circuit; they still meet only through
//! encoded descriptors and the peer's endpoint, exactly as two processes
//! would. After that everything is cooperative polling through
//! [`Circuit::run`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};
use xfer::{
    Descriptors, DescriptorType, DriverRegistry, EventManager, PortOptions, PortRole,
    SmemServices, StartOutcome, TemplateId, TransferTemplateManager, XferError,
};

use crate::buffer::{Buffer, BufferId, BufferState, MetaRecord, PortRef};
use crate::distribution::{DestinationGeometry, SourceGeometry};
use crate::layout::{InputLayout, OutputLayout};
use crate::metadata::PortMetaData;
use crate::port::{Doorbell, Feedback, InputPort, LocalMemory, OutputPort};
use crate::role::{choose_roles, RoleOffer};
use crate::{
    ConnectionMetaData, DataDistribution, TransportConfig, TransportError, TransportResult,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircuitId(pub u32);

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Ports allocated, descriptors not yet exchanged.
    Open,
    Connected,
    /// No new output buffers; started work drains.
    Disconnecting,
    /// Memory released. Terminal.
    Closed,
}

#[derive(Clone, Copy, Debug)]
enum TemplateOwner {
    Unused,
    Output { rank: u32, slot: u32 },
    Doorbell,
}

pub struct Circuit {
    id: CircuitId,
    state: CircuitState,
    distribution: DataDistribution,
    registry: Arc<DriverRegistry>,
    outputs: Vec<OutputPort>,
    inputs: Vec<InputPort>,
    templates: TransferTemplateManager,
    owners: Vec<TemplateOwner>,
    doorbells: VecDeque<Doorbell>,
    event_range: Option<(u32, u32)>,
    event_wait: Duration,
}

/// One destination rank in the flattened order used for global ranks.
struct DestinationPlan<'a> {
    set: usize,
    port: &'a PortMetaData,
    buffer_count: u32,
    geometry: DestinationGeometry,
}

fn producer_roles(caps: xfer::DriverCaps) -> Vec<PortRole> {
    let mut roles = vec![PortRole::ActiveMessage];
    if caps.remote_read {
        roles.push(PortRole::ActiveOnly);
    }
    roles
}

fn consumer_roles(caps: xfer::DriverCaps) -> Vec<PortRole> {
    let mut roles = vec![PortRole::ActiveFlowControl];
    if caps.remote_read {
        roles.push(PortRole::Passive);
    }
    roles
}

const ROLE_BITS: u32 = (1 << xfer::MAX_ROLE) - 1;

impl Circuit {
    /// Allocates every port of `connection`, negotiates roles and exchanges
    /// descriptors.
    pub fn new(
        id: CircuitId,
        connection: ConnectionMetaData,
        registry: Arc<DriverRegistry>,
        config: &TransportConfig,
    ) -> TransportResult<Self> {
        connection.validate()?;
        let distribution = connection.distribution;
        let (_, source) = connection.source()?;
        let global_rank_count = connection.global_rank_count();

        let mut plans = Vec::new();
        for (set, meta) in connection.destinations() {
            for rank in 0..meta.rank_count() {
                let port = meta
                    .port(rank)
                    .ok_or_else(|| TransportError::bad_config(format!("missing rank {rank}")))?;
                plans.push(DestinationPlan {
                    set,
                    port,
                    buffer_count: meta.buffer_count,
                    geometry: DestinationGeometry {
                        rank,
                        rank_count: meta.rank_count(),
                        global_rank: plans.len() as u32,
                        global_rank_count,
                        buffer_length: meta.buffer_length,
                    },
                });
            }
        }
        let sources: Vec<SourceGeometry> = (0..source.rank_count())
            .map(|rank| SourceGeometry {
                rank,
                rank_count: source.rank_count(),
                buffer_length: source.buffer_length,
            })
            .collect();
        for src in &sources {
            for plan in &plans {
                distribution.validate_geometry(src, &plan.geometry)?;
            }
        }

        let mut circuit = Circuit {
            id,
            state: CircuitState::Open,
            distribution,
            registry: Arc::clone(&registry),
            outputs: Vec::with_capacity(sources.len()),
            inputs: Vec::with_capacity(plans.len()),
            templates: TransferTemplateManager::new(config.xfer.max_tx_templates),
            owners: Vec::new(),
            doorbells: VecDeque::new(),
            event_range: None,
            event_wait: config.event_wait,
        };

        let mut output_offers = Vec::with_capacity(sources.len());
        let dst_slots = plans.iter().map(|plan| plan.buffer_count).max().unwrap_or(1);
        for src in &sources {
            let port = source
                .port(src.rank)
                .ok_or_else(|| TransportError::bad_config(format!("missing rank {}", src.rank)))?;
            let (protocol, offer) = circuit.offer(port, config, true)?;
            let layout = OutputLayout::new(
                source.buffer_count,
                source.buffer_length,
                plans.len() as u32,
                dst_slots,
            )
            .ok_or_else(|| TransportError::NoMoreMemory(format!("output {} layout", src.rank)))?;
            let memory = LocalMemory::allocate(&registry, &protocol, layout.total)?;
            circuit.outputs.push(OutputPort::new(*src, memory, layout)?);
            output_offers.push(offer);
        }

        let mut input_offers = Vec::with_capacity(plans.len());
        for plan in &plans {
            let (protocol, offer) = circuit.offer(plan.port, config, false)?;
            let layout = InputLayout::new(
                plan.buffer_count,
                plan.geometry.buffer_length,
                source.rank_count(),
            )
            .ok_or_else(|| {
                TransportError::NoMoreMemory(format!("input {}.{} layout", plan.set, plan.geometry.rank))
            })?;
            let memory = LocalMemory::allocate(&registry, &protocol, layout.total)?;
            circuit.inputs.push(InputPort::new(
                plan.set,
                plan.geometry.rank,
                plan.geometry.buffer_length,
                memory,
                layout,
            )?);
            input_offers.push(offer);
        }

        for (rank, user) in output_offers.iter().enumerate() {
            for (input, provider) in input_offers.iter().enumerate() {
                let roles = choose_roles(*user, *provider).map_err(|reason| {
                    TransportError::bad_config(format!(
                        "output {rank} -> input {input}: {reason}"
                    ))
                })?;
                let count_requested = user.options.feedback_is_count()
                    || provider.options.feedback_is_count();
                let consumer_options = provider
                    .options
                    .without(PortOptions::MANDATED_ROLE)
                    .with(if count_requested { PortOptions::FEEDBACK_IS_COUNT } else { 0 });

                let wire = circuit.inputs[input]
                    .consumer_descriptor(rank as u32, roles.input, consumer_options)?
                    .encode();
                circuit.attach_destination(rank, input, &plans[input].geometry, &wire)?;

                let consumer = Descriptors::decode(&wire)?;
                let producer_options = user
                    .options
                    .without(PortOptions::MANDATED_ROLE | PortOptions::FEEDBACK_IS_COUNT)
                    .with(consumer.options.bits() & PortOptions::FEEDBACK_IS_COUNT);
                let wire = circuit.outputs[rank]
                    .producer_descriptor(input, roles.output, producer_options)?
                    .encode();
                circuit.attach_feedback(input, rank as u32, &wire)?;
            }
        }

        circuit.state = CircuitState::Connected;
        debug!(
            circuit = %id,
            %distribution,
            outputs = circuit.outputs.len(),
            inputs = circuit.inputs.len(),
            "circuit connected"
        );
        Ok(circuit)
    }

    /// Protocol and role offer for `port`, limited to what its driver can do.
    fn offer(
        &self,
        port: &PortMetaData,
        config: &TransportConfig,
        output: bool,
    ) -> TransportResult<(String, RoleOffer)> {
        let protocol = match port.protocol() {
            "" => config.default_protocol.clone(),
            protocol => protocol.to_string(),
        };
        let caps = self.registry.factory(&protocol)?.capabilities();
        let capable = PortOptions::supporting(&if output {
            producer_roles(caps)
        } else {
            consumer_roles(caps)
        });
        let requested = port.options.bits() & ROLE_BITS;
        let roles = match requested {
            0 => capable.bits(),
            bits => bits & capable.bits(),
        };
        if roles == 0 {
            return Err(TransportError::bad_config(format!(
                "rank {} asks for roles {:#x} that {protocol} cannot provide",
                port.rank, requested
            )));
        }
        let options = PortOptions::from_bits(roles | (port.options.bits() & !ROLE_BITS));
        if port.role != PortRole::NoRole && !options.supports(port.role) {
            return Err(TransportError::bad_config(format!(
                "rank {} cannot take role {:?} over {protocol}",
                port.rank, port.role
            )));
        }
        Ok((protocol, RoleOffer::new(port.role, options)))
    }

    fn attach_peer(&self, uri: &str) -> TransportResult<Arc<dyn SmemServices>> {
        let endpoint = self.registry.endpoint(uri)?;
        self.registry.smem(&endpoint).map_err(|err| match err {
            XferError::MapFailed { .. } | XferError::Io(_) => {
                TransportError::ServerNotResponding(format!("{uri}: {err}"))
            }
            other => other.into(),
        })
    }

    /// Producer half: decodes a consumer descriptor for `input`.
    fn attach_destination(
        &mut self,
        rank: usize,
        input: usize,
        geometry: &DestinationGeometry,
        wire: &[u8],
    ) -> TransportResult<()> {
        let consumer = Descriptors::decode(wire)?;
        if consumer.kind == DescriptorType::ProducerDesc {
            return Err(TransportError::BadConnectionCookie(
                "producer descriptor where a consumer was expected".into(),
            ));
        }
        let target = self.attach_peer(consumer.desc.oob.endpoint()?)?;
        let source = Arc::clone(&self.outputs[rank].memory.smem);
        let services = self
            .templates
            .add_services(self.registry.create_xfer_services(&source, &target)?);
        self.outputs[rank].add_destination(
            input,
            *geometry,
            self.distribution,
            &consumer,
            target,
            services,
        )?;
        Ok(())
    }

    /// Consumer half: decodes the producer descriptor for lane `lane`.
    fn attach_feedback(&mut self, input: usize, lane: u32, wire: &[u8]) -> TransportResult<()> {
        let producer = Descriptors::decode(wire)?;
        if producer.kind != DescriptorType::ProducerDesc {
            return Err(TransportError::BadConnectionCookie(
                "consumer descriptor where a producer was expected".into(),
            ));
        }
        let services = match producer.role.complement() {
            PortRole::ActiveFlowControl => {
                let target = self.attach_peer(producer.desc.oob.endpoint()?)?;
                let source = Arc::clone(&self.inputs[input].memory.smem);
                Some(
                    self.templates
                        .add_services(self.registry.create_xfer_services(&source, &target)?),
                )
            }
            PortRole::Passive => None,
            role => {
                return Err(TransportError::BadConnectionCookie(format!(
                    "consumer cannot take role {role:?}"
                )))
            }
        };
        self.inputs[input].attach_feedback(lane, Feedback::new(&producer, services))
    }

    /// Routes every local memory's completion events to `events`, using ids
    /// from `base` upwards. Returns how many ids were taken.
    pub fn attach_events(&mut self, events: &EventManager, base: u32) -> u32 {
        let memories = self
            .outputs
            .iter()
            .map(|port| &port.memory)
            .chain(self.inputs.iter().map(|port| &port.memory));
        let mut next = base;
        for memory in memories {
            memory.smem.set_event_sink(events.sink(next));
            next += 1;
        }
        if next > base {
            self.event_range = Some((base, next - 1));
        }
        next - base
    }

    pub fn id(&self) -> CircuitId {
        self.id
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn distribution(&self) -> DataDistribution {
        self.distribution
    }

    /// Every port of the circuit: outputs by rank, then inputs in set order.
    pub fn ports(&self) -> Vec<PortRef> {
        self.outputs
            .iter()
            .map(|port| PortRef::Output { rank: port.rank })
            .chain(self.inputs.iter().map(|port| PortRef::Input {
                set: port.set,
                rank: port.rank,
            }))
            .collect()
    }

    /// Role each output rank took towards each destination, in destination
    /// order.
    pub fn output_roles(&self, rank: u32) -> TransportResult<Vec<PortRole>> {
        Ok(self
            .output(rank)?
            .destinations
            .iter()
            .map(|dest| dest.role)
            .collect())
    }

    fn output(&self, rank: u32) -> TransportResult<&OutputPort> {
        self.outputs
            .get(rank as usize)
            .ok_or_else(|| TransportError::bad_config(format!("no output rank {rank}")))
    }

    fn output_mut(outputs: &mut [OutputPort], rank: u32) -> TransportResult<&mut OutputPort> {
        outputs
            .get_mut(rank as usize)
            .ok_or_else(|| TransportError::bad_config(format!("no output rank {rank}")))
    }

    fn input_index(&self, set: usize, rank: u32) -> TransportResult<usize> {
        self.inputs
            .iter()
            .position(|port| port.set == set && port.rank == rank)
            .ok_or_else(|| TransportError::bad_config(format!("no input {set}.{rank}")))
    }

    fn not_owned(buffer: &Buffer) -> TransportError {
        TransportError::BufferNotOwned(buffer.id().to_string())
    }

    fn ensure_open(&self) -> TransportResult<()> {
        match self.state {
            CircuitState::Closed => Err(TransportError::CircuitDisconnecting(self.id)),
            _ => Ok(()),
        }
    }

    /// Next empty buffer of output `rank` in ring order, if it is free.
    pub fn get_next_empty_output_buffer(&mut self, rank: u32) -> TransportResult<Option<Buffer>> {
        if self.state != CircuitState::Connected {
            return Err(TransportError::CircuitDisconnecting(self.id));
        }
        let port = Self::output_mut(&mut self.outputs, rank)?;
        let Some(slot) = port.ring.peek(BufferState::Empty) else {
            return Ok(None);
        };
        let generation = port.slot_mut(slot)?.claim(BufferState::Filling);
        port.ring.advance();
        let id = BufferId {
            port: PortRef::Output { rank },
            lane: 0,
            slot,
        };
        Ok(Some(Buffer::new(id, generation, port.geometry.buffer_length)))
    }

    /// Like [`Circuit::get_next_empty_output_buffer`], failing with
    /// [`TransportError::NoMoreBuffers`] instead of returning nothing.
    pub fn require_empty_output_buffer(&mut self, rank: u32) -> TransportResult<Buffer> {
        self.get_next_empty_output_buffer(rank)?
            .ok_or_else(|| TransportError::NoMoreBuffers(format!("output {rank}")))
    }

    /// Oldest message that landed on input `rank` of port set `set`.
    pub fn get_next_full_input_buffer(&mut self, set: usize, rank: u32) -> TransportResult<Option<Buffer>> {
        self.ensure_open()?;
        let index = self.input_index(set, rank)?;
        let port = &mut self.inputs[index];
        if port.ready.is_empty() {
            port.detect_full()?;
        }
        let Some((lane, slot)) = port.ready.pop_front() else {
            return Ok(None);
        };
        let capacity = port.buffer_length;
        let state = port.slot_mut(lane, slot)?;
        let generation = state.claim(BufferState::Draining);
        let record = MetaRecord {
            length: state.length,
            opcode: state.opcode,
            eom: state.eom,
            sequence: MetaRecord::wrap_sequence(state.sequence),
        };
        let id = BufferId {
            port: PortRef::Input { set, rank },
            lane,
            slot,
        };
        Ok(Some(Buffer::new(id, generation, capacity).with_message(record)))
    }

    /// Checks that `buffer` is currently held by the caller.
    fn check_held(&self, buffer: &Buffer) -> TransportResult<()> {
        let held = match buffer.port() {
            PortRef::Output { rank } => self
                .output(rank)?
                .slot(buffer.slot())?
                .is_held_by(buffer, BufferState::Filling),
            PortRef::Input { set, rank } => self.inputs[self.input_index(set, rank)?]
                .slot(buffer.lane(), buffer.slot())?
                .is_held_by(buffer, BufferState::Draining),
        };
        if held {
            Ok(())
        } else {
            Err(Self::not_owned(buffer))
        }
    }

    fn memory_range(&self, buffer: &Buffer) -> TransportResult<(&xfer::Mapping, u64)> {
        match buffer.port() {
            PortRef::Output { rank } => {
                let port = self.output(rank)?;
                Ok((&port.memory.mapping, port.data_offset(buffer.slot())))
            }
            PortRef::Input { set, rank } => {
                let port = &self.inputs[self.input_index(set, rank)?];
                Ok((
                    &port.memory.mapping,
                    port.data_offset(buffer.lane(), buffer.slot()),
                ))
            }
        }
    }

    /// Writable payload of a held buffer, `capacity` bytes long.
    pub fn buffer_mut(&mut self, buffer: &Buffer) -> TransportResult<&mut [u8]> {
        self.check_held(buffer)?;
        let (mapping, offset) = self.memory_range(buffer)?;
        // SAFETY: the slot is held by the caller, so no transfer reads or
        // writes it, and the returned borrow keeps the circuit exclusively
        // borrowed until the caller is done with it.
        Ok(unsafe { mapping.slice_mut(offset, u64::from(buffer.capacity()))? })
    }

    /// Payload of a held buffer: the message for input buffers, the whole
    /// capacity for output buffers.
    pub fn payload(&self, buffer: &Buffer) -> TransportResult<&[u8]> {
        self.check_held(buffer)?;
        let len = match buffer.port() {
            PortRef::Output { .. } => buffer.capacity(),
            PortRef::Input { .. } => buffer.byte_length(),
        };
        let (mapping, offset) = self.memory_range(buffer)?;
        // SAFETY: as for `buffer_mut`; peers never write a held slot.
        Ok(unsafe { mapping.slice(offset, u64::from(len))? })
    }

    pub fn set_number_of_bytes_to_transfer(&self, buffer: &mut Buffer, length: u32) -> TransportResult<()> {
        self.check_output(buffer)?;
        if length > buffer.capacity() {
            return Err(TransportError::bad_config(format!(
                "{length} bytes do not fit a {} byte buffer",
                buffer.capacity()
            )));
        }
        buffer.set_byte_length(length);
        Ok(())
    }

    pub fn set_opcode(&self, buffer: &mut Buffer, opcode: u32) -> TransportResult<()> {
        self.check_output(buffer)?;
        buffer.set_opcode(opcode);
        Ok(())
    }

    pub fn set_end_of_message(&self, buffer: &mut Buffer, eom: bool) -> TransportResult<()> {
        self.check_output(buffer)?;
        buffer.set_eom(eom);
        Ok(())
    }

    fn check_output(&self, buffer: &Buffer) -> TransportResult<()> {
        match buffer.port() {
            PortRef::Output { .. } => self.check_held(buffer),
            PortRef::Input { .. } => Err(Self::not_owned(buffer)),
        }
    }

    /// Hands a buffer back: output buffers are sent, input buffers released.
    pub fn advance(&mut self, buffer: Buffer) -> TransportResult<()> {
        match buffer.port() {
            PortRef::Output { rank } => self.send(rank, buffer),
            PortRef::Input { set, rank } => self.release_input(set, rank, buffer),
        }
    }

    /// Gives a buffer up: input buffers go back to the producer, output
    /// buffers return to the pool unsent.
    pub fn release(&mut self, buffer: Buffer) -> TransportResult<()> {
        match buffer.port() {
            PortRef::Output { rank } => {
                let port = Self::output_mut(&mut self.outputs, rank)?;
                let slot = port.slot_mut(buffer.slot())?;
                if !slot.is_held_by(&buffer, BufferState::Filling) {
                    return Err(Self::not_owned(&buffer));
                }
                slot.claim(BufferState::Empty);
                Ok(())
            }
            PortRef::Input { set, rank } => self.release_input(set, rank, buffer),
        }
    }

    fn send(&mut self, rank: u32, buffer: Buffer) -> TransportResult<()> {
        let distribution = self.distribution;
        let port = Self::output_mut(&mut self.outputs, rank)?;
        if !port
            .slot(buffer.slot())?
            .is_held_by(&buffer, BufferState::Filling)
        {
            return Err(Self::not_owned(&buffer));
        }
        let sequence = port.sequence;
        port.sequence += 1;
        let targets = port.targets(distribution, sequence);
        let slot = port.slot_mut(buffer.slot())?;
        slot.length = buffer.byte_length();
        slot.opcode = buffer.opcode();
        slot.eom = buffer.is_end_of_message();
        slot.sequence = sequence;
        slot.pending = 0;
        if targets.is_empty() {
            slot.claim(BufferState::Empty);
            return Ok(());
        }
        slot.remaining = targets;
        slot.claim(BufferState::InFlight);

        let id = buffer.id();
        trace!(circuit = %self.id, %id, sequence, length = buffer.byte_length(), "advance");
        if self.can_transfer_buffer(id, false)? && self.start_buffer_transfer(id)? {
            return Ok(());
        }
        self.que_transfer(id)
    }

    /// True when every destination `id` still has to reach has a free slot
    /// and the templates involved can start. Unless `queued` is set, a
    /// non-empty queue means the buffer has to wait its turn.
    pub fn can_transfer_buffer(&mut self, id: BufferId, queued: bool) -> TransportResult<bool> {
        let PortRef::Output { rank } = id.port else {
            return Err(TransportError::internal("only output buffers are transferred"));
        };
        let port = Self::output_mut(&mut self.outputs, rank)?;
        if !queued && !port.queue.is_empty() {
            return Ok(false);
        }
        let slot = port.slot(id.slot)?;
        if slot.state != BufferState::InFlight {
            return Err(TransportError::BufferNotOwned(id.to_string()));
        }
        for dst in slot.remaining.clone() {
            if !port.destination_free(dst)? {
                return Ok(false);
            }
            let template = port.transfer_template(id.slot, dst, &mut self.templates)?;
            if !self.templates.can_start(template)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Starts `id` towards every destination it still has to reach, in
    /// order, stopping at the first that cannot take it. Returns true once
    /// nothing is left to start.
    pub fn start_buffer_transfer(&mut self, id: BufferId) -> TransportResult<bool> {
        let PortRef::Output { rank } = id.port else {
            return Err(TransportError::internal("only output buffers are transferred"));
        };
        let port = Self::output_mut(&mut self.outputs, rank)?;
        let slot = port.slot(id.slot)?;
        if slot.state != BufferState::InFlight {
            return Err(TransportError::BufferNotOwned(id.to_string()));
        }
        let length = u64::from(slot.length);
        for dst in slot.remaining.clone() {
            if !port.destination_free(dst)? {
                break;
            }
            let template = port.transfer_template(id.slot, dst, &mut self.templates)?;
            port.stage_metadata(id.slot, dst)?;
            port.begin_send(dst)?;
            let outcome = match self.templates.start(template, Some(length)) {
                Ok(outcome) => outcome,
                Err(err) => {
                    if self.templates.is_complete(template)? {
                        port.abort_send(dst)?;
                    }
                    return Err(err.into());
                }
            };
            match outcome {
                StartOutcome::Started => {
                    port.finish_send(dst)?;
                    let slot = port.slot_mut(id.slot)?;
                    slot.remaining.retain(|pending| *pending != dst);
                    slot.pending += 1;
                    record_owner(
                        &mut self.owners,
                        template,
                        TemplateOwner::Output {
                            rank,
                            slot: id.slot,
                        },
                    );
                }
                StartOutcome::Busy => {
                    port.abort_send(dst)?;
                    break;
                }
            }
        }
        Ok(port.slot(id.slot)?.remaining.is_empty())
    }

    /// Parks `id` behind earlier transfers of the same output.
    pub fn que_transfer(&mut self, id: BufferId) -> TransportResult<()> {
        let PortRef::Output { rank } = id.port else {
            return Err(TransportError::internal("only output buffers are queued"));
        };
        let port = Self::output_mut(&mut self.outputs, rank)?;
        if !port.queue.contains(&id.slot) {
            port.queue.push_back(id.slot);
            trace!(circuit = %self.id, %id, depth = port.queue.len(), "transfer queued");
        }
        Ok(())
    }

    /// Starts queued transfers in order; returns how many made progress.
    pub fn check_queued_transfers(&mut self) -> TransportResult<usize> {
        let mut work = 0;
        for rank in 0..self.outputs.len() as u32 {
            while let Some(slot) = self.outputs[rank as usize].queue.front().copied() {
                let id = BufferId {
                    port: PortRef::Output { rank },
                    lane: 0,
                    slot,
                };
                if !self.can_transfer_buffer(id, true)? {
                    break;
                }
                let done = self.start_buffer_transfer(id)?;
                work += 1;
                if !done {
                    break;
                }
                self.outputs[rank as usize].queue.pop_front();
            }
        }
        Ok(work)
    }

    pub fn queued_transfer_count(&self) -> usize {
        self.outputs.iter().map(|port| port.queue.len()).sum()
    }

    fn release_input(&mut self, set: usize, rank: u32, buffer: Buffer) -> TransportResult<()> {
        self.ensure_open()?;
        let index = self.input_index(set, rank)?;
        let port = &mut self.inputs[index];
        if !port
            .slot(buffer.lane(), buffer.slot())?
            .is_held_by(&buffer, BufferState::Draining)
        {
            return Err(Self::not_owned(&buffer));
        }
        if let Some(bell) = port.release_slot(index, buffer.lane(), buffer.slot())? {
            self.doorbells.push_back(bell);
        }
        self.ring_doorbells()?;
        Ok(())
    }

    fn ring_doorbells(&mut self) -> TransportResult<usize> {
        let mut rung = 0;
        let mut waiting = VecDeque::new();
        while let Some(bell) = self.doorbells.pop_front() {
            let port = &mut self.inputs[bell.input];
            let template = port.doorbell_template(bell, &mut self.templates)?;
            match self.templates.start(template, None)? {
                StartOutcome::Started => {
                    port.doorbell_started(bell);
                    record_owner(&mut self.owners, template, TemplateOwner::Doorbell);
                    rung += 1;
                }
                StartOutcome::Busy => waiting.push_back(bell),
            }
        }
        self.doorbells = waiting;
        Ok(rung)
    }

    fn complete_transfers(&mut self) -> TransportResult<usize> {
        let finished = self.templates.poll()?;
        for template in self.templates.drain_completed() {
            let owner = self
                .owners
                .get(template.0 as usize)
                .copied()
                .unwrap_or(TemplateOwner::Unused);
            if let TemplateOwner::Output { rank, slot } = owner {
                let port = Self::output_mut(&mut self.outputs, rank)?;
                let state = port.slot_mut(slot)?;
                state.pending = state.pending.saturating_sub(1);
                if state.state == BufferState::InFlight && state.is_delivered() {
                    state.claim(BufferState::Empty);
                }
            }
        }
        Ok(finished)
    }

    fn poll_once(&mut self) -> TransportResult<usize> {
        let mut work = 0;
        for port in &self.outputs {
            work += port.memory.smem.poll()?;
        }
        for port in &self.inputs {
            work += port.memory.smem.poll()?;
        }
        work += self.complete_transfers()?;
        work += self.ring_doorbells()?;
        work += self.check_queued_transfers()?;
        for port in self.inputs.iter_mut() {
            work += port.detect_full()?;
        }
        Ok(work)
    }

    /// One cooperative step. Blocks only when nothing was done and `events`
    /// is given, for at most the configured event wait.
    pub fn run(&mut self, events: Option<&mut EventManager>) -> TransportResult<usize> {
        if self.state == CircuitState::Closed {
            return Ok(0);
        }
        let mut work = self.poll_once()?;
        if work == 0 {
            if let (Some(events), Some((low, high))) = (events, self.event_range) {
                if let Some(event) = events.wait(low, high, self.event_wait) {
                    trace!(circuit = %self.id, event, "woken");
                    work += self.poll_once()?;
                }
            }
        }
        self.try_close();
        Ok(work)
    }

    /// Stops handing out output buffers; the circuit closes once started
    /// work has drained and no worker holds a buffer.
    pub fn disconnect(&mut self) -> TransportResult<()> {
        match self.state {
            CircuitState::Open | CircuitState::Connected => {
                debug!(circuit = %self.id, "disconnecting");
                self.state = CircuitState::Disconnecting;
            }
            CircuitState::Disconnecting | CircuitState::Closed => {}
        }
        Ok(())
    }

    fn is_quiescent(&self) -> bool {
        let outputs_idle = self.outputs.iter().all(|port| {
            port.queue.is_empty()
                && port.ring.count(BufferState::InFlight) == 0
                && port.ring.count(BufferState::Filling) == 0
        });
        let inputs_idle = self
            .inputs
            .iter()
            .all(|port| port.count(BufferState::Draining) == 0);
        outputs_idle && inputs_idle && self.doorbells.is_empty() && self.templates.in_flight() == 0
    }

    fn try_close(&mut self) {
        if self.state == CircuitState::Disconnecting && self.is_quiescent() {
            let unread: usize = self
                .inputs
                .iter()
                .map(|port| port.count(BufferState::Full))
                .sum();
            if unread > 0 {
                debug!(circuit = %self.id, unread, "discarding unread messages");
            }
            self.shutdown();
            debug!(circuit = %self.id, "circuit closed");
        }
    }

    /// Tears the circuit down now, whatever is in flight.
    pub fn abort(&mut self) {
        if self.state != CircuitState::Closed {
            warn!(circuit = %self.id, state = ?self.state, "aborting circuit");
            self.shutdown();
        }
    }

    fn shutdown(&mut self) {
        self.templates = TransferTemplateManager::new(1);
        self.owners.clear();
        self.doorbells.clear();
        for port in self.outputs.drain(..) {
            port.close(&self.registry);
        }
        for port in self.inputs.drain(..) {
            port.close(&self.registry);
        }
        self.state = CircuitState::Closed;
    }

    /// Slot states of `port`; input lanes are concatenated in rank order.
    pub fn buffer_states(&self, port: PortRef) -> TransportResult<Vec<BufferState>> {
        self.ensure_open()?;
        match port {
            PortRef::Output { rank } => Ok(self.output(rank)?.ring.states()),
            PortRef::Input { set, rank } => Ok(self.inputs[self.input_index(set, rank)?].states()),
        }
    }
}

fn record_owner(owners: &mut Vec<TemplateOwner>, template: TemplateId, owner: TemplateOwner) {
    let index = template.0 as usize;
    if owners.len() <= index {
        owners.resize(index + 1, TemplateOwner::Unused);
    }
    owners[index] = owner;
}

impl Drop for Circuit {
    fn drop(&mut self) {
        if self.state != CircuitState::Closed {
            self.shutdown();
        }
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("distribution", &self.distribution)
            .field("outputs", &self.outputs.len())
            .field("inputs", &self.inputs.len())
            .field("queued", &self.queued_transfer_count())
            .finish()
    }
}
