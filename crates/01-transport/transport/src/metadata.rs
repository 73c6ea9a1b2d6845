//! Connection metadata: what a circuit is asked to build.
//!
//! A connection owns its port sets; a port set owns its ports. Sets are
//! addressed by their index in [`ConnectionMetaData::port_sets`], ports by
//! their rank within the set.

use std::collections::BTreeSet;

use xfer::{PortOptions, PortRole};

use crate::{DataDistribution, TransportConfig, TransportError, TransportResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortMetaData {
    pub rank: u32,
    /// A protocol name, or a full endpoint URI whose protocol and size are
    /// used for the port's local endpoint.
    pub endpoint: String,
    /// Preferred role; [`PortRole::NoRole`] leaves the choice to negotiation.
    pub role: PortRole,
    /// Role restrictions and modifiers. Role bits, when present, narrow the
    /// roles the port is willing to take.
    pub options: PortOptions,
}

impl PortMetaData {
    pub fn new(rank: u32, endpoint: impl Into<String>) -> Self {
        Self {
            rank,
            endpoint: endpoint.into(),
            role: PortRole::NoRole,
            options: PortOptions::default(),
        }
    }

    pub fn with_role(mut self, role: PortRole) -> Self {
        self.role = role;
        self
    }

    /// Insists on `role`; negotiation fails rather than picking another.
    pub fn with_mandated_role(mut self, role: PortRole) -> Self {
        self.role = role;
        self.options = self.options.with(PortOptions::MANDATED_ROLE);
        self
    }

    pub fn with_options(mut self, options: PortOptions) -> Self {
        self.options = self.options.with(options.bits());
        self
    }

    /// Flow-control feedback as a running release count.
    pub fn with_feedback_count(self) -> Self {
        self.with_options(PortOptions::from_bits(PortOptions::FEEDBACK_IS_COUNT))
    }

    pub(crate) fn protocol(&self) -> &str {
        match self.endpoint.split_once("://") {
            Some((protocol, _)) => protocol,
            None => &self.endpoint,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PortSetMetaData {
    pub output: bool,
    pub buffer_count: u32,
    pub buffer_length: u32,
    pub port_set_id: i32,
    /// Mirrors the connection-wide policy once the set is added.
    pub distribution: DataDistribution,
    pub ports: Vec<PortMetaData>,
}

impl PortSetMetaData {
    pub fn output(port_set_id: i32, buffer_count: u32, buffer_length: u32) -> Self {
        Self::new(true, port_set_id, buffer_count, buffer_length)
    }

    pub fn input(port_set_id: i32, buffer_count: u32, buffer_length: u32) -> Self {
        Self::new(false, port_set_id, buffer_count, buffer_length)
    }

    /// A set with the configured default geometry.
    pub fn with_defaults(output: bool, port_set_id: i32, config: &TransportConfig) -> Self {
        Self::new(output, port_set_id, config.buffer_count, config.buffer_size)
    }

    fn new(output: bool, port_set_id: i32, buffer_count: u32, buffer_length: u32) -> Self {
        Self {
            output,
            buffer_count,
            buffer_length,
            port_set_id,
            distribution: DataDistribution::default(),
            ports: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: PortMetaData) -> Self {
        self.ports.push(port);
        self
    }

    /// Adds ranks `0..count`, all on `endpoint`.
    pub fn with_ranks(mut self, count: u32, endpoint: &str) -> Self {
        let first = self.ports.len() as u32;
        self.ports
            .extend((first..first + count).map(|rank| PortMetaData::new(rank, endpoint)));
        self
    }

    pub fn rank_count(&self) -> u32 {
        self.ports.len() as u32
    }

    pub fn port(&self, rank: u32) -> Option<&PortMetaData> {
        self.ports.iter().find(|port| port.rank == rank)
    }

    fn validate(&self) -> TransportResult<()> {
        let kind = if self.output { "output" } else { "input" };
        if self.ports.is_empty() {
            return Err(TransportError::bad_config(format!(
                "{kind} port set {} has no ports",
                self.port_set_id
            )));
        }
        if self.buffer_count == 0 || self.buffer_length == 0 {
            return Err(TransportError::bad_config(format!(
                "{kind} port set {} needs at least one non-empty buffer",
                self.port_set_id
            )));
        }
        let ranks: BTreeSet<u32> = self.ports.iter().map(|port| port.rank).collect();
        let contiguous = ranks.len() == self.ports.len()
            && ranks.iter().copied().eq(0..self.ports.len() as u32);
        if !contiguous {
            return Err(TransportError::bad_config(format!(
                "{kind} port set {} ranks must be 0..{} without repeats",
                self.port_set_id,
                self.ports.len()
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConnectionMetaData {
    pub distribution: DataDistribution,
    pub port_sets: Vec<PortSetMetaData>,
}

impl ConnectionMetaData {
    pub fn new(distribution: DataDistribution) -> Self {
        Self {
            distribution,
            port_sets: Vec::new(),
        }
    }

    /// Adds `set`, returning its index.
    pub fn add_port_set(&mut self, mut set: PortSetMetaData) -> usize {
        set.distribution = self.distribution;
        self.port_sets.push(set);
        self.port_sets.len() - 1
    }

    pub fn with_port_set(mut self, set: PortSetMetaData) -> Self {
        self.add_port_set(set);
        self
    }

    /// Index and metadata of the single output set.
    pub fn source(&self) -> TransportResult<(usize, &PortSetMetaData)> {
        let mut outputs = self.port_sets.iter().enumerate().filter(|(_, set)| set.output);
        match (outputs.next(), outputs.next()) {
            (Some(found), None) => Ok(found),
            (None, _) => Err(TransportError::bad_config("connection has no output port set")),
            (Some(_), Some(_)) => Err(TransportError::bad_config(
                "connection has more than one output port set",
            )),
        }
    }

    /// Input sets with their indices, in insertion order.
    pub fn destinations(&self) -> impl Iterator<Item = (usize, &PortSetMetaData)> {
        self.port_sets.iter().enumerate().filter(|(_, set)| !set.output)
    }

    /// Number of destination ranks across every input set.
    pub fn global_rank_count(&self) -> u32 {
        self.destinations().map(|(_, set)| set.rank_count()).sum()
    }

    pub fn validate(&self) -> TransportResult<()> {
        self.source()?;
        if self.destinations().next().is_none() {
            return Err(TransportError::bad_config("connection has no input port set"));
        }
        for set in &self.port_sets {
            set.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pio() -> &'static str {
        xfer::drivers::PIO_PROTOCOL
    }

    #[test]
    fn builds_a_one_to_two_connection() {
        let conn = ConnectionMetaData::new(DataDistribution::Sequential)
            .with_port_set(PortSetMetaData::output(0, 4, 64).with_ranks(1, pio()))
            .with_port_set(PortSetMetaData::input(1, 4, 64).with_ranks(2, pio()));
        conn.validate().expect("valid");
        assert_eq!(conn.source().expect("source").0, 0);
        assert_eq!(conn.global_rank_count(), 2);
        assert_eq!(conn.port_sets[1].distribution, DataDistribution::Sequential);
    }

    #[test]
    fn rejects_missing_or_duplicate_sides() {
        let inputs_only = ConnectionMetaData::default()
            .with_port_set(PortSetMetaData::input(1, 2, 8).with_ranks(1, pio()));
        assert!(inputs_only.validate().is_err());

        let two_outputs = ConnectionMetaData::default()
            .with_port_set(PortSetMetaData::output(0, 2, 8).with_ranks(1, pio()))
            .with_port_set(PortSetMetaData::output(1, 2, 8).with_ranks(1, pio()))
            .with_port_set(PortSetMetaData::input(2, 2, 8).with_ranks(1, pio()));
        assert!(two_outputs.validate().is_err());
    }

    #[test]
    fn ranks_must_be_contiguous() {
        let conn = ConnectionMetaData::default()
            .with_port_set(PortSetMetaData::output(0, 2, 8).with_ranks(1, pio()))
            .with_port_set(
                PortSetMetaData::input(1, 2, 8)
                    .with_port(PortMetaData::new(0, pio()))
                    .with_port(PortMetaData::new(2, pio())),
            );
        assert!(matches!(
            conn.validate(),
            Err(TransportError::BadPortConfig(_))
        ));
    }

    #[test]
    fn endpoint_field_accepts_protocols_and_uris() {
        assert_eq!(PortMetaData::new(0, "ocpi-udp").protocol(), "ocpi-udp");
        assert_eq!(
            PortMetaData::new(0, "ocpi-udp://127.0.0.1;0:4096.1.8").protocol(),
            "ocpi-udp"
        );
    }

    #[test]
    fn mandated_roles_set_the_option_bit() {
        let port = PortMetaData::new(0, pio()).with_mandated_role(PortRole::Passive);
        assert!(port.options.mandated());
        assert_eq!(port.role, PortRole::Passive);
        assert!(PortMetaData::new(0, pio())
            .with_feedback_count()
            .options
            .feedback_is_count());
    }
}
