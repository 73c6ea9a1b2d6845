//! Process-wide owner of drivers, circuits and completion events.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, error, trace, warn};
use xfer::{DriverRegistry, EventManager};

use crate::{
    Circuit, CircuitId, CircuitState, ConnectionMetaData, Severity, TransportConfig,
    TransportError, TransportResult,
};

/// A port is identified across circuits by its port set id and rank.
type PortKey = (i32, u32);

pub struct Runtime {
    config: TransportConfig,
    registry: Arc<DriverRegistry>,
    events: EventManager,
    circuits: BTreeMap<CircuitId, Circuit>,
    ports: HashMap<PortKey, CircuitId>,
    next_circuit: u32,
    next_event: u32,
}

impl Runtime {
    /// Builds a runtime with the built-in drivers.
    pub fn new(config: TransportConfig) -> Self {
        let registry = Arc::new(DriverRegistry::with_default_drivers(config.xfer.clone()));
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: TransportConfig, registry: Arc<DriverRegistry>) -> Self {
        debug!(protocols = ?registry.protocols(), "transport runtime up");
        Self {
            config,
            registry,
            events: EventManager::new(),
            circuits: BTreeMap::new(),
            ports: HashMap::new(),
            next_circuit: 0,
            next_event: 0,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Connects every port of `connection` into a new circuit.
    pub fn create_circuit(&mut self, connection: ConnectionMetaData) -> TransportResult<CircuitId> {
        let keys: Vec<PortKey> = connection
            .port_sets
            .iter()
            .flat_map(|set| set.ports.iter().map(move |port| (set.port_set_id, port.rank)))
            .collect();
        if let Some((set, rank)) = keys.iter().find(|key| self.ports.contains_key(key)) {
            return Err(TransportError::PortAlreadyConnected(format!(
                "port set {set} rank {rank}"
            )));
        }

        let id = CircuitId(self.next_circuit);
        let mut circuit = Circuit::new(id, connection, Arc::clone(&self.registry), &self.config)?;
        self.next_circuit += 1;
        self.next_event += circuit.attach_events(&self.events, self.next_event);
        for key in keys {
            self.ports.insert(key, id);
        }
        self.circuits.insert(id, circuit);
        Ok(id)
    }

    pub fn circuit(&self, id: CircuitId) -> TransportResult<&Circuit> {
        self.circuits
            .get(&id)
            .ok_or(TransportError::CircuitNotFound(id))
    }

    pub fn circuit_mut(&mut self, id: CircuitId) -> TransportResult<&mut Circuit> {
        self.circuits
            .get_mut(&id)
            .ok_or(TransportError::CircuitNotFound(id))
    }

    /// Takes `id` out of the runtime. Dropping the result tears it down.
    pub fn remove_circuit(&mut self, id: CircuitId) -> TransportResult<Circuit> {
        let circuit = self
            .circuits
            .remove(&id)
            .ok_or(TransportError::CircuitNotFound(id))?;
        self.ports.retain(|_, owner| *owner != id);
        Ok(circuit)
    }

    pub fn circuit_ids(&self) -> Vec<CircuitId> {
        self.circuits.keys().copied().collect()
    }

    fn poll_circuits(&mut self) -> Result<usize, (CircuitId, TransportError)> {
        let mut work = 0;
        for (id, circuit) in self.circuits.iter_mut() {
            work += circuit.run(None).map_err(|err| (*id, err))?;
        }
        Ok(work)
    }

    /// Polls every circuit once, sleeping on completion events for at most
    /// the configured wait when nothing moved.
    ///
    /// A failing circuit is handled by severity before the error is
    /// returned: application-fatal errors tear that circuit down,
    /// container-fatal errors tear down all of them.
    pub fn run(&mut self) -> TransportResult<usize> {
        let mut work = match self.poll_circuits() {
            Ok(work) => work,
            Err((id, err)) => return Err(self.fail(id, err)),
        };
        if work == 0 && self.next_event > 0 && !self.circuits.is_empty() {
            if let Some(event) = self.events.wait(0, self.next_event - 1, self.config.event_wait) {
                trace!(event, "runtime woken");
                work += match self.poll_circuits() {
                    Ok(work) => work,
                    Err((id, err)) => return Err(self.fail(id, err)),
                };
            }
        }

        let closed: Vec<CircuitId> = self
            .circuits
            .iter()
            .filter(|(_, circuit)| circuit.state() == CircuitState::Closed)
            .map(|(id, _)| *id)
            .collect();
        if !closed.is_empty() {
            self.ports.retain(|_, owner| !closed.contains(owner));
        }
        Ok(work)
    }

    fn fail(&mut self, id: CircuitId, err: TransportError) -> TransportError {
        match err.severity() {
            Severity::ContainerFatal => {
                error!(circuit = %id, %err, "container fatal; tearing down every circuit");
                for circuit in self.circuits.values_mut() {
                    circuit.abort();
                }
                self.circuits.clear();
                self.ports.clear();
            }
            Severity::ApplicationFatal => {
                warn!(circuit = %id, %err, "circuit failed");
                if let Ok(mut circuit) = self.remove_circuit(id) {
                    circuit.abort();
                }
            }
            Severity::ApplicationRecoverable => {
                debug!(circuit = %id, %err, "recoverable circuit error");
            }
        }
        err
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for circuit in self.circuits.values_mut() {
            circuit.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataDistribution, PortSetMetaData};
    use xfer::drivers::PIO_PROTOCOL;
    use xfer::XferConfig;

    fn runtime(tag: &str) -> Runtime {
        let dir = std::env::temp_dir().join(format!("transport-runtime-{tag}-{}", std::process::id()));
        Runtime::new(TransportConfig::default().with_xfer(XferConfig::default().with_smb_dir(dir)))
    }

    fn connection(output_set: i32, input_set: i32) -> ConnectionMetaData {
        ConnectionMetaData::new(DataDistribution::Parallel)
            .with_port_set(PortSetMetaData::output(output_set, 2, 64).with_ranks(1, PIO_PROTOCOL))
            .with_port_set(PortSetMetaData::input(input_set, 2, 64).with_ranks(1, PIO_PROTOCOL))
    }

    #[test]
    fn unknown_circuits_are_reported() {
        let mut runtime = runtime("unknown");
        assert!(matches!(
            runtime.circuit(CircuitId(9)),
            Err(TransportError::CircuitNotFound(CircuitId(9)))
        ));
        assert!(matches!(
            runtime.remove_circuit(CircuitId(9)),
            Err(TransportError::CircuitNotFound(_))
        ));
    }

    #[test]
    fn ports_join_one_circuit_at_a_time() {
        let mut runtime = runtime("ports");
        let first = runtime.create_circuit(connection(0, 1)).expect("circuit");
        assert!(matches!(
            runtime.create_circuit(connection(0, 2)),
            Err(TransportError::PortAlreadyConnected(_))
        ));

        drop(runtime.remove_circuit(first).expect("remove"));
        runtime.create_circuit(connection(0, 2)).expect("reconnect");
        assert_eq!(runtime.circuit_ids().len(), 1);
    }

    #[test]
    fn fatal_errors_tear_down_by_severity() {
        let mut runtime = runtime("fatal");
        let a = runtime.create_circuit(connection(0, 1)).expect("a");
        let b = runtime.create_circuit(connection(2, 3)).expect("b");
        let c = runtime.create_circuit(connection(4, 5)).expect("c");

        let err = runtime.fail(a, TransportError::NoMoreBuffers("test".into()));
        assert_eq!(err.severity(), Severity::ApplicationRecoverable);
        assert_eq!(runtime.circuit_ids(), vec![a, b, c]);

        runtime.fail(a, TransportError::internal("test"));
        assert_eq!(runtime.circuit_ids(), vec![b, c]);

        runtime.fail(
            b,
            TransportError::MappingFailed {
                endpoint: "test".into(),
                reason: "gone".into(),
            },
        );
        assert!(runtime.circuit_ids().is_empty());
    }

    #[test]
    fn idle_runs_wait_at_most_the_event_window() {
        let mut runtime = runtime("idle");
        runtime.create_circuit(connection(0, 1)).expect("circuit");
        let start = std::time::Instant::now();
        assert_eq!(runtime.run().expect("run"), 0);
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }
}
