//! Drives a loopback circuit through the worker boundary.

use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{debug, info};
use transport::{
    Circuit, CircuitId, ConnectionMetaData, PortSetMetaData, TransportConfig,
};
use xfer::{DriverRegistry, XferConfig};

use crate::checks::{verify_backpressure, verify_burst, verify_flood, CheckResult, DrainReport};
use crate::config::{ScenarioKind, TestConfig};
use crate::stats::{ScenarioStats, StatsSink};
use crate::{frame_id, frame_payload, FRAME_HEADER_LEN};

const OUTPUT_RANK: u32 = 0;
const INPUT_SET: usize = 1;
const INPUT_RANK: u32 = 0;
/// Consecutive polls without progress before a run is declared stuck.
const IDLE_LIMIT: u32 = 200_000;

pub struct FrameScenarioEngine {
    config: TestConfig,
    circuit: Circuit,
    stats: ScenarioStats,
    sink: Option<Arc<dyn StatsSink>>,
    idle: u32,
}

impl FrameScenarioEngine {
    pub fn new(config: TestConfig) -> anyhow::Result<Self> {
        let transport = TransportConfig::default()
            .with_xfer(XferConfig::default().with_smb_dir(config.smb_dir.clone()));
        let registry = Arc::new(DriverRegistry::with_default_drivers(transport.xfer.clone()));
        Self::with_registry(config, registry, &transport)
    }

    pub fn with_registry(
        config: TestConfig,
        registry: Arc<DriverRegistry>,
        transport: &TransportConfig,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            config.buffer_length as usize >= FRAME_HEADER_LEN,
            "{} byte buffers cannot hold a frame header",
            config.buffer_length
        );
        let connection = ConnectionMetaData::new(config.distribution)
            .with_port_set(
                PortSetMetaData::output(0, config.buffer_count, config.buffer_length)
                    .with_ranks(1, &config.protocol),
            )
            .with_port_set(
                PortSetMetaData::input(1, config.buffer_count, config.buffer_length)
                    .with_ranks(1, &config.protocol),
            );
        let circuit = Circuit::new(CircuitId(0), connection, registry, transport)
            .with_context(|| format!("building {} loopback", config.protocol))?;
        Ok(Self {
            config,
            circuit,
            stats: ScenarioStats::default(),
            sink: None,
            idle: 0,
        })
    }

    pub fn with_stats_sink(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    pub fn stats(&self) -> ScenarioStats {
        self.stats
    }

    /// Runs the configured scenario to completion and reports what arrived.
    pub fn run(&mut self) -> anyhow::Result<DrainReport> {
        let kind = self.config.kind;
        info!(?kind, protocol = %self.config.protocol, "scenario start");
        let mut report = DrainReport::default();
        match kind {
            ScenarioKind::Flood { frame_count } => self.flood(frame_count, &mut report)?,
            ScenarioKind::Burst { bursts, burst_size } => {
                self.burst(bursts, burst_size, &mut report)?
            }
            ScenarioKind::Backpressure { frames } => self.backpressure(frames, &mut report)?,
        }
        report.stalls = self.stats.stalls;
        report.max_outstanding = self.stats.max_outstanding;
        if let Some(sink) = &self.sink {
            sink.publish(&self.stats);
        }
        info!(
            sent = self.stats.sent,
            received = self.stats.received,
            stalls = self.stats.stalls,
            "scenario done"
        );
        Ok(report)
    }

    /// Runs the scenario and checks the result against its kind.
    pub fn run_and_verify(&mut self) -> anyhow::Result<CheckResult> {
        let report = self.run()?;
        let capacity = self.config.capacity();
        Ok(match self.config.kind {
            ScenarioKind::Flood { frame_count } => verify_flood(&report, frame_count),
            ScenarioKind::Burst { bursts, burst_size } => {
                verify_burst(&report, bursts, burst_size)
            }
            ScenarioKind::Backpressure { frames } => {
                verify_backpressure(&report, frames, capacity)
            }
        })
    }

    /// One frame out if a buffer is free. Returns false on a stall.
    fn try_send(&mut self, frame: u32) -> anyhow::Result<bool> {
        let Some(mut buffer) = self.circuit.get_next_empty_output_buffer(OUTPUT_RANK)? else {
            self.stats.stalls += 1;
            return Ok(false);
        };
        let payload = frame_payload(frame, self.config.buffer_length as usize);
        self.circuit.buffer_mut(&buffer)?[..payload.len()].copy_from_slice(&payload);
        self.circuit
            .set_number_of_bytes_to_transfer(&mut buffer, payload.len() as u32)?;
        self.circuit.set_opcode(&mut buffer, frame)?;
        self.circuit.set_end_of_message(&mut buffer, true)?;
        self.circuit.advance(buffer)?;
        self.stats.note_sent();
        Ok(true)
    }

    /// Receives up to `limit` frames; returns how many arrived.
    fn drain(&mut self, report: &mut DrainReport, limit: usize) -> anyhow::Result<usize> {
        let mut drained = 0;
        while drained < limit {
            let Some(buffer) = self
                .circuit
                .get_next_full_input_buffer(INPUT_SET, INPUT_RANK)?
            else {
                break;
            };
            let payload = self.circuit.payload(&buffer)?;
            let frame = frame_id(payload).context("frame shorter than its header")?;
            if payload != frame_payload(frame, payload.len()).as_slice() || buffer.opcode() != frame {
                report.corrupt += 1;
            }
            let len = payload.len();
            self.circuit.release(buffer)?;
            report.frames.push(frame);
            self.stats.note_received(len);
            drained += 1;
        }
        Ok(drained)
    }

    /// Polls the circuit, failing once nothing has moved for too long.
    fn step(&mut self, progress: usize, received: usize) -> anyhow::Result<()> {
        let work = self.circuit.run(None)? + progress;
        if work > 0 {
            self.idle = 0;
            return Ok(());
        }
        self.idle += 1;
        if self.idle > IDLE_LIMIT {
            bail!("scenario stuck after {received} frames");
        }
        std::thread::yield_now();
        Ok(())
    }

    fn flood(&mut self, frame_count: u32, report: &mut DrainReport) -> anyhow::Result<()> {
        let mut next = 0;
        while report.frames.len() < frame_count as usize {
            let mut progress = 0;
            if next < frame_count && self.try_send(next)? {
                next += 1;
                progress += 1;
            }
            progress += self.drain(report, usize::MAX)?;
            self.step(progress, report.frames.len())?;
        }
        Ok(())
    }

    fn burst(&mut self, bursts: u32, burst_size: u32, report: &mut DrainReport) -> anyhow::Result<()> {
        let mut next = 0;
        for burst in 0..bursts {
            let end = next + burst_size;
            while next < end {
                if self.try_send(next)? {
                    next += 1;
                    self.step(1, report.frames.len())?;
                } else {
                    // Out of buffers mid-burst: let the consumer catch up.
                    let drained = self.drain(report, usize::MAX)?;
                    self.step(drained, report.frames.len())?;
                }
            }
            while report.frames.len() < end as usize {
                let drained = self.drain(report, usize::MAX)?;
                self.step(drained, report.frames.len())?;
            }
            debug!(burst, received = report.frames.len(), "burst drained");
        }
        Ok(())
    }

    fn backpressure(&mut self, frames: u32, report: &mut DrainReport) -> anyhow::Result<()> {
        let mut next = 0;
        while report.frames.len() < frames as usize {
            if next < frames && self.try_send(next)? {
                next += 1;
                self.step(1, report.frames.len())?;
                continue;
            }
            // Stalled (or done sending): take one frame, then push again.
            let drained = self.drain(report, 1)?;
            self.step(drained, report.frames.len())?;
        }
        Ok(())
    }
}
