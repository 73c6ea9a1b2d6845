use std::path::PathBuf;

use transport::DataDistribution;
use xfer::drivers::PIO_PROTOCOL;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenarioType {
    Flood = 0,
    Burst = 1,
    Backpressure = 2,
}

impl ScenarioType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ScenarioType::Flood),
            1 => Some(ScenarioType::Burst),
            2 => Some(ScenarioType::Backpressure),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenarioKind {
    /// Send as fast as buffers allow while the consumer keeps up.
    Flood { frame_count: u32 },
    /// Send `burst_size` frames back to back, then drain them all.
    Burst { bursts: u32, burst_size: u32 },
    /// Only drain once the producer has run out of buffers.
    Backpressure { frames: u32 },
}

impl ScenarioKind {
    pub fn scenario_type(&self) -> ScenarioType {
        match self {
            ScenarioKind::Flood { .. } => ScenarioType::Flood,
            ScenarioKind::Burst { .. } => ScenarioType::Burst,
            ScenarioKind::Backpressure { .. } => ScenarioType::Backpressure,
        }
    }

    /// Frames the scenario sends in total.
    pub fn total_frames(&self) -> u32 {
        match *self {
            ScenarioKind::Flood { frame_count } => frame_count,
            ScenarioKind::Burst { bursts, burst_size } => bursts.saturating_mul(burst_size),
            ScenarioKind::Backpressure { frames } => frames,
        }
    }
}

/// One loopback scenario: what traffic to generate and the circuit it runs
/// over.
#[derive(Clone, Debug)]
pub struct TestConfig {
    pub kind: ScenarioKind,
    pub buffer_count: u32,
    pub buffer_length: u32,
    pub protocol: String,
    pub distribution: DataDistribution,
    /// Directory for shared-memory backing files.
    pub smb_dir: PathBuf,
}

impl TestConfig {
    fn new(kind: ScenarioKind) -> Self {
        Self {
            kind,
            buffer_count: 4,
            buffer_length: 64,
            protocol: PIO_PROTOCOL.to_string(),
            distribution: DataDistribution::Parallel,
            smb_dir: std::env::temp_dir().join("transport-scenarios"),
        }
    }

    pub fn flood(frame_count: u32) -> Self {
        Self::new(ScenarioKind::Flood { frame_count })
    }

    pub fn burst(bursts: u32, burst_size: u32) -> Self {
        Self::new(ScenarioKind::Burst { bursts, burst_size })
    }

    pub fn backpressure(frames: u32) -> Self {
        Self::new(ScenarioKind::Backpressure { frames })
    }

    /// Builds a scenario from the numeric form used by test tables:
    /// `param1` is the frame (or burst) count, `param2` the burst size.
    pub fn from_raw(test_type: u32, param1: u32, param2: u32) -> Option<Self> {
        Some(match ScenarioType::from_u32(test_type)? {
            ScenarioType::Flood => Self::flood(param1),
            ScenarioType::Burst => Self::burst(param1, param2),
            ScenarioType::Backpressure => Self::backpressure(param1),
        })
    }

    pub fn with_buffers(mut self, count: u32, length: u32) -> Self {
        self.buffer_count = count;
        self.buffer_length = length;
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_smb_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.smb_dir = dir.into();
        self
    }

    /// Messages that can be outstanding before the producer stalls: a full
    /// input ring plus a full output ring.
    pub fn capacity(&self) -> u32 {
        self.buffer_count.saturating_mul(2)
    }
}
