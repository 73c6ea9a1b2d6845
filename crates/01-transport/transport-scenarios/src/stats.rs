use std::sync::Arc;

use parking_lot::Mutex;

/// Counters a scenario publishes when it finishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScenarioStats {
    pub sent: u64,
    pub received: u64,
    pub bytes: u64,
    /// Producer attempts that found no empty buffer.
    pub stalls: u64,
    /// Largest number of frames sent but not yet received.
    pub max_outstanding: u32,
}

impl ScenarioStats {
    pub fn outstanding(&self) -> u32 {
        self.sent.saturating_sub(self.received) as u32
    }

    pub(crate) fn note_sent(&mut self) {
        self.sent += 1;
        self.max_outstanding = self.max_outstanding.max(self.outstanding());
    }

    pub(crate) fn note_received(&mut self, bytes: usize) {
        self.received += 1;
        self.bytes += bytes as u64;
    }
}

pub trait StatsSink: Send + Sync {
    fn publish(&self, stats: &ScenarioStats);
}

/// Sink that keeps the latest snapshot behind a shared lock.
#[derive(Clone, Default)]
pub struct ArcStatsSink {
    inner: Arc<Mutex<ScenarioStats>>,
}

impl ArcStatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ScenarioStats {
        *self.inner.lock()
    }
}

impl StatsSink for ArcStatsSink {
    fn publish(&self, stats: &ScenarioStats) {
        *self.inner.lock() = *stats;
    }
}
