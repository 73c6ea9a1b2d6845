//! Post-run verification of what a scenario delivered.

use std::fmt;

/// What the consumer side saw during one scenario run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Frame ids in arrival order.
    pub frames: Vec<u32>,
    /// Frames whose payload did not match what was sent.
    pub corrupt: u32,
    pub stalls: u64,
    pub max_outstanding: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub failures: Vec<String>,
}

impl CheckResult {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            failures: Vec::new(),
        }
    }

    fn expect(&mut self, ok: bool, failure: impl FnOnce() -> String) {
        if !ok {
            self.failures.push(failure());
        }
    }

    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> anyhow::Result<()> {
        anyhow::ensure!(self.passed(), "{self}");
        Ok(())
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            return write!(f, "{}: ok", self.name);
        }
        write!(f, "{}: {}", self.name, self.failures.join("; "))
    }
}

/// Frames arrived once each, in send order, intact.
fn check_sequence(result: &mut CheckResult, report: &DrainReport, expected: u32) {
    result.expect(report.frames.len() == expected as usize, || {
        format!("received {} of {expected} frames", report.frames.len())
    });
    if let Some((index, frame)) = report
        .frames
        .iter()
        .enumerate()
        .find(|(index, frame)| **frame != *index as u32)
    {
        result
            .failures
            .push(format!("frame {frame} arrived in position {index}"));
    }
    result.expect(report.corrupt == 0, || {
        format!("{} corrupt payloads", report.corrupt)
    });
}

pub fn verify_flood(report: &DrainReport, frame_count: u32) -> CheckResult {
    let mut result = CheckResult::new("flood");
    check_sequence(&mut result, report, frame_count);
    result
}

pub fn verify_burst(report: &DrainReport, bursts: u32, burst_size: u32) -> CheckResult {
    let mut result = CheckResult::new("burst");
    check_sequence(&mut result, report, bursts.saturating_mul(burst_size));
    result
}

/// Besides ordering, the producer must have been held back, and never by
/// more than the buffers between it and the consumer.
pub fn verify_backpressure(report: &DrainReport, frames: u32, capacity: u32) -> CheckResult {
    let mut result = CheckResult::new("backpressure");
    check_sequence(&mut result, report, frames);
    if frames > capacity {
        result.expect(report.stalls > 0, || "producer never stalled".to_string());
    }
    result.expect(report.max_outstanding <= capacity, || {
        format!(
            "{} frames outstanding with only {capacity} buffers",
            report.max_outstanding
        )
    });
    result
}
