//! Completion events for drivers that signal through the OS rather than
//! through polled memory.
//!
//! Drivers post an event id through an [`EventSink`]; the owner of the
//! [`EventManager`] waits for ids in a range with a bounded timeout. Ids
//! outside the requested range are kept for a later wait instead of being
//! dropped.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::trace;

#[derive(Clone, Debug)]
pub struct EventSink {
    id: u32,
    tx: Sender<u32>,
}

impl EventSink {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Posts the sink's event id. Never blocks; a dropped manager is ignored.
    pub fn post(&self) {
        if self.tx.send(self.id).is_err() {
            trace!(id = self.id, "event manager gone; dropping event");
        }
    }
}

#[derive(Debug)]
pub struct EventManager {
    tx: Sender<u32>,
    rx: Receiver<u32>,
    deferred: VecDeque<u32>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            deferred: VecDeque::new(),
        }
    }

    pub fn sink(&self, id: u32) -> EventSink {
        EventSink {
            id,
            tx: self.tx.clone(),
        }
    }

    /// Waits up to `timeout` for an event with `low <= id <= high`.
    pub fn wait(&mut self, low: u32, high: u32, timeout: Duration) -> Option<u32> {
        let in_range = |id: u32| (low..=high).contains(&id);
        if let Some(pos) = self.deferred.iter().position(|&id| in_range(id)) {
            return self.deferred.remove(pos);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(id) if in_range(id) => return Some(id),
                Ok(id) => self.deferred.push_back(id),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }

    /// Number of events received but not yet returned by [`EventManager::wait`].
    pub fn pending(&self) -> usize {
        self.deferred.len() + self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_posted_event() {
        let mut events = EventManager::new();
        events.sink(5).post();
        assert_eq!(events.wait(0, 10, Duration::from_millis(10)), Some(5));
        assert_eq!(events.wait(0, 10, Duration::from_millis(1)), None);
    }

    #[test]
    fn out_of_range_events_are_kept() {
        let mut events = EventManager::new();
        events.sink(42).post();
        events.sink(3).post();
        assert_eq!(events.wait(0, 9, Duration::from_millis(10)), Some(3));
        assert_eq!(events.pending(), 1);
        assert_eq!(events.wait(40, 50, Duration::ZERO), Some(42));
        assert_eq!(events.pending(), 0);
    }

    #[test]
    fn wait_is_bounded() {
        let mut events = EventManager::new();
        let start = Instant::now();
        assert_eq!(events.wait(0, 0, Duration::from_millis(20)), None);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn sinks_post_across_threads() {
        let mut events = EventManager::new();
        let sink = events.sink(7);
        let worker = std::thread::spawn(move || sink.post());
        worker.join().expect("join");
        assert_eq!(events.wait(7, 7, Duration::from_secs(1)), Some(7));
    }
}
