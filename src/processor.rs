use std::time::{Duration, Instant};

use crate::events::ChangeEvent;

/// Delivery pacing knobs for one subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessorSettings {
    /// At most one delivery per window; intermediate events are replaced by
    /// the most recent one, not queued.
    pub throttle: Option<Duration>,
    /// Accumulate events and deliver them as one ordered array.
    pub batch_window: Option<Duration>,
    /// Restart the batch window on every new event instead of measuring it
    /// from the first buffered event.
    pub quiet_period: bool,
}

impl ProcessorSettings {
    pub fn passthrough(&self) -> bool {
        self.throttle.is_none() && self.batch_window.is_none()
    }
}

/// A ready delivery produced by the processor.
#[derive(Debug, Clone)]
pub enum Flush {
    Single(ChangeEvent),
    /// Preserves original transport order.
    Batch(Vec<ChangeEvent>),
}

/// Per-subscription batching/throttling state machine.
///
/// Deliberately timer-free: callers feed it events and the current `Instant`,
/// poll `next_deadline` to know when to wake, and call `flush_due` on wake.
/// Tests drive it with synthetic instants.
#[derive(Debug)]
pub struct MessageProcessor {
    settings: ProcessorSettings,
    buffer: Vec<ChangeEvent>,
    pending: Option<ChangeEvent>,
    deadline: Option<Instant>,
    throttle_open_at: Option<Instant>,
}

impl MessageProcessor {
    pub fn new(settings: ProcessorSettings) -> Self {
        Self {
            settings,
            buffer: Vec::new(),
            pending: None,
            deadline: None,
            throttle_open_at: None,
        }
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    /// Feeds one inbound event. Returns a delivery only in passthrough mode;
    /// otherwise the event waits for a deadline.
    pub fn accept(&mut self, event: ChangeEvent, now: Instant) -> Option<Flush> {
        match (self.settings.throttle, self.settings.batch_window) {
            (None, None) => Some(Flush::Single(event)),
            (Some(window), None) => {
                let first = self.pending.is_none();
                self.pending = Some(event);
                if first {
                    self.deadline = Some(now + window);
                }
                None
            }
            (_, Some(window)) => {
                let first = self.buffer.is_empty();
                self.buffer.push(event);
                if first || self.settings.quiet_period {
                    self.deadline = Some(now + window);
                }
                None
            }
        }
    }

    /// When the owner should next call `flush_due`. None when nothing is
    /// buffered.
    pub fn next_deadline(&self) -> Option<Instant> {
        let deadline = self.deadline?;
        // Throttle gates how often a batch flush may occur.
        match (self.settings.batch_window, self.throttle_open_at) {
            (Some(_), Some(open)) => Some(deadline.max(open)),
            _ => Some(deadline),
        }
    }

    /// Flushes if the deadline has passed.
    pub fn flush_due(&mut self, now: Instant) -> Option<Flush> {
        let due = self.next_deadline()?;
        if now < due {
            return None;
        }
        self.flush(now)
    }

    fn flush(&mut self, now: Instant) -> Option<Flush> {
        self.deadline = None;
        if self.settings.batch_window.is_some() {
            if self.buffer.is_empty() {
                return None;
            }
            if let Some(throttle) = self.settings.throttle {
                self.throttle_open_at = Some(now + throttle);
            }
            return Some(Flush::Batch(std::mem::take(&mut self.buffer)));
        }
        self.pending.take().map(Flush::Single)
    }

    /// Flushes everything unconditionally. Called on unregister so buffered
    /// events are not silently lost; after this the processor is empty.
    pub fn drain(&mut self) -> Option<Flush> {
        self.deadline = None;
        if !self.buffer.is_empty() {
            return Some(Flush::Batch(std::mem::take(&mut self.buffer)));
        }
        self.pending.take().map(Flush::Single)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.pending.is_none()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::EventKind;
    use crate::types::{EventTimestamp, Table};

    fn event(n: u64) -> ChangeEvent {
        ChangeEvent {
            table: Table::from("orders"),
            kind: EventKind::Update,
            row: json!({"id": n}),
            old_row: None,
            timestamp: EventTimestamp::millis(n as i64),
        }
    }

    fn seq(flush: &Flush) -> Vec<u64> {
        match flush {
            Flush::Single(e) => vec![e.row["id"].as_u64().unwrap()],
            Flush::Batch(events) => events
                .iter()
                .map(|e| e.row["id"].as_u64().unwrap())
                .collect(),
        }
    }

    #[test]
    fn test_passthrough_delivers_immediately() {
        let mut processor = MessageProcessor::new(ProcessorSettings::default());
        let t0 = Instant::now();
        let flush = processor.accept(event(1), t0).unwrap();
        assert_eq!(seq(&flush), vec![1]);
        assert!(processor.next_deadline().is_none());
    }

    #[test]
    fn test_throttle_last_value_wins() {
        // 5 events within 50ms under a 100ms throttle: exactly one delivery,
        // carrying the last payload.
        let mut processor = MessageProcessor::new(ProcessorSettings {
            throttle: Some(Duration::from_millis(100)),
            ..ProcessorSettings::default()
        });
        let t0 = Instant::now();
        for n in 1..=5 {
            let at = t0 + Duration::from_millis((n - 1) * 10);
            assert!(processor.accept(event(n), at).is_none());
        }
        assert_eq!(processor.next_deadline(), Some(t0 + Duration::from_millis(100)));
        // Not due yet at t=50.
        assert!(processor
            .flush_due(t0 + Duration::from_millis(50))
            .is_none());
        let flush = processor
            .flush_due(t0 + Duration::from_millis(100))
            .unwrap();
        assert_eq!(seq(&flush), vec![5]);
        // Nothing further.
        assert!(processor.flush_due(t0 + Duration::from_millis(250)).is_none());
    }

    #[test]
    fn test_batch_fixed_window_preserves_order() {
        // Events at t=0, 100, 200 under a 500ms window: one array of all
        // three, original order, at ~t=500.
        let mut processor = MessageProcessor::new(ProcessorSettings {
            batch_window: Some(Duration::from_millis(500)),
            ..ProcessorSettings::default()
        });
        let t0 = Instant::now();
        processor.accept(event(1), t0);
        processor.accept(event(2), t0 + Duration::from_millis(100));
        processor.accept(event(3), t0 + Duration::from_millis(200));
        // Fixed window measured from the first buffered event.
        assert_eq!(processor.next_deadline(), Some(t0 + Duration::from_millis(500)));
        let flush = processor
            .flush_due(t0 + Duration::from_millis(500))
            .unwrap();
        assert_eq!(seq(&flush), vec![1, 2, 3]);
        assert!(processor.is_empty());
    }

    #[test]
    fn test_batch_quiet_period_restarts_window() {
        let mut processor = MessageProcessor::new(ProcessorSettings {
            batch_window: Some(Duration::from_millis(500)),
            quiet_period: true,
            ..ProcessorSettings::default()
        });
        let t0 = Instant::now();
        processor.accept(event(1), t0);
        processor.accept(event(2), t0 + Duration::from_millis(400));
        assert_eq!(processor.next_deadline(), Some(t0 + Duration::from_millis(900)));
    }

    #[test]
    fn test_throttle_gates_batch_flush() {
        let mut processor = MessageProcessor::new(ProcessorSettings {
            throttle: Some(Duration::from_millis(1_000)),
            batch_window: Some(Duration::from_millis(200)),
            quiet_period: false,
        });
        let t0 = Instant::now();
        processor.accept(event(1), t0);
        let first = processor.flush_due(t0 + Duration::from_millis(200)).unwrap();
        assert_eq!(seq(&first), vec![1]);

        // Second batch is ready at t=500 but the throttle holds it to t=1200.
        processor.accept(event(2), t0 + Duration::from_millis(300));
        assert_eq!(
            processor.next_deadline(),
            Some(t0 + Duration::from_millis(1_200))
        );
        assert!(processor.flush_due(t0 + Duration::from_millis(600)).is_none());
        let second = processor
            .flush_due(t0 + Duration::from_millis(1_200))
            .unwrap();
        assert_eq!(seq(&second), vec![2]);
    }

    #[test]
    fn test_drain_flushes_exactly_once() {
        let mut processor = MessageProcessor::new(ProcessorSettings {
            batch_window: Some(Duration::from_millis(500)),
            ..ProcessorSettings::default()
        });
        let t0 = Instant::now();
        processor.accept(event(1), t0);
        processor.accept(event(2), t0);
        let flush = processor.drain().unwrap();
        assert_eq!(seq(&flush), vec![1, 2]);
        assert!(processor.drain().is_none());
        assert!(processor.next_deadline().is_none());
    }
}
