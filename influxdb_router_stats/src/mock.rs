//! A [`StatsSink`] that records observations, for tests
use parking_lot::Mutex;

use crate::StatsSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatEvent {
    Counter { metric: String, value: u64 },
    Gauge { metric: String, value: u64 },
}

#[derive(Debug, Default)]
pub struct MockStats {
    events: Mutex<Vec<StatEvent>>,
}

impl MockStats {
    /// All observations, in the order they were made
    pub fn events(&self) -> Vec<StatEvent> {
        self.events.lock().clone()
    }

    /// Sum of all increments to the counter `metric`
    pub fn counter_total(&self, metric: &str) -> u64 {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                StatEvent::Counter { metric: m, value } if m == metric => Some(*value),
                _ => None,
            })
            .sum()
    }
}

impl StatsSink for MockStats {
    fn incr_counter(&self, metric: &str, value: u64) {
        self.events.lock().push(StatEvent::Counter {
            metric: metric.to_string(),
            value,
        });
    }

    fn gauge(&self, metric: &str, value: u64) {
        self.events.lock().push(StatEvent::Gauge {
            metric: metric.to_string(),
            value,
        });
    }
}
