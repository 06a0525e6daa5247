//! Counters for the status report.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Hatchery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    JobsReceivedStream,
    JobsReceivedPoll,
    JobsEmitted,
    SpawnAccepted,
    SpawnRefused,
    JobsBooked,
    InstancesReaped,
    InstancesProvisioned,
}

impl Counter {
    pub const ALL: [Counter; 8] = [
        Counter::JobsReceivedStream,
        Counter::JobsReceivedPoll,
        Counter::JobsEmitted,
        Counter::SpawnAccepted,
        Counter::SpawnRefused,
        Counter::JobsBooked,
        Counter::InstancesReaped,
        Counter::InstancesProvisioned,
    ];
}

/// Sink for counter increments.
pub trait MetricsSink: Send + Sync {
    fn incr(&self, counter: Counter, value: u64);

    /// Current counter values. Sinks that do not keep values report none.
    fn snapshot(&self) -> BTreeMap<Counter, u64> {
        BTreeMap::new()
    }
}

/// Lock-free in-process counters.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    values: [AtomicU64; Counter::ALL.len()],
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }
}

impl MetricsSink for AtomicMetrics {
    fn incr(&self, counter: Counter, value: u64) {
        self.values[counter as usize].fetch_add(value, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BTreeMap<Counter, u64> {
        Counter::ALL.iter().map(|c| (*c, self.get(*c))).collect()
    }
}

/// Discards every increment.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _counter: Counter, _value: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_counters() {
        let metrics = AtomicMetrics::new();
        metrics.incr(Counter::JobsEmitted, 2);
        metrics.incr(Counter::JobsEmitted, 1);
        metrics.incr(Counter::InstancesReaped, 1);

        assert_eq!(metrics.get(Counter::JobsEmitted), 3);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.len(), Counter::ALL.len());
        assert_eq!(snapshot[&Counter::InstancesReaped], 1);
        assert_eq!(snapshot[&Counter::JobsBooked], 0);
    }

    #[test]
    fn test_noop_snapshot_is_empty() {
        let metrics = NoopMetrics;
        metrics.incr(Counter::JobsEmitted, 5);
        assert!(metrics.snapshot().is_empty());
    }
}
