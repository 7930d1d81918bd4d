use crate::telemetry::MetricsRegistry;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Checkpoint counters and downtime gauges.
///
/// Written only by the primary coordinator; read concurrently by the
/// management surface. Values only grow for the lifetime of a session.
#[derive(Debug)]
pub struct StatisticsLedger {
    checkpoint_count: AtomicU64,
    periodic_checkpoint_count: AtomicU64,
    compare_triggered_count: AtomicU64,
    pages_full: AtomicU64,
    pages_incremental: AtomicU64,
    downtime: Mutex<Downtime>,
}

#[derive(Debug, Clone, Copy)]
struct Downtime {
    total_ms: u64,
    max_ms: u64,
    // u64::MAX until the first sample lands
    min_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub checkpoint_count: u64,
    pub periodic_checkpoint_count: u64,
    pub compare_triggered_count: u64,
    pub pages_full: u64,
    pub pages_incremental: u64,
    pub downtime_total_ms: u64,
    pub downtime_max_ms: u64,
    /// `None` until a checkpoint has completed.
    pub downtime_min_ms: Option<u64>,
}

impl Default for StatisticsLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsLedger {
    pub fn new() -> Self {
        Self {
            checkpoint_count: AtomicU64::new(0),
            periodic_checkpoint_count: AtomicU64::new(0),
            compare_triggered_count: AtomicU64::new(0),
            pages_full: AtomicU64::new(0),
            pages_incremental: AtomicU64::new(0),
            downtime: Mutex::new(Downtime {
                total_ms: 0,
                max_ms: 0,
                min_ms: u64::MAX,
            }),
        }
    }

    pub fn record_checkpoint(&self) {
        self.checkpoint_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_periodic_trigger(&self) {
        self.periodic_checkpoint_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compare_trigger(&self) {
        self.compare_triggered_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_full_pages(&self, pages: u64) {
        self.pages_full.fetch_add(pages, Ordering::Relaxed);
    }

    pub fn record_incremental_pages(&self, pages: u64) {
        self.pages_incremental.fetch_add(pages, Ordering::Relaxed);
    }

    /// Folds one suspend-to-resume interval into total, max and min.
    pub fn record_downtime(&self, downtime: Duration) {
        let millis = u64::try_from(downtime.as_millis()).unwrap_or(u64::MAX);
        let mut guard = self.downtime.lock();
        guard.total_ms = guard.total_ms.saturating_add(millis);
        guard.max_ms = guard.max_ms.max(millis);
        guard.min_ms = guard.min_ms.min(millis);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let downtime = *self.downtime.lock();
        StatisticsSnapshot {
            checkpoint_count: self.checkpoint_count.load(Ordering::Relaxed),
            periodic_checkpoint_count: self.periodic_checkpoint_count.load(Ordering::Relaxed),
            compare_triggered_count: self.compare_triggered_count.load(Ordering::Relaxed),
            pages_full: self.pages_full.load(Ordering::Relaxed),
            pages_incremental: self.pages_incremental.load(Ordering::Relaxed),
            downtime_total_ms: downtime.total_ms,
            downtime_max_ms: downtime.max_ms,
            downtime_min_ms: (downtime.min_ms != u64::MAX).then_some(downtime.min_ms),
        }
    }

    pub fn publish_metrics(&self, registry: &mut MetricsRegistry) {
        let snapshot = self.snapshot();
        registry.set_gauge("checkpoint.count", snapshot.checkpoint_count);
        registry.set_gauge(
            "checkpoint.periodic_count",
            snapshot.periodic_checkpoint_count,
        );
        registry.set_gauge(
            "checkpoint.compare_triggered_count",
            snapshot.compare_triggered_count,
        );
        registry.set_gauge("memory.pages_full", snapshot.pages_full);
        registry.set_gauge("memory.pages_incremental", snapshot.pages_incremental);
        registry.set_gauge("downtime.total_ms", snapshot.downtime_total_ms);
        registry.set_gauge("downtime.max_ms", snapshot.downtime_max_ms);
        if let Some(min) = snapshot.downtime_min_ms {
            registry.set_gauge("downtime.min_ms", min);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn downtime_accumulates_total_max_and_min() {
        let ledger = StatisticsLedger::new();
        let t0 = Instant::now();
        let pairs = [(0u64, 5u64), (100, 102), (200, 250)];
        for (suspend, resume) in pairs {
            let start = t0 + Duration::from_millis(suspend);
            let end = t0 + Duration::from_millis(resume);
            ledger.record_downtime(end - start);
        }
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.downtime_total_ms, 57);
        assert_eq!(snapshot.downtime_max_ms, 50);
        assert_eq!(snapshot.downtime_min_ms, Some(2));
    }

    #[test]
    fn min_downtime_is_unset_before_first_checkpoint() {
        let ledger = StatisticsLedger::new();
        assert_eq!(ledger.snapshot().downtime_min_ms, None);
        let mut registry = MetricsRegistry::new("colo");
        ledger.publish_metrics(&mut registry);
        assert!(!registry.snapshot().gauges.contains_key("colo.downtime.min_ms"));
    }

    #[test]
    fn counters_publish_as_gauges() {
        let ledger = StatisticsLedger::new();
        ledger.record_checkpoint();
        ledger.record_checkpoint();
        ledger.record_periodic_trigger();
        ledger.record_compare_trigger();
        ledger.record_full_pages(12);
        ledger.record_incremental_pages(4);
        let mut registry = MetricsRegistry::new("colo");
        ledger.publish_metrics(&mut registry);
        let gauges = registry.snapshot().gauges;
        assert_eq!(gauges.get("colo.checkpoint.count"), Some(&2));
        assert_eq!(gauges.get("colo.checkpoint.periodic_count"), Some(&1));
        assert_eq!(gauges.get("colo.checkpoint.compare_triggered_count"), Some(&1));
        assert_eq!(gauges.get("colo.memory.pages_full"), Some(&12));
        assert_eq!(gauges.get("colo.memory.pages_incremental"), Some(&4));
    }
}
