//! Metric export for checkpoint sessions.
//!
//! Names are dotted paths under one root (`colo.checkpoint.count`). Snapshots
//! use ordered maps so reports diff cleanly between runs.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug)]
pub struct MetricsRegistry {
    root: String,
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
}

impl MetricsRegistry {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.ends_with('.') {
            root.pop();
        }
        Self {
            root,
            counters: BTreeMap::new(),
            gauges: BTreeMap::new(),
        }
    }

    /// Adds `delta` to a monotonic counter and returns the new value.
    pub fn inc_counter(&mut self, name: &str, delta: u64) -> u64 {
        let key = self.path(name);
        let counter = self.counters.entry(key).or_default();
        *counter = counter.saturating_add(delta);
        *counter
    }

    pub fn set_gauge(&mut self, name: &str, value: u64) {
        let key = self.path(name);
        self.gauges.insert(key, value);
    }

    /// Records a duration gauge in whole milliseconds under `<name>_ms`.
    pub fn set_duration_gauge(&mut self, name: &str, value: Duration) {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        self.set_gauge(&format!("{name}_ms"), millis);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.clone(),
            gauges: self.gauges.clone(),
        }
    }

    fn path(&self, name: &str) -> String {
        let name = name.trim_start_matches('.');
        match name.strip_prefix(self.root.as_str()) {
            Some(rest) if rest.starts_with('.') => name.to_string(),
            _ if self.root.is_empty() => name.to_string(),
            _ => format!("{}.{}", self.root, name),
        }
    }
}

impl MetricsSnapshot {
    pub fn gauge(&self, name: &str) -> Option<u64> {
        self.gauges.get(name).copied()
    }

    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_rooted_once() {
        let mut registry = MetricsRegistry::new("colo.");
        registry.inc_counter("failover.requests", 1);
        registry.inc_counter("colo.failover.requests", 2);
        registry.set_gauge("colometer", 4);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counter("colo.failover.requests"), Some(3));
        assert_eq!(snapshot.gauge("colo.colometer"), Some(4));
    }

    #[test]
    fn duration_gauges_are_milliseconds() {
        let mut registry = MetricsRegistry::new("colo");
        registry.set_duration_gauge("downtime.max", Duration::from_micros(12_700));
        assert_eq!(registry.snapshot().gauge("colo.downtime.max_ms"), Some(12));
    }

    #[test]
    fn counters_saturate() {
        let mut registry = MetricsRegistry::new("colo");
        registry.inc_counter("pages", u64::MAX);
        assert_eq!(registry.inc_counter("pages", 5), u64::MAX);
    }
}
