//! Process-wide monotonic counters.
//!
//! Counters are free-form named, incremented from any thread, and reset on
//! restart. A snapshot can be dumped to the log at shutdown. Telemetry must
//! never break the pipeline, so there is no fallible path here.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Default)]
pub struct Telemetry {
    counters: RwLock<HashMap<String, AtomicU64>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, delta: u64) {
        {
            let counters = self.counters.read();
            if let Some(c) = counters.get(name) {
                c.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write();
        counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sorted copy of every counter, for logging and tests.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn log_snapshot(&self) {
        let snap = self.snapshot();
        if snap.is_empty() {
            info!("telemetry snapshot: (empty)");
            return;
        }
        let summary = snap
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        info!(%summary, "telemetry snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic_and_independent() {
        let t = Telemetry::new();
        t.incr("scan_clean");
        t.incr("scan_clean");
        t.add("scan_match", 3);
        assert_eq!(t.get("scan_clean"), 2);
        assert_eq!(t.get("scan_match"), 3);
        assert_eq!(t.get("never_touched"), 0);
    }

    #[test]
    fn snapshot_is_sorted() {
        let t = Telemetry::new();
        t.incr("b");
        t.incr("a");
        let keys: Vec<_> = t.snapshot().into_keys().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
