use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide hit counters keyed by full metric name.
///
/// Counters are created on first use and live as long as the registry; they
/// are never reset.
#[derive(Debug, Default)]
pub struct HitCounters {
    counters: DashMap<String, Arc<AtomicU64>>,
}

impl HitCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter for `name`, registering it when absent
    pub fn counter(&self, name: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.counters.get(name) {
            return counter.clone();
        }
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    /// Adds one to the counter and returns the new value
    pub fn increment(&self, name: &str) -> u64 {
        self.counter(name).fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.counters.len()
    }
}
