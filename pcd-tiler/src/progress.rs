use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    value: u64,
    max: u64,
}

/// Named progress counters published by the core. The core only pushes
/// updates; rendering belongs to whoever owns the reporter.
///
/// Updates take a short mutex; snapshots read under the same lock.
#[derive(Default)]
pub struct ProgressReporter {
    counters: Mutex<FxHashMap<String, Progress>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, max: u64) {
        let mut counters = self.counters.lock().unwrap();
        counters.insert(name.to_string(), Progress { value: 0, max });
    }

    pub fn set(&self, name: &str, value: u64) {
        let mut counters = self.counters.lock().unwrap();
        let progress = counters.entry(name.to_string()).or_default();
        progress.value = if progress.max > 0 {
            value.min(progress.max)
        } else {
            value
        };
    }

    pub fn add(&self, name: &str, delta: u64) {
        let mut counters = self.counters.lock().unwrap();
        let progress = counters.entry(name.to_string()).or_default();
        progress.value += delta;
    }

    pub fn get(&self, name: &str) -> Option<(u64, u64)> {
        let counters = self.counters.lock().unwrap();
        counters.get(name).map(|p| (p.value, p.max))
    }

    pub fn snapshot(&self) -> Vec<(String, u64, u64)> {
        let counters = self.counters.lock().unwrap();
        let mut entries: Vec<_> = counters
            .iter()
            .map(|(name, p)| (name.clone(), p.value, p.max))
            .collect();
        entries.sort();
        entries
    }
}

/// Sliding-window throughput: entries older than the window are trimmed and
/// the rate is the windowed sum divided by the window length.
pub struct ThroughputCounter {
    window: Duration,
    entries: VecDeque<(Instant, u64)>,
}

impl Default for ThroughputCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(5))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
        }
    }

    pub fn push_entry(&mut self, count: u64) {
        self.push_at(Instant::now(), count);
    }

    fn push_at(&mut self, at: Instant, count: u64) {
        self.entries.push_back((at, count));
        self.trim(at);
    }

    fn trim(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.entries.front() {
            if now.duration_since(t) > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn per_second(&mut self) -> f64 {
        self.trim(Instant::now());
        let total: u64 = self.entries.iter().map(|&(_, c)| c).sum();
        total as f64 / self.window.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let reporter = ProgressReporter::new();
        reporter.register("indexing", 100);
        reporter.add("indexing", 30);
        reporter.add("indexing", 20);
        assert_eq!(reporter.get("indexing"), Some((50, 100)));
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let reporter = ProgressReporter::new();
        reporter.register("flushing", 10);
        reporter.register("indexing", 10);
        let names: Vec<String> = reporter
            .snapshot()
            .into_iter()
            .map(|(name, _, _)| name)
            .collect();
        assert_eq!(names, vec!["flushing", "indexing"]);
    }

    #[test]
    fn throughput_window_trims_old_entries() {
        let mut counter = ThroughputCounter::with_window(Duration::from_secs(5));
        let start = Instant::now();
        counter.push_at(start, 100);
        counter.push_at(start + Duration::from_secs(10), 50);
        // The first entry fell out of the window.
        let total: u64 = counter.entries.iter().map(|&(_, c)| c).sum();
        assert_eq!(total, 50);
    }

    #[test]
    fn rate_is_windowed_sum_over_window_seconds() {
        let mut counter = ThroughputCounter::with_window(Duration::from_secs(5));
        counter.push_entry(500);
        counter.push_entry(250);
        let rate = counter.per_second();
        assert!((rate - 150.0).abs() < 1e-9);
    }
}
