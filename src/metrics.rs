//! Per-command request counters and latency accumulation.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommandStat {
    pub requests: u64,
    pub latency_usec_sum: u64,
}

/// Keyed by uppercase command name. Updated on every dispatch; contention is
/// one short-lived lock per command.
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<HashMap<String, CommandStat>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, cmd: &str, latency_usec: u64) {
        let mut map = self.inner.lock().unwrap();
        let stat = map.entry(cmd.to_string()).or_default();
        stat.requests += 1;
        stat.latency_usec_sum += latency_usec;
    }

    pub fn get(&self, cmd: &str) -> Option<CommandStat> {
        self.inner.lock().unwrap().get(cmd).copied()
    }

    pub fn total_requests(&self) -> u64 {
        self.inner.lock().unwrap().values().map(|s| s.requests).sum()
    }

    /// Sorted snapshot for diagnostics output.
    pub fn snapshot(&self) -> Vec<(String, CommandStat)> {
        let mut entries: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_per_command() {
        let metrics = Metrics::new();
        metrics.record("GET", 10);
        metrics.record("GET", 5);
        metrics.record("SET", 7);

        let get = metrics.get("GET").unwrap();
        assert_eq!(get.requests, 2);
        assert_eq!(get.latency_usec_sum, 15);
        assert_eq!(metrics.total_requests(), 3);

        let names: Vec<_> = metrics.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["GET".to_string(), "SET".to_string()]);
    }
}
