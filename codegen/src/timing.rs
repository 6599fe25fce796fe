//! Pass timing instrumentation.
//!
//! Each compilation unit carries a `TimingLogger` with named splits
//! ("BuildMirGraph", "Mir2Lir", "Assemble", ...). The driver aggregates the
//! per-method logs into a process-wide summary when `dump_passes` is set;
//! when it is not, every call here is a cheap no-op.

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

/// Per-method split timer. One split is open at a time.
pub struct TimingLogger {
    enabled: bool,
    current: Option<(&'static str, Instant)>,
    splits: Vec<(&'static str, Duration)>,
}

impl TimingLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, current: None, splits: Vec::new() }
    }

    /// Close the open split (if any) and open a new one.
    pub fn new_split(&mut self, label: &'static str) {
        if !self.enabled {
            return;
        }
        self.end();
        self.current = Some((label, Instant::now()));
    }

    /// Close the open split.
    pub fn end(&mut self) {
        if let Some((label, start)) = self.current.take() {
            self.splits.push((label, start.elapsed()));
        }
    }

    pub fn splits(&self) -> &[(&'static str, Duration)] {
        &self.splits
    }
}

/// Process-wide accumulation of split times, keyed by split label.
#[derive(Default)]
pub struct CumulativeTimings {
    totals: FxHashMap<&'static str, (Duration, u64)>,
}

impl CumulativeTimings {
    pub fn add_logger(&mut self, logger: &TimingLogger) {
        for &(label, duration) in logger.splits() {
            let entry = self.totals.entry(label).or_default();
            entry.0 += duration;
            entry.1 += 1;
        }
    }

    /// Log the aggregate at info level, slowest split first.
    pub fn dump(&self) {
        let mut rows: Vec<_> = self.totals.iter().collect();
        rows.sort_by(|a, b| b.1 .0.cmp(&a.1 .0));
        for (label, (total, count)) in rows {
            log::info!("timing: {label}: {:?} over {count} methods", total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_logger_records_nothing() {
        let mut timings = TimingLogger::new(false);
        timings.new_split("A");
        timings.end();
        assert!(timings.splits().is_empty());
    }

    #[test]
    fn splits_accumulate() {
        let mut timings = TimingLogger::new(true);
        timings.new_split("A");
        timings.new_split("B");
        timings.end();
        let labels: Vec<_> = timings.splits().iter().map(|s| s.0).collect();
        assert_eq!(labels, ["A", "B"]);

        let mut cumulative = CumulativeTimings::default();
        cumulative.add_logger(&timings);
        assert_eq!(cumulative.totals.len(), 2);
    }
}
