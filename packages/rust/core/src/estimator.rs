//! Learned task-duration estimates.
//!
//! Until an operation has `min_records` observations the estimate is a fixed
//! per-unit baseline. After that, the most recent `window` records give an
//! average seconds-per-unit rate.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use studydeck_shared::{EstimatorConfig, OperationType, TimingRecord};

#[derive(Debug, Clone)]
pub struct Estimator {
    config: EstimatorConfig,
    history: HashMap<OperationType, VecDeque<TimingRecord>>,
}

impl Estimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
        }
    }

    /// Seconds per unit used before enough history exists.
    pub fn baseline(&self, operation: OperationType) -> f64 {
        let b = &self.config.baselines;
        match operation {
            OperationType::Summarize => b.summarize,
            OperationType::Flashcards => b.flashcards,
            OperationType::Report => b.report,
        }
    }

    /// Predicted duration in seconds for `units` units of `operation`.
    ///
    /// Non-decreasing in `units` for a fixed history.
    pub fn estimate(&self, operation: OperationType, units: u32) -> f64 {
        let units = f64::from(units);
        let rate = self.learned_rate(operation).unwrap_or_else(|| self.baseline(operation));
        (rate * units + self.config.overhead_secs).max(self.config.min_estimate_secs)
    }

    fn learned_rate(&self, operation: OperationType) -> Option<f64> {
        let records = self.history.get(&operation)?;
        if records.len() < self.config.min_records {
            return None;
        }

        let recent = records.iter().rev().take(self.config.window);
        let (secs, units) = recent.fold((0.0, 0.0), |(s, u), r| {
            (s + r.actual_seconds, u + f64::from(r.unit_count))
        });
        (units > 0.0).then(|| secs / units)
    }

    /// Record an observation made now.
    pub fn record(&mut self, operation: OperationType, unit_count: u32, secs: f64) -> TimingRecord {
        let record = TimingRecord {
            operation,
            unit_count,
            actual_seconds: secs.max(0.0),
            recorded_at: Utc::now(),
        };
        self.push(record.clone());
        record
    }

    /// Seed history from persisted records (oldest first).
    pub fn load(&mut self, records: impl IntoIterator<Item = TimingRecord>) {
        for record in records {
            self.push(record);
        }
    }

    fn push(&mut self, record: TimingRecord) {
        let cap = self.config.history_cap;
        let entries = self.history.entry(record.operation).or_default();
        entries.push_back(record);
        while entries.len() > cap {
            entries.pop_front();
        }
    }

    /// Purge records older than the configured maximum age. Returns how many
    /// were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(self.config.max_age_days);
        let mut removed = 0;
        for entries in self.history.values_mut() {
            let before = entries.len();
            entries.retain(|r| r.recorded_at >= cutoff);
            removed += before - entries.len();
        }
        if removed > 0 {
            debug!(removed, "pruned stale timing records");
        }
        removed
    }

    /// Number of records held for `operation`.
    pub fn history_len(&self, operation: OperationType) -> usize {
        self.history.get(&operation).map_or(0, VecDeque::len)
    }
}

impl Default for Estimator {
    fn default() -> Self {
        Self::new(EstimatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_at(op: OperationType, units: u32, secs: f64, days_ago: i64) -> TimingRecord {
        TimingRecord {
            operation: op,
            unit_count: units,
            actual_seconds: secs,
            recorded_at: Utc::now() - Duration::days(days_ago),
        }
    }

    #[test]
    fn baseline_without_history() {
        let est = Estimator::default();
        assert_eq!(est.estimate(OperationType::Summarize, 3), 4.0 * 3.0 + 2.0);
        assert_eq!(est.estimate(OperationType::Flashcards, 1), 8.0);
        assert_eq!(est.estimate(OperationType::Report, 2), 18.0);
    }

    #[test]
    fn two_records_still_use_baseline() {
        let mut est = Estimator::default();
        est.record(OperationType::Summarize, 1, 100.0);
        est.record(OperationType::Summarize, 1, 100.0);
        assert_eq!(est.estimate(OperationType::Summarize, 1), 6.0);
    }

    #[test]
    fn history_replaces_baseline() {
        let mut est = Estimator::default();
        est.record(OperationType::Summarize, 2, 10.0);
        est.record(OperationType::Summarize, 4, 20.0);
        est.record(OperationType::Summarize, 4, 20.0);
        // 50 s over 10 units = 5 s/unit
        assert_eq!(est.estimate(OperationType::Summarize, 3), 17.0);
        // other operations are unaffected
        assert_eq!(est.estimate(OperationType::Report, 1), 10.0);
    }

    #[test]
    fn only_recent_window_counts() {
        let mut est = Estimator::default();
        for _ in 0..10 {
            est.record(OperationType::Report, 1, 100.0);
        }
        for _ in 0..10 {
            est.record(OperationType::Report, 1, 1.0);
        }
        assert_eq!(est.estimate(OperationType::Report, 1), 3.0);
    }

    #[test]
    fn estimate_has_floor() {
        let mut est = Estimator::default();
        for _ in 0..3 {
            est.record(OperationType::Summarize, 10, 0.0);
        }
        assert_eq!(est.estimate(OperationType::Summarize, 5), 2.0);
    }

    #[test]
    fn estimate_is_monotonic_in_units() {
        let mut est = Estimator::default();
        est.record(OperationType::Flashcards, 3, 7.0);
        est.record(OperationType::Flashcards, 1, 2.5);
        est.record(OperationType::Flashcards, 5, 30.0);

        let mut last = 0.0;
        for units in 0..100 {
            let e = est.estimate(OperationType::Flashcards, units);
            assert!(e >= last, "estimate dropped at {units} units");
            last = e;
        }
    }

    #[test]
    fn history_is_capped() {
        let mut est = Estimator::default();
        for _ in 0..60 {
            est.record(OperationType::Summarize, 1, 1.0);
        }
        assert_eq!(est.history_len(OperationType::Summarize), 50);
    }

    #[test]
    fn prune_drops_old_records() {
        let mut est = Estimator::default();
        est.load([
            record_at(OperationType::Report, 1, 5.0, 40),
            record_at(OperationType::Report, 1, 5.0, 31),
            record_at(OperationType::Report, 1, 5.0, 2),
        ]);
        assert_eq!(est.prune(Utc::now()), 2);
        assert_eq!(est.history_len(OperationType::Report), 1);
    }

    #[test]
    fn zero_unit_history_falls_back_to_baseline() {
        let mut est = Estimator::default();
        for _ in 0..3 {
            est.record(OperationType::Summarize, 0, 9.0);
        }
        assert_eq!(est.estimate(OperationType::Summarize, 1), 6.0);
    }
}
