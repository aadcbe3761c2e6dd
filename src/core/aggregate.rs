//! Reduction of fetched samples into the state shown to subscribers.
//!
//! Steps keep every observed sample and a total recomputed from them; heart
//! rate keeps a bounded window of the most recent samples. Both dedupe by
//! sample id so a re-delivered sample never counts twice.

use crate::store::{QuantitySample, SampleType};
use std::collections::HashSet;
use uuid::Uuid;

/// Default number of heart rate samples kept.
pub const HEART_RATE_WINDOW: usize = 10;

/// Keep the first occurrence of every id, preserving order.
fn dedupe(samples: Vec<QuantitySample>) -> Vec<QuantitySample> {
    let mut seen = HashSet::with_capacity(samples.len());
    samples.into_iter().filter(|s| seen.insert(s.id())).collect()
}

/// Running step total.
#[derive(Debug, Clone, Default)]
pub struct StepTotals {
    samples: Vec<QuantitySample>,
    total: f64,
}

impl StepTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with a full query result and recompute the total from it.
    pub fn replace(&mut self, samples: Vec<QuantitySample>) {
        self.samples = dedupe(samples);
        self.recompute();
    }

    /// Merge an incremental delta.
    pub fn apply_delta(&mut self, added: Vec<QuantitySample>, deleted: &[Uuid]) {
        let deleted: HashSet<&Uuid> = deleted.iter().collect();
        let mut merged = std::mem::take(&mut self.samples);
        merged.extend(added);
        merged.retain(|s| !deleted.contains(&s.id()));

        self.samples = dedupe(merged);
        self.samples.sort_by_key(QuantitySample::start);
        self.recompute();
    }

    fn recompute(&mut self) {
        self.total = self.samples.iter().map(QuantitySample::value).sum();
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn samples(&self) -> &[QuantitySample] {
        &self.samples
    }
}

/// Most recent heart rate samples, newest first.
#[derive(Debug, Clone)]
pub struct HeartRateWindow {
    capacity: usize,
    samples: Vec<QuantitySample>,
}

impl HeartRateWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Vec::new(),
        }
    }

    /// Replace the window with a query result.
    pub fn replace(&mut self, samples: Vec<QuantitySample>) {
        self.samples = samples;
        self.normalize();
    }

    /// Merge an incremental delta into the window.
    pub fn apply_delta(&mut self, added: Vec<QuantitySample>, deleted: &[Uuid]) {
        let deleted: HashSet<&Uuid> = deleted.iter().collect();
        self.samples.retain(|s| !deleted.contains(&s.id()));
        self.samples
            .extend(added.into_iter().filter(|s| !deleted.contains(&s.id())));
        self.normalize();
    }

    fn normalize(&mut self) {
        self.samples = dedupe(std::mem::take(&mut self.samples));
        // Newest first; stable so equal start times keep arrival order.
        self.samples.sort_by(|a, b| b.start().cmp(&a.start()));
        self.samples.truncate(self.capacity);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn samples(&self) -> &[QuantitySample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for HeartRateWindow {
    fn default() -> Self {
        Self::new(HEART_RATE_WINDOW)
    }
}

/// Aggregation policy selected by sample type.
#[derive(Debug, Clone)]
pub enum Aggregator {
    Steps(StepTotals),
    HeartRate(HeartRateWindow),
}

impl Aggregator {
    /// Build the aggregator for `sample_type`. `window` bounds the heart rate list.
    pub fn for_type(sample_type: SampleType, window: usize) -> Self {
        match sample_type {
            SampleType::StepCount => Aggregator::Steps(StepTotals::new()),
            SampleType::HeartRate => Aggregator::HeartRate(HeartRateWindow::new(window)),
        }
    }

    pub fn replace(&mut self, samples: Vec<QuantitySample>) {
        match self {
            Aggregator::Steps(steps) => steps.replace(samples),
            Aggregator::HeartRate(window) => window.replace(samples),
        }
    }

    pub fn apply_delta(&mut self, added: Vec<QuantitySample>, deleted: &[Uuid]) {
        match self {
            Aggregator::Steps(steps) => steps.apply_delta(added, deleted),
            Aggregator::HeartRate(window) => window.apply_delta(added, deleted),
        }
    }

    /// Samples currently held, in the order subscribers see them.
    pub fn samples(&self) -> &[QuantitySample] {
        match self {
            Aggregator::Steps(steps) => steps.samples(),
            Aggregator::HeartRate(window) => window.samples(),
        }
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use quickcheck_macros::quickcheck;

    fn to_samples(sample_type: SampleType, raw: &[(u16, u16)]) -> Vec<QuantitySample> {
        let origin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        raw.iter()
            .map(|(value, minute)| {
                let start = origin + Duration::minutes(i64::from(*minute));
                QuantitySample::new(sample_type, f64::from(*value), start, start + Duration::minutes(1))
            })
            .collect()
    }

    // The total after any sequence of bulk results is the sum of the last one.
    #[quickcheck]
    fn prop_step_total_tracks_last_bulk_result(results: Vec<Vec<(u16, u16)>>) -> bool {
        let mut steps = StepTotals::new();
        let mut expected = 0.0;
        for raw in &results {
            let samples = to_samples(SampleType::StepCount, raw);
            expected = samples.iter().map(QuantitySample::value).sum();
            steps.replace(samples);
        }
        steps.total() == expected
    }

    // Heart rate never holds more than the window, always newest first.
    #[quickcheck]
    fn prop_heart_rate_window_bounded_and_sorted(results: Vec<Vec<(u16, u16)>>, incremental: bool) -> bool {
        let mut window = HeartRateWindow::default();
        for raw in &results {
            let samples = to_samples(SampleType::HeartRate, raw);
            if incremental {
                window.apply_delta(samples, &[]);
            } else {
                window.replace(samples);
            }
            let ordered = window
                .samples()
                .windows(2)
                .all(|pair| pair[0].start() >= pair[1].start());
            if window.len() > HEART_RATE_WINDOW || !ordered {
                return false;
            }
        }
        true
    }
}
