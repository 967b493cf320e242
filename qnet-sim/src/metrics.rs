//! Statistics collection during a run.

use std::collections::BTreeMap;

use qnet_core::{ClassId, Measure, NodeId, Sample, StatisticsSink};
use serde::Serialize;

/// Running weighted mean of one series.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Accumulator {
    pub count: u64,
    pub total_weight: f64,
    pub weighted_sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Accumulator {
    fn add(&mut self, value: f64, weight: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.total_weight += weight;
        self.weighted_sum += value * weight;
    }

    /// Weighted mean, `None` before any positive weight was seen.
    pub fn mean(&self) -> Option<f64> {
        (self.total_weight > 0.0).then(|| self.weighted_sum / self.total_weight)
    }
}

/// Identifies a series: a measure at a station (or network-wide) for one
/// class (or all classes).
pub type SeriesKey = (Measure, Option<NodeId>, Option<ClassId>);

/// Collects weighted means per measure, station and class.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    series: BTreeMap<SeriesKey, Accumulator>,
    samples: u64,
    last_time: f64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, measure: Measure, node: Option<NodeId>, class: Option<ClassId>) -> Option<&Accumulator> {
        self.series.get(&(measure, node, class))
    }

    pub fn mean(&self, measure: Measure, node: Option<NodeId>, class: Option<ClassId>) -> Option<f64> {
        self.get(measure, node, class).and_then(Accumulator::mean)
    }

    /// Number of samples of `measure` across every station and class.
    pub fn count(&self, measure: Measure) -> u64 {
        self.series
            .iter()
            .filter(|((m, _, _), _)| *m == measure)
            .map(|(_, acc)| acc.count)
            .sum()
    }

    /// Weighted mean of `measure` for `class` pooled over every station.
    pub fn pooled_mean(&self, measure: Measure, class: Option<ClassId>) -> Option<f64> {
        let (weight, sum) = self
            .series
            .iter()
            .filter(|((m, _, c), _)| *m == measure && *c == class)
            .fold((0.0, 0.0), |(w, s), (_, acc)| {
                (w + acc.total_weight, s + acc.weighted_sum)
            });
        (weight > 0.0).then(|| sum / weight)
    }

    /// Every series in key order.
    pub fn series(&self) -> impl Iterator<Item = (&SeriesKey, &Accumulator)> {
        self.series.iter()
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Time of the latest sample.
    pub fn last_time(&self) -> f64 {
        self.last_time
    }
}

impl StatisticsSink for MetricsCollector {
    fn record(&mut self, sample: Sample) {
        self.samples += 1;
        self.last_time = self.last_time.max(sample.time);
        self.series
            .entry((sample.measure, sample.node, sample.class))
            .or_default()
            .add(sample.value, sample.weight);
    }
}
