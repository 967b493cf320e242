//! Statistics sink interface and per-station load accounting.
//!
//! Stations push [`Sample`]s into a [`StatisticsSink`] on every relevant
//! transition; aggregation is the sink's business. [`LoadBoard`] keeps the
//! few live figures that routing strategies read back (busy units,
//! observed residence times).

use serde::Serialize;

use crate::job::{ClassId, NodeId};
use crate::Time;

/// Performance measure a sample contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Measure {
    QueueLength,
    ResidenceTime,
    ResponseTime,
    SystemResponseTime,
    Utilization,
    Throughput,
    Dropped,
    Balked,
    Reneged,
    Retried,
    CacheHit,
    CacheMiss,
    FiringThroughput,
    Preempted,
}

impl Measure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Measure::QueueLength => "queue_length",
            Measure::ResidenceTime => "residence_time",
            Measure::ResponseTime => "response_time",
            Measure::SystemResponseTime => "system_response_time",
            Measure::Utilization => "utilization",
            Measure::Throughput => "throughput",
            Measure::Dropped => "dropped",
            Measure::Balked => "balked",
            Measure::Reneged => "reneged",
            Measure::Retried => "retried",
            Measure::CacheHit => "cache_hit",
            Measure::CacheMiss => "cache_miss",
            Measure::FiringThroughput => "firing_throughput",
            Measure::Preempted => "preempted",
        }
    }
}

/// One observation. `node` and `class` are `None` for network-wide figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub measure: Measure,
    pub node: Option<NodeId>,
    pub class: Option<ClassId>,
    pub value: f64,
    pub weight: f64,
    pub time: Time,
}

pub trait StatisticsSink {
    fn record(&mut self, sample: Sample);
}

/// Discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatistics;

impl StatisticsSink for NullStatistics {
    fn record(&mut self, _sample: Sample) {}
}

/// Keeps every sample in arrival order.
#[derive(Debug, Default, Clone)]
pub struct RecordedStatistics {
    pub samples: Vec<Sample>,
}

impl RecordedStatistics {
    pub fn new() -> Self {
        Default::default()
    }

    /// Samples of one measure in recording order.
    pub fn of(&self, measure: Measure) -> impl Iterator<Item = &Sample> {
        self.samples.iter().filter(move |s| s.measure == measure)
    }

    pub fn count(&self, measure: Measure) -> usize {
        self.of(measure).count()
    }
}

impl StatisticsSink for RecordedStatistics {
    fn record(&mut self, sample: Sample) {
        self.samples.push(sample);
    }
}

#[derive(Debug, Clone, Default)]
struct NodeLoad {
    busy: f64,
    servers: f64,
    busy_area: f64,
    last_change: Time,
    residence_sum: f64,
    residence_count: u64,
}

/// Live load figures per station.
#[derive(Debug, Clone, Default)]
pub struct LoadBoard {
    nodes: Vec<NodeLoad>,
}

impl LoadBoard {
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes: vec![NodeLoad::default(); nodes],
        }
    }

    /// Declares the number of server units of a station. Infinite-server
    /// stations use `f64::INFINITY`.
    pub fn set_servers(&mut self, node: NodeId, servers: f64) {
        self.nodes[node.0].servers = servers;
    }

    /// Updates the number of busy units, integrating the previous value.
    /// Returns the utilization over the interval just closed and its length.
    pub fn set_busy(&mut self, node: NodeId, busy: f64, now: Time) -> (f64, f64) {
        let closed = self.utilization(node);
        let load = &mut self.nodes[node.0];
        let elapsed = (now - load.last_change).max(0.0);
        load.busy_area += load.busy * elapsed;
        load.last_change = now;
        load.busy = busy;
        (closed, elapsed)
    }

    pub fn busy(&self, node: NodeId) -> f64 {
        self.nodes[node.0].busy
    }

    pub fn servers(&self, node: NodeId) -> f64 {
        self.nodes[node.0].servers
    }

    /// Instantaneous fraction of busy units; zero for stations without a
    /// finite server pool.
    pub fn utilization(&self, node: NodeId) -> f64 {
        let load = &self.nodes[node.0];
        if load.servers > 0.0 && load.servers.is_finite() {
            load.busy / load.servers
        } else {
            0.0
        }
    }

    /// Time-averaged busy fraction over `[0, now]`.
    pub fn mean_utilization(&self, node: NodeId, now: Time) -> f64 {
        let load = &self.nodes[node.0];
        if now <= 0.0 || load.servers <= 0.0 || !load.servers.is_finite() {
            return 0.0;
        }
        let area = load.busy_area + load.busy * (now - load.last_change).max(0.0);
        area / (now * load.servers)
    }

    pub fn observe_residence(&mut self, node: NodeId, residence: f64) {
        let load = &mut self.nodes[node.0];
        load.residence_sum += residence;
        load.residence_count += 1;
    }

    /// Mean observed residence time, zero before the first departure.
    pub fn mean_residence(&self, node: NodeId) -> f64 {
        let load = &self.nodes[node.0];
        if load.residence_count == 0 {
            0.0
        } else {
            load.residence_sum / load.residence_count as f64
        }
    }
}
