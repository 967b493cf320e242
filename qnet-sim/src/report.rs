//! Run reports.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use qnet_core::{ClassId, ClassKind, Measure, Network, Time};
use serde::Serialize;

use crate::invariants::InvariantViolation;
use crate::metrics::MetricsCollector;

/// Counters and averages of one class at one station.
#[derive(Debug, Clone, Serialize)]
pub struct StationClassReport {
    pub class: String,
    pub arrivals: u64,
    pub departures: u64,
    pub dropped: u64,
    pub balked: u64,
    pub reneged: u64,
    pub retrials: u64,
    /// Time-averaged number of jobs at the station.
    pub mean_population: f64,
    /// Departures per unit time.
    pub throughput: f64,
    pub mean_sojourn: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StationReport {
    pub name: String,
    pub kind: &'static str,
    /// Time-averaged busy fraction of the server pool.
    pub utilization: f64,
    pub mean_residence: f64,
    pub classes: Vec<StationClassReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassReport {
    pub name: String,
    pub closed: bool,
    /// Time-averaged number of jobs of the class in the network.
    pub mean_population: f64,
    /// Sink response time for open classes, cycle time for closed ones.
    pub mean_response: Option<f64>,
    pub completed: u64,
    pub dropped: u64,
}

/// One recorded series.
#[derive(Debug, Clone, Serialize)]
pub struct MeasureReport {
    pub measure: &'static str,
    pub station: Option<String>,
    pub class: Option<String>,
    pub count: u64,
    pub mean: Option<f64>,
    pub min: f64,
    pub max: f64,
}

/// Result of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Seed used for reproduction
    pub seed: u64,
    pub horizon: Time,
    /// Simulated time the averages are taken over
    pub end_time: Time,
    /// Total events processed
    pub event_count: u64,
    pub events_by_type: BTreeMap<String, u64>,
    pub cancelled_events: u64,
    /// Jobs alive when the run stopped
    pub jobs_in_system: usize,
    pub stations: Vec<StationReport>,
    pub classes: Vec<ClassReport>,
    pub measures: Vec<MeasureReport>,
    pub warnings_emitted: usize,
    pub warnings_suppressed: u64,
    pub invariant_violations: Vec<InvariantViolation>,
    /// Whether the run completed without invariant violations
    pub success: bool,
}

/// Engine-side figures that go into a report.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunTotals {
    pub seed: u64,
    pub horizon: Time,
    pub end_time: Time,
    pub event_count: u64,
    pub events_by_type: BTreeMap<String, u64>,
    pub cancelled_events: u64,
}

impl SimulationReport {
    pub(crate) fn collect(
        network: &Network,
        metrics: &MetricsCollector,
        totals: RunTotals,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let end = totals.end_time;
        let topology = network.topology();
        let classes = network.classes();
        let class_name = |class: ClassId| classes.get(class).name.clone();

        let stations = topology
            .nodes()
            .map(|node| {
                let registry = network.registry().node(node);
                let per_class = classes
                    .ids()
                    .map(|class| {
                        let counters = registry.counters(class);
                        StationClassReport {
                            class: class_name(class),
                            arrivals: counters.arrivals,
                            departures: counters.departures,
                            dropped: counters.dropped,
                            balked: counters.balked,
                            reneged: counters.reneged,
                            retrials: counters.retrials,
                            mean_population: registry.mean_population(class, end),
                            throughput: if end > 0.0 {
                                counters.departures as f64 / end
                            } else {
                                0.0
                            },
                            mean_sojourn: registry.mean_sojourn(class),
                        }
                    })
                    .collect();
                StationReport {
                    name: topology.name(node).to_string(),
                    kind: topology.kind(node).as_str(),
                    utilization: network.loads().mean_utilization(node, end),
                    mean_residence: network.loads().mean_residence(node),
                    classes: per_class,
                }
            })
            .collect();

        let system = network.registry().network();
        let class_reports = classes
            .iter()
            .map(|(class, info)| {
                let counters = system.counters(class);
                ClassReport {
                    name: info.name.clone(),
                    closed: info.kind == ClassKind::Closed,
                    mean_population: system.mean_population(class, end),
                    mean_response: metrics.pooled_mean(Measure::SystemResponseTime, Some(class)),
                    completed: counters.departures,
                    dropped: counters.dropped,
                }
            })
            .collect();

        let measures = metrics
            .series()
            .map(|((measure, node, class), acc)| MeasureReport {
                measure: measure.as_str(),
                station: node.map(|n| topology.name(n).to_string()),
                class: class.map(class_name),
                count: acc.count,
                mean: acc.mean(),
                min: acc.min,
                max: acc.max,
            })
            .collect();

        Self {
            seed: totals.seed,
            horizon: totals.horizon,
            end_time: end,
            event_count: totals.event_count,
            events_by_type: totals.events_by_type,
            cancelled_events: totals.cancelled_events,
            jobs_in_system: network.jobs().len(),
            stations,
            classes: class_reports,
            measures,
            warnings_emitted: network.warnings().distinct(),
            warnings_suppressed: network.warnings().suppressed(),
            success: violations.is_empty(),
            invariant_violations: violations,
        }
    }

    pub fn station(&self, name: &str) -> Option<&StationReport> {
        self.stations.iter().find(|s| s.name == name)
    }

    pub fn class(&self, name: &str) -> Option<&ClassReport> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Serializes the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// - `serde_json::Error` - If serialization fails
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Generates human-readable summary.
    pub fn summary(&self) -> String {
        let mut summary = String::new();
        let _ = writeln!(summary, "Simulation Report (seed: {})", self.seed);
        let _ = writeln!(summary, "Simulated time: {:.3} (horizon {:.3})", self.end_time, self.horizon);
        let _ = writeln!(summary, "Events processed: {}", self.event_count);
        let _ = writeln!(summary, "Jobs in system: {}", self.jobs_in_system);
        let _ = writeln!(summary, "Success: {}", self.success);

        summary.push_str("\nClasses:\n");
        for class in &self.classes {
            let response = class
                .mean_response
                .map_or_else(|| "-".to_string(), |r| format!("{r:.4}"));
            let _ = writeln!(
                summary,
                "  {:<16} N={:.4} R={} completed={} dropped={}",
                class.name, class.mean_population, response, class.completed, class.dropped
            );
        }

        summary.push_str("\nStations:\n");
        for station in &self.stations {
            let _ = writeln!(
                summary,
                "  {:<16} {:<12} U={:.4} residence={:.4}",
                station.name, station.kind, station.utilization, station.mean_residence
            );
            for class in station.classes.iter().filter(|c| c.arrivals > 0) {
                let _ = writeln!(
                    summary,
                    "    {:<14} N={:.4} X={:.4} in={} out={} dropped={}",
                    class.class,
                    class.mean_population,
                    class.throughput,
                    class.arrivals,
                    class.departures,
                    class.dropped
                );
            }
        }

        summary.push_str("\nEvent breakdown:\n");
        for (event_type, count) in &self.events_by_type {
            let _ = writeln!(summary, "  {event_type}: {count}");
        }

        if self.warnings_emitted > 0 {
            let _ = writeln!(
                summary,
                "\nWarnings: {} distinct, {} suppressed",
                self.warnings_emitted, self.warnings_suppressed
            );
        }

        if !self.invariant_violations.is_empty() {
            summary.push_str("\nInvariant violations:\n");
            for violation in &self.invariant_violations {
                let _ = writeln!(summary, "  - {violation}");
            }
        }

        summary
    }
}
