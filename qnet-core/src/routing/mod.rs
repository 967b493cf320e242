//! Routing strategies selecting the next station for a job.
//!
//! Strategies are plain configuration; the little state some of them need
//! (round-robin counters, weighted schedules, power-of-k memory) lives in a
//! [`RoutingState`] owned by the routing station, one per class. A `None`
//! decision means the job cannot be routed and is never an error.

mod empirical;
mod property;
mod simple;

use crate::distribution::check_probabilities;
use crate::error::ConfigError;
use crate::job::{ClassId, ClassTable, NodeId};
use crate::random::RandomSource;
use crate::registry::NetworkRegistry;
use crate::stats::LoadBoard;
use crate::topology::Topology;

pub use empirical::SwitchRoute;
pub use simple::weighted_schedule;

/// Read-only network state visible to routing strategies.
pub struct RouteView<'a> {
    pub here: NodeId,
    pub topology: &'a Topology,
    pub classes: &'a ClassTable,
    pub registry: &'a NetworkRegistry,
    pub loads: &'a LoadBoard,
    pub epsilon: f64,
}

impl RouteView<'_> {
    pub fn outputs(&self) -> &[NodeId] {
        self.topology.outputs(self.here)
    }

    /// Whether `node` may receive a job of `class`: closed jobs never go to
    /// a sink.
    pub fn viable(&self, node: NodeId, class: ClassId) -> bool {
        !(self.classes.get(class).is_closed() && self.topology.is_sink(node))
    }
}

/// Where a routed job goes, and the class it takes on the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub target: NodeId,
    pub switch_to: Option<ClassId>,
}

impl RouteDecision {
    pub fn to(target: NodeId) -> Self {
        Self {
            target,
            switch_to: None,
        }
    }
}

/// Per-class routing policy of a station.
#[derive(Debug, Clone)]
pub enum RoutingStrategy {
    Random,
    RoundRobin,
    /// One integer weight per output link.
    WeightedRoundRobin(Vec<u32>),
    ShortestQueue,
    ShortestResponseTime,
    LeastUtilization,
    /// Join the shortest of `k` sampled outputs, optionally also comparing
    /// against the previous winner.
    PowerOfK { k: usize, memory: bool },
    /// Population thresholds mapped to probability vectors over outputs.
    LoadDependent(Vec<(usize, Vec<f64>)>),
    /// Probability per output link.
    Empirical(Vec<f64>),
    /// Probability per output link with a class-switch row for each.
    ClassSwitch(Vec<SwitchRoute>),
    /// Jobs of this class are never routed from here.
    Disabled,
}

impl RoutingStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            RoutingStrategy::Random => "random",
            RoutingStrategy::RoundRobin => "round-robin",
            RoutingStrategy::WeightedRoundRobin(_) => "weighted-round-robin",
            RoutingStrategy::ShortestQueue => "shortest-queue",
            RoutingStrategy::ShortestResponseTime => "shortest-response-time",
            RoutingStrategy::LeastUtilization => "least-utilization",
            RoutingStrategy::PowerOfK { .. } => "power-of-k",
            RoutingStrategy::LoadDependent(_) => "load-dependent",
            RoutingStrategy::Empirical(_) => "empirical",
            RoutingStrategy::ClassSwitch(_) => "class-switch",
            RoutingStrategy::Disabled => "disabled",
        }
    }

    /// Checks the strategy against the station's output links.
    ///
    /// # Errors
    ///
    /// - `ConfigError::ClassArity` - If a per-output vector has the wrong length
    /// - `ConfigError::InvalidProbabilities` - If a probability vector is invalid
    /// - `ConfigError::LoadDependentTable` - If thresholds are empty or unsorted
    pub fn validate(&self, node: &str, outputs: usize, classes: usize) -> Result<(), ConfigError> {
        let arity = |actual: usize, expected: usize, what: &str| {
            if actual == expected {
                Ok(())
            } else {
                Err(ConfigError::ClassArity {
                    context: format!("{what} at {node}"),
                    expected,
                    actual,
                })
            }
        };
        match self {
            RoutingStrategy::WeightedRoundRobin(weights) => {
                arity(weights.len(), outputs, "round-robin weights")
            }
            RoutingStrategy::PowerOfK { k, .. } if *k == 0 => Err(ConfigError::InvalidStation {
                node: node.to_string(),
                reason: "power-of-k routing needs k >= 1".into(),
            }),
            RoutingStrategy::LoadDependent(table) => {
                let sorted = table.windows(2).all(|w| w[0].0 < w[1].0);
                if table.is_empty() || !sorted {
                    return Err(ConfigError::LoadDependentTable {
                        context: format!("routing at {node}"),
                    });
                }
                table.iter().try_for_each(|(_, probabilities)| {
                    arity(probabilities.len(), outputs, "load-dependent routing")?;
                    check_probabilities(&format!("load-dependent routing at {node}"), probabilities)
                })
            }
            RoutingStrategy::Empirical(probabilities) => {
                arity(probabilities.len(), outputs, "empirical routing")?;
                check_probabilities(&format!("routing at {node}"), probabilities)
            }
            RoutingStrategy::ClassSwitch(routes) => {
                arity(routes.len(), outputs, "class-switch routing")?;
                let probabilities: Vec<f64> = routes.iter().map(|r| r.probability).collect();
                check_probabilities(&format!("class-switch routing at {node}"), &probabilities)?;
                routes.iter().filter(|r| r.probability > 0.0).try_for_each(|r| {
                    arity(r.classes.len(), classes, "class-switch row")?;
                    check_probabilities(&format!("class-switch row at {node}"), &r.classes)
                })
            }
            _ => Ok(()),
        }
    }

    /// Fresh routing state for this strategy.
    pub fn initial_state(&self) -> RoutingState {
        let schedule = match self {
            RoutingStrategy::WeightedRoundRobin(weights) => weighted_schedule(weights),
            _ => Vec::new(),
        };
        RoutingState {
            counter: 0,
            schedule,
            memory: None,
        }
    }

    /// Chooses the next station for a job of `class`.
    pub fn select(
        &self,
        state: &mut RoutingState,
        view: &RouteView<'_>,
        rng: &mut dyn RandomSource,
        class: ClassId,
    ) -> Option<RouteDecision> {
        match self {
            RoutingStrategy::Random => simple::random(view, rng, class),
            RoutingStrategy::RoundRobin => simple::round_robin(state, view, class),
            RoutingStrategy::WeightedRoundRobin(_) => simple::weighted(state, view, class),
            RoutingStrategy::ShortestQueue => {
                property::minimize(view, rng, class, property::Property::QueueLength)
            }
            RoutingStrategy::ShortestResponseTime => {
                property::minimize(view, rng, class, property::Property::ResponseTime)
            }
            RoutingStrategy::LeastUtilization => {
                property::minimize(view, rng, class, property::Property::Utilization)
            }
            RoutingStrategy::PowerOfK { k, memory } => {
                property::power_of_k(state, view, rng, class, *k, *memory)
            }
            RoutingStrategy::LoadDependent(table) => {
                empirical::load_dependent(table, view, rng, class)
            }
            RoutingStrategy::Empirical(probabilities) => {
                empirical::empirical(probabilities, view, rng, class)
            }
            RoutingStrategy::ClassSwitch(routes) => {
                empirical::class_switch(routes, view, rng, class)
            }
            RoutingStrategy::Disabled => None,
        }
    }
}

/// Mutable routing state of one class at one station.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingState {
    /// Next round-robin position, or position in the weighted schedule.
    pub counter: usize,
    /// Output indices in weighted round-robin order.
    pub schedule: Vec<usize>,
    /// Previous power-of-k winner.
    pub memory: Option<NodeId>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::job::JobClass;
    use crate::topology::NodeKind;

    /// A router at node 0 linked to the given output kinds, with one open
    /// and one closed class.
    pub struct Fixture {
        pub topology: Topology,
        pub classes: ClassTable,
        pub registry: NetworkRegistry,
        pub loads: LoadBoard,
    }

    impl Fixture {
        pub fn new(outputs: &[NodeKind]) -> Self {
            let mut topology = Topology::new();
            let here = topology.add_node("router", NodeKind::Router);
            for (i, kind) in outputs.iter().enumerate() {
                let node = topology.add_node(format!("out{i}"), *kind);
                topology.add_link(here, node);
            }
            let classes = ClassTable::new(vec![
                JobClass::open("open"),
                JobClass::closed("closed", NodeId(1), 1),
            ]);
            let nodes = topology.len();
            Self {
                topology,
                registry: NetworkRegistry::new(nodes, 2),
                loads: LoadBoard::new(nodes),
                classes,
            }
        }

        pub fn view(&self) -> RouteView<'_> {
            RouteView {
                here: NodeId(0),
                topology: &self.topology,
                classes: &self.classes,
                registry: &self.registry,
                loads: &self.loads,
                epsilon: crate::config::TIE_EPSILON,
            }
        }
    }

    pub const OPEN: ClassId = ClassId(0);
    pub const CLOSED: ClassId = ClassId(1);
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::topology::NodeKind;

    #[test]
    fn test_validate_rejects_bad_empirical() {
        let strategy = RoutingStrategy::Empirical(vec![0.5, 0.4]);
        assert!(matches!(
            strategy.validate("r", 2, 1),
            Err(ConfigError::InvalidProbabilities { .. })
        ));
        assert!(matches!(
            strategy.validate("r", 3, 1),
            Err(ConfigError::ClassArity { .. })
        ));
    }

    #[test]
    fn test_disabled_never_routes() {
        let fixture = Fixture::new(&[NodeKind::Queue]);
        let mut rng = crate::random::SequenceRandom::new(vec![0.3]);
        let strategy = RoutingStrategy::Disabled;
        let mut state = strategy.initial_state();
        assert_eq!(strategy.select(&mut state, &fixture.view(), &mut rng, OPEN), None);
    }
}
