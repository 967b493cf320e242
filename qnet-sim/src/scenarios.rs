//! Pre-built networks for common queueing patterns.
//!
//! Each builder returns a linked [`Network`] ready to hand to the engine.
//! The parameters are small on purpose so runs finish quickly in tests.

use std::fmt;
use std::str::FromStr;

use qnet_core::petri::{ModeSpec, StorageConfig, TransitionMatrix};
use qnet_core::section::{
    CacheConfig, CachePolicy, ForkConfig, JoinStrategy, MoveSemantics, QueueConfig,
    SchedulingPolicy, ServerConfig, ServerType,
};
use qnet_core::{
    ClassMask, ConfigError, Distribution, JobClass, Network, NodeSpec, RoutingStrategy, ServiceSpec,
    zipf,
};

type BuildResult = Result<Network, ConfigError>;

fn exp(rate: f64) -> Option<Distribution> {
    Some(Distribution::Exponential { rate })
}

fn source(interarrival: Vec<Option<Distribution>>) -> NodeSpec {
    let routing = vec![RoutingStrategy::Random; interarrival.len()];
    NodeSpec::Source { interarrival, routing }
}

/// Poisson arrivals to a single exponential server, then a sink.
///
/// # Errors
/// - `ConfigError` - If a rate is not positive
pub fn mm1(arrival_rate: f64, service_rate: f64) -> BuildResult {
    let mut builder = Network::builder();
    builder.class(JobClass::open("customer"));
    let arrivals = builder.node("arrivals", source(vec![exp(arrival_rate)]))?;
    let queue = builder.node(
        "queue",
        NodeSpec::Queue {
            queue: QueueConfig::infinite(1),
            service: ServiceSpec::Server(ServerConfig::homogeneous(1, vec![exp(service_rate)])),
            routing: vec![RoutingStrategy::Random],
        },
    )?;
    let departures = builder.node("departures", NodeSpec::Sink)?;
    builder.link(arrivals, queue)?;
    builder.link(queue, departures)?;
    builder.build()
}

/// A fixed population cycling between a slow and a fast station.
///
/// # Errors
/// - `ConfigError` - If the population is zero
pub fn closed_cycle(population: u32) -> BuildResult {
    let mut builder = Network::builder();
    let slow = builder.declare("slow")?;
    let fast = builder.declare("fast")?;
    builder.class(JobClass::closed("circulating", slow, population));
    for (node, rate) in [(slow, 1.0), (fast, 2.0)] {
        builder.define(
            node,
            NodeSpec::Queue {
                queue: QueueConfig::infinite(1),
                service: ServiceSpec::Server(ServerConfig::homogeneous(1, vec![exp(rate)])),
                routing: vec![RoutingStrategy::Random],
            },
        )?;
    }
    builder.link(slow, fast)?;
    builder.link(fast, slow)?;
    builder.build()
}

/// Every arrival splits into two branches served in parallel and is
/// reassembled before leaving.
///
/// # Errors
/// - `ConfigError` - Never for the fixed parameters
pub fn fork_join() -> BuildResult {
    let mut builder = Network::builder();
    builder.class(JobClass::open("request"));
    let arrivals = builder.node("arrivals", source(vec![exp(0.5)]))?;
    let split = builder.node("split", NodeSpec::Fork { fork: ForkConfig::simple(1) })?;
    let mut branches = Vec::new();
    for (name, rate) in [("branch-a", 1.0), ("branch-b", 1.5)] {
        branches.push(builder.node(
            name,
            NodeSpec::Queue {
                queue: QueueConfig::infinite(1),
                service: ServiceSpec::Server(ServerConfig::homogeneous(1, vec![exp(rate)])),
                routing: vec![RoutingStrategy::Random],
            },
        )?);
    }
    let merge = builder.node(
        "merge",
        NodeSpec::Join {
            strategy: JoinStrategy::Normal,
            routing: vec![RoutingStrategy::Random],
        },
    )?;
    let departures = builder.node("departures", NodeSpec::Sink)?;
    builder.link(arrivals, split)?;
    for branch in branches {
        builder.link(split, branch)?;
        builder.link(branch, merge)?;
    }
    builder.link(merge, departures)?;
    builder.build()
}

/// Requests for Zipf-popular items hit an LRU cache; misses go to a slow
/// origin before leaving.
///
/// # Errors
/// - `ConfigError` - If `items` is zero
pub fn cache(items: usize, capacity: usize) -> BuildResult {
    let mut builder = Network::builder();
    builder.class(JobClass::open("request"));
    let hit = builder.class(JobClass::open("hit"));
    let miss = builder.class(JobClass::open("miss"));

    let arrivals = builder.node("arrivals", source(vec![exp(1.0), None, None]))?;
    let store = builder.node(
        "cache",
        NodeSpec::Cache {
            cache: CacheConfig {
                items,
                tiers: vec![capacity],
                policy: CachePolicy::Lru,
                moves: MoveSemantics::default(),
                popularity: vec![Some(zipf(items, 1.0)), None, None],
                transitions: Vec::new(),
                hit_class: vec![Some(hit), None, None],
                miss_class: vec![Some(miss), None, None],
            },
            routing: vec![
                RoutingStrategy::Disabled,
                RoutingStrategy::Empirical(vec![1.0, 0.0]),
                RoutingStrategy::Empirical(vec![0.0, 1.0]),
            ],
        },
    )?;
    let departures = builder.node("departures", NodeSpec::Sink)?;
    let origin = builder.node(
        "origin",
        NodeSpec::Delay {
            service: vec![None, None, exp(0.5)],
            routing: vec![RoutingStrategy::Disabled, RoutingStrategy::Disabled, RoutingStrategy::Random],
        },
    )?;

    builder.link(arrivals, store)?;
    builder.link(store, departures)?;
    builder.link(store, origin)?;
    builder.link(origin, departures)?;
    builder.build()
}

/// A bounded buffer as a Petri net: `produce` moves a token from `free`
/// to `full`, `consume` moves it back.
///
/// # Errors
/// - `ConfigError` - Never for a positive buffer
pub fn petri_producer_consumer(buffer: u32) -> BuildResult {
    let mut builder = Network::builder();
    let token = builder.class(JobClass::open("token"));
    let free = builder.node(
        "free",
        NodeSpec::Place {
            storage: StorageConfig::unbounded(1).with_initial(token, buffer),
        },
    )?;
    let full = builder.node(
        "full",
        NodeSpec::Place {
            storage: StorageConfig::unbounded(1),
        },
    )?;
    let one = || TransitionMatrix::zeros(1, 1).with(0, token, 1);
    let produce = builder.node(
        "produce",
        NodeSpec::Transition {
            modes: vec![ModeSpec::new("produce", one(), one(), Distribution::Exponential { rate: 1.0 })],
        },
    )?;
    let consume = builder.node(
        "consume",
        NodeSpec::Transition {
            modes: vec![
                ModeSpec::new("consume", one(), one(), Distribution::Exponential { rate: 0.8 })
                    .with_servers(2),
            ],
        },
    )?;
    builder.link(free, produce)?;
    builder.link(produce, full)?;
    builder.link(full, consume)?;
    builder.link(consume, free)?;
    builder.build()
}

/// Two classes sharing a pool of one fast unit and two slow units; only
/// `small` jobs may use the slow units.
///
/// # Errors
/// - `ConfigError` - Never for the fixed parameters
pub fn heterogeneous_server() -> BuildResult {
    let mut builder = Network::builder();
    builder.class(JobClass::open("small"));
    builder.class(JobClass::open("large"));

    let arrivals = builder.node("arrivals", source(vec![exp(0.8), exp(0.4)]))?;
    let pool = ServerConfig {
        types: vec![
            ServerType {
                name: "fast".into(),
                units: 1,
                compatible: ClassMask::all(2),
                service: vec![exp(3.0), exp(1.5)],
            },
            ServerType {
                name: "slow".into(),
                units: 2,
                compatible: ClassMask::from_bits(vec![true, false]),
                service: vec![exp(1.0), None],
            },
        ],
        required: vec![1, 1],
        policy: SchedulingPolicy::Fsf,
        switchover: None,
        setup: vec![None, None],
        delay_off: vec![None, None],
    };
    let pool_node = builder.node(
        "pool",
        NodeSpec::Queue {
            queue: QueueConfig::infinite(2),
            service: ServiceSpec::Server(pool),
            routing: vec![RoutingStrategy::Random; 2],
        },
    )?;
    let departures = builder.node("departures", NodeSpec::Sink)?;
    builder.link(arrivals, pool_node)?;
    builder.link(pool_node, departures)?;
    builder.build()
}

/// Named built-in scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Mm1,
    ClosedCycle,
    ForkJoin,
    Cache,
    PetriProducerConsumer,
    HeterogeneousServer,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Scenario::Mm1,
        Scenario::ClosedCycle,
        Scenario::ForkJoin,
        Scenario::Cache,
        Scenario::PetriProducerConsumer,
        Scenario::HeterogeneousServer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::Mm1 => "mm1",
            Scenario::ClosedCycle => "closed-cycle",
            Scenario::ForkJoin => "fork-join",
            Scenario::Cache => "cache",
            Scenario::PetriProducerConsumer => "petri",
            Scenario::HeterogeneousServer => "heterogeneous",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Scenario::Mm1 => "single exponential server, arrival rate 0.5, service rate 1",
            Scenario::ClosedCycle => "three jobs cycling between a slow and a fast station",
            Scenario::ForkJoin => "requests split across two parallel branches and rejoined",
            Scenario::Cache => "Zipf requests over 50 items against a 10-slot LRU cache",
            Scenario::PetriProducerConsumer => "bounded buffer of four tokens as a Petri net",
            Scenario::HeterogeneousServer => "two classes on a pool of fast and slow units",
        }
    }

    /// Builds the scenario's network with its default parameters.
    ///
    /// # Errors
    /// - `ConfigError` - If the network fails to link
    pub fn build(&self) -> BuildResult {
        match self {
            Scenario::Mm1 => mm1(0.5, 1.0),
            Scenario::ClosedCycle => closed_cycle(3),
            Scenario::ForkJoin => fork_join(),
            Scenario::Cache => cache(50, 10),
            Scenario::PetriProducerConsumer => petri_producer_consumer(4),
            Scenario::HeterogeneousServer => heterogeneous_server(),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| format!("unknown scenario '{s}'"))
    }
}
