//! Whole-network runs driven straight through the kernel.

use qnet_core::petri::{ModeSpec, StorageConfig, TransitionMatrix};
use qnet_core::registry::ClassCounters;
use qnet_core::routing::SwitchRoute;
use qnet_core::section::{
    CacheConfig, CachePolicy, ForkConfig, InputSection, JoinStrategy, MoveSemantics, PsConfig,
    QueueConfig, ServerConfig, DropRule,
};
use qnet_core::{
    ClassId, DeterministicRng, Distribution, EventQueue, JobClass, Measure, Network, NodeId,
    NodeSpec, RecordedStatistics, RoutingStrategy, Scheduler, ServiceSpec, zipf,
};

/// Runs until `horizon`, calling `check` after every delivered message.
fn run(
    network: &mut Network,
    seed: u64,
    horizon: f64,
    mut check: impl FnMut(&Network),
) -> RecordedStatistics {
    let mut rng = DeterministicRng::from_seed(seed);
    let mut queue = EventQueue::new();
    let mut stats = RecordedStatistics::new();
    network.start(&mut rng, &mut queue, &mut stats).unwrap();
    while queue.peek_time().is_some_and(|t| t <= horizon) {
        let Some((_, message)) = queue.pop() else {
            break;
        };
        network.dispatch(&message, &mut rng, &mut queue, &mut stats).unwrap();
        check(network);
    }
    assert!(queue.now() <= horizon);
    stats
}

fn det(value: f64) -> Option<Distribution> {
    Some(Distribution::Deterministic(value))
}

fn exp(rate: f64) -> Option<Distribution> {
    Some(Distribution::Exponential { rate })
}

fn absorbed(network: &Network, sink: NodeId) -> u64 {
    match &network.node(sink).unwrap().input {
        InputSection::Sink(s) => s.absorbed(),
        _ => panic!("not a sink"),
    }
}

fn input_counters(network: &Network, node: NodeId, class: ClassId) -> ClassCounters {
    match &network.node(node).unwrap().input {
        InputSection::Queue(queue) => queue.registry().counters(class).clone(),
        _ => panic!("not a buffered input"),
    }
}

/// Every scope that holds a job files it under the job's current class.
fn assert_classes_agree(network: &Network) {
    let classes: Vec<ClassId> = network.classes().ids().collect();
    let system = network.registry().network();
    for (node, station) in network.nodes() {
        let registry = network.registry().node(node);
        for class in &classes {
            for job in registry.iter_class(*class) {
                assert_eq!(network.jobs().class_of(job).unwrap(), *class, "station scope at {node}");
                assert_eq!(system.class_of(job), Some(*class), "network scope at {node}");
            }
            if let InputSection::Queue(queue) = &station.input {
                for job in queue.registry().iter_class(*class) {
                    assert_eq!(network.jobs().class_of(job).unwrap(), *class, "input scope at {node}");
                    assert_eq!(registry.class_of(job), Some(*class), "input and station at {node}");
                }
            }
        }
    }
    assert!(system.verify().is_ok());
}

#[test]
fn test_fork_join_round_trip() {
    let mut builder = Network::builder();
    builder.class(JobClass::open("job"));
    let one = || vec![RoutingStrategy::Random];
    let source = builder
        .node(
            "source",
            NodeSpec::Source {
                interarrival: vec![det(1.0)],
                routing: one(),
            },
        )
        .unwrap();
    let fork = builder.node("fork", NodeSpec::Fork { fork: ForkConfig::simple(1) }).unwrap();
    let left = builder
        .node(
            "left",
            NodeSpec::Delay {
                service: vec![det(0.5)],
                routing: one(),
            },
        )
        .unwrap();
    let right = builder
        .node(
            "right",
            NodeSpec::Delay {
                service: vec![det(0.25)],
                routing: one(),
            },
        )
        .unwrap();
    let join = builder
        .node(
            "join",
            NodeSpec::Join {
                strategy: JoinStrategy::Normal,
                routing: one(),
            },
        )
        .unwrap();
    let sink = builder.node("sink", NodeSpec::Sink).unwrap();
    for (from, to) in [(source, fork), (fork, left), (fork, right), (left, join), (right, join), (join, sink)] {
        builder.link(from, to).unwrap();
    }
    let mut network = builder.build().unwrap();

    let stats = run(&mut network, 11, 10.75, |_| {});

    assert_eq!(absorbed(&network, sink), 10);
    assert!(network.forks().is_empty());
    assert!(network.jobs().is_empty());
    assert!(network.registry().network().is_empty());
    // Every parent left the system exactly half a time unit after arriving.
    let responses: Vec<f64> = stats
        .of(Measure::SystemResponseTime)
        .filter(|s| s.node == Some(sink))
        .map(|s| s.value)
        .collect();
    assert_eq!(responses.len(), 10);
    assert!(responses.iter().all(|r| (r - 0.5).abs() < 1e-9));
}

#[test]
fn test_routing_and_station_switches_reach_every_scope() {
    let mut builder = Network::builder();
    let plain = builder.class(JobClass::open("plain"));
    let tagged = builder.class(JobClass::open("tagged"));
    let both = || vec![RoutingStrategy::Random, RoutingStrategy::Random];
    let source = builder
        .node(
            "source",
            NodeSpec::Source {
                interarrival: vec![exp(1.0), None],
                routing: both(),
            },
        )
        .unwrap();
    let tag = builder
        .node(
            "tag",
            NodeSpec::Router {
                routing: vec![
                    RoutingStrategy::ClassSwitch(vec![SwitchRoute {
                        probability: 1.0,
                        classes: vec![0.0, 1.0],
                    }]),
                    RoutingStrategy::Random,
                ],
            },
        )
        .unwrap();
    let hold = builder
        .node(
            "hold",
            NodeSpec::Delay {
                service: vec![exp(2.0), exp(2.0)],
                routing: both(),
            },
        )
        .unwrap();
    let untag = builder
        .node(
            "untag",
            NodeSpec::ClassSwitch {
                matrix: vec![vec![1.0, 0.0], vec![1.0, 0.0]],
                routing: both(),
            },
        )
        .unwrap();
    let sink = builder.node("sink", NodeSpec::Sink).unwrap();
    for (from, to) in [(source, tag), (tag, hold), (hold, untag), (untag, sink)] {
        builder.link(from, to).unwrap();
    }
    let mut network = builder.build().unwrap();

    let stats = run(&mut network, 21, 50.0, assert_classes_agree);

    assert!(absorbed(&network, sink) > 0);
    // The router relabels every arrival and charges the departure to the new class.
    let at_tag = input_counters(&network, tag, plain);
    assert!(at_tag.switched_out > 0);
    assert_eq!(at_tag.departures, 0);
    assert_eq!(input_counters(&network, tag, tagged).switched_in, at_tag.switched_out);
    assert_eq!(input_counters(&network, hold, plain).arrivals, 0);
    let at_untag = input_counters(&network, untag, tagged);
    assert!(at_untag.switched_out > 0);
    assert_eq!(at_untag.departures, 0);
    assert!(
        stats
            .of(Measure::SystemResponseTime)
            .all(|s| s.class == Some(plain))
    );
}

#[test]
fn test_cache_outcomes_reach_every_scope() {
    let mut builder = Network::builder();
    let request = builder.class(JobClass::open("request"));
    let hit = builder.class(JobClass::open("hit"));
    let miss = builder.class(JobClass::open("miss"));
    let all = || vec![RoutingStrategy::Random; 3];
    let source = builder
        .node(
            "source",
            NodeSpec::Source {
                interarrival: vec![exp(2.0), None, None],
                routing: all(),
            },
        )
        .unwrap();
    let cache = builder
        .node(
            "cache",
            NodeSpec::Cache {
                cache: CacheConfig {
                    items: 6,
                    tiers: vec![2],
                    policy: CachePolicy::Lru,
                    moves: MoveSemantics::default(),
                    popularity: vec![Some(zipf(6, 1.2)), None, None],
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
        )
        .unwrap();
    let origin = builder
        .node(
            "origin",
            NodeSpec::Delay {
                service: vec![None, exp(1.0), exp(1.0)],
                routing: all(),
            },
        )
        .unwrap();
    let sink = builder.node("sink", NodeSpec::Sink).unwrap();
    for (from, to) in [(source, cache), (cache, sink), (cache, origin), (origin, sink)] {
        builder.link(from, to).unwrap();
    }
    let mut network = builder.build().unwrap();

    run(&mut network, 8, 100.0, assert_classes_agree);

    let requests = input_counters(&network, cache, request);
    let hits = input_counters(&network, cache, hit);
    let misses = input_counters(&network, cache, miss);
    assert!(hits.switched_in > 0);
    assert!(misses.switched_in > 0);
    assert_eq!(requests.switched_out, hits.switched_in + misses.switched_in);
    assert_eq!(requests.departures, 0);
    assert_eq!(input_counters(&network, origin, hit).arrivals, 0);
    assert!(input_counters(&network, origin, miss).arrivals > 0);
}

#[test]
fn test_closed_cycle_keeps_population() {
    let mut builder = Network::builder();
    let first = builder.declare("first").unwrap();
    let second = builder.declare("second").unwrap();
    builder.class(JobClass::closed("circulating", first, 3));
    for (node, rate) in [(first, 1.0), (second, 2.0)] {
        builder
            .define(
                node,
                NodeSpec::Queue {
                    queue: QueueConfig::infinite(1),
                    service: ServiceSpec::Server(ServerConfig::homogeneous(1, vec![exp(rate)])),
                    routing: vec![RoutingStrategy::RoundRobin],
                },
            )
            .unwrap();
    }
    builder.link(first, second).unwrap();
    builder.link(second, first).unwrap();
    let mut network = builder.build().unwrap();

    let stats = run(&mut network, 5, 100.0, |network| {
        assert_eq!(network.jobs().len(), 3);
        assert!(network.registry().network().verify().is_ok());
    });

    assert!(stats.count(Measure::SystemResponseTime) > 0);
    assert!(
        stats
            .of(Measure::SystemResponseTime)
            .all(|s| s.node == Some(first) && s.value > 0.0)
    );
}

#[test]
fn test_finite_queue_never_exceeds_capacity() {
    let mut builder = Network::builder();
    builder.class(JobClass::open("job"));
    let source = builder
        .node(
            "source",
            NodeSpec::Source {
                interarrival: vec![exp(2.0)],
                routing: vec![RoutingStrategy::Random],
            },
        )
        .unwrap();
    let queue = builder
        .node(
            "queue",
            NodeSpec::Queue {
                queue: QueueConfig::finite(1, 2, DropRule::Drop),
                service: ServiceSpec::Server(ServerConfig::homogeneous(1, vec![exp(1.0)])),
                routing: vec![RoutingStrategy::Random],
            },
        )
        .unwrap();
    let sink = builder.node("sink", NodeSpec::Sink).unwrap();
    builder.link(source, queue).unwrap();
    builder.link(queue, sink).unwrap();
    let mut network = builder.build().unwrap();

    let stats = run(&mut network, 3, 200.0, |network| {
        assert!(network.registry().node(queue).len() <= 2);
    });

    assert!(stats.count(Measure::Dropped) > 0);
    assert!(absorbed(&network, sink) > 0);
    let counters = network.registry().node(queue).counters(ClassId(0));
    assert_eq!(counters.dropped as usize, stats.count(Measure::Dropped));
}

#[test]
fn test_processor_sharing_serves_lone_jobs_at_full_rate() {
    let mut builder = Network::builder();
    builder.class(JobClass::open("job"));
    let source = builder
        .node(
            "source",
            NodeSpec::Source {
                interarrival: vec![det(1.0)],
                routing: vec![RoutingStrategy::Random],
            },
        )
        .unwrap();
    let ps = builder
        .node(
            "ps",
            NodeSpec::Queue {
                queue: QueueConfig::infinite(1),
                service: ServiceSpec::ProcessorSharing(PsConfig::egalitarian(1, vec![det(0.5)])),
                routing: vec![RoutingStrategy::Random],
            },
        )
        .unwrap();
    let sink = builder.node("sink", NodeSpec::Sink).unwrap();
    builder.link(source, ps).unwrap();
    builder.link(ps, sink).unwrap();
    let mut network = builder.build().unwrap();

    let stats = run(&mut network, 1, 20.75, |_| {});

    assert_eq!(absorbed(&network, sink), 20);
    assert!(
        stats
            .of(Measure::SystemResponseTime)
            .all(|s| (s.value - 0.5).abs() < 1e-9)
    );
}

#[test]
fn test_petri_producer_consumer_conserves_tokens() {
    let mut builder = Network::builder();
    builder.class(JobClass::open("token"));
    let free = builder
        .node(
            "free",
            NodeSpec::Place {
                storage: StorageConfig::unbounded(1).with_initial(ClassId(0), 2),
            },
        )
        .unwrap();
    let full = builder
        .node(
            "full",
            NodeSpec::Place {
                storage: StorageConfig::unbounded(1),
            },
        )
        .unwrap();
    let single = || TransitionMatrix::zeros(1, 1).with(0, ClassId(0), 1);
    let mode = |name: &str, rate: f64| {
        ModeSpec::new(name, single(), single(), Distribution::Exponential { rate })
    };
    let produce = builder
        .node("produce", NodeSpec::Transition { modes: vec![mode("produce", 1.0)] })
        .unwrap();
    let consume = builder
        .node("consume", NodeSpec::Transition { modes: vec![mode("consume", 2.0)] })
        .unwrap();
    for (from, to) in [(free, produce), (produce, full), (full, consume), (consume, free)] {
        builder.link(from, to).unwrap();
    }
    let mut network = builder.build().unwrap();

    let stats = run(&mut network, 9, 50.0, |network| {
        assert_eq!(network.jobs().len(), 2);
        let resident = network.registry().node(free).len() + network.registry().node(full).len();
        assert!(resident <= 2);
    });

    let firings = stats.count(Measure::FiringThroughput);
    assert!(firings > 10, "only {firings} firings");
    assert!(
        stats
            .of(Measure::FiringThroughput)
            .any(|s| s.node == Some(produce))
    );
    assert!(
        stats
            .of(Measure::FiringThroughput)
            .any(|s| s.node == Some(consume))
    );
}
