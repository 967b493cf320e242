//! Model assembly and event dispatch.
//!
//! [`NetworkBuilder`] collects classes, stations and links, checks them as a
//! whole and composes every station from its three sections. The resulting
//! [`Network`] owns the job table and the registries and delivers one
//! message at a time to the addressed section; the timeline, the random
//! source and the statistics sink stay with the caller.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::KernelConfig;
use crate::context::Kernel;
use crate::distribution::{Distribution, check_probabilities};
use crate::error::{ConfigError, KernelError, Result};
use crate::event::{Address, Event, Message, SectionKind};
use crate::forks::ForkTable;
use crate::job::{ClassId, ClassTable, JobClass, JobTable, NodeId};
use crate::petri::{Enabling, Firing, Linkage, ModeSpec, Storage, StorageConfig, Timing};
use crate::random::RandomSource;
use crate::registry::NetworkRegistry;
use crate::routing::RoutingStrategy;
use crate::scheduler::Scheduler;
use crate::section::{
    CacheConfig, CacheServer, ClassSwitcher, DelayServer, ForkConfig, ForkOutput, InputSection,
    JoinInput, JoinStrategy, Node, OutputSection, PsConfig, PsServer, QueueConfig, QueueInput,
    Router, Server, ServerConfig, ServiceSection, SinkInput, SourceInput, Tunnel,
};
use crate::stats::{LoadBoard, StatisticsSink};
use crate::topology::{NodeKind, Topology};
use crate::warnings::WarningLog;

/// Service discipline of a queueing station.
#[derive(Debug, Clone)]
pub enum ServiceSpec {
    Server(ServerConfig),
    ProcessorSharing(PsConfig),
    /// Infinite server.
    Delay(Vec<Option<Distribution>>),
}

impl ServiceSpec {
    /// Per-class demand distributions, used by demand-ordered queues.
    fn demand(&self, classes: usize) -> Vec<Option<Distribution>> {
        match self {
            ServiceSpec::Server(config) => config
                .types
                .first()
                .map(|t| t.service.clone())
                .unwrap_or_else(|| vec![None; classes]),
            ServiceSpec::ProcessorSharing(config) => config.service.clone(),
            ServiceSpec::Delay(service) => service.clone(),
        }
    }

    fn validate(&self, node: &str, classes: usize) -> std::result::Result<(), ConfigError> {
        match self {
            ServiceSpec::Server(config) => config.validate(node, classes),
            ServiceSpec::ProcessorSharing(config) => config.validate(node, classes),
            ServiceSpec::Delay(service) => validate_distributions(node, "delay service", service, classes),
        }
    }
}

/// Station description. Per-class vectors are indexed by class id.
#[derive(Debug, Clone)]
pub enum NodeSpec {
    Source {
        interarrival: Vec<Option<Distribution>>,
        routing: Vec<RoutingStrategy>,
    },
    Sink,
    Queue {
        queue: QueueConfig,
        service: ServiceSpec,
        routing: Vec<RoutingStrategy>,
    },
    Delay {
        service: Vec<Option<Distribution>>,
        routing: Vec<RoutingStrategy>,
    },
    Router {
        routing: Vec<RoutingStrategy>,
    },
    ClassSwitch {
        /// Row `i` is the distribution of the new class of a class-`i` job.
        matrix: Vec<Vec<f64>>,
        routing: Vec<RoutingStrategy>,
    },
    Cache {
        cache: CacheConfig,
        routing: Vec<RoutingStrategy>,
    },
    Fork {
        fork: ForkConfig,
    },
    Join {
        strategy: JoinStrategy,
        routing: Vec<RoutingStrategy>,
    },
    Place {
        storage: StorageConfig,
    },
    Transition {
        modes: Vec<ModeSpec>,
    },
}

impl NodeSpec {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeSpec::Source { .. } => NodeKind::Source,
            NodeSpec::Sink => NodeKind::Sink,
            NodeSpec::Queue { .. } => NodeKind::Queue,
            NodeSpec::Delay { .. } => NodeKind::Delay,
            NodeSpec::Router { .. } => NodeKind::Router,
            NodeSpec::ClassSwitch { .. } => NodeKind::ClassSwitch,
            NodeSpec::Cache { .. } => NodeKind::Cache,
            NodeSpec::Fork { .. } => NodeKind::Fork,
            NodeSpec::Join { .. } => NodeKind::Join,
            NodeSpec::Place { .. } => NodeKind::Place,
            NodeSpec::Transition { .. } => NodeKind::Transition,
        }
    }

    fn routing(&self) -> Option<&[RoutingStrategy]> {
        match self {
            NodeSpec::Source { routing, .. }
            | NodeSpec::Queue { routing, .. }
            | NodeSpec::Delay { routing, .. }
            | NodeSpec::Router { routing }
            | NodeSpec::ClassSwitch { routing, .. }
            | NodeSpec::Cache { routing, .. }
            | NodeSpec::Join { routing, .. } => Some(routing),
            NodeSpec::Sink | NodeSpec::Fork { .. } | NodeSpec::Place { .. } | NodeSpec::Transition { .. } => None,
        }
    }
}

fn validate_distributions(
    node: &str,
    what: &str,
    distributions: &[Option<Distribution>],
    classes: usize,
) -> std::result::Result<(), ConfigError> {
    if distributions.len() != classes {
        return Err(ConfigError::ClassArity {
            context: format!("{what} at {node}"),
            expected: classes,
            actual: distributions.len(),
        });
    }
    distributions.iter().flatten().try_for_each(Distribution::validate)
}

/// Collects a model and links it into a [`Network`].
#[derive(Debug, Default)]
pub struct NetworkBuilder {
    classes: Vec<JobClass>,
    names: Vec<String>,
    specs: Vec<Option<NodeSpec>>,
    links: Vec<(NodeId, NodeId)>,
    config: KernelConfig,
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn class(&mut self, class: JobClass) -> ClassId {
        self.classes.push(class);
        ClassId(self.classes.len() - 1)
    }

    /// Reserves a station name, so classes and links can refer to it before
    /// it is defined.
    ///
    /// # Errors
    ///
    /// - `ConfigError::DuplicateNode` - If the name is taken
    pub fn declare(&mut self, name: impl Into<String>) -> std::result::Result<NodeId, ConfigError> {
        let name = name.into();
        if self.names.contains(&name) {
            return Err(ConfigError::DuplicateNode { name });
        }
        self.names.push(name);
        self.specs.push(None);
        Ok(NodeId(self.names.len() - 1))
    }

    /// # Errors
    ///
    /// - `ConfigError::UnknownNode` - If the node was not declared
    pub fn define(&mut self, node: NodeId, spec: NodeSpec) -> std::result::Result<(), ConfigError> {
        let slot = self.specs.get_mut(node.0).ok_or(ConfigError::UnknownNode { node })?;
        *slot = Some(spec);
        Ok(())
    }

    /// Declares and defines a station in one step.
    ///
    /// # Errors
    ///
    /// - `ConfigError::DuplicateNode` - If the name is taken
    pub fn node(&mut self, name: impl Into<String>, spec: NodeSpec) -> std::result::Result<NodeId, ConfigError> {
        let node = self.declare(name)?;
        self.define(node, spec)?;
        Ok(node)
    }

    /// Appends an output link; link order is the order routing sees.
    ///
    /// # Errors
    ///
    /// - `ConfigError::UnknownNode` - If either end was not declared
    pub fn link(&mut self, from: NodeId, to: NodeId) -> std::result::Result<(), ConfigError> {
        for node in [from, to] {
            if node.0 >= self.names.len() {
                return Err(ConfigError::UnknownNode { node });
            }
        }
        self.links.push((from, to));
        Ok(())
    }

    /// Checks the model and composes every station.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`]: undefined stations, bad links, closed classes
    /// without a usable reference station, or station settings that do not
    /// fit the class count or the station's links.
    pub fn build(self) -> std::result::Result<Network, ConfigError> {
        let NetworkBuilder {
            classes,
            names,
            specs,
            links,
            config,
        } = self;

        let mut defined = Vec::with_capacity(specs.len());
        for (name, spec) in names.iter().zip(specs) {
            defined.push(spec.ok_or_else(|| ConfigError::UndefinedNode { name: name.clone() })?);
        }

        let mut topology = Topology::new();
        for (name, spec) in names.iter().zip(&defined) {
            topology.add_node(name.clone(), spec.kind());
        }
        for (from, to) in links {
            check_link(&topology, from, to)?;
            topology.add_link(from, to);
        }

        let classes = ClassTable::new(classes);
        check_classes(&topology, &classes)?;

        let class_count = classes.len();
        let mut nodes = Vec::with_capacity(defined.len());
        for (index, spec) in defined.into_iter().enumerate() {
            let node = NodeId(index);
            validate_node(&topology, node, &spec, class_count)?;
            nodes.push(compose(&topology, node, spec, class_count));
        }
        debug!(nodes = nodes.len(), classes = class_count, "network linked");

        Ok(Network {
            registry: NetworkRegistry::new(nodes.len(), class_count),
            loads: LoadBoard::new(nodes.len()),
            warnings: WarningLog::new(config.deduplicate_warnings),
            jobs: JobTable::new(),
            forks: ForkTable::new(),
            topology,
            classes,
            config,
            nodes,
        })
    }
}

fn check_link(topology: &Topology, from: NodeId, to: NodeId) -> std::result::Result<(), ConfigError> {
    let invalid = |reason: &str| {
        Err(ConfigError::InvalidLink {
            from: topology.name(from).to_string(),
            to: topology.name(to).to_string(),
            reason: reason.to_string(),
        })
    };
    match (topology.kind(from), topology.kind(to)) {
        (NodeKind::Sink, _) => invalid("a sink has no outputs"),
        (_, NodeKind::Source) => invalid("a source has no inputs"),
        (NodeKind::Place, kind) if kind != NodeKind::Transition => invalid("a place feeds transitions only"),
        (kind, NodeKind::Transition) if kind != NodeKind::Place => invalid("a transition is fed by places only"),
        _ => Ok(()),
    }
}

fn check_classes(topology: &Topology, classes: &ClassTable) -> std::result::Result<(), ConfigError> {
    if classes.is_empty() {
        return Err(ConfigError::InvalidClass {
            class: String::new(),
            reason: "a network needs at least one class".into(),
        });
    }
    for (_, class) in classes.iter() {
        if !class.is_closed() {
            continue;
        }
        let invalid = |reason: &str| {
            Err(ConfigError::InvalidClass {
                class: class.name.clone(),
                reason: reason.to_string(),
            })
        };
        let Some(reference) = class.reference else {
            return invalid("closed class has no reference station");
        };
        if !topology.contains(reference) {
            return Err(ConfigError::UnknownNode { node: reference });
        }
        match topology.kind(reference) {
            NodeKind::Source | NodeKind::Sink | NodeKind::Transition => {
                return invalid("reference station cannot admit jobs");
            }
            _ => {}
        }
        if class.population == 0 {
            return invalid("closed class has an empty population");
        }
    }
    Ok(())
}

fn validate_node(
    topology: &Topology,
    node: NodeId,
    spec: &NodeSpec,
    classes: usize,
) -> std::result::Result<(), ConfigError> {
    let name = topology.name(node);
    let outputs = topology.outputs(node).len();
    let inputs = topology.inputs(node).len();

    if let Some(routing) = spec.routing() {
        if routing.len() != classes {
            return Err(ConfigError::ClassArity {
                context: format!("routing at {name}"),
                expected: classes,
                actual: routing.len(),
            });
        }
        routing
            .iter()
            .try_for_each(|strategy| strategy.validate(name, outputs, classes))?;
    }

    match spec {
        NodeSpec::Source { interarrival, .. } => {
            validate_distributions(name, "interarrival times", interarrival, classes)
        }
        NodeSpec::Sink | NodeSpec::Router { .. } => Ok(()),
        NodeSpec::Queue { queue, service, .. } => {
            queue.validate(name, classes)?;
            service.validate(name, classes)
        }
        NodeSpec::Delay { service, .. } => validate_distributions(name, "delay service", service, classes),
        NodeSpec::ClassSwitch { matrix, .. } => {
            if matrix.len() != classes {
                return Err(ConfigError::ClassArity {
                    context: format!("class switch matrix at {name}"),
                    expected: classes,
                    actual: matrix.len(),
                });
            }
            for (class, row) in matrix.iter().enumerate() {
                if row.len() != classes {
                    return Err(ConfigError::ClassArity {
                        context: format!("class switch row {class} at {name}"),
                        expected: classes,
                        actual: row.len(),
                    });
                }
                check_probabilities(&format!("class switch row {class} at {name}"), row)?;
            }
            Ok(())
        }
        NodeSpec::Cache { cache, .. } => cache.validate(name, classes),
        NodeSpec::Fork { fork } => fork.validate(name, outputs, classes),
        NodeSpec::Join { strategy, .. } => strategy.validate(name, classes),
        NodeSpec::Place { storage } => storage.validate(name, classes),
        NodeSpec::Transition { modes } => {
            if modes.is_empty() {
                return Err(ConfigError::InvalidStation {
                    node: name.to_string(),
                    reason: "transition has no modes".into(),
                });
            }
            modes
                .iter()
                .enumerate()
                .try_for_each(|(index, mode)| mode.validate(name, index, inputs, outputs, classes))
        }
    }
}

fn routed(routing: Vec<RoutingStrategy>) -> OutputSection {
    OutputSection::Router(Router::new(routing))
}

fn buffered(classes: usize, demand: Vec<Option<Distribution>>) -> InputSection {
    InputSection::Queue(QueueInput::new(QueueConfig::infinite(classes), demand, classes))
}

fn compose(topology: &Topology, node: NodeId, spec: NodeSpec, classes: usize) -> Node {
    let (input, service, output) = match spec {
        NodeSpec::Source { interarrival, routing } => (
            InputSection::Source(SourceInput::new(interarrival)),
            ServiceSection::Tunnel(Tunnel),
            routed(routing),
        ),
        NodeSpec::Sink => (
            InputSection::Sink(SinkInput::new()),
            ServiceSection::Tunnel(Tunnel),
            routed(vec![RoutingStrategy::Disabled; classes]),
        ),
        NodeSpec::Queue { queue, service, routing } => {
            let demand = service.demand(classes);
            let service = match service {
                ServiceSpec::Server(config) => ServiceSection::Server(Server::new(config)),
                ServiceSpec::ProcessorSharing(config) => ServiceSection::ProcessorSharing(PsServer::new(config)),
                ServiceSpec::Delay(service) => ServiceSection::Delay(DelayServer::new(service)),
            };
            (
                InputSection::Queue(QueueInput::new(queue, demand, classes)),
                service,
                routed(routing),
            )
        }
        NodeSpec::Delay { service, routing } => (
            buffered(classes, service.clone()),
            ServiceSection::Delay(DelayServer::new(service)),
            routed(routing),
        ),
        NodeSpec::Router { routing } => (
            buffered(classes, vec![None; classes]),
            ServiceSection::Tunnel(Tunnel),
            routed(routing),
        ),
        NodeSpec::ClassSwitch { matrix, routing } => (
            buffered(classes, vec![None; classes]),
            ServiceSection::ClassSwitch(ClassSwitcher::new(matrix)),
            routed(routing),
        ),
        NodeSpec::Cache { cache, routing } => (
            buffered(classes, vec![None; classes]),
            ServiceSection::Cache(CacheServer::new(cache)),
            routed(routing),
        ),
        NodeSpec::Fork { fork } => (
            buffered(classes, vec![None; classes]),
            ServiceSection::Tunnel(Tunnel),
            OutputSection::Fork(ForkOutput::new(fork)),
        ),
        NodeSpec::Join { strategy, routing } => (
            InputSection::Join(JoinInput::new(strategy)),
            ServiceSection::Tunnel(Tunnel),
            routed(routing),
        ),
        NodeSpec::Place { storage } => (
            InputSection::Storage(Storage::new(storage)),
            ServiceSection::Tunnel(Tunnel),
            OutputSection::Linkage(Linkage::new()),
        ),
        NodeSpec::Transition { modes } => {
            let modes = Arc::new(modes);
            let places = topology.inputs(node).to_vec();
            let outputs = topology.outputs(node).to_vec();
            (
                InputSection::Enabling(Enabling::new(Arc::clone(&modes), places.clone(), classes)),
                ServiceSection::Timing(Timing::new(Arc::clone(&modes), places)),
                OutputSection::Firing(Firing::new(modes, outputs, classes)),
            )
        }
    };
    Node {
        input,
        service,
        output,
    }
}

/// A linked network: stations plus the job table and registries.
pub struct Network {
    topology: Topology,
    classes: ClassTable,
    config: KernelConfig,
    nodes: Vec<Node>,
    jobs: JobTable,
    registry: NetworkRegistry,
    loads: LoadBoard,
    forks: ForkTable,
    warnings: WarningLog,
}

impl Network {
    pub fn builder() -> NetworkBuilder {
        NetworkBuilder::new()
    }

    /// Delivers `Start` to every section and injects closed populations at
    /// their reference stations.
    ///
    /// # Errors
    ///
    /// Any [`KernelError`] raised by a section.
    pub fn start(
        &mut self,
        rng: &mut dyn RandomSource,
        scheduler: &mut dyn Scheduler,
        stats: &mut dyn StatisticsSink,
    ) -> Result<()> {
        let now = scheduler.now();
        for index in 0..self.nodes.len() {
            for section in [SectionKind::Input, SectionKind::Service, SectionKind::Output] {
                let here = Address::new(NodeId(index), section);
                let message = Message::new(Event::Start, here, here, now);
                self.dispatch(&message, rng, scheduler, stats)?;
            }
        }

        let closed: Vec<(ClassId, NodeId, u32)> = self
            .classes
            .iter()
            .filter_map(|(id, class)| {
                class
                    .reference
                    .filter(|_| class.is_closed())
                    .map(|reference| (id, reference, class.population))
            })
            .collect();
        for (class, reference, population) in closed {
            let here = Address::kernel(reference);
            let mut kernel = self.kernel(here, now, rng, scheduler, stats);
            for _ in 0..population {
                let job = kernel.create_job(class)?;
                kernel.send(Address::input(reference), Event::Job(job))?;
            }
            debug!(class = class.0, node = reference.0, population, "closed population injected");
        }
        Ok(())
    }

    /// Hands one message to the addressed section.
    ///
    /// # Errors
    ///
    /// - `KernelError::Invariant` - If the destination station does not exist
    /// - Any error raised by the section
    pub fn dispatch(
        &mut self,
        message: &Message,
        rng: &mut dyn RandomSource,
        scheduler: &mut dyn Scheduler,
        stats: &mut dyn StatisticsSink,
    ) -> Result<()> {
        let here = message.destination;
        trace!(
            to = %here,
            from = %message.source,
            event = message.event.as_str(),
            "dispatch"
        );
        let Network {
            topology,
            classes,
            config,
            nodes,
            jobs,
            registry,
            loads,
            forks,
            warnings,
        } = self;
        let node = nodes
            .get_mut(here.node.0)
            .ok_or_else(|| KernelError::invariant(here.node, "message addressed to an unknown station"))?;
        let mut kernel = Kernel {
            now: scheduler.now(),
            here,
            jobs,
            registry,
            loads,
            forks,
            topology,
            classes,
            config,
            rng,
            scheduler,
            stats,
            warnings,
            switched: Vec::new(),
        };
        node.handle(&mut kernel, message)
    }

    fn kernel<'a>(
        &'a mut self,
        here: Address,
        now: crate::Time,
        rng: &'a mut dyn RandomSource,
        scheduler: &'a mut dyn Scheduler,
        stats: &'a mut dyn StatisticsSink,
    ) -> Kernel<'a> {
        Kernel {
            now,
            here,
            jobs: &mut self.jobs,
            registry: &mut self.registry,
            loads: &mut self.loads,
            forks: &mut self.forks,
            topology: &self.topology,
            classes: &self.classes,
            config: &self.config,
            rng,
            scheduler,
            stats,
            warnings: &mut self.warnings,
            switched: Vec::new(),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn node(&self, node: NodeId) -> Option<&Node> {
        self.nodes.get(node.0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }

    pub fn loads(&self) -> &LoadBoard {
        &self.loads
    }

    pub fn forks(&self) -> &ForkTable {
        &self.forks
    }

    pub fn warnings(&self) -> &WarningLog {
        &self.warnings
    }

    /// Looks a station up by name.
    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.topology.lookup(name)
    }
}
