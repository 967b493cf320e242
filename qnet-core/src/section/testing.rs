//! Test harness owning every piece of kernel state, so single sections can
//! be driven message by message.

use crate::config::KernelConfig;
use crate::context::Kernel;
use crate::event::{Address, Event, Message};
use crate::forks::ForkTable;
use crate::job::{ClassId, ClassTable, JobClass, JobId, JobTable, NodeId};
use crate::random::{RandomSource, SequenceRandom};
use crate::registry::NetworkRegistry;
use crate::scheduler::{EventQueue, Scheduler};
use crate::stats::{LoadBoard, RecordedStatistics};
use crate::topology::{NodeKind, Topology};
use crate::warnings::WarningLog;

pub(crate) struct Harness {
    pub jobs: JobTable,
    pub registry: NetworkRegistry,
    pub loads: LoadBoard,
    pub forks: ForkTable,
    pub topology: Topology,
    pub classes: ClassTable,
    pub config: KernelConfig,
    pub rng: Box<dyn RandomSource>,
    pub queue: EventQueue,
    pub stats: RecordedStatistics,
    pub warnings: WarningLog,
}

impl Harness {
    pub fn new(topology: Topology, classes: ClassTable) -> Self {
        let nodes = topology.len();
        let class_count = classes.len();
        Self {
            jobs: JobTable::new(),
            registry: NetworkRegistry::new(nodes, class_count),
            loads: LoadBoard::new(nodes),
            forks: ForkTable::new(),
            topology,
            classes,
            config: KernelConfig::default(),
            rng: Box::new(SequenceRandom::new(vec![0.5])),
            queue: EventQueue::new(),
            stats: RecordedStatistics::new(),
            warnings: WarningLog::new(true),
        }
    }

    /// Nodes named `n0..` of the given kinds with one open class per entry
    /// of `classes`.
    pub fn chain(kinds: &[NodeKind], classes: usize) -> Self {
        let mut topology = Topology::new();
        for (i, kind) in kinds.iter().enumerate() {
            topology.add_node(format!("n{i}"), *kind);
        }
        let classes = ClassTable::new((0..classes).map(|c| JobClass::open(format!("c{c}"))).collect());
        Self::new(topology, classes)
    }

    pub fn link(mut self, from: usize, to: usize) -> Self {
        self.topology.add_link(NodeId(from), NodeId(to));
        self
    }

    pub fn with_rng(mut self, values: Vec<f64>) -> Self {
        self.rng = Box::new(SequenceRandom::new(values));
        self
    }

    pub fn now(&self) -> f64 {
        self.queue.now()
    }

    pub fn kernel(&mut self, here: Address) -> Kernel<'_> {
        Kernel {
            now: self.queue.now(),
            here,
            jobs: &mut self.jobs,
            registry: &mut self.registry,
            loads: &mut self.loads,
            forks: &mut self.forks,
            topology: &self.topology,
            classes: &self.classes,
            config: &self.config,
            rng: &mut *self.rng,
            scheduler: &mut self.queue,
            stats: &mut self.stats,
            warnings: &mut self.warnings,
            switched: Vec::new(),
        }
    }

    /// Creates a job registered at network scope and resident at `node`.
    pub fn job_at(&mut self, class: ClassId, node: NodeId) -> JobId {
        let mut kernel = self.kernel(Address::input(node));
        let job = kernel.create_job(class).unwrap();
        kernel.enter_node(job).unwrap();
        job
    }

    /// A message as if sent by `from` to `to` at the current time.
    pub fn message(&self, event: Event, from: Address, to: Address) -> Message {
        Message::new(event, from, to, self.queue.now())
    }

    /// Next pending message, advancing the clock to it.
    pub fn next(&mut self) -> Option<Message> {
        self.queue.pop().map(|(_, message)| message)
    }

    /// Every message due at the current instant, in delivery order.
    pub fn drain_now(&mut self) -> Vec<Message> {
        let now = self.queue.now();
        let mut out = Vec::new();
        while self.queue.peek_time().is_some_and(|t| t <= now) {
            if let Some(message) = self.next() {
                out.push(message);
            }
        }
        out
    }

    /// Events of the messages due now, with their destinations.
    pub fn drain_events(&mut self) -> Vec<(Address, Event)> {
        self.drain_now()
            .into_iter()
            .map(|m| (m.destination, m.event))
            .collect()
    }
}
