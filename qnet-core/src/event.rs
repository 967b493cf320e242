//! Event tags and the message envelope exchanged between sections.

use std::fmt;

use crate::job::{ClassId, ClassMask, JobId, NodeId};
use crate::Time;

/// One pipeline stage of a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionKind {
    Input,
    Service,
    Output,
    /// Pseudo-section standing for the kernel itself; messages addressed
    /// here are discarded after delivery.
    Kernel,
}

impl SectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKind::Input => "input",
            SectionKind::Service => "service",
            SectionKind::Output => "output",
            SectionKind::Kernel => "kernel",
        }
    }
}

/// Location of a section in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub node: NodeId,
    pub section: SectionKind,
}

impl Address {
    pub fn new(node: NodeId, section: SectionKind) -> Self {
        Self { node, section }
    }

    pub fn input(node: NodeId) -> Self {
        Self::new(node, SectionKind::Input)
    }

    pub fn service(node: NodeId) -> Self {
        Self::new(node, SectionKind::Service)
    }

    pub fn output(node: NodeId) -> Self {
        Self::new(node, SectionKind::Output)
    }

    pub fn kernel(node: NodeId) -> Self {
        Self::new(node, SectionKind::Kernel)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.section.as_str())
    }
}

/// Everything a section can be asked to handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Simulation start, delivered once to every section.
    Start,
    /// A job handed over from another section.
    Job(JobId),
    /// The receiver of a job accepted it; the sender may release resources.
    Ack(JobId),
    /// The service section can accept one more job of the given classes.
    Ready(ClassMask),
    /// The job has left the station.
    Departed(JobId),
    /// Ask the service section to preempt a lower-priority job.
    PreemptRequest(JobId),
    /// A preempted job returns to the queue with its residual demand.
    Preempted(JobId),
    /// A preemption request could not be honoured.
    Bounced(JobId),
    ServiceDone(JobId),
    SetupDone(JobId),
    PowerDown { server_type: usize, unit: usize },
    PsCompletion,
    Arrival(ClassId),
    Renege(JobId),
    Retrial(JobId),
    JoinDone { parent: JobId },
    /// Place content changed by `delta` jobs of `class`.
    JobChange { class: ClassId, delta: i64 },
    Enabling { mode: usize, degree: u32 },
    ModeFiring { mode: usize, active: bool },
    Timing { mode: usize, timer: u64 },
    JobRequest { mode: usize, counts: Vec<u32> },
    JobWithdrawn {
        mode: usize,
        jobs: Vec<JobId>,
        complete: bool,
    },
    Restore { jobs: Vec<JobId> },
    Firing { mode: usize, consumed: Vec<JobId> },
}

impl Event {
    /// Returns string representation of event type for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Start => "Start",
            Event::Job(_) => "Job",
            Event::Ack(_) => "Ack",
            Event::Ready(_) => "Ready",
            Event::Departed(_) => "Departed",
            Event::PreemptRequest(_) => "PreemptRequest",
            Event::Preempted(_) => "Preempted",
            Event::Bounced(_) => "Bounced",
            Event::ServiceDone(_) => "ServiceDone",
            Event::SetupDone(_) => "SetupDone",
            Event::PowerDown { .. } => "PowerDown",
            Event::PsCompletion => "PsCompletion",
            Event::Arrival(_) => "Arrival",
            Event::Renege(_) => "Renege",
            Event::Retrial(_) => "Retrial",
            Event::JoinDone { .. } => "JoinDone",
            Event::JobChange { .. } => "JobChange",
            Event::Enabling { .. } => "Enabling",
            Event::ModeFiring { .. } => "ModeFiring",
            Event::Timing { .. } => "Timing",
            Event::JobRequest { .. } => "JobRequest",
            Event::JobWithdrawn { .. } => "JobWithdrawn",
            Event::Restore { .. } => "Restore",
            Event::Firing { .. } => "Firing",
        }
    }
}

/// Envelope carrying an event between two sections.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub event: Event,
    pub source: Address,
    pub destination: Address,
    pub sent_at: Time,
}

impl Message {
    pub fn new(event: Event, source: Address, destination: Address, sent_at: Time) -> Self {
        Self {
            event,
            source,
            destination,
            sent_at,
        }
    }
}

/// Outcome of offering a message to a section.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Consumed,
    NotConsumed,
}
