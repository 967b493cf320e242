//! Qnet Core - Discrete-event kernel for multi-class queueing networks
//!
//! Jobs of several classes move through a graph of stations. Every station
//! is an input section (admission), a service section (holding time) and an
//! output section (routing), and the sections talk to each other only by
//! messages delivered through a cancellable timeline. The kernel covers
//! queues with finite capacity and impatience, multi-server pools with
//! scheduling policies, processor sharing, fork/join, caches and stochastic
//! Petri net places and transitions.
//!
//! A run is fully determined by the model and the random stream: the crate
//! never reads a clock or an ambient random generator.

pub mod config;
pub mod context;
pub mod distribution;
pub mod error;
pub mod event;
pub mod forks;
pub mod job;
pub mod network;
pub mod petri;
pub mod random;
pub mod registry;
pub mod routing;
pub mod scheduler;
pub mod section;
pub mod stats;
pub mod topology;
pub mod tracing_setup;
pub mod warnings;

/// Simulated time, in model units.
pub type Time = f64;

// Re-export main types for convenient access
pub use config::KernelConfig;
pub use context::Kernel;
pub use distribution::{Distribution, ServiceStrategy, zipf};
pub use error::{ConfigError, KernelError, Result};
pub use event::{Address, Event, Handled, Message, SectionKind};
pub use job::{ClassId, ClassKind, ClassMask, ClassTable, Job, JobClass, JobId, JobTable, NodeId};
pub use network::{Network, NetworkBuilder, NodeSpec, ServiceSpec};
pub use random::{DeterministicRng, RandomSource, SequenceRandom};
pub use registry::{DropReason, JobRegistry, NetworkRegistry};
pub use routing::{RouteDecision, RoutingStrategy};
pub use scheduler::{EventQueue, EventToken, Scheduler};
pub use stats::{LoadBoard, Measure, NullStatistics, RecordedStatistics, Sample, StatisticsSink};
pub use topology::{NodeKind, Topology};
pub use warnings::{WarningKind, WarningLog};
