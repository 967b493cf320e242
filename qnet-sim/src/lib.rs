//! Qnet Sim - Deterministic simulation engine for queueing networks
//!
//! Drives a [`qnet_core::Network`] through simulated time from a seeded
//! random stream, collects weighted statistics per station and class,
//! checks network invariants between events and renders a run report.

pub mod clock;
pub mod config;
pub mod engine;
pub mod invariants;
pub mod metrics;
pub mod report;
pub mod scenarios;

pub use clock::{MAX_EVENT_QUEUE_SIZE, SimulationClock};
pub use config::SimulationConfig;
pub use engine::{Simulation, SimulationError, StopReason, simulate};
pub use invariants::{
    CapacityBound, ClosedPopulation, Invariant, InvariantViolation, RegistryConsistency,
    ServerBounds, default_invariants,
};
pub use metrics::{Accumulator, MetricsCollector};
pub use report::{ClassReport, MeasureReport, SimulationReport, StationClassReport, StationReport};
pub use scenarios::Scenario;
