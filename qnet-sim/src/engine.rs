//! Deterministic simulation engine for queueing networks.

use std::collections::BTreeMap;

use qnet_core::{DeterministicRng, KernelError, Network, Scheduler, Time};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::SimulationClock;
use crate::config::SimulationConfig;
use crate::invariants::{Invariant, InvariantViolation, default_invariants};
use crate::metrics::MetricsCollector;
use crate::report::{RunTotals, SimulationReport};

/// Maximum number of invariant violations before stopping simulation.
const MAX_INVARIANT_VIOLATIONS: usize = 10;

/// Errors that can occur during simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Event queue exceeded maximum capacity
    #[error("Event queue overflow: {count} events scheduled")]
    EventQueueOverflow {
        /// Number of events that caused overflow
        count: usize,
    },

    /// Too many invariant violations occurred
    #[error("Too many invariant violations: {count}")]
    TooManyInvariantViolations {
        /// Number of violations that occurred
        count: usize,
    },

    /// Event could not be scheduled properly
    #[error("Invalid event scheduling: {reason}")]
    InvalidEventScheduling {
        /// Reason why scheduling failed
        reason: String,
    },

    /// A station broke a kernel invariant
    #[error("Kernel failure: {0}")]
    Kernel(#[from] KernelError),

    /// Deterministic seed required but not provided
    #[error("No deterministic seed provided")]
    NoDeterministicSeed,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The next event lies beyond the horizon.
    Horizon,
    /// No event is pending.
    Drained,
    /// The event budget was used up.
    EventLimit,
}

/// Drives one network through time.
pub struct Simulation {
    config: SimulationConfig,
    network: Network,
    clock: SimulationClock,
    rng: DeterministicRng,
    metrics: MetricsCollector,
    invariants: Vec<Box<dyn Invariant>>,
    violations: Vec<InvariantViolation>,
    events_by_type: BTreeMap<&'static str, u64>,
    started: bool,
}

impl Simulation {
    /// Creates new simulation of `network` with given configuration.
    ///
    /// The default invariants are installed when the configuration asks
    /// for invariant checks.
    ///
    /// # Errors
    /// - `SimulationError::NoDeterministicSeed` - No seed provided in config
    pub fn new(network: Network, config: SimulationConfig) -> Result<Self, SimulationError> {
        let seed = config
            .deterministic_seed
            .ok_or(SimulationError::NoDeterministicSeed)?;
        let invariants = if config.check_invariants {
            default_invariants()
        } else {
            Vec::new()
        };

        Ok(Self {
            config,
            network,
            clock: SimulationClock::new(),
            rng: DeterministicRng::from_seed(seed),
            metrics: MetricsCollector::new(),
            invariants,
            violations: Vec::new(),
            events_by_type: BTreeMap::new(),
            started: false,
        })
    }

    /// Returns the seed used for this simulation.
    pub fn simulation_seed(&self) -> u64 {
        self.rng.seed()
    }

    /// Returns current simulation time.
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn violations(&self) -> &[InvariantViolation] {
        &self.violations
    }

    /// Adds an invariant to check after every event.
    pub fn add_invariant(&mut self, invariant: Box<dyn Invariant>) {
        self.invariants.push(invariant);
    }

    fn start(&mut self) -> Result<(), SimulationError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        info!(
            seed = self.simulation_seed(),
            horizon = self.config.horizon,
            stations = self.network.topology().len(),
            classes = self.network.classes().len(),
            "simulation started"
        );
        self.network
            .start(&mut self.rng, &mut self.clock, &mut self.metrics)?;
        self.check_invariants()
    }

    /// Delivers the next event due before the horizon.
    ///
    /// Returns `false` once nothing is left to deliver.
    ///
    /// # Errors
    /// - `SimulationError::Kernel` - A station failed while handling the event
    /// - `SimulationError::EventQueueOverflow` - Too many events pending
    /// - `SimulationError::TooManyInvariantViolations` - Too many invariant violations
    pub fn step(&mut self) -> Result<bool, SimulationError> {
        self.start()?;
        let Some(message) = self.clock.next_until(self.config.horizon)? else {
            return Ok(false);
        };
        *self.events_by_type.entry(message.event.as_str()).or_default() += 1;
        self.network
            .dispatch(&message, &mut self.rng, &mut self.clock, &mut self.metrics)?;
        self.clock.check_capacity()?;
        self.check_invariants()?;
        Ok(true)
    }

    /// Runs until the horizon, the event budget, or an empty timeline.
    ///
    /// # Errors
    /// - `SimulationError::Kernel` - A station failed while handling an event
    /// - `SimulationError::EventQueueOverflow` - Too many events pending
    /// - `SimulationError::TooManyInvariantViolations` - Too many invariant violations
    pub fn run(&mut self) -> Result<SimulationReport, SimulationError> {
        let reason = loop {
            if self.clock.delivered() >= self.config.max_events {
                break StopReason::EventLimit;
            }
            if !self.step()? {
                break if self.clock.next_due().is_some() {
                    StopReason::Horizon
                } else {
                    StopReason::Drained
                };
            }
        };

        let report = self.report(reason);
        info!(
            events = report.event_count,
            end_time = report.end_time,
            ?reason,
            success = report.success,
            "simulation finished"
        );
        Ok(report)
    }

    /// Builds a report of the run so far.
    pub fn report(&self, reason: StopReason) -> SimulationReport {
        // Averages extend to the horizon unless the run was cut short.
        let end_time = match reason {
            StopReason::Horizon | StopReason::Drained => self.config.horizon,
            StopReason::EventLimit => self.clock.now(),
        };
        let totals = RunTotals {
            seed: self.simulation_seed(),
            horizon: self.config.horizon,
            end_time,
            event_count: self.clock.delivered(),
            events_by_type: self
                .events_by_type
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect(),
            cancelled_events: self.clock.cancelled(),
        };
        SimulationReport::collect(&self.network, &self.metrics, totals, self.violations.clone())
    }

    /// Checks all invariants.
    fn check_invariants(&mut self) -> Result<(), SimulationError> {
        let now = self.clock.now();
        for invariant in &self.invariants {
            if let Err(violation) = invariant.check(&self.network, now) {
                warn!(invariant = invariant.name(), "{violation}");
                self.violations.push(violation);

                if self.violations.len() >= MAX_INVARIANT_VIOLATIONS {
                    return Err(SimulationError::TooManyInvariantViolations {
                        count: self.violations.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Convenience wrapper: runs `network` once with `config`.
///
/// # Errors
/// Propagates every [`SimulationError`] of [`Simulation::run`].
pub fn simulate(network: Network, config: SimulationConfig) -> Result<SimulationReport, SimulationError> {
    let mut simulation = Simulation::new(network, config)?;
    let report = simulation.run()?;
    debug!(seed = report.seed, "run complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios;

    #[test]
    fn test_seed_is_required() {
        let network = scenarios::mm1(1.0, 2.0).unwrap();
        let result = Simulation::new(network, SimulationConfig::default());
        assert!(matches!(result, Err(SimulationError::NoDeterministicSeed)));
    }

    #[test]
    fn test_event_budget_stops_run() {
        let network = scenarios::mm1(1.0, 2.0).unwrap();
        let config = SimulationConfig {
            max_events: 50,
            ..SimulationConfig::deterministic_testing()
        };
        let mut simulation = Simulation::new(network, config).unwrap();
        let report = simulation.run().unwrap();

        assert_eq!(report.event_count, 50);
        assert!(report.end_time < report.horizon);
        assert_eq!(report.end_time, simulation.now());
    }

    #[test]
    fn test_failing_invariant_is_recorded() {
        struct AlwaysFails;
        impl Invariant for AlwaysFails {
            fn check(&self, _network: &Network, now: Time) -> Result<(), InvariantViolation> {
                Err(self.violation(now, "always".into()))
            }
            fn name(&self) -> &str {
                "AlwaysFails"
            }
        }

        let network = scenarios::mm1(1.0, 2.0).unwrap();
        let mut simulation = Simulation::new(network, SimulationConfig::deterministic_testing()).unwrap();
        simulation.add_invariant(Box::new(AlwaysFails));
        let result = simulation.run();

        assert!(matches!(
            result,
            Err(SimulationError::TooManyInvariantViolations { count: 10 })
        ));
        assert_eq!(simulation.violations().len(), 10);
    }
}
