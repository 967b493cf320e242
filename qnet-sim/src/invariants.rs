//! Invariant checking framework for simulation validation.

use std::fmt;

use qnet_core::{Network, NodeKind, Time};
use serde::Serialize;

/// Violation of a simulation invariant.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: String,
    /// Detailed description of the violation
    pub description: String,
    /// Simulated time of the check
    pub time: Time,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invariant '{}' violated at t={}: {}",
            self.invariant, self.time, self.description
        )
    }
}

/// Trait for checking network invariants between events.
pub trait Invariant: Send + Sync {
    /// Checks if invariant holds for the network at time `now`.
    ///
    /// # Errors
    /// Returns `InvariantViolation` if the invariant condition is not met.
    fn check(&self, network: &Network, now: Time) -> Result<(), InvariantViolation>;

    /// Returns name of this invariant.
    fn name(&self) -> &str;

    fn violation(&self, now: Time, description: String) -> InvariantViolation {
        InvariantViolation {
            invariant: self.name().to_string(),
            description,
            time: now,
        }
    }
}

/// Every registry agrees with itself, and the network scope holds exactly
/// the jobs alive in the job table.
pub struct RegistryConsistency;

impl Invariant for RegistryConsistency {
    fn check(&self, network: &Network, now: Time) -> Result<(), InvariantViolation> {
        let registries = network.registry();
        registries
            .network()
            .verify()
            .map_err(|e| self.violation(now, e))?;
        for (_, registry) in registries.nodes() {
            registry.verify().map_err(|e| self.violation(now, e))?;
        }
        let alive = network.jobs().len();
        let registered = registries.network().len();
        if alive != registered {
            return Err(self.violation(
                now,
                format!("{alive} jobs alive but {registered} registered at network scope"),
            ));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "RegistryConsistency"
    }
}

/// Input sections never admit beyond their finite capacity.
pub struct CapacityBound;

impl Invariant for CapacityBound {
    fn check(&self, network: &Network, now: Time) -> Result<(), InvariantViolation> {
        for (id, node) in network.nodes() {
            let admits = node.input.admits();
            if let Some(capacity) = admits.capacity() {
                let resident = admits.resident();
                if resident > capacity {
                    return Err(self.violation(
                        now,
                        format!(
                            "{} holds {resident} jobs, capacity {capacity}",
                            network.topology().name(id)
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "CapacityBound"
    }
}

/// Busy server units stay within the pool.
pub struct ServerBounds;

impl Invariant for ServerBounds {
    fn check(&self, network: &Network, now: Time) -> Result<(), InvariantViolation> {
        for (id, node) in network.nodes() {
            let serves = node.service.serves();
            let busy = serves.busy_units();
            let over = serves.total_units().is_some_and(|total| busy > total + 1e-9);
            if busy < 0.0 || over {
                return Err(self.violation(
                    now,
                    format!(
                        "{} has {busy} busy units of {:?}",
                        network.topology().name(id),
                        serves.total_units()
                    ),
                ));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "ServerBounds"
    }
}

/// Closed classes keep their combined population once it has been
/// injected. Switching between closed classes moves jobs, never creates them.
///
/// Forks and transitions create and absorb jobs, so networks containing
/// either are not checked.
pub struct ClosedPopulation;

impl Invariant for ClosedPopulation {
    fn check(&self, network: &Network, now: Time) -> Result<(), InvariantViolation> {
        let topology = network.topology();
        if topology
            .nodes()
            .any(|n| matches!(topology.kind(n), NodeKind::Fork | NodeKind::Transition))
        {
            return Ok(());
        }
        let registry = network.registry().network();
        let mut expected = 0usize;
        let mut actual = 0usize;
        for (class, info) in network.classes().iter() {
            if info.is_closed() {
                expected += info.population as usize;
                actual += registry.class_len(class);
            }
        }
        if actual != expected {
            return Err(self.violation(
                now,
                format!("closed classes hold {actual} jobs, population {expected}"),
            ));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "ClosedPopulation"
    }
}

/// The invariants the engine checks when enabled.
pub fn default_invariants() -> Vec<Box<dyn Invariant>> {
    vec![
        Box::new(RegistryConsistency),
        Box::new(CapacityBound),
        Box::new(ServerBounds),
        Box::new(ClosedPopulation),
    ]
}
