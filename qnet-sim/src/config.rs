//! Run configuration for the simulation engine.

use serde::{Deserialize, Serialize};

/// Settings of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Deterministic seed for reproducible runs
    pub deterministic_seed: Option<u64>,
    /// Upper bound on delivered events
    pub max_events: u64,
    /// Simulated time at which the run stops
    pub horizon: f64,
    /// Check invariants after every event
    pub check_invariants: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            max_events: 10_000_000,
            horizon: 10_000.0,
            check_invariants: false,
        }
    }
}

impl SimulationConfig {
    /// Creates a configuration for deterministic testing.
    pub fn deterministic_testing() -> Self {
        Self {
            deterministic_seed: Some(42),
            max_events: 1_000_000,
            horizon: 1_000.0,
            check_invariants: true,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.deterministic_seed = Some(seed);
        self
    }

    pub fn with_horizon(mut self, horizon: f64) -> Self {
        self.horizon = horizon;
        self
    }

    /// Loads defaults and applies environment variable overrides.
    ///
    /// Reads `QNET_SEED`, `QNET_MAX_EVENTS`, `QNET_HORIZON` and
    /// `QNET_CHECK_INVARIANTS`; unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(seed) = std::env::var("QNET_SEED") {
            if let Ok(seed_value) = seed.parse::<u64>() {
                config.deterministic_seed = Some(seed_value);
            }
        }

        if let Ok(max_events) = std::env::var("QNET_MAX_EVENTS") {
            if let Ok(count) = max_events.parse::<u64>() {
                config.max_events = count;
            }
        }

        if let Ok(horizon) = std::env::var("QNET_HORIZON") {
            if let Ok(value) = horizon.parse::<f64>() {
                if value.is_finite() && value >= 0.0 {
                    config.horizon = value;
                }
            }
        }

        if let Ok(check) = std::env::var("QNET_CHECK_INVARIANTS") {
            config.check_invariants = check.parse().unwrap_or(false);
        }

        config
    }
}
