//! Kernel-wide tunables.
//!
//! Model configuration (classes, stations, links) goes through
//! [`crate::network::NetworkBuilder`]; this module only holds the numeric
//! constants and switches shared by every station.

/// Tolerance for tie detection in routing and rate comparisons.
pub const TIE_EPSILON: f64 = 1e-14;

/// Settings shared by every station of a network.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Tolerance used by property-based routing when collecting tie sets.
    pub tie_epsilon: f64,
    /// Emit each user-facing warning once per station, class and kind.
    pub deduplicate_warnings: bool,
    /// Re-check the processor-sharing capacity bound after every rate update.
    pub check_rate_bounds: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tie_epsilon: TIE_EPSILON,
            deduplicate_warnings: true,
            check_rate_bounds: true,
        }
    }
}

impl KernelConfig {
    /// Verbose settings for debugging a model: every warning is logged.
    pub fn verbose() -> Self {
        Self {
            deduplicate_warnings: false,
            ..Default::default()
        }
    }
}
