//! Error taxonomy for the kernel.
//!
//! Two families exist. [`ConfigError`] is raised while a network is linked
//! and aborts model setup. [`KernelError`] signals a broken kernel invariant
//! during a run and is never recovered from. Conditions a station is
//! expected to branch on (no viable route, a full queue, a disabled mode)
//! are ordinary return values and never appear here.

use crate::job::{ClassId, JobId, NodeId};
use crate::Time;

/// Model configuration rejected at link time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Station {node} requires {required} servers for class {class}, only {available} compatible")]
    InsufficientServers {
        node: String,
        class: ClassId,
        required: u32,
        available: u32,
    },

    #[error("Station {node}: {reason}")]
    InvalidStation { node: String, reason: String },

    #[error("Invalid distribution: {reason}")]
    InvalidDistribution { reason: String },

    #[error("Probabilities for {context} sum to {sum}, expected 1")]
    InvalidProbabilities { context: String, sum: f64 },

    #[error("Load-dependent table for {context} must be non-empty, sorted and start at population 1 or less")]
    LoadDependentTable { context: String },

    #[error("Expected {expected} per-class entries for {context}, got {actual}")]
    ClassArity {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown node {node}")]
    UnknownNode { node: NodeId },

    #[error("Unknown class {class}")]
    UnknownClass { class: ClassId },

    #[error("Node {name} declared but never defined")]
    UndefinedNode { name: String },

    #[error("Duplicate node name {name}")]
    DuplicateNode { name: String },

    #[error("Invalid link {from} -> {to}: {reason}")]
    InvalidLink {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Class {class}: {reason}")]
    InvalidClass { class: String, reason: String },

    #[error("Transition {node} mode {mode}: {reason}")]
    InvalidMode {
        node: String,
        mode: usize,
        reason: String,
    },
}

/// Fatal kernel failure: an invariant was violated while processing events.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job {job} is not known to the kernel")]
    UnknownJob { job: JobId },

    #[error("Job {job} missing from {scope} registry")]
    NotRegistered { job: JobId, scope: &'static str },

    #[error("Job {job} already present in {scope} registry")]
    AlreadyRegistered { job: JobId, scope: &'static str },

    #[error("Event {event} not consumed by node {node} section {section}")]
    UnhandledEvent {
        node: NodeId,
        section: &'static str,
        event: &'static str,
    },

    #[error("Cannot schedule event with negative delay {delay}")]
    NegativeDelay { delay: Time },

    #[error("Negative residual service {residual} for job {job}")]
    NegativeResidual { job: JobId, residual: f64 },

    #[error("Servers of job {job} released twice")]
    DoubleRelease { job: JobId },

    #[error("Node {node} has no popularity distribution for class {class}")]
    MissingPopularity { node: NodeId, class: ClassId },

    #[error("Closed-class job {job} reached sink {node}")]
    ClosedJobAtSink { job: JobId, node: NodeId },

    #[error("Invariant violated at node {node}: {reason}")]
    Invariant { node: NodeId, reason: String },
}

impl KernelError {
    /// Builds a generic invariant violation for the given node.
    pub fn invariant(node: NodeId, reason: impl Into<String>) -> Self {
        KernelError::Invariant {
            node,
            reason: reason.into(),
        }
    }

    /// Checks if this error originates from model configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(self, KernelError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_wraps_into_kernel_error() {
        let err: KernelError = ConfigError::UnknownNode { node: NodeId(3) }.into();
        assert!(err.is_config_error());
        assert_eq!(err.to_string(), "Configuration error: Unknown node 3");
    }

    #[test]
    fn test_invariant_error_message() {
        let err = KernelError::invariant(NodeId(1), "busy exceeds capacity");
        assert!(!err.is_config_error());
        assert!(err.to_string().contains("busy exceeds capacity"));
    }
}
