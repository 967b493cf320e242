//! One-shot user-facing warnings.

use std::collections::HashSet;

use crate::job::{ClassId, NodeId};

/// Category of a user-facing warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarningKind {
    /// No viable output for a job.
    Unroutable,
    /// A fork fragment was redirected away from a sink.
    ForkRedirect,
    /// A fork fragment had nowhere to go and was discarded.
    FragmentLost,
}

/// Emits each warning at most once per station, class and kind.
#[derive(Debug, Default)]
pub struct WarningLog {
    seen: HashSet<(NodeId, Option<ClassId>, WarningKind)>,
    deduplicate: bool,
    suppressed: u64,
}

impl WarningLog {
    pub fn new(deduplicate: bool) -> Self {
        Self {
            seen: HashSet::new(),
            deduplicate,
            suppressed: 0,
        }
    }

    /// Logs `message` unless an identical key was already reported.
    /// Returns whether the warning was emitted.
    pub fn warn_once(
        &mut self,
        node: NodeId,
        class: Option<ClassId>,
        kind: WarningKind,
        message: &str,
    ) -> bool {
        if !self.seen.insert((node, class, kind)) && self.deduplicate {
            self.suppressed += 1;
            return false;
        }
        tracing::warn!(node = node.0, class = ?class.map(|c| c.0), ?kind, "{message}");
        true
    }

    /// Number of distinct warnings emitted.
    pub fn distinct(&self) -> usize {
        self.seen.len()
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}
