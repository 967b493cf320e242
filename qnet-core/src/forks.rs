//! Bookkeeping shared between fork and join stations.
//!
//! A record is created when a fork splits a job and removed when the join
//! that reassembles it fires (or absorbs the last fragment).

use std::collections::HashMap;

use crate::job::{ClassId, JobId, NodeId};

#[derive(Debug, Clone, PartialEq)]
pub struct ForkRecord {
    pub fork_node: NodeId,
    /// Fragments still expected downstream.
    pub fragments: u32,
    /// Fragments per class.
    pub per_class: Vec<u32>,
    /// Fragments accepted by their first downstream station.
    pub acked: u32,
}

/// Fork records keyed by the parent job.
#[derive(Debug, Default)]
pub struct ForkTable {
    records: HashMap<JobId, ForkRecord>,
}

impl ForkTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn open(&mut self, parent: JobId, fork_node: NodeId, classes: usize) {
        self.records.insert(
            parent,
            ForkRecord {
                fork_node,
                fragments: 0,
                per_class: vec![0; classes],
                acked: 0,
            },
        );
    }

    /// Counts one more emitted fragment of `class`.
    pub fn add_fragment(&mut self, parent: JobId, class: ClassId) {
        if let Some(record) = self.records.get_mut(&parent) {
            record.fragments += 1;
            record.per_class[class.0] += 1;
        }
    }

    /// Forgets a fragment that never left the fork.
    pub fn lose_fragment(&mut self, parent: JobId, class: ClassId) {
        if let Some(record) = self.records.get_mut(&parent) {
            record.fragments = record.fragments.saturating_sub(1);
            record.per_class[class.0] = record.per_class[class.0].saturating_sub(1);
        }
    }

    /// Registers a downstream ack; returns true once every fragment is acked.
    pub fn ack(&mut self, parent: JobId) -> bool {
        match self.records.get_mut(&parent) {
            Some(record) => {
                record.acked += 1;
                record.acked >= record.fragments
            }
            None => false,
        }
    }

    pub fn get(&self, parent: JobId) -> Option<&ForkRecord> {
        self.records.get(&parent)
    }

    pub fn close(&mut self, parent: JobId) -> Option<ForkRecord> {
        self.records.remove(&parent)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_lifecycle() {
        let mut table = ForkTable::new();
        table.open(JobId(1), NodeId(2), 2);
        table.add_fragment(JobId(1), ClassId(0));
        table.add_fragment(JobId(1), ClassId(1));

        assert!(!table.ack(JobId(1)));
        assert!(table.ack(JobId(1)));
        assert_eq!(table.get(JobId(1)).unwrap().per_class, vec![1, 1]);
        assert!(table.close(JobId(1)).is_some());
        assert!(table.is_empty());
    }
}
