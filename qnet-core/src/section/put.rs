//! Per-class insertion rules of a queue buffer.

use std::collections::VecDeque;

use crate::distribution::{Distribution, ServiceStrategy};
use crate::job::{ClassId, JobId};
use crate::random::{RandomSource, uniform_index};

/// Where an admitted job is placed in the waiting line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutStrategy {
    /// Tail insertion.
    #[default]
    Fcfs,
    /// Head insertion.
    Lcfs,
    /// Uniformly random position, equivalent to random service order.
    Random,
    /// Behind every job of equal or higher priority.
    PriorityFcfs,
    /// Ahead of every job of equal or lower priority.
    PriorityLcfs,
    /// Shortest sampled demand first; the demand is fixed at arrival.
    Sjf,
    /// Longest sampled demand first.
    Ljf,
    /// Shortest expected demand first.
    Sept,
    /// Longest expected demand first.
    Lept,
    /// Priority order, and an arriving job may preempt a lower-priority one
    /// in service.
    PreemptivePriority,
}

impl PutStrategy {
    pub fn is_preemptive(&self) -> bool {
        matches!(self, PutStrategy::PreemptivePriority)
    }

    /// Whether the strategy needs a demand sampled at arrival.
    pub fn samples_demand(&self) -> bool {
        matches!(self, PutStrategy::Sjf | PutStrategy::Ljf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) struct Buffered {
    pub job: JobId,
    pub class: ClassId,
    /// Ordering key; smaller keys are served first.
    pub key: f64,
}

/// Ordering key for a job. `demand` is the sampled demand for SJF and LJF.
pub(super) fn order_key(
    strategy: PutStrategy,
    priority: i32,
    demand: Option<f64>,
    expected: Option<&Distribution>,
) -> f64 {
    match strategy {
        PutStrategy::Fcfs | PutStrategy::Lcfs | PutStrategy::Random => 0.0,
        PutStrategy::PriorityFcfs | PutStrategy::PriorityLcfs | PutStrategy::PreemptivePriority => {
            -f64::from(priority)
        }
        PutStrategy::Sjf => demand.unwrap_or(0.0),
        PutStrategy::Ljf => -demand.unwrap_or(0.0),
        PutStrategy::Sept => expected.map_or(0.0, |d| d.expect(1)),
        PutStrategy::Lept => -expected.map_or(0.0, |d| d.expect(1)),
    }
}

/// Inserts `entry` following `strategy`.
pub(super) fn insert(
    buffer: &mut VecDeque<Buffered>,
    entry: Buffered,
    strategy: PutStrategy,
    rng: &mut dyn RandomSource,
) {
    let position = match strategy {
        PutStrategy::Fcfs => buffer.len(),
        PutStrategy::Lcfs => 0,
        PutStrategy::Random => uniform_index(rng, buffer.len() + 1),
        PutStrategy::PriorityLcfs => head_of_group(buffer, entry.key),
        PutStrategy::PriorityFcfs
        | PutStrategy::PreemptivePriority
        | PutStrategy::Sjf
        | PutStrategy::Ljf
        | PutStrategy::Sept
        | PutStrategy::Lept => buffer
            .iter()
            .position(|b| b.key > entry.key)
            .unwrap_or(buffer.len()),
    };
    buffer.insert(position, entry);
}

/// Position ahead of every entry whose key is not smaller than `key`.
pub(super) fn head_of_group(buffer: &VecDeque<Buffered>, key: f64) -> usize {
    buffer
        .iter()
        .position(|b| b.key >= key)
        .unwrap_or(buffer.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SequenceRandom;

    fn entry(id: u64, key: f64) -> Buffered {
        Buffered {
            job: JobId(id),
            class: ClassId(0),
            key,
        }
    }

    fn order(buffer: &VecDeque<Buffered>) -> Vec<u64> {
        buffer.iter().map(|b| b.job.0).collect()
    }

    #[test]
    fn test_priority_fcfs_goes_behind_equal_priority() {
        let mut rng = SequenceRandom::new(vec![0.5]);
        let mut buffer = VecDeque::new();
        for (id, priority) in [(1, 1), (2, 5), (3, 1), (4, 5)] {
            let key = order_key(PutStrategy::PriorityFcfs, priority, None, None);
            insert(&mut buffer, entry(id, key), PutStrategy::PriorityFcfs, &mut rng);
        }
        assert_eq!(order(&buffer), vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_priority_lcfs_goes_ahead_of_equal_priority() {
        let mut rng = SequenceRandom::new(vec![0.5]);
        let mut buffer = VecDeque::new();
        for (id, priority) in [(1, 1), (2, 5), (3, 1), (4, 5)] {
            let key = order_key(PutStrategy::PriorityLcfs, priority, None, None);
            insert(&mut buffer, entry(id, key), PutStrategy::PriorityLcfs, &mut rng);
        }
        assert_eq!(order(&buffer), vec![4, 2, 3, 1]);
    }

    #[test]
    fn test_sjf_orders_by_sampled_demand() {
        let mut rng = SequenceRandom::new(vec![0.5]);
        let mut buffer = VecDeque::new();
        for (id, demand) in [(1, 3.0), (2, 1.0), (3, 2.0)] {
            let key = order_key(PutStrategy::Sjf, 0, Some(demand), None);
            insert(&mut buffer, entry(id, key), PutStrategy::Sjf, &mut rng);
        }
        assert_eq!(order(&buffer), vec![2, 3, 1]);
    }

    #[test]
    fn test_lcfs_and_random() {
        let mut rng = SequenceRandom::new(vec![0.0]);
        let mut buffer = VecDeque::new();
        insert(&mut buffer, entry(1, 0.0), PutStrategy::Lcfs, &mut rng);
        insert(&mut buffer, entry(2, 0.0), PutStrategy::Lcfs, &mut rng);
        insert(&mut buffer, entry(3, 0.0), PutStrategy::Random, &mut rng);
        assert_eq!(order(&buffer), vec![3, 2, 1]);
    }
}
