//! Processor-sharing service with weighted and prioritised variants.
//!
//! Server capacity is spread over the resident classes by water-filling:
//! each class receives capacity in proportion to its weight, never more
//! than one unit per job, and the surplus of saturated classes flows to
//! the rest. Jobs of a class share their class allocation equally.

use std::collections::BTreeMap;

use tracing::trace;

use crate::context::Kernel;
use crate::distribution::{Distribution, ServiceStrategy};
use crate::error::{ConfigError, KernelError, Result};
use crate::event::{Event, Handled, Message, SectionKind};
use crate::job::{ClassId, ClassMask, JobId};
use crate::scheduler::EventToken;
use crate::stats::Measure;
use crate::Time;

use super::Serves;

/// Residual work below this counts as finished.
const COMPLETION_TOLERANCE: f64 = 1e-9;

/// Capacity sharing discipline. Weight vectors are indexed by class.
#[derive(Debug, Clone, PartialEq)]
pub enum PsPolicy {
    /// Generalised PS: class share proportional to its weight.
    Gps(Vec<f64>),
    /// Discriminatory PS: share proportional to weight times population.
    Dps(Vec<f64>),
    /// Higher-priority classes are served first; weights apply within a
    /// priority level.
    PriorityPs(Vec<f64>),
}

impl PsPolicy {
    /// Equal shares for every resident class, whatever its population.
    /// Use `Dps` with unit weights for an equal share per job.
    pub fn egalitarian(classes: usize) -> Self {
        PsPolicy::Gps(vec![1.0; classes])
    }

    fn weights(&self) -> &[f64] {
        match self {
            PsPolicy::Gps(w) | PsPolicy::Dps(w) | PsPolicy::PriorityPs(w) => w,
        }
    }
}

/// A pool of unit-rate processors serving a subset of classes.
#[derive(Debug, Clone)]
pub struct PsType {
    pub units: u32,
    pub compatible: ClassMask,
}

#[derive(Debug, Clone)]
pub struct PsConfig {
    pub types: Vec<PsType>,
    pub service: Vec<Option<Distribution>>,
    pub policy: PsPolicy,
}

impl PsConfig {
    /// `units` processors shared equally by the resident classes.
    pub fn egalitarian(units: u32, service: Vec<Option<Distribution>>) -> Self {
        let classes = service.len();
        Self {
            types: vec![PsType {
                units,
                compatible: ClassMask::all(classes),
            }],
            policy: PsPolicy::egalitarian(classes),
            service,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.types.iter().map(|t| f64::from(t.units)).sum()
    }

    /// # Errors
    ///
    /// - `ConfigError::ClassArity` - If a per-class vector has the wrong length
    /// - `ConfigError::InvalidStation` - If a weight is not positive
    pub fn validate(&self, node: &str, classes: usize) -> std::result::Result<(), ConfigError> {
        let weights = self.policy.weights();
        for (context, actual) in [
            ("ps service", self.service.len()),
            ("ps weights", weights.len()),
        ] {
            if actual != classes {
                return Err(ConfigError::ClassArity {
                    context: format!("{context} at {node}"),
                    expected: classes,
                    actual,
                });
            }
        }
        if let Some(w) = weights.iter().find(|w| !(**w > 0.0 && w.is_finite())) {
            return Err(ConfigError::InvalidStation {
                node: node.to_string(),
                reason: format!("processor-sharing weight {w} must be positive"),
            });
        }
        Ok(())
    }
}

/// Water-fills `capacity` over `classes`, each capped at `caps[c]`, in
/// proportion to `weights[c]`. Adds the result to `alloc`.
fn water_fill(capacity: f64, classes: &[usize], weights: &[f64], caps: &[f64], alloc: &mut [f64]) -> f64 {
    let mut remaining = capacity;
    let mut active: Vec<usize> = classes
        .iter()
        .copied()
        .filter(|c| caps[*c] - alloc[*c] > 0.0 && weights[*c] > 0.0)
        .collect();

    while remaining > 0.0 && !active.is_empty() {
        let total: f64 = active.iter().map(|c| weights[*c]).sum();
        let saturated: Vec<usize> = active
            .iter()
            .copied()
            .filter(|c| remaining * weights[*c] / total >= caps[*c] - alloc[*c])
            .collect();
        if saturated.is_empty() {
            for c in &active {
                alloc[*c] += remaining * weights[*c] / total;
            }
            remaining = 0.0;
            break;
        }
        for c in &saturated {
            remaining -= caps[*c] - alloc[*c];
            alloc[*c] = caps[*c];
        }
        remaining = remaining.max(0.0);
        active.retain(|c| !saturated.contains(c));
    }
    capacity - remaining
}

/// Capacity allocated to each class given the number of resident jobs per
/// class. A class never receives more than one unit per job.
pub fn allocate_rates(policy: &PsPolicy, types: &[PsType], counts: &[usize], priorities: &[i32]) -> Vec<f64> {
    let classes = counts.len();
    let caps: Vec<f64> = counts.iter().map(|n| *n as f64).collect();
    let base = policy.weights();
    let weights: Vec<f64> = match policy {
        PsPolicy::Dps(w) => w.iter().zip(counts).map(|(w, n)| w * *n as f64).collect(),
        PsPolicy::Gps(_) | PsPolicy::PriorityPs(_) => base.to_vec(),
    };
    let mut alloc = vec![0.0; classes];

    for server_type in types {
        let compatible: Vec<usize> = (0..classes)
            .filter(|c| counts[*c] > 0 && server_type.compatible.contains(ClassId(*c)))
            .collect();
        let mut capacity = f64::from(server_type.units);
        match policy {
            PsPolicy::Gps(_) | PsPolicy::Dps(_) => {
                water_fill(capacity, &compatible, &weights, &caps, &mut alloc);
            }
            PsPolicy::PriorityPs(_) => {
                let mut levels: Vec<i32> = compatible.iter().map(|c| priorities[*c]).collect();
                levels.sort_unstable_by(|a, b| b.cmp(a));
                levels.dedup();
                for level in levels {
                    if capacity <= 0.0 {
                        break;
                    }
                    let members: Vec<usize> = compatible
                        .iter()
                        .copied()
                        .filter(|c| priorities[*c] == level)
                        .collect();
                    capacity -= water_fill(capacity, &members, &weights, &caps, &mut alloc);
                }
            }
        }
    }
    alloc
}

#[derive(Debug, Clone, Copy)]
struct Sharing {
    class: ClassId,
    demand: f64,
    residual: f64,
}

/// Service section sharing its capacity among all resident jobs.
pub struct PsServer {
    config: PsConfig,
    jobs: BTreeMap<JobId, Sharing>,
    alloc: Vec<f64>,
    last_update: Time,
    completion: Option<(EventToken, JobId)>,
}

impl PsServer {
    pub fn new(config: PsConfig) -> Self {
        let classes = config.service.len();
        Self {
            config,
            jobs: BTreeMap::new(),
            alloc: vec![0.0; classes],
            last_update: 0.0,
            completion: None,
        }
    }

    /// Jobs currently sharing the processors.
    pub fn sharing(&self) -> usize {
        self.jobs.len()
    }

    /// Current per-job service rate of `class`.
    pub fn rate(&self, class: ClassId) -> f64 {
        let n = self.jobs.values().filter(|s| s.class == class).count();
        if n == 0 { 0.0 } else { self.alloc[class.0] / n as f64 }
    }

    pub fn residual(&self, job: JobId) -> Option<f64> {
        self.jobs.get(&job).map(|s| s.residual)
    }

    fn advance(&mut self, now: Time) {
        let elapsed = now - self.last_update;
        if elapsed > 0.0 {
            let rates: Vec<f64> = (0..self.alloc.len()).map(|c| self.rate(ClassId(c))).collect();
            for sharing in self.jobs.values_mut() {
                sharing.residual -= rates[sharing.class.0] * elapsed;
            }
        }
        self.last_update = now;
    }

    fn reallocate(&mut self, kernel: &mut Kernel<'_>) -> Result<()> {
        let classes = self.alloc.len();
        let mut counts = vec![0usize; classes];
        for sharing in self.jobs.values() {
            counts[sharing.class.0] += 1;
        }
        let priorities: Vec<i32> = (0..classes).map(|c| kernel.priority_of(ClassId(c))).collect();
        self.alloc = allocate_rates(&self.config.policy, &self.config.types, &counts, &priorities);

        let total: f64 = self.alloc.iter().sum();
        if kernel.config.check_rate_bounds && total > self.config.capacity() + kernel.config.tie_epsilon {
            return Err(KernelError::invariant(
                kernel.here.node,
                format!("allocated rate {total} exceeds capacity {}", self.config.capacity()),
            ));
        }
        kernel.set_busy(total);
        Ok(())
    }

    /// Schedules the next completion under the current rates.
    fn reschedule(&mut self, kernel: &mut Kernel<'_>) -> Result<()> {
        if let Some((token, _)) = self.completion.take() {
            kernel.cancel(token);
        }
        self.reallocate(kernel)?;
        let next = self
            .jobs
            .iter()
            .filter_map(|(id, s)| {
                let rate = self.rate(s.class);
                (rate > 0.0).then(|| (s.residual.max(0.0) / rate, *id))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        if let Some((delay, job)) = next {
            let token = kernel.schedule_self(Event::PsCompletion, delay)?;
            self.completion = Some((token, job));
        }
        Ok(())
    }

    fn complete(&mut self, kernel: &mut Kernel<'_>, job: JobId, sharing: Sharing) -> Result<()> {
        let record = kernel.jobs.get_mut(job)?;
        record.total_service += sharing.demand;
        let response = kernel.now - record.node_enter;
        kernel.record_at(Measure::ResponseTime, Some(sharing.class), response, 1.0);
        trace!(node = kernel.node().0, job = job.0, "ps completion");
        kernel.send_local(SectionKind::Output, Event::Job(job))
    }
}

impl Serves for PsServer {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Start => {
                let node = kernel.node();
                kernel.loads.set_servers(node, self.config.capacity());
                self.last_update = kernel.now;
                super::passthrough::ready_all(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::Job(job) => {
                self.advance(kernel.now);
                let class = kernel.class_of(*job)?;
                let population = kernel.population();
                let assigned = kernel.jobs.get_mut(*job)?.service_demand.take();
                let demand = match assigned {
                    Some(demand) => demand,
                    None => self.config.service[class.0]
                        .as_ref()
                        .map_or(0.0, |d| d.wait(kernel.rng, population)),
                };
                kernel.jobs.get_mut(*job)?.service_start = Some(kernel.now);
                self.jobs.insert(
                    *job,
                    Sharing {
                        class,
                        demand,
                        residual: demand,
                    },
                );
                self.reschedule(kernel)?;
                super::passthrough::ready_all(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::PsCompletion => {
                self.advance(kernel.now);
                let forced = self.completion.take().map(|(_, job)| job);
                let finished: Vec<JobId> = self
                    .jobs
                    .iter()
                    .filter(|(id, s)| s.residual <= COMPLETION_TOLERANCE || Some(**id) == forced)
                    .map(|(id, _)| *id)
                    .collect();
                for job in finished {
                    if let Some(sharing) = self.jobs.remove(&job) {
                        self.complete(kernel, job, sharing)?;
                    }
                }
                self.reschedule(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::Ack(_) => Ok(Handled::Consumed),
            Event::Ready(_)
            | Event::Departed(_)
            | Event::PreemptRequest(_)
            | Event::Preempted(_)
            | Event::Bounced(_)
            | Event::ServiceDone(_)
            | Event::SetupDone(_)
            | Event::PowerDown { .. }
            | Event::Arrival(_)
            | Event::Renege(_)
            | Event::Retrial(_)
            | Event::JoinDone { .. }
            | Event::JobChange { .. }
            | Event::Enabling { .. }
            | Event::ModeFiring { .. }
            | Event::Timing { .. }
            | Event::JobRequest { .. }
            | Event::JobWithdrawn { .. }
            | Event::Restore { .. }
            | Event::Firing { .. } => Ok(Handled::NotConsumed),
        }
    }

    fn busy_units(&self) -> f64 {
        self.alloc.iter().sum()
    }

    fn total_units(&self) -> Option<f64> {
        Some(self.config.capacity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Address;
    use crate::job::NodeId;
    use crate::section::testing::Harness;
    use crate::topology::NodeKind;
    use proptest::prelude::*;

    fn single(units: u32, classes: usize) -> Vec<PsType> {
        vec![PsType {
            units,
            compatible: ClassMask::all(classes),
        }]
    }

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn test_gps_splits_by_weight() {
        let alloc = allocate_rates(&PsPolicy::Gps(vec![2.0, 1.0]), &single(3, 2), &[5, 5], &[0, 0]);
        assert!(close(&alloc, &[2.0, 1.0]));
    }

    #[test]
    fn test_dps_scales_with_population() {
        let alloc = allocate_rates(&PsPolicy::Dps(vec![1.0, 1.0]), &single(2, 2), &[3, 1], &[0, 0]);
        assert!(close(&alloc, &[1.5, 0.5]));
    }

    #[test]
    fn test_egalitarian_splits_by_class_not_population() {
        let alloc = allocate_rates(&PsPolicy::egalitarian(2), &single(1, 2), &[2, 1], &[0, 0]);
        assert!(close(&alloc, &[0.5, 0.5]));
    }

    #[test]
    fn test_saturated_class_surplus_flows_on() {
        // Class 0 has a single job, so it cannot use more than one unit.
        let alloc = allocate_rates(&PsPolicy::Gps(vec![10.0, 1.0]), &single(4, 2), &[1, 5], &[0, 0]);
        assert!(close(&alloc, &[1.0, 3.0]));
    }

    #[test]
    fn test_priority_ps_serves_high_priority_first() {
        let alloc = allocate_rates(
            &PsPolicy::PriorityPs(vec![1.0, 1.0]),
            &single(3, 2),
            &[1, 5],
            &[1, 0],
        );
        assert!(close(&alloc, &[1.0, 2.0]));
    }

    #[test]
    fn test_incompatible_types_are_skipped() {
        let types = vec![
            PsType {
                units: 2,
                compatible: ClassMask::from_bits(vec![true, false]),
            },
            PsType {
                units: 1,
                compatible: ClassMask::from_bits(vec![true, true]),
            },
        ];
        let alloc = allocate_rates(&PsPolicy::Gps(vec![1.0, 1.0]), &types, &[4, 4], &[0, 0]);
        assert!(close(&alloc, &[2.5, 0.5]));
    }

    #[test]
    fn test_two_jobs_share_one_processor() {
        let mut h = Harness::chain(&[NodeKind::Queue], 1);
        let here = Address::service(NodeId(0));
        let mut ps = PsServer::new(PsConfig::egalitarian(1, vec![Some(Distribution::Deterministic(2.0))]));

        let a = h.job_at(ClassId(0), NodeId(0));
        let b = h.job_at(ClassId(0), NodeId(0));
        for job in [a, b] {
            let msg = h.message(Event::Job(job), Address::input(NodeId(0)), here);
            ps.handle(&mut h.kernel(here), &msg).unwrap();
        }
        assert!((ps.rate(ClassId(0)) - 0.5).abs() < 1e-12);
        h.drain_now();

        // Both finish together after four time units.
        let completion = h.next().unwrap();
        assert_eq!(completion.event, Event::PsCompletion);
        assert!((h.now() - 4.0).abs() < 1e-9);
        ps.handle(&mut h.kernel(here), &completion).unwrap();
        let outputs: Vec<_> = h
            .drain_events()
            .into_iter()
            .filter(|(to, _)| *to == Address::output(NodeId(0)))
            .collect();
        assert_eq!(outputs.len(), 2);
        assert_eq!(ps.sharing(), 0);
    }

    proptest! {
        #[test]
        fn prop_allocation_within_bounds(
            counts in prop::collection::vec(0usize..6, 3),
            weights in prop::collection::vec(0.1f64..5.0, 3),
            units in 1u32..5,
            dps in any::<bool>(),
        ) {
            let policy = if dps { PsPolicy::Dps(weights) } else { PsPolicy::Gps(weights) };
            let alloc = allocate_rates(&policy, &single(units, 3), &counts, &[0, 0, 0]);
            let total: f64 = alloc.iter().sum();
            let demand: usize = counts.iter().sum();

            prop_assert!(total <= f64::from(units) + 1e-9);
            for (a, n) in alloc.iter().zip(&counts) {
                prop_assert!(*a >= 0.0);
                prop_assert!(*a <= *n as f64 + 1e-9);
            }
            // Work conserving: capacity idles only when every job runs at full rate.
            let expected = f64::from(units).min(demand as f64);
            prop_assert!((total - expected).abs() < 1e-9);
        }

        #[test]
        fn prop_egalitarian_share_ignores_population(
            counts in prop::collection::vec(0usize..20, 2),
        ) {
            let alloc = allocate_rates(&PsPolicy::egalitarian(2), &single(1, 2), &counts, &[0, 0]);
            let present = counts.iter().filter(|n| **n > 0).count();

            for (a, n) in alloc.iter().zip(&counts) {
                let expected = if *n > 0 { 1.0 / present as f64 } else { 0.0 };
                prop_assert!((a - expected).abs() < 1e-14);
            }
            prop_assert!(alloc.iter().sum::<f64>() <= 1.0 + 1e-14);
        }
    }
}
