//! Admission-controlled waiting line.
//!
//! The queue counts a job as resident from admission until its output
//! section reports `Departed`, so capacity covers jobs waiting, in service
//! and blocked after service. Jobs are handed to the service section one
//! per `Ready` credit.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::context::Kernel;
use crate::distribution::{Distribution, ServiceStrategy};
use crate::error::{ConfigError, Result};
use crate::event::{Address, Event, Handled, Message, SectionKind};
use crate::job::{ClassId, ClassMask, JobId};
use crate::registry::{DropReason, JobRegistry};
use crate::scheduler::EventToken;
use crate::stats::Measure;
use crate::Time;

use super::Admits;
use super::put::{self, Buffered, PutStrategy};

/// What happens to a job arriving at a full queue.
#[derive(Debug, Clone)]
pub enum DropRule {
    /// The job is lost.
    Drop,
    /// The sender is not acknowledged until the job is admitted.
    Block,
    /// The job waits outside the queue; the sender is released.
    Wait,
    /// The job retries after a random delay, at most `max_attempts` times.
    Retrial {
        delay: Distribution,
        max_attempts: Option<u32>,
    },
}

/// Probability of refusing to join, by queue length.
#[derive(Debug, Clone)]
pub struct Balking {
    /// `(from_length, probability)` rows sorted by length.
    pub thresholds: Vec<(usize, f64)>,
}

impl Balking {
    fn probability(&self, queue_length: usize) -> f64 {
        let row = self
            .thresholds
            .partition_point(|(from, _)| *from <= queue_length);
        if row == 0 {
            0.0
        } else {
            self.thresholds[row - 1].1
        }
    }
}

/// Admission settings of a queue. Per-class vectors are indexed by class.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: Option<usize>,
    pub class_capacity: Vec<Option<usize>>,
    pub put: Vec<PutStrategy>,
    pub drop_rules: Vec<DropRule>,
    pub balking: Vec<Option<Balking>>,
    pub patience: Vec<Option<Distribution>>,
}

impl QueueConfig {
    /// Unbounded FCFS queue.
    pub fn infinite(classes: usize) -> Self {
        Self {
            capacity: None,
            class_capacity: vec![None; classes],
            put: vec![PutStrategy::Fcfs; classes],
            drop_rules: vec![DropRule::Drop; classes],
            balking: vec![None; classes],
            patience: vec![None; classes],
        }
    }

    /// FCFS queue holding at most `capacity` jobs with one drop rule for all
    /// classes.
    pub fn finite(classes: usize, capacity: usize, rule: DropRule) -> Self {
        Self {
            capacity: Some(capacity),
            drop_rules: vec![rule; classes],
            ..Self::infinite(classes)
        }
    }

    pub fn with_put(mut self, class: ClassId, strategy: PutStrategy) -> Self {
        self.put[class.0] = strategy;
        self
    }

    pub fn with_patience(mut self, class: ClassId, patience: Distribution) -> Self {
        self.patience[class.0] = Some(patience);
        self
    }

    pub fn with_balking(mut self, class: ClassId, balking: Balking) -> Self {
        self.balking[class.0] = Some(balking);
        self
    }

    pub fn with_class_capacity(mut self, class: ClassId, capacity: usize) -> Self {
        self.class_capacity[class.0] = Some(capacity);
        self
    }

    /// # Errors
    ///
    /// - `ConfigError::ClassArity` - If a per-class vector has the wrong length
    /// - `ConfigError::InvalidStation` - If a balking probability is outside [0, 1]
    /// - `ConfigError::InvalidDistribution` - If a retrial or patience delay is invalid
    pub fn validate(&self, node: &str, classes: usize) -> std::result::Result<(), ConfigError> {
        for (what, actual) in [
            ("class capacities", self.class_capacity.len()),
            ("put strategies", self.put.len()),
            ("drop rules", self.drop_rules.len()),
            ("balking", self.balking.len()),
            ("patience", self.patience.len()),
        ] {
            if actual != classes {
                return Err(ConfigError::ClassArity {
                    context: format!("{what} at {node}"),
                    expected: classes,
                    actual,
                });
            }
        }
        let bad_balking = self.balking.iter().flatten().any(|b| {
            b.thresholds.windows(2).any(|w| w[0].0 >= w[1].0)
                || b.thresholds.iter().any(|(_, p)| !(0.0..=1.0).contains(p))
        });
        if bad_balking {
            return Err(ConfigError::InvalidStation {
                node: node.to_string(),
                reason: "balking thresholds must be sorted with probabilities in [0, 1]".into(),
            });
        }
        for rule in &self.drop_rules {
            if let DropRule::Retrial { delay, .. } = rule {
                delay.validate()?;
            }
        }
        self.patience.iter().flatten().try_for_each(Distribution::validate)
    }
}

#[derive(Debug, Clone, Copy)]
struct Waiting {
    job: JobId,
    /// Sender still owed an acknowledgement (blocking rule).
    ack_to: Option<Address>,
}

/// Input section of a queueing station.
pub struct QueueInput {
    config: QueueConfig,
    /// Demand distributions of the service section, for SJF-family keys.
    demand: Vec<Option<Distribution>>,
    registry: JobRegistry,
    buffer: VecDeque<Buffered>,
    waiting: VecDeque<Waiting>,
    patience: HashMap<JobId, EventToken>,
    credit: Option<ClassMask>,
    preempting: Option<JobId>,
}

impl QueueInput {
    pub fn new(config: QueueConfig, demand: Vec<Option<Distribution>>, classes: usize) -> Self {
        Self {
            config,
            demand,
            registry: JobRegistry::new("queue", classes),
            buffer: VecDeque::new(),
            waiting: VecDeque::new(),
            patience: HashMap::new(),
            credit: None,
            preempting: None,
        }
    }

    /// Jobs waiting to be handed to the service section.
    pub fn queue_length(&self) -> usize {
        self.buffer.len()
    }

    /// Jobs waiting outside the queue for capacity.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Files a resident job under its new class. Buffered entries follow
    /// so the get strategy sees the new class too.
    ///
    /// # Errors
    ///
    /// Propagates registry failures.
    pub fn switch_class(&mut self, job: JobId, to: ClassId, now: Time) -> Result<()> {
        if self.registry.contains(job) {
            self.registry.switch_class(job, to, now)?;
        }
        if let Some(entry) = self.buffer.iter_mut().find(|b| b.job == job) {
            entry.class = to;
        }
        Ok(())
    }

    fn has_room(&self, class: ClassId) -> bool {
        let total_ok = self
            .config
            .capacity
            .is_none_or(|capacity| self.registry.len() < capacity);
        let class_ok = self.config.class_capacity[class.0]
            .is_none_or(|capacity| self.registry.class_len(class) < capacity);
        total_ok && class_ok
    }

    fn balks(&self, kernel: &mut Kernel<'_>, class: ClassId) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        match &self.config.balking[class.0] {
            Some(balking) => {
                let p = balking.probability(self.buffer.len());
                p > 0.0 && kernel.rng.raw() < p
            }
            None => false,
        }
    }

    /// Handles a job offered by `source` (or retrying from orbit when `None`).
    fn arrive(&mut self, kernel: &mut Kernel<'_>, job: JobId, source: Option<Address>) -> Result<()> {
        let class = kernel.class_of(job)?;

        if self.balks(kernel, class) {
            if let Some(source) = source {
                kernel.send(source, Event::Ack(job))?;
            }
            debug!(node = kernel.node().0, job = job.0, "balked");
            return kernel.destroy_job(job, DropReason::Balked);
        }

        if self.has_room(class) {
            kernel.enter_node(job)?;
            if let Some(source) = source {
                kernel.send(source, Event::Ack(job))?;
            }
            return self.admit(kernel, job, class);
        }

        match self.config.drop_rules[class.0].clone() {
            DropRule::Drop => {
                if let Some(source) = source {
                    kernel.send(source, Event::Ack(job))?;
                }
                debug!(node = kernel.node().0, job = job.0, "dropped at full queue");
                kernel.destroy_job(job, DropReason::Dropped)
            }
            DropRule::Block => {
                kernel.enter_node(job)?;
                self.waiting.push_back(Waiting { job, ack_to: source });
                Ok(())
            }
            DropRule::Wait => {
                kernel.enter_node(job)?;
                if let Some(source) = source {
                    kernel.send(source, Event::Ack(job))?;
                }
                self.waiting.push_back(Waiting { job, ack_to: None });
                Ok(())
            }
            DropRule::Retrial {
                delay,
                max_attempts,
            } => {
                if let Some(source) = source {
                    kernel.send(source, Event::Ack(job))?;
                }
                let attempts = kernel.jobs.get(job)?.retrials;
                if max_attempts.is_some_and(|max| attempts >= max) {
                    return kernel.destroy_job(job, DropReason::RetrialsExhausted);
                }
                kernel.jobs.get_mut(job)?.retrials += 1;
                let node = kernel.node();
                let now = kernel.now;
                kernel
                    .registry
                    .node_mut(node)
                    .move_to_retrial_orbit(job, class, now)?;
                let wait = delay.wait(kernel.rng, kernel.registry.node(node).len());
                kernel.schedule_self(Event::Retrial(job), wait)?;
                Ok(())
            }
        }
    }

    /// Places an admitted job in the buffer.
    fn admit(&mut self, kernel: &mut Kernel<'_>, job: JobId, class: ClassId) -> Result<()> {
        self.registry.add(job, class, kernel.now)?;

        let strategy = self.config.put[class.0];
        let demand = if strategy.samples_demand() {
            let population = kernel.population();
            let sampled = self.demand[class.0]
                .as_ref()
                .map(|d| d.wait(kernel.rng, population));
            kernel.jobs.get_mut(job)?.service_demand = sampled;
            sampled
        } else {
            None
        };
        let key = put::order_key(
            strategy,
            kernel.priority_of(class),
            demand,
            self.demand[class.0].as_ref(),
        );
        put::insert(&mut self.buffer, Buffered { job, class, key }, strategy, kernel.rng);

        if let Some(patience) = &self.config.patience[class.0] {
            let wait = patience.wait(kernel.rng, self.registry.len());
            let token = kernel.schedule_self(Event::Renege(job), wait)?;
            self.patience.insert(job, token);
        }
        kernel.record_at(Measure::QueueLength, Some(class), self.buffer.len() as f64, 1.0);

        let can_forward = self.credit.as_ref().is_some_and(|mask| mask.contains(class));
        if !can_forward && strategy.is_preemptive() && self.preempting.is_none() {
            return self.request_preemption(kernel, job);
        }
        self.forward(kernel)
    }

    fn request_preemption(&mut self, kernel: &mut Kernel<'_>, job: JobId) -> Result<()> {
        let Some(position) = self.buffer.iter().position(|b| b.job == job) else {
            return Ok(());
        };
        // Only the head of the line may preempt.
        if position != 0 {
            return Ok(());
        }
        self.buffer.remove(position);
        if let Some(token) = self.patience.remove(&job) {
            kernel.cancel(token);
        }
        self.preempting = Some(job);
        kernel.send_local(SectionKind::Service, Event::PreemptRequest(job))
    }

    /// Hands the first eligible buffered job to the service section.
    fn forward(&mut self, kernel: &mut Kernel<'_>) -> Result<()> {
        let Some(mask) = &self.credit else {
            return Ok(());
        };
        let Some(position) = self.buffer.iter().position(|b| mask.contains(b.class)) else {
            return Ok(());
        };
        let Some(entry) = self.buffer.remove(position) else {
            return Ok(());
        };
        self.credit = None;
        if let Some(token) = self.patience.remove(&entry.job) {
            kernel.cancel(token);
        }
        kernel.send_local(SectionKind::Service, Event::Job(entry.job))
    }

    /// Admits waiting jobs while there is room.
    fn admit_waiting(&mut self, kernel: &mut Kernel<'_>) -> Result<()> {
        let mut index = 0;
        while index < self.waiting.len() {
            let candidate = self.waiting[index];
            let class = kernel.class_of(candidate.job)?;
            if !self.has_room(class) {
                index += 1;
                continue;
            }
            self.waiting.remove(index);
            if let Some(source) = candidate.ack_to {
                kernel.send(source, Event::Ack(candidate.job))?;
            }
            self.admit(kernel, candidate.job, class)?;
        }
        Ok(())
    }

    fn renege(&mut self, kernel: &mut Kernel<'_>, job: JobId) -> Result<()> {
        self.patience.remove(&job);
        let Some(position) = self.buffer.iter().position(|b| b.job == job) else {
            return Ok(());
        };
        self.buffer.remove(position);
        self.registry.renege(job, kernel.now)?;
        debug!(node = kernel.node().0, job = job.0, "reneged");
        kernel.destroy_job(job, DropReason::Reneged)?;
        self.admit_waiting(kernel)?;
        self.forward(kernel)
    }
}

impl Admits for QueueInput {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Start => Ok(Handled::Consumed),
            Event::Job(job) => {
                self.arrive(kernel, *job, Some(message.source))?;
                Ok(Handled::Consumed)
            }
            Event::Retrial(job) => {
                let node = kernel.node();
                kernel.registry.node_mut(node).retry(*job)?;
                kernel.record_at(Measure::Retried, kernel.jobs.class_of(*job).ok(), 1.0, 1.0);
                self.arrive(kernel, *job, None)?;
                Ok(Handled::Consumed)
            }
            Event::Ready(mask) => {
                self.credit = Some(mask.clone());
                self.forward(kernel)?;
                self.admit_waiting(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::Departed(job) => {
                if self.registry.contains(*job) {
                    self.registry.remove(*job, kernel.now)?;
                }
                self.admit_waiting(kernel)?;
                self.forward(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::Renege(job) => {
                self.renege(kernel, *job)?;
                Ok(Handled::Consumed)
            }
            Event::Preempted(victim) => {
                // The preempting job is now in service.
                self.preempting = None;
                let class = kernel.class_of(*victim)?;
                let key = put::order_key(
                    PutStrategy::PreemptivePriority,
                    kernel.priority_of(class),
                    None,
                    None,
                );
                let position = put::head_of_group(&self.buffer, key);
                self.buffer.insert(
                    position,
                    Buffered {
                        job: *victim,
                        class,
                        key,
                    },
                );
                kernel.record_at(Measure::Preempted, Some(class), 1.0, 1.0);
                self.forward(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::Bounced(job) => {
                self.preempting = None;
                let class = kernel.class_of(*job)?;
                let strategy = self.config.put[class.0];
                let key = put::order_key(strategy, kernel.priority_of(class), None, None);
                put::insert(&mut self.buffer, Buffered { job: *job, class, key }, strategy, kernel.rng);
                self.forward(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::Ack(_)
            | Event::PreemptRequest(_)
            | Event::ServiceDone(_)
            | Event::SetupDone(_)
            | Event::PowerDown { .. }
            | Event::PsCompletion
            | Event::Arrival(_)
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

    fn resident(&self) -> usize {
        self.registry.len()
    }

    fn capacity(&self) -> Option<usize> {
        self.config.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balking_probability_by_length() {
        let balking = Balking {
            thresholds: vec![(2, 0.5), (4, 1.0)],
        };
        assert_eq!(balking.probability(1), 0.0);
        assert_eq!(balking.probability(2), 0.5);
        assert_eq!(balking.probability(3), 0.5);
        assert_eq!(balking.probability(9), 1.0);
    }

    #[test]
    fn test_finite_config_sets_rules() {
        let config = QueueConfig::finite(2, 3, DropRule::Block);
        assert_eq!(config.capacity, Some(3));
        assert!(matches!(config.drop_rules[1], DropRule::Block));
        assert_eq!(config.put, vec![PutStrategy::Fcfs; 2]);
    }

    #[test]
    fn test_unsorted_balking_rejected() {
        let config = QueueConfig::infinite(1).with_balking(
            ClassId(0),
            Balking {
                thresholds: vec![(4, 0.5), (2, 1.0)],
            },
        );
        assert!(matches!(
            config.validate("q", 1),
            Err(ConfigError::InvalidStation { .. })
        ));
        assert!(matches!(
            QueueConfig::infinite(1).validate("q", 2),
            Err(ConfigError::ClassArity { expected: 2, .. })
        ));
    }
}
