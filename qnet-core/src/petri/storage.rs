//! Place input: a capacitated token buffer.
//!
//! Tokens are ordinary jobs. They arrive from transition outputs and leave
//! only when a transition withdraws them; every change of content is
//! announced to the place's linkage section.

use std::collections::VecDeque;

use tracing::debug;

use crate::context::Kernel;
use crate::error::{ConfigError, Result};
use crate::event::{Address, Event, Handled, Message, SectionKind};
use crate::job::{ClassId, JobId};
use crate::registry::DropReason;
use crate::section::Admits;

/// What happens to a token arriving at a full place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageRule {
    #[default]
    Drop,
    /// The sending transition is not acknowledged until there is room.
    Block,
    /// The token waits outside the place; the sender is released.
    Wait,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub capacity: Option<usize>,
    pub class_capacity: Vec<Option<usize>>,
    pub rules: Vec<StorageRule>,
    /// Tokens per class present at start.
    pub initial: Vec<u32>,
}

impl StorageConfig {
    pub fn unbounded(classes: usize) -> Self {
        Self {
            capacity: None,
            class_capacity: vec![None; classes],
            rules: vec![StorageRule::Drop; classes],
            initial: vec![0; classes],
        }
    }

    pub fn with_initial(mut self, class: ClassId, tokens: u32) -> Self {
        self.initial[class.0] = tokens;
        self
    }

    pub fn with_capacity(mut self, capacity: usize, rule: StorageRule) -> Self {
        self.capacity = Some(capacity);
        self.rules.iter_mut().for_each(|r| *r = rule);
        self
    }

    /// # Errors
    ///
    /// - `ConfigError::ClassArity` - If a per-class vector has the wrong length
    /// - `ConfigError::InvalidStation` - If the initial marking exceeds capacity
    pub fn validate(&self, node: &str, classes: usize) -> std::result::Result<(), ConfigError> {
        for (what, actual) in [
            ("class capacities", self.class_capacity.len()),
            ("storage rules", self.rules.len()),
            ("initial marking", self.initial.len()),
        ] {
            if actual != classes {
                return Err(ConfigError::ClassArity {
                    context: format!("{what} at {node}"),
                    expected: classes,
                    actual,
                });
            }
        }
        let total: u32 = self.initial.iter().sum();
        let over_total = self.capacity.is_some_and(|c| total as usize > c);
        let over_class = self
            .initial
            .iter()
            .zip(&self.class_capacity)
            .any(|(n, cap)| cap.is_some_and(|c| *n as usize > c));
        if over_total || over_class {
            return Err(ConfigError::InvalidStation {
                node: node.to_string(),
                reason: "initial marking exceeds place capacity".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    job: JobId,
    ack_to: Option<Address>,
}

pub struct Storage {
    config: StorageConfig,
    tokens: Vec<VecDeque<JobId>>,
    waiting: VecDeque<Pending>,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Self {
        let classes = config.initial.len();
        Self {
            config,
            tokens: vec![VecDeque::new(); classes],
            waiting: VecDeque::new(),
        }
    }

    pub fn tokens(&self, class: ClassId) -> usize {
        self.tokens[class.0].len()
    }

    pub fn total(&self) -> usize {
        self.tokens.iter().map(VecDeque::len).sum()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    fn has_room(&self, class: ClassId) -> bool {
        self.config.capacity.is_none_or(|c| self.total() < c)
            && self.config.class_capacity[class.0].is_none_or(|c| self.tokens(class) < c)
    }

    fn announce(kernel: &mut Kernel<'_>, class: ClassId, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        kernel.send_local(SectionKind::Output, Event::JobChange { class, delta })
    }

    fn store(&mut self, kernel: &mut Kernel<'_>, job: JobId, class: ClassId) -> Result<()> {
        kernel.enter_node(job)?;
        self.tokens[class.0].push_back(job);
        Self::announce(kernel, class, 1)
    }

    fn arrive(&mut self, kernel: &mut Kernel<'_>, job: JobId, source: Address) -> Result<()> {
        let class = kernel.class_of(job)?;
        if self.has_room(class) {
            kernel.send(source, Event::Ack(job))?;
            return self.store(kernel, job, class);
        }
        match self.config.rules[class.0] {
            StorageRule::Drop => {
                kernel.send(source, Event::Ack(job))?;
                debug!(node = kernel.node().0, job = job.0, "token dropped at full place");
                kernel.destroy_job(job, DropReason::Dropped)
            }
            StorageRule::Block => {
                self.waiting.push_back(Pending {
                    job,
                    ack_to: Some(source),
                });
                Ok(())
            }
            StorageRule::Wait => {
                kernel.send(source, Event::Ack(job))?;
                self.waiting.push_back(Pending { job, ack_to: None });
                Ok(())
            }
        }
    }

    fn admit_waiting(&mut self, kernel: &mut Kernel<'_>) -> Result<()> {
        let mut index = 0;
        while index < self.waiting.len() {
            let pending = self.waiting[index];
            let class = kernel.class_of(pending.job)?;
            if !self.has_room(class) {
                index += 1;
                continue;
            }
            self.waiting.remove(index);
            if let Some(source) = pending.ack_to {
                kernel.send(source, Event::Ack(pending.job))?;
            }
            self.store(kernel, pending.job, class)?;
        }
        Ok(())
    }

    /// All-or-nothing withdrawal of `counts[class]` tokens, oldest first.
    fn withdraw(&mut self, kernel: &mut Kernel<'_>, counts: &[u32]) -> Result<Option<Vec<JobId>>> {
        let enough = counts
            .iter()
            .enumerate()
            .all(|(class, n)| self.tokens.get(class).is_some_and(|t| t.len() >= *n as usize));
        if !enough {
            return Ok(None);
        }
        let mut jobs = Vec::new();
        for (class, n) in counts.iter().enumerate() {
            for _ in 0..*n {
                if let Some(job) = self.tokens[class].pop_front() {
                    kernel.leave_node(job)?;
                    jobs.push(job);
                }
            }
            Self::announce(kernel, ClassId(class), -i64::from(*n))?;
        }
        Ok(Some(jobs))
    }

    fn restore(&mut self, kernel: &mut Kernel<'_>, jobs: &[JobId]) -> Result<()> {
        let mut restored = vec![0i64; self.tokens.len()];
        for job in jobs.iter().rev() {
            let class = kernel.class_of(*job)?;
            kernel.enter_node(*job)?;
            self.tokens[class.0].push_front(*job);
            restored[class.0] += 1;
        }
        for (class, delta) in restored.into_iter().enumerate() {
            Self::announce(kernel, ClassId(class), delta)?;
        }
        Ok(())
    }
}

impl Admits for Storage {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Start => {
                for class in 0..self.config.initial.len() {
                    for _ in 0..self.config.initial[class] {
                        let job = kernel.create_job(ClassId(class))?;
                        self.store(kernel, job, ClassId(class))?;
                    }
                }
                Ok(Handled::Consumed)
            }
            Event::Job(job) => {
                self.arrive(kernel, *job, message.source)?;
                Ok(Handled::Consumed)
            }
            Event::JobRequest { mode, counts } => {
                let withdrawn = self.withdraw(kernel, counts)?;
                let complete = withdrawn.is_some();
                kernel.send(
                    message.source,
                    Event::JobWithdrawn {
                        mode: *mode,
                        jobs: withdrawn.unwrap_or_default(),
                        complete,
                    },
                )?;
                if complete {
                    self.admit_waiting(kernel)?;
                }
                Ok(Handled::Consumed)
            }
            Event::Restore { jobs } => {
                self.restore(kernel, jobs)?;
                Ok(Handled::Consumed)
            }
            Event::Ready(_) | Event::Departed(_) => Ok(Handled::Consumed),
            Event::Ack(_)
            | Event::PreemptRequest(_)
            | Event::Preempted(_)
            | Event::Bounced(_)
            | Event::ServiceDone(_)
            | Event::SetupDone(_)
            | Event::PowerDown { .. }
            | Event::PsCompletion
            | Event::Arrival(_)
            | Event::Renege(_)
            | Event::Retrial(_)
            | Event::JoinDone { .. }
            | Event::JobChange { .. }
            | Event::Enabling { .. }
            | Event::ModeFiring { .. }
            | Event::Timing { .. }
            | Event::JobWithdrawn { .. }
            | Event::Firing { .. } => Ok(Handled::NotConsumed),
        }
    }

    fn resident(&self) -> usize {
        self.total()
    }

    fn capacity(&self) -> Option<usize> {
        self.config.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NodeId;
    use crate::section::testing::Harness;
    use crate::topology::NodeKind;

    const PLACE: NodeId = NodeId(0);

    fn started(config: StorageConfig) -> (Harness, Storage) {
        let mut h = Harness::chain(&[NodeKind::Place, NodeKind::Transition], 2);
        let mut storage = Storage::new(config);
        let here = Address::input(PLACE);
        let start = h.message(Event::Start, here, here);
        storage.handle(&mut h.kernel(here), &start).unwrap();
        h.drain_now();
        (h, storage)
    }

    fn request(h: &mut Harness, storage: &mut Storage, counts: Vec<u32>) -> Event {
        let here = Address::input(PLACE);
        let msg = h.message(
            Event::JobRequest { mode: 0, counts },
            Address::service(NodeId(1)),
            here,
        );
        storage.handle(&mut h.kernel(here), &msg).unwrap();
        h.drain_events()
            .into_iter()
            .map(|(_, e)| e)
            .find(|e| matches!(e, Event::JobWithdrawn { .. }))
            .unwrap()
    }

    #[test]
    fn test_initial_marking_created_at_start() {
        let (h, storage) = started(StorageConfig::unbounded(2).with_initial(ClassId(0), 3));
        assert_eq!(storage.tokens(ClassId(0)), 3);
        assert_eq!(h.registry.node(PLACE).len(), 3);
        assert_eq!(h.registry.network().len(), 3);
    }

    #[test]
    fn test_withdrawal_is_all_or_nothing() {
        let (mut h, mut storage) = started(
            StorageConfig::unbounded(2)
                .with_initial(ClassId(0), 2)
                .with_initial(ClassId(1), 1),
        );

        let event = request(&mut h, &mut storage, vec![1, 2]);
        assert_eq!(
            event,
            Event::JobWithdrawn {
                mode: 0,
                jobs: Vec::new(),
                complete: false
            }
        );
        assert_eq!(storage.total(), 3);

        let Event::JobWithdrawn { jobs, complete, .. } = request(&mut h, &mut storage, vec![2, 1]) else {
            unreachable!()
        };
        assert!(complete);
        assert_eq!(jobs.len(), 3);
        assert_eq!(storage.total(), 0);
        assert!(h.registry.node(PLACE).is_empty());
    }

    #[test]
    fn test_restore_puts_tokens_back_in_order() {
        let (mut h, mut storage) = started(StorageConfig::unbounded(2).with_initial(ClassId(0), 2));
        let Event::JobWithdrawn { jobs, .. } = request(&mut h, &mut storage, vec![1, 0]) else {
            unreachable!()
        };

        let here = Address::input(PLACE);
        let msg = h.message(Event::Restore { jobs: jobs.clone() }, Address::service(NodeId(1)), here);
        storage.handle(&mut h.kernel(here), &msg).unwrap();
        assert_eq!(storage.tokens(ClassId(0)), 2);
        assert_eq!(storage.tokens[0].front().copied(), jobs.first().copied());
        assert_eq!(
            h.drain_events(),
            vec![(
                Address::output(PLACE),
                Event::JobChange {
                    class: ClassId(0),
                    delta: 1
                }
            )]
        );
    }

    #[test]
    fn test_full_place_drops_token() {
        let (mut h, mut storage) = started(
            StorageConfig::unbounded(2)
                .with_initial(ClassId(0), 1)
                .with_capacity(1, StorageRule::Drop),
        );
        let here = Address::input(PLACE);
        let job = h.kernel(here).create_job(ClassId(0)).unwrap();
        let msg = h.message(Event::Job(job), Address::output(NodeId(1)), here);
        storage.handle(&mut h.kernel(here), &msg).unwrap();
        assert!(!h.jobs.contains(job));
        assert_eq!(storage.total(), 1);
    }
}
