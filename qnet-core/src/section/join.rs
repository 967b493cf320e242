//! Join input: reassembles fork fragments into their parent job.

use std::collections::HashMap;

use tracing::debug;

use crate::context::Kernel;
use crate::error::{ConfigError, Result};
use crate::event::{Address, Event, Handled, Message, SectionKind};
use crate::job::{ForkLink, JobId};
use crate::registry::DropReason;

use super::Admits;

/// When a join releases the parent.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinStrategy {
    /// Once every fragment has arrived.
    Normal,
    /// Once the given number of fragments per class has arrived; later
    /// fragments are absorbed.
    Guard(Vec<u32>),
    /// Once `n` fragments have arrived, the held fragments continue on
    /// their own, as do the ones arriving later. The parent is absorbed.
    Semaphore(u32),
}

impl JoinStrategy {
    /// # Errors
    ///
    /// - `ConfigError::ClassArity` - If a guard does not list every class
    /// - `ConfigError::InvalidStation` - If a semaphore threshold is zero
    pub fn validate(&self, node: &str, classes: usize) -> std::result::Result<(), ConfigError> {
        match self {
            JoinStrategy::Normal => Ok(()),
            JoinStrategy::Guard(required) if required.len() != classes => Err(ConfigError::ClassArity {
                context: format!("join guard at {node}"),
                expected: classes,
                actual: required.len(),
            }),
            JoinStrategy::Guard(_) => Ok(()),
            JoinStrategy::Semaphore(0) => Err(ConfigError::InvalidStation {
                node: node.to_string(),
                reason: "semaphore threshold must be at least 1".into(),
            }),
            JoinStrategy::Semaphore(_) => Ok(()),
        }
    }
}

#[derive(Debug)]
struct Group {
    total: u32,
    seen: u32,
    per_class: Vec<u32>,
    held: Vec<JobId>,
    fired: bool,
}

#[derive(Debug)]
pub struct JoinInput {
    strategy: JoinStrategy,
    groups: HashMap<JobId, Group>,
    joined: u64,
}

impl JoinInput {
    pub fn new(strategy: JoinStrategy) -> Self {
        Self {
            strategy,
            groups: HashMap::new(),
            joined: 0,
        }
    }

    /// Parents released so far.
    pub fn joined(&self) -> u64 {
        self.joined
    }

    /// Parents with fragments still outstanding.
    pub fn open_groups(&self) -> usize {
        self.groups.len()
    }

    fn pass_through(kernel: &mut Kernel<'_>, job: JobId) -> Result<()> {
        kernel.enter_node(job)?;
        kernel.send_local(SectionKind::Service, Event::Job(job))
    }

    fn ready(&self, group: &Group, emitted: &[u32]) -> bool {
        match &self.strategy {
            JoinStrategy::Normal => group.seen >= group.total,
            JoinStrategy::Guard(required) => required
                .iter()
                .zip(emitted)
                .zip(&group.per_class)
                .all(|((need, emitted), seen)| seen >= need.min(emitted)),
            JoinStrategy::Semaphore(threshold) => group.seen >= (*threshold).min(group.total),
        }
    }

    fn fire(&mut self, kernel: &mut Kernel<'_>, link: ForkLink, held: Vec<JobId>) -> Result<()> {
        let parent = link.parent;
        match self.strategy {
            JoinStrategy::Normal | JoinStrategy::Guard(_) => {
                for fragment in held {
                    kernel.destroy_job(fragment, DropReason::Absorbed)?;
                }
                kernel.enter_node(parent)?;
                kernel.send_local(SectionKind::Service, Event::Job(parent))?;
            }
            JoinStrategy::Semaphore(_) => {
                for fragment in held {
                    kernel.jobs.get_mut(fragment)?.forked_from = None;
                    kernel.send_local(SectionKind::Service, Event::Job(fragment))?;
                }
                kernel.destroy_job(parent, DropReason::Absorbed)?;
            }
        }
        self.joined += 1;
        debug!(node = kernel.node().0, parent = parent.0, "join fired");
        kernel.send(Address::output(link.fork_node), Event::JoinDone { parent })
    }

    fn arrive(&mut self, kernel: &mut Kernel<'_>, job: JobId) -> Result<()> {
        let Some(link) = kernel.jobs.get(job)?.forked_from else {
            return Self::pass_through(kernel, job);
        };
        let Some(record) = kernel.forks.get(link.parent) else {
            // The fork record is gone: the fragment travels on alone.
            kernel.jobs.get_mut(job)?.forked_from = None;
            return Self::pass_through(kernel, job);
        };
        let emitted = record.per_class.clone();
        let total = record.fragments;
        let class = kernel.class_of(job)?;

        let group = self.groups.entry(link.parent).or_insert_with(|| Group {
            total,
            seen: 0,
            per_class: vec![0; emitted.len()],
            held: Vec::new(),
            fired: false,
        });
        group.total = total;
        group.seen += 1;
        group.per_class[class.0] += 1;

        if group.fired {
            match self.strategy {
                JoinStrategy::Semaphore(_) => {
                    kernel.jobs.get_mut(job)?.forked_from = None;
                    Self::pass_through(kernel, job)?;
                }
                JoinStrategy::Normal | JoinStrategy::Guard(_) => {
                    kernel.destroy_job(job, DropReason::Absorbed)?;
                }
            }
        } else {
            kernel.enter_node(job)?;
            group.held.push(job);
        }

        let Some(group) = self.groups.get(&link.parent) else {
            return Ok(());
        };
        let finished = group.seen >= group.total;
        if !group.fired && self.ready(group, &emitted) {
            let held = self
                .groups
                .get_mut(&link.parent)
                .map(|g| {
                    g.fired = true;
                    std::mem::take(&mut g.held)
                })
                .unwrap_or_default();
            self.fire(kernel, link, held)?;
        }
        if finished {
            self.groups.remove(&link.parent);
            kernel.forks.close(link.parent);
        }
        Ok(())
    }
}

impl Admits for JoinInput {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Job(job) => {
                kernel.send(message.source, Event::Ack(*job))?;
                self.arrive(kernel, *job)?;
                Ok(Handled::Consumed)
            }
            Event::Start | Event::Ready(_) | Event::Departed(_) => Ok(Handled::Consumed),
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
            | Event::JobRequest { .. }
            | Event::JobWithdrawn { .. }
            | Event::Restore { .. }
            | Event::Firing { .. } => Ok(Handled::NotConsumed),
        }
    }

    fn resident(&self) -> usize {
        self.groups.values().map(|g| g.held.len()).sum()
    }
}
