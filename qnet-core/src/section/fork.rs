//! Fork output: splits a parent job into fragments, one batch per link.
//!
//! The parent leaves the fork station once every fragment has been
//! accepted downstream and then waits, outside any station, for the join
//! that reassembles it.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::context::Kernel;
use crate::error::{ConfigError, Result};
use crate::event::{Address, Event, Handled, Message, SectionKind};
use crate::job::{ClassId, ForkLink, JobId, NodeId};
use crate::random::uniform_index;
use crate::registry::DropReason;
use crate::warnings::WarningKind;

use super::Routes;

/// How many fragments of which class go down each output link.
#[derive(Debug, Clone, PartialEq)]
pub enum ForkStrategy {
    /// `per_link` fragments of the parent's class on every link.
    Simple { per_link: u32 },
    /// `table[parent_class][link][fragment_class]` fragments.
    Table(Vec<Vec<Vec<u32>>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForkConfig {
    pub strategy: ForkStrategy,
    /// Maximum number of forked parents not yet joined; further parents
    /// hold the fork's service section.
    pub block: Option<u32>,
}

impl ForkConfig {
    pub fn simple(per_link: u32) -> Self {
        Self {
            strategy: ForkStrategy::Simple { per_link },
            block: None,
        }
    }

    /// # Errors
    ///
    /// - `ConfigError::ClassArity` - If the table does not match the classes
    ///   and output links
    pub fn validate(&self, node: &str, outputs: usize, classes: usize) -> std::result::Result<(), ConfigError> {
        let ForkStrategy::Table(table) = &self.strategy else {
            return Ok(());
        };
        let arity = |what: &str, expected: usize, actual: usize| {
            if expected == actual {
                Ok(())
            } else {
                Err(ConfigError::ClassArity {
                    context: format!("fork {what} at {node}"),
                    expected,
                    actual,
                })
            }
        };
        arity("table", classes, table.len())?;
        for links in table {
            arity("links", outputs, links.len())?;
            for fragments in links {
                arity("fragment classes", classes, fragments.len())?;
            }
        }
        Ok(())
    }

    fn fragments(&self, parent_class: ClassId, link: usize, classes: usize) -> Vec<u32> {
        match &self.strategy {
            ForkStrategy::Simple { per_link } => {
                let mut counts = vec![0; classes];
                counts[parent_class.0] = *per_link;
                counts
            }
            ForkStrategy::Table(table) => table
                .get(parent_class.0)
                .and_then(|links| links.get(link))
                .cloned()
                .unwrap_or_else(|| vec![0; classes]),
        }
    }
}

pub struct ForkOutput {
    config: ForkConfig,
    /// Fragment awaiting its downstream ack, mapped to its parent.
    fragments: HashMap<JobId, JobId>,
    /// Parents released downstream and not yet joined.
    outstanding: u32,
    /// Parents whose service release waits for a join.
    held: VecDeque<JobId>,
}

impl ForkOutput {
    pub fn new(config: ForkConfig) -> Self {
        Self {
            config,
            fragments: HashMap::new(),
            outstanding: 0,
            held: VecDeque::new(),
        }
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    fn release_service(&mut self, kernel: &mut Kernel<'_>, parent: JobId) -> Result<()> {
        if self.config.block.is_some_and(|limit| self.outstanding >= limit) {
            self.held.push_back(parent);
            return Ok(());
        }
        self.outstanding += 1;
        kernel.send_local(SectionKind::Service, Event::Ack(parent))
    }

    /// Redirects a closed fragment headed for a sink.
    fn redirect(kernel: &mut Kernel<'_>, class: ClassId, outputs: &[NodeId]) -> Option<NodeId> {
        let viable: Vec<NodeId> = outputs
            .iter()
            .copied()
            .filter(|n| !kernel.topology.is_sink(*n))
            .collect();
        if viable.is_empty() {
            kernel.warn_once(
                Some(class),
                WarningKind::FragmentLost,
                &format!("closed fragment of class {class} has no viable output; fragment lost"),
            );
            return None;
        }
        kernel.warn_once(
            Some(class),
            WarningKind::ForkRedirect,
            &format!("closed fragment of class {class} redirected away from a sink"),
        );
        Some(viable[uniform_index(kernel.rng, viable.len())])
    }

    fn split(&mut self, kernel: &mut Kernel<'_>, parent: JobId) -> Result<()> {
        let here = kernel.node();
        let parent_class = kernel.class_of(parent)?;
        let system_enter = kernel.jobs.get(parent)?.system_enter;
        let classes = kernel.classes.len();
        let outputs = kernel.topology.outputs(here).to_vec();
        kernel.forks.open(parent, here, classes);

        let mut emitted = 0;
        for (link, target) in outputs.iter().enumerate() {
            let counts = self.config.fragments(parent_class, link, classes);
            for (class, count) in counts.iter().enumerate() {
                let class = ClassId(class);
                for _ in 0..*count {
                    let mut target = *target;
                    if kernel.classes.get(class).is_closed() && kernel.topology.is_sink(target) {
                        match Self::redirect(kernel, class, &outputs) {
                            Some(node) => target = node,
                            None => continue,
                        }
                    }
                    let fragment = kernel.create_job(class)?;
                    let record = kernel.jobs.get_mut(fragment)?;
                    record.system_enter = system_enter;
                    record.forked_from = Some(ForkLink {
                        parent,
                        fork_node: here,
                    });
                    kernel.forks.add_fragment(parent, class);
                    self.fragments.insert(fragment, parent);
                    kernel.send(Address::input(target), Event::Job(fragment))?;
                    emitted += 1;
                }
            }
        }

        if emitted == 0 {
            kernel.forks.close(parent);
            kernel.warn_once(
                Some(parent_class),
                WarningKind::Unroutable,
                &format!("fork emitted no fragment for class {parent_class}; job discarded"),
            );
            kernel.destroy_job(parent, DropReason::Unroutable)?;
            kernel.send_local(SectionKind::Service, Event::Ack(parent))?;
            return kernel.send_local(SectionKind::Input, Event::Departed(parent));
        }
        debug!(node = here.0, parent = parent.0, fragments = emitted, "forked");
        Ok(())
    }
}

impl Routes for ForkOutput {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Start => Ok(Handled::Consumed),
            Event::Job(parent) => {
                self.split(kernel, *parent)?;
                Ok(Handled::Consumed)
            }
            Event::Ack(fragment) => {
                let Some(parent) = self.fragments.remove(fragment) else {
                    return Ok(Handled::Consumed);
                };
                if kernel.forks.ack(parent) {
                    kernel.leave_node(parent)?;
                    kernel.send_local(SectionKind::Input, Event::Departed(parent))?;
                    self.release_service(kernel, parent)?;
                }
                Ok(Handled::Consumed)
            }
            Event::JoinDone { .. } => {
                self.outstanding = self.outstanding.saturating_sub(1);
                if let Some(parent) = self.held.pop_front() {
                    self.outstanding += 1;
                    kernel.send_local(SectionKind::Service, Event::Ack(parent))?;
                }
                Ok(Handled::Consumed)
            }
            Event::Ready(_)
            | Event::Departed(_)
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

    fn pending(&self) -> usize {
        self.fragments.len()
    }
}
