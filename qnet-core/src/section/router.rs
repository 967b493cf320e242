use std::collections::HashSet;

use tracing::trace;

use crate::context::Kernel;
use crate::error::Result;
use crate::event::{Address, Event, Handled, Message, SectionKind};
use crate::job::{ClassId, JobId};
use crate::registry::{DropReason, JobRegistry};
use crate::routing::{RoutingState, RoutingStrategy};
use crate::warnings::WarningKind;

use super::Routes;

/// Output section dispatching each job to one downstream station.
///
/// A job stays charged to the station until the receiver acknowledges it,
/// which is what blocks the service section after completion.
pub struct Router {
    strategies: Vec<RoutingStrategy>,
    states: Vec<RoutingState>,
    pending: JobRegistry,
    /// Jobs routed back to this station; they departed before being sent.
    looped: HashSet<JobId>,
}

impl Router {
    pub fn new(strategies: Vec<RoutingStrategy>) -> Self {
        let classes = strategies.len();
        let states = strategies.iter().map(RoutingStrategy::initial_state).collect();
        Self {
            strategies,
            states,
            pending: JobRegistry::new("router", classes),
            looped: HashSet::new(),
        }
    }

    pub fn strategy(&self, class: ClassId) -> &RoutingStrategy {
        &self.strategies[class.0]
    }

    /// Releases the service section and the input section after `job` left.
    fn depart(kernel: &mut Kernel<'_>, job: JobId) -> Result<()> {
        kernel.send_local(SectionKind::Service, Event::Ack(job))?;
        kernel.send_local(SectionKind::Input, Event::Departed(job))
    }

    fn route(&mut self, kernel: &mut Kernel<'_>, job: JobId) -> Result<()> {
        let class = kernel.class_of(job)?;
        let decision = {
            let (view, rng) = kernel.route_view();
            self.strategies[class.0].select(&mut self.states[class.0], &view, rng, class)
        };

        let Some(decision) = decision else {
            let node = kernel.node();
            let name = kernel.topology.name(node).to_string();
            kernel.warn_once(
                Some(class),
                WarningKind::Unroutable,
                &format!("no viable output for class {class} at {name}; job discarded"),
            );
            kernel.destroy_job(job, DropReason::Unroutable)?;
            return Self::depart(kernel, job);
        };

        let class = match decision.switch_to {
            Some(to) => {
                kernel.switch_class(job, to)?;
                to
            }
            None => class,
        };
        self.pending.add(job, class, kernel.now)?;
        trace!(node = kernel.node().0, job = job.0, target = decision.target.0, "routed");

        if decision.target == kernel.node() {
            kernel.leave_node(job)?;
            kernel.send_local(SectionKind::Input, Event::Departed(job))?;
            self.looped.insert(job);
        }
        kernel.send(Address::input(decision.target), Event::Job(job))
    }
}

impl Routes for Router {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Start => Ok(Handled::Consumed),
            Event::Job(job) => {
                self.route(kernel, *job)?;
                Ok(Handled::Consumed)
            }
            Event::Ack(job) => {
                if self.pending.contains(*job) {
                    self.pending.remove(*job, kernel.now)?;
                }
                if self.looped.remove(job) {
                    kernel.send_local(SectionKind::Service, Event::Ack(*job))?;
                } else {
                    kernel.leave_node(*job)?;
                    Self::depart(kernel, *job)?;
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

    fn pending(&self) -> usize {
        self.pending.len()
    }
}
