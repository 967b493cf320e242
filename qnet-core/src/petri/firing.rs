//! Transition output: turns the consumed jobs of a firing into the jobs
//! released on each output link.

use std::sync::Arc;

use tracing::trace;

use crate::context::Kernel;
use crate::error::Result;
use crate::event::{Address, Event, Handled, Message};
use crate::job::{ClassId, JobId, NodeId};
use crate::random::{reservoir_sample, shuffle};
use crate::registry::DropReason;
use crate::section::Routes;
use crate::stats::Measure;

use super::matrix::ModeSpec;

pub struct Firing {
    modes: Arc<Vec<ModeSpec>>,
    outputs: Vec<NodeId>,
    classes: usize,
    in_flight: usize,
}

impl Firing {
    pub fn new(modes: Arc<Vec<ModeSpec>>, outputs: Vec<NodeId>, classes: usize) -> Self {
        Self {
            modes,
            outputs,
            classes,
            in_flight: 0,
        }
    }

    /// Reuses consumed jobs of each class where possible. Surplus jobs are
    /// absorbed, missing ones created.
    fn provision(&self, kernel: &mut Kernel<'_>, mode: usize, consumed: &[JobId]) -> Result<Vec<Vec<JobId>>> {
        let spec = &self.modes[mode];
        let mut pools: Vec<Vec<JobId>> = vec![Vec::new(); self.classes];
        for job in consumed {
            pools[kernel.class_of(*job)?.0].push(*job);
        }
        let mut released = Vec::with_capacity(self.classes);
        for (class, pool) in pools.into_iter().enumerate() {
            let needed = spec.firing.class_total(ClassId(class)) as usize;
            let mut kept = if pool.len() > needed {
                let kept = reservoir_sample(kernel.rng, &pool, needed);
                for job in pool.iter().filter(|j| !kept.contains(j)) {
                    kernel.destroy_job(*job, DropReason::Absorbed)?;
                }
                kept
            } else {
                pool
            };
            while kept.len() < needed {
                kept.push(kernel.create_job(ClassId(class))?);
            }
            shuffle(kernel.rng, &mut kept);
            released.push(kept);
        }
        Ok(released)
    }

    fn fire(&mut self, kernel: &mut Kernel<'_>, mode: usize, consumed: &[JobId]) -> Result<()> {
        let mut pools = self.provision(kernel, mode, consumed)?;
        let mut deliveries: Vec<(NodeId, JobId)> = Vec::new();
        for (link, class, count) in self.modes[mode].firing.entries() {
            for _ in 0..count {
                if let Some(job) = pools[class.0].pop() {
                    deliveries.push((self.outputs[link], job));
                }
            }
        }
        shuffle(kernel.rng, &mut deliveries);
        trace!(node = kernel.node().0, mode, released = deliveries.len(), "transition fired");
        self.in_flight += deliveries.len();
        for (target, job) in deliveries {
            kernel.send(Address::input(target), Event::Job(job))?;
        }
        kernel.record_at(Measure::FiringThroughput, None, 1.0, 1.0);
        Ok(())
    }
}

impl Routes for Firing {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Firing { mode, consumed } => {
                self.fire(kernel, *mode, consumed)?;
                Ok(Handled::Consumed)
            }
            Event::Ack(_) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                Ok(Handled::Consumed)
            }
            Event::Start => Ok(Handled::Consumed),
            Event::Job(_)
            | Event::Ready(_)
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
            | Event::Restore { .. } => Ok(Handled::NotConsumed),
        }
    }

    fn pending(&self) -> usize {
        self.in_flight
    }
}
