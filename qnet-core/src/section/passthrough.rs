//! Zero-state service sections: tunnel, infinite server and class switch.
//!
//! Tunnel-like sections pace their input with one `Ready` per accepted
//! downstream hand-over, which is what gives routers and forks their
//! blocking-after-service behaviour.

use std::collections::HashMap;

use tracing::trace;

use crate::context::Kernel;
use crate::distribution::{Distribution, ServiceStrategy};
use crate::error::{KernelError, Result};
use crate::event::{Event, Handled, Message, SectionKind};
use crate::job::{ClassId, ClassMask, JobId};
use crate::random::sample_index;
use crate::scheduler::EventToken;

use super::Serves;

pub(super) fn ready_all(kernel: &mut Kernel<'_>) -> Result<()> {
    let mask = ClassMask::all(kernel.classes.len());
    kernel.send_local(SectionKind::Input, Event::Ready(mask))
}

/// Forwards every job to the output section without delay.
#[derive(Debug, Default)]
pub struct Tunnel;

impl Serves for Tunnel {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Start | Event::Ack(_) => {
                ready_all(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::Job(job) => {
                kernel.send_local(SectionKind::Output, Event::Job(*job))?;
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
}

/// Infinite server: every job is served immediately and in parallel.
#[derive(Debug)]
pub struct DelayServer {
    service: Vec<Option<Distribution>>,
    in_service: HashMap<JobId, EventToken>,
}

impl DelayServer {
    pub fn new(service: Vec<Option<Distribution>>) -> Self {
        Self {
            service,
            in_service: HashMap::new(),
        }
    }

    fn update_load(&self, kernel: &mut Kernel<'_>) {
        kernel.set_busy(self.in_service.len() as f64);
    }
}

impl Serves for DelayServer {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Start => {
                let node = kernel.node();
                kernel.loads.set_servers(node, f64::INFINITY);
                ready_all(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::Job(job) => {
                let class = kernel.class_of(*job)?;
                let pending = kernel.jobs.get_mut(*job)?.service_demand.take();
                let population = kernel.population();
                let demand = match (pending, &self.service[class.0]) {
                    (Some(demand), _) => demand,
                    (None, Some(distribution)) => distribution.wait(kernel.rng, population),
                    (None, None) => 0.0,
                };
                kernel.jobs.get_mut(*job)?.service_start = Some(kernel.now);
                let token = kernel.schedule_self(Event::ServiceDone(*job), demand)?;
                self.in_service.insert(*job, token);
                self.update_load(kernel);
                ready_all(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::ServiceDone(job) => {
                self.in_service.remove(job);
                let started = kernel.jobs.get(*job)?.service_start.unwrap_or(kernel.now);
                kernel.jobs.get_mut(*job)?.total_service += kernel.now - started;
                self.update_load(kernel);
                kernel.send_local(SectionKind::Output, Event::Job(*job))?;
                Ok(Handled::Consumed)
            }
            Event::Ack(_) => Ok(Handled::Consumed),
            Event::Ready(_)
            | Event::Departed(_)
            | Event::PreemptRequest(_)
            | Event::Preempted(_)
            | Event::Bounced(_)
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

    fn busy_units(&self) -> f64 {
        self.in_service.len() as f64
    }
}

/// Samples a new class for every passing job from a per-class matrix.
#[derive(Debug)]
pub struct ClassSwitcher {
    matrix: Vec<Vec<f64>>,
}

impl ClassSwitcher {
    /// `matrix[from][to]` is the probability of switching `from` -> `to`.
    pub fn new(matrix: Vec<Vec<f64>>) -> Self {
        Self { matrix }
    }
}

impl Serves for ClassSwitcher {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Start | Event::Ack(_) => {
                ready_all(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::Job(job) => {
                let class = kernel.class_of(*job)?;
                let node = kernel.node();
                let to = sample_index(kernel.rng, &self.matrix[class.0])
                    .map(ClassId)
                    .ok_or_else(|| {
                        KernelError::invariant(node, format!("no switch target for class {class}"))
                    })?;
                if to != class {
                    kernel.switch_class(*job, to)?;
                }
                trace!(job = job.0, from = class.0, to = to.0, "class switch section");
                kernel.send_local(SectionKind::Output, Event::Job(*job))?;
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
}
