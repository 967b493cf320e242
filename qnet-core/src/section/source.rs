use tracing::debug;

use crate::context::Kernel;
use crate::distribution::{Distribution, ServiceStrategy};
use crate::error::Result;
use crate::event::{Event, Handled, Message, SectionKind};
use crate::job::ClassId;

use super::Admits;

/// Generates open-class arrivals from per-class interarrival strategies.
#[derive(Debug)]
pub struct SourceInput {
    interarrival: Vec<Option<Distribution>>,
    generated: u64,
}

impl SourceInput {
    pub fn new(interarrival: Vec<Option<Distribution>>) -> Self {
        Self {
            interarrival,
            generated: 0,
        }
    }

    pub fn generated(&self) -> u64 {
        self.generated
    }

    fn schedule_next(&self, kernel: &mut Kernel<'_>, class: ClassId) -> Result<()> {
        if let Some(distribution) = &self.interarrival[class.0] {
            let delay = distribution.wait(kernel.rng, 0);
            kernel.schedule_self(Event::Arrival(class), delay)?;
        }
        Ok(())
    }
}

impl Admits for SourceInput {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Start => {
                for class in 0..self.interarrival.len() {
                    self.schedule_next(kernel, ClassId(class))?;
                }
                Ok(Handled::Consumed)
            }
            Event::Arrival(class) => {
                let job = kernel.create_job(*class)?;
                kernel.enter_node(job)?;
                self.generated += 1;
                debug!(node = kernel.node().0, job = job.0, class = class.0, "arrival");
                kernel.send_local(SectionKind::Service, Event::Job(job))?;
                self.schedule_next(kernel, *class)?;
                Ok(Handled::Consumed)
            }
            Event::Ready(_) | Event::Departed(_) => Ok(Handled::Consumed),
            Event::Job(_)
            | Event::Ack(_)
            | Event::PreemptRequest(_)
            | Event::Preempted(_)
            | Event::Bounced(_)
            | Event::ServiceDone(_)
            | Event::SetupDone(_)
            | Event::PowerDown { .. }
            | Event::PsCompletion
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
