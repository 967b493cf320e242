use crate::context::Kernel;
use crate::error::{KernelError, Result};
use crate::event::{Event, Handled, Message};
use crate::registry::DropReason;
use crate::stats::Measure;

use super::Admits;

/// Absorbs open-class jobs leaving the network.
#[derive(Debug, Default)]
pub struct SinkInput {
    absorbed: u64,
}

impl SinkInput {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn absorbed(&self) -> u64 {
        self.absorbed
    }
}

impl Admits for SinkInput {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Job(job) => {
                kernel.send(message.source, Event::Ack(*job))?;
                let record = kernel.jobs.get(*job)?;
                let class = record.class;
                if kernel.classes.get(class).is_closed() {
                    return Err(KernelError::ClosedJobAtSink {
                        job: *job,
                        node: kernel.node(),
                    });
                }
                let response = kernel.now - record.system_enter;
                kernel.record_at(Measure::SystemResponseTime, Some(class), response, 1.0);
                kernel.enter_node(*job)?;
                kernel.destroy_job(*job, DropReason::Completed)?;
                self.absorbed += 1;
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
}
