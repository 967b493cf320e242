//! Station sections and the capability traits they implement.
//!
//! A station is an input section that admits jobs, a service section that
//! holds them for some time, and an output section that routes them on.
//! Concrete sections are composed per station kind; the enums below give
//! the network a closed set to dispatch over.

mod cache;
mod fork;
mod join;
mod passthrough;
mod put;
mod queue;
mod router;
mod server;
mod ps;
mod sink;
mod source;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheConfig, CachePolicy, CacheServer, CacheStore, MoveSemantics};
pub use fork::{ForkConfig, ForkOutput, ForkStrategy};
pub use join::{JoinInput, JoinStrategy};
pub use passthrough::{ClassSwitcher, DelayServer, Tunnel};
pub use ps::{PsConfig, PsPolicy, PsServer, PsType, allocate_rates};
pub use put::PutStrategy;
pub use queue::{Balking, DropRule, QueueConfig, QueueInput};
pub use router::Router;
pub use server::{SchedulingPolicy, Server, ServerConfig, ServerType, UnitState};
pub use sink::SinkInput;
pub use source::SourceInput;

use crate::context::Kernel;
use crate::error::{KernelError, Result};
use crate::event::{Handled, Message, SectionKind};
use crate::job::{ClassId, JobId};
use crate::petri::{Enabling, Firing, Linkage, Storage, Timing};
use crate::Time;

/// Input capability: admission control.
pub trait Admits {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled>;

    /// Jobs admitted and not yet departed.
    fn resident(&self) -> usize {
        0
    }

    /// Finite admission limit, if any.
    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// Service capability: holding jobs for their service time.
pub trait Serves {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled>;

    /// Server units currently held by jobs.
    fn busy_units(&self) -> f64 {
        0.0
    }

    /// Size of the server pool, `None` for unbounded sections.
    fn total_units(&self) -> Option<f64> {
        None
    }
}

/// Output capability: choosing where jobs go next.
pub trait Routes {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled>;

    /// Jobs handed downstream and awaiting acknowledgement.
    fn pending(&self) -> usize {
        0
    }
}

pub enum InputSection {
    Source(SourceInput),
    Sink(SinkInput),
    Queue(QueueInput),
    Join(JoinInput),
    Storage(Storage),
    Enabling(Enabling),
}

impl InputSection {
    fn as_admits(&mut self) -> &mut dyn Admits {
        match self {
            InputSection::Source(s) => s,
            InputSection::Sink(s) => s,
            InputSection::Queue(s) => s,
            InputSection::Join(s) => s,
            InputSection::Storage(s) => s,
            InputSection::Enabling(s) => s,
        }
    }

    /// Mirrors a class switch of a resident job in the section's registry.
    fn switch_class(&mut self, job: JobId, to: ClassId, now: Time) -> Result<()> {
        match self {
            InputSection::Queue(queue) => queue.switch_class(job, to, now),
            InputSection::Source(_)
            | InputSection::Sink(_)
            | InputSection::Join(_)
            | InputSection::Storage(_)
            | InputSection::Enabling(_) => Ok(()),
        }
    }

    pub fn admits(&self) -> &dyn Admits {
        match self {
            InputSection::Source(s) => s,
            InputSection::Sink(s) => s,
            InputSection::Queue(s) => s,
            InputSection::Join(s) => s,
            InputSection::Storage(s) => s,
            InputSection::Enabling(s) => s,
        }
    }
}

pub enum ServiceSection {
    Tunnel(Tunnel),
    Server(Server),
    ProcessorSharing(PsServer),
    Delay(DelayServer),
    ClassSwitch(ClassSwitcher),
    Cache(CacheServer),
    Timing(Timing),
}

impl ServiceSection {
    fn as_serves(&mut self) -> &mut dyn Serves {
        match self {
            ServiceSection::Tunnel(s) => s,
            ServiceSection::Server(s) => s,
            ServiceSection::ProcessorSharing(s) => s,
            ServiceSection::Delay(s) => s,
            ServiceSection::ClassSwitch(s) => s,
            ServiceSection::Cache(s) => s,
            ServiceSection::Timing(s) => s,
        }
    }

    pub fn serves(&self) -> &dyn Serves {
        match self {
            ServiceSection::Tunnel(s) => s,
            ServiceSection::Server(s) => s,
            ServiceSection::ProcessorSharing(s) => s,
            ServiceSection::Delay(s) => s,
            ServiceSection::ClassSwitch(s) => s,
            ServiceSection::Cache(s) => s,
            ServiceSection::Timing(s) => s,
        }
    }
}

pub enum OutputSection {
    Router(Router),
    Fork(ForkOutput),
    Linkage(Linkage),
    Firing(Firing),
}

impl OutputSection {
    fn as_routes(&mut self) -> &mut dyn Routes {
        match self {
            OutputSection::Router(s) => s,
            OutputSection::Fork(s) => s,
            OutputSection::Linkage(s) => s,
            OutputSection::Firing(s) => s,
        }
    }

    pub fn routes(&self) -> &dyn Routes {
        match self {
            OutputSection::Router(s) => s,
            OutputSection::Fork(s) => s,
            OutputSection::Linkage(s) => s,
            OutputSection::Firing(s) => s,
        }
    }
}

/// A station: three sections behind one address.
pub struct Node {
    pub input: InputSection,
    pub service: ServiceSection,
    pub output: OutputSection,
}

impl Node {
    /// Delivers a message to the addressed section.
    ///
    /// # Errors
    ///
    /// - `KernelError::UnhandledEvent` - If the section does not consume the event
    /// - Any error raised by the section itself
    pub fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<()> {
        let section = message.destination.section;
        let handled = match section {
            SectionKind::Input => self.input.as_admits().handle(kernel, message)?,
            SectionKind::Service => self.service.as_serves().handle(kernel, message)?,
            SectionKind::Output => self.output.as_routes().handle(kernel, message)?,
            SectionKind::Kernel => Handled::Consumed,
        };
        for (job, to) in kernel.take_switches() {
            self.input.switch_class(job, to, kernel.now)?;
        }
        match handled {
            Handled::Consumed => Ok(()),
            Handled::NotConsumed => Err(KernelError::UnhandledEvent {
                node: message.destination.node,
                section: section.as_str(),
                event: message.event.as_str(),
            }),
        }
    }
}
