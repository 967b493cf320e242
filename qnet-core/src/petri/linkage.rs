use crate::context::Kernel;
use crate::error::Result;
use crate::event::{Address, Event, Handled, Message};
use crate::section::Routes;

/// Place output: relays content changes to every downstream transition.
#[derive(Debug, Default)]
pub struct Linkage {
    forwarded: u64,
}

impl Linkage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

impl Routes for Linkage {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::JobChange { .. } => {
                let here = kernel.node();
                for target in kernel.topology.outputs(here).to_vec() {
                    kernel.send(Address::input(target), message.event.clone())?;
                }
                self.forwarded += 1;
                Ok(Handled::Consumed)
            }
            Event::Start | Event::Ack(_) => Ok(Handled::Consumed),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ClassId, NodeId};
    use crate::section::testing::Harness;
    use crate::topology::NodeKind;

    #[test]
    fn test_change_reaches_every_downstream_transition() {
        let mut h = Harness::chain(&[NodeKind::Place, NodeKind::Transition, NodeKind::Transition], 1)
            .link(0, 1)
            .link(0, 2);
        let mut linkage = Linkage::new();
        let here = Address::output(NodeId(0));
        let change = Event::JobChange {
            class: ClassId(0),
            delta: 2,
        };
        let msg = h.message(change.clone(), Address::input(NodeId(0)), here);
        linkage.handle(&mut h.kernel(here), &msg).unwrap();

        let events = h.drain_now();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|m| m.event == change && m.source == here));
        assert_eq!(events[0].destination, Address::input(NodeId(1)));
        assert_eq!(events[1].destination, Address::input(NodeId(2)));
    }
}
