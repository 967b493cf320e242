//! Transition input: tracks the marking of the input places and reports
//! the enabling degree of every mode to the timing section.

use std::sync::Arc;

use tracing::trace;

use crate::context::Kernel;
use crate::error::{KernelError, Result};
use crate::event::{Address, Event, Handled, Message, SectionKind};
use crate::job::{ClassId, NodeId};
use crate::section::Admits;

use super::matrix::{ModeSpec, enabling_degree};

pub struct Enabling {
    modes: Arc<Vec<ModeSpec>>,
    places: Vec<NodeId>,
    /// Tokens per input place and class, as last announced.
    available: Vec<Vec<u32>>,
    reported: Vec<u32>,
    firing: Vec<bool>,
}

impl Enabling {
    pub fn new(modes: Arc<Vec<ModeSpec>>, places: Vec<NodeId>, classes: usize) -> Self {
        let count = modes.len();
        Self {
            available: vec![vec![0; classes]; places.len()],
            modes,
            places,
            reported: vec![0; count],
            firing: vec![false; count],
        }
    }

    /// Last degree reported for `mode`.
    pub fn degree(&self, mode: usize) -> u32 {
        self.reported[mode]
    }

    pub fn available(&self, place: usize, class: ClassId) -> u32 {
        self.available[place][class.0]
    }

    fn compute(&self, mode: usize) -> u32 {
        let spec = &self.modes[mode];
        enabling_degree(&spec.enabling, &spec.inhibiting, &self.available)
    }

    fn report(&mut self, kernel: &mut Kernel<'_>, mode: usize, force: bool) -> Result<()> {
        let degree = self.compute(mode);
        if !force && degree == self.reported[mode] {
            return Ok(());
        }
        self.reported[mode] = degree;
        trace!(node = kernel.node().0, mode, degree, "enabling degree");
        kernel.send_local(SectionKind::Service, Event::Enabling { mode, degree })
    }

    fn apply(&mut self, kernel: &mut Kernel<'_>, source: Address, class: ClassId, delta: i64) -> Result<()> {
        let node = kernel.node();
        let Some(place) = self.places.iter().position(|p| *p == source.node) else {
            return Err(KernelError::invariant(
                node,
                format!("content change from {} which is not an input place", source.node),
            ));
        };
        let slot = &mut self.available[place][class.0];
        let updated = i64::from(*slot) + delta;
        if updated < 0 {
            return Err(KernelError::invariant(
                node,
                format!("place {} would hold {updated} jobs of class {class}", source.node),
            ));
        }
        *slot = updated as u32;
        for mode in 0..self.modes.len() {
            if !self.firing[mode] {
                self.report(kernel, mode, false)?;
            }
        }
        Ok(())
    }
}

impl Admits for Enabling {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::JobChange { class, delta } => {
                self.apply(kernel, message.source, *class, *delta)?;
                Ok(Handled::Consumed)
            }
            Event::ModeFiring { mode, active } => {
                self.firing[*mode] = *active;
                if !*active {
                    self.report(kernel, *mode, true)?;
                }
                Ok(Handled::Consumed)
            }
            Event::Start => Ok(Handled::Consumed),
            Event::Job(_)
            | Event::Ack(_)
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
            | Event::Timing { .. }
            | Event::JobRequest { .. }
            | Event::JobWithdrawn { .. }
            | Event::Restore { .. }
            | Event::Firing { .. } => Ok(Handled::NotConsumed),
        }
    }
}
