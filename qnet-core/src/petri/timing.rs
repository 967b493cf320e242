//! Transition service: firing timers and the withdrawal handshake.
//!
//! Each enabled mode runs up to `timer_target(degree)` timers. When a timer
//! expires the transition asks every required input place for its jobs; a
//! place either hands over the full amount or nothing. A firing goes ahead
//! only if every place delivered, otherwise the partial withdrawal is put
//! back. One firing is in progress at a time; timers expiring meanwhile wait
//! their turn.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::context::Kernel;
use crate::distribution::ServiceStrategy;
use crate::error::Result;
use crate::event::{Address, Event, Handled, Message, SectionKind};
use crate::job::{JobId, NodeId};
use crate::scheduler::EventToken;
use crate::section::Serves;
use crate::Time;

use super::matrix::ModeSpec;

#[derive(Debug)]
struct Timer {
    due: Time,
    id: u64,
    /// `None` once expired and waiting for the current firing to finish.
    token: Option<EventToken>,
}

#[derive(Debug)]
struct InProgress {
    mode: usize,
    awaiting: usize,
    withdrawn: Vec<(NodeId, Vec<JobId>)>,
    failed: bool,
}

pub struct Timing {
    modes: Arc<Vec<ModeSpec>>,
    places: Vec<NodeId>,
    degrees: Vec<u32>,
    timers: Vec<Vec<Timer>>,
    deferred: VecDeque<(usize, u64)>,
    current: Option<InProgress>,
    next_id: u64,
    fired: u64,
    aborted: u64,
}

impl Timing {
    pub fn new(modes: Arc<Vec<ModeSpec>>, places: Vec<NodeId>) -> Self {
        let count = modes.len();
        Self {
            modes,
            places,
            degrees: vec![0; count],
            timers: (0..count).map(|_| Vec::new()).collect(),
            deferred: VecDeque::new(),
            current: None,
            next_id: 0,
            fired: 0,
            aborted: 0,
        }
    }

    /// Timers currently held by `mode`, including expired ones waiting.
    pub fn timers(&self, mode: usize) -> usize {
        self.timers[mode].len()
    }

    /// Completed firings.
    pub fn fired(&self) -> u64 {
        self.fired
    }

    /// Firings abandoned because a place could not deliver.
    pub fn aborted(&self) -> u64 {
        self.aborted
    }

    pub fn is_firing(&self) -> bool {
        self.current.is_some()
    }

    /// Brings the timer count of `mode` in line with its degree. Surplus
    /// timers are cancelled latest-expiring first.
    fn adjust(&mut self, kernel: &mut Kernel<'_>, mode: usize) -> Result<()> {
        let target = self.modes[mode].timer_target(self.degrees[mode]);
        while self.timers[mode].len() > target {
            let Some(latest) = self.timers[mode]
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.due.total_cmp(&b.due).then(a.id.cmp(&b.id)))
                .map(|(i, _)| i)
            else {
                break;
            };
            let timer = self.timers[mode].swap_remove(latest);
            match timer.token {
                Some(token) => {
                    kernel.cancel(token);
                }
                None => self.deferred.retain(|(m, id)| !(*m == mode && *id == timer.id)),
            }
        }
        let population = kernel.population();
        while self.timers[mode].len() < target {
            let delay = self.modes[mode].delay.wait(kernel.rng, population);
            let id = self.next_id;
            self.next_id += 1;
            let token = kernel.schedule_self(Event::Timing { mode, timer: id }, delay)?;
            self.timers[mode].push(Timer {
                due: kernel.now + delay,
                id,
                token: Some(token),
            });
        }
        Ok(())
    }

    fn begin(&mut self, kernel: &mut Kernel<'_>, mode: usize) -> Result<()> {
        kernel.send_local(SectionKind::Input, Event::ModeFiring { mode, active: true })?;
        let mut awaiting = 0;
        for (link, place) in self.places.iter().enumerate() {
            let counts = self.modes[mode].enabling.row(link);
            if counts.iter().all(|c| *c == 0) {
                continue;
            }
            kernel.send(
                Address::input(*place),
                Event::JobRequest {
                    mode,
                    counts: counts.to_vec(),
                },
            )?;
            awaiting += 1;
        }
        trace!(node = kernel.node().0, mode, awaiting, "firing started");
        self.current = Some(InProgress {
            mode,
            awaiting,
            withdrawn: Vec::new(),
            failed: false,
        });
        Ok(())
    }

    fn expire(&mut self, kernel: &mut Kernel<'_>, mode: usize, id: u64) -> Result<()> {
        let Some(index) = self.timers[mode].iter().position(|t| t.id == id) else {
            return Ok(());
        };
        if self.current.is_some() {
            self.timers[mode][index].token = None;
            self.deferred.push_back((mode, id));
            return Ok(());
        }
        self.timers[mode].swap_remove(index);
        self.begin(kernel, mode)
    }

    fn collect(
        &mut self,
        kernel: &mut Kernel<'_>,
        place: NodeId,
        jobs: Vec<JobId>,
        complete: bool,
    ) -> Result<()> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };
        if complete {
            current.withdrawn.push((place, jobs));
        } else {
            current.failed = true;
        }
        current.awaiting = current.awaiting.saturating_sub(1);
        if current.awaiting == 0 {
            self.finish(kernel)?;
        }
        Ok(())
    }

    fn finish(&mut self, kernel: &mut Kernel<'_>) -> Result<()> {
        let Some(done) = self.current.take() else {
            return Ok(());
        };
        if done.failed {
            self.aborted += 1;
            debug!(node = kernel.node().0, mode = done.mode, "firing aborted");
            for (place, jobs) in done.withdrawn {
                kernel.send(Address::input(place), Event::Restore { jobs })?;
            }
        } else {
            self.fired += 1;
            let consumed = done.withdrawn.into_iter().flat_map(|(_, jobs)| jobs).collect();
            kernel.send_local(
                SectionKind::Output,
                Event::Firing {
                    mode: done.mode,
                    consumed,
                },
            )?;
        }
        kernel.send_local(
            SectionKind::Input,
            Event::ModeFiring {
                mode: done.mode,
                active: false,
            },
        )?;
        for mode in (0..self.modes.len()).filter(|m| *m != done.mode) {
            self.adjust(kernel, mode)?;
        }
        while self.current.is_none() {
            let Some((mode, id)) = self.deferred.pop_front() else {
                break;
            };
            if let Some(index) = self.timers[mode].iter().position(|t| t.id == id) {
                self.timers[mode].swap_remove(index);
                self.begin(kernel, mode)?;
            }
        }
        Ok(())
    }
}

impl Serves for Timing {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Enabling { mode, degree } => {
                self.degrees[*mode] = *degree;
                self.adjust(kernel, *mode)?;
                Ok(Handled::Consumed)
            }
            Event::Timing { mode, timer } => {
                self.expire(kernel, *mode, *timer)?;
                Ok(Handled::Consumed)
            }
            Event::JobWithdrawn { jobs, complete, .. } => {
                self.collect(kernel, message.source.node, jobs.clone(), *complete)?;
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
            | Event::JobChange { .. }
            | Event::ModeFiring { .. }
            | Event::JobRequest { .. }
            | Event::Restore { .. }
            | Event::Firing { .. } => Ok(Handled::NotConsumed),
        }
    }

    fn busy_units(&self) -> f64 {
        self.timers.iter().map(Vec::len).sum::<usize>() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::Distribution;
    use crate::job::ClassId;
    use crate::petri::TransitionMatrix;
    use crate::section::testing::Harness;
    use crate::topology::NodeKind;

    const P0: NodeId = NodeId(0);
    const P1: NodeId = NodeId(1);
    const T: NodeId = NodeId(2);

    fn mode(name: &str, need0: u32, need1: u32, servers: i64) -> ModeSpec {
        ModeSpec::new(
            name,
            TransitionMatrix::zeros(2, 1)
                .with(0, ClassId(0), need0)
                .with(1, ClassId(0), need1),
            TransitionMatrix::zeros(1, 1).with(0, ClassId(0), 1),
            Distribution::Deterministic(1.0),
        )
        .with_servers(servers)
    }

    fn setup(modes: Vec<ModeSpec>) -> (Harness, Timing) {
        let h = Harness::chain(&[NodeKind::Place, NodeKind::Place, NodeKind::Transition], 1)
            .link(0, 2)
            .link(1, 2);
        (h, Timing::new(Arc::new(modes), vec![P0, P1]))
    }

    fn deliver(h: &mut Harness, timing: &mut Timing, event: Event, from: Address) {
        let here = Address::service(T);
        let msg = h.message(event, from, here);
        timing.handle(&mut h.kernel(here), &msg).unwrap();
    }

    fn withdrawn(jobs: Vec<JobId>, complete: bool) -> Event {
        Event::JobWithdrawn {
            mode: 0,
            jobs,
            complete,
        }
    }

    #[test]
    fn test_timers_follow_degree_and_servers() {
        let (mut h, mut timing) = setup(vec![mode("single", 1, 0, 2), mode("open", 1, 0, -1)]);
        deliver(&mut h, &mut timing, Event::Enabling { mode: 0, degree: 5 }, Address::input(T));
        deliver(&mut h, &mut timing, Event::Enabling { mode: 1, degree: 5 }, Address::input(T));
        assert_eq!(timing.timers(0), 2);
        assert_eq!(timing.timers(1), 5);

        deliver(&mut h, &mut timing, Event::Enabling { mode: 1, degree: 1 }, Address::input(T));
        assert_eq!(timing.timers(1), 1);
        assert_eq!(h.queue.cancelled(), 4);
    }

    #[test]
    fn test_expiry_requests_required_places_only() {
        let (mut h, mut timing) = setup(vec![mode("m", 2, 0, 1)]);
        deliver(&mut h, &mut timing, Event::Enabling { mode: 0, degree: 1 }, Address::input(T));

        let expiry = h.next().unwrap();
        assert_eq!(expiry.event, Event::Timing { mode: 0, timer: 0 });
        timing.handle(&mut h.kernel(Address::service(T)), &expiry).unwrap();

        assert!(timing.is_firing());
        assert_eq!(timing.timers(0), 0);
        assert_eq!(
            h.drain_events(),
            vec![
                (Address::input(T), Event::ModeFiring { mode: 0, active: true }),
                (
                    Address::input(P0),
                    Event::JobRequest {
                        mode: 0,
                        counts: vec![2]
                    }
                ),
            ]
        );
    }

    #[test]
    fn test_complete_withdrawal_fires() {
        let (mut h, mut timing) = setup(vec![mode("m", 1, 1, 1)]);
        deliver(&mut h, &mut timing, Event::Enabling { mode: 0, degree: 1 }, Address::input(T));
        let expiry = h.next().unwrap();
        timing.handle(&mut h.kernel(Address::service(T)), &expiry).unwrap();
        h.drain_now();

        let a = h.kernel(Address::input(P0)).create_job(ClassId(0)).unwrap();
        let b = h.kernel(Address::input(P1)).create_job(ClassId(0)).unwrap();
        deliver(&mut h, &mut timing, withdrawn(vec![a], true), Address::input(P0));
        assert!(timing.is_firing());
        deliver(&mut h, &mut timing, withdrawn(vec![b], true), Address::input(P1));

        assert!(!timing.is_firing());
        assert_eq!(timing.fired(), 1);
        assert_eq!(
            h.drain_events(),
            vec![
                (
                    Address::output(T),
                    Event::Firing {
                        mode: 0,
                        consumed: vec![a, b]
                    }
                ),
                (Address::input(T), Event::ModeFiring { mode: 0, active: false }),
            ]
        );
    }

    #[test]
    fn test_partial_withdrawal_is_restored() {
        let (mut h, mut timing) = setup(vec![mode("m", 1, 1, 1)]);
        deliver(&mut h, &mut timing, Event::Enabling { mode: 0, degree: 1 }, Address::input(T));
        let expiry = h.next().unwrap();
        timing.handle(&mut h.kernel(Address::service(T)), &expiry).unwrap();
        h.drain_now();

        let a = h.kernel(Address::input(P0)).create_job(ClassId(0)).unwrap();
        deliver(&mut h, &mut timing, withdrawn(vec![a], true), Address::input(P0));
        deliver(&mut h, &mut timing, withdrawn(Vec::new(), false), Address::input(P1));

        assert_eq!(timing.aborted(), 1);
        assert_eq!(
            h.drain_events(),
            vec![
                (Address::input(P0), Event::Restore { jobs: vec![a] }),
                (Address::input(T), Event::ModeFiring { mode: 0, active: false }),
            ]
        );
    }

    #[test]
    fn test_expiry_during_firing_is_deferred() {
        let (mut h, mut timing) = setup(vec![mode("m", 1, 0, -1)]);
        deliver(&mut h, &mut timing, Event::Enabling { mode: 0, degree: 2 }, Address::input(T));
        let first = h.next().unwrap();
        let second = h.next().unwrap();
        timing.handle(&mut h.kernel(Address::service(T)), &first).unwrap();
        timing.handle(&mut h.kernel(Address::service(T)), &second).unwrap();
        h.drain_now();
        assert_eq!(timing.timers(0), 1);

        let a = h.kernel(Address::input(P0)).create_job(ClassId(0)).unwrap();
        deliver(&mut h, &mut timing, withdrawn(vec![a], true), Address::input(P0));

        // The deferred expiry starts the next firing straight away.
        assert!(timing.is_firing());
        assert_eq!(timing.timers(0), 0);
        let events = h.drain_events();
        assert!(events.contains(&(Address::input(T), Event::ModeFiring { mode: 0, active: true })));
        assert!(events.contains(&(
            Address::input(P0),
            Event::JobRequest {
                mode: 0,
                counts: vec![1]
            }
        )));
    }
}
