//! Multi-server pool with class compatibility and scheduling policies.
//!
//! Each job of class `c` holds `required[c]` compatible units from the
//! moment it starts until its output section acknowledges the downstream
//! hand-over. Units carry a small state machine for setup, switchover and
//! delay-off power management.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace};

use crate::context::Kernel;
use crate::distribution::{Distribution, ServiceStrategy};
use crate::error::{ConfigError, KernelError, Result};
use crate::event::{Event, Handled, Message, SectionKind};
use crate::job::{ClassId, ClassMask, JobId};
use crate::random::{RandomSource, reservoir_sample};
use crate::scheduler::EventToken;
use crate::stats::Measure;
use crate::Time;

use super::Serves;

/// Residual service below this is treated as rounding noise.
const RESIDUAL_TOLERANCE: f64 = 1e-9;

/// Order in which server types are tried when allocating units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    /// Fixed type order.
    #[default]
    Fcfs,
    /// A type moves to the back of the order when it becomes fully busy.
    Alis,
    /// Every type used by an allocation moves to the back.
    Fairness,
    /// Uniformly random choice among free compatible units.
    Rais,
    /// Fastest expected service first, splitting greedily across types.
    Fsf,
    /// Types sorted once by descending number of compatible classes.
    Alfs,
}

/// A group of identical server units.
#[derive(Debug, Clone)]
pub struct ServerType {
    pub name: String,
    pub units: u32,
    pub compatible: ClassMask,
    /// Service time per class when this type is the job's primary type.
    pub service: Vec<Option<Distribution>>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub types: Vec<ServerType>,
    /// Units needed per job, by class.
    pub required: Vec<u32>,
    pub policy: SchedulingPolicy,
    /// `switchover[from][to]`: setup delay when a unit changes class.
    pub switchover: Option<Vec<Vec<Option<Distribution>>>>,
    /// Setup delay when a powered-down unit is started, by class.
    pub setup: Vec<Option<Distribution>>,
    /// Idle time before a unit powers down, by the class it last served.
    pub delay_off: Vec<Option<Distribution>>,
}

impl ServerConfig {
    /// `units` identical servers compatible with every class.
    pub fn homogeneous(units: u32, service: Vec<Option<Distribution>>) -> Self {
        let classes = service.len();
        Self {
            types: vec![ServerType {
                name: "server".into(),
                units,
                compatible: ClassMask::all(classes),
                service,
            }],
            required: vec![1; classes],
            policy: SchedulingPolicy::Fcfs,
            switchover: None,
            setup: vec![None; classes],
            delay_off: vec![None; classes],
        }
    }

    pub fn total_units(&self) -> u32 {
        self.types.iter().map(|t| t.units).sum()
    }

    /// Checks the pool against the class table.
    ///
    /// # Errors
    ///
    /// - `ConfigError::ClassArity` - If a per-class vector has the wrong length
    /// - `ConfigError::InsufficientServers` - If a class needs more units than
    ///   its compatible types provide
    /// - `ConfigError::InvalidStation` - If a compatible type has no service time
    pub fn validate(&self, node: &str, classes: usize) -> std::result::Result<(), ConfigError> {
        let arity = |context: &str, actual: usize| {
            if actual == classes {
                Ok(())
            } else {
                Err(ConfigError::ClassArity {
                    context: format!("{context} at {node}"),
                    expected: classes,
                    actual,
                })
            }
        };
        arity("servers required", self.required.len())?;
        arity("setup delays", self.setup.len())?;
        arity("delay-off timers", self.delay_off.len())?;
        if let Some(matrix) = &self.switchover {
            arity("switchover rows", matrix.len())?;
            matrix.iter().try_for_each(|row| arity("switchover row", row.len()))?;
        }
        for server_type in &self.types {
            arity("server type service", server_type.service.len())?;
        }

        for class in 0..classes {
            let class = ClassId(class);
            let required = self.required[class.0];
            if required == 0 {
                return Err(ConfigError::InvalidStation {
                    node: node.to_string(),
                    reason: format!("class {class} requires zero servers"),
                });
            }
            let compatible: Vec<&ServerType> = self
                .types
                .iter()
                .filter(|t| t.compatible.contains(class))
                .collect();
            if compatible.is_empty() {
                continue;
            }
            let available: u32 = compatible.iter().map(|t| t.units).sum();
            if available < required {
                return Err(ConfigError::InsufficientServers {
                    node: node.to_string(),
                    class,
                    required,
                    available,
                });
            }
            if let Some(t) = compatible.iter().find(|t| t.service[class.0].is_none()) {
                return Err(ConfigError::InvalidStation {
                    node: node.to_string(),
                    reason: format!("server type {} has no service time for class {class}", t.name),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Idle,
    Running,
    SettingUp,
    PoweredDown,
}

#[derive(Debug)]
struct Unit {
    state: UnitState,
    last_class: Option<ClassId>,
    power_timer: Option<EventToken>,
}

impl Unit {
    fn is_free(&self) -> bool {
        matches!(self.state, UnitState::Idle | UnitState::PoweredDown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    SettingUp,
    Running { since: Time },
    /// Finished, units held until the output is acknowledged.
    Done,
}

#[derive(Debug)]
struct Assignment {
    class: ClassId,
    units: Vec<(usize, usize)>,
    demand: f64,
    token: Option<EventToken>,
    phase: Phase,
    assigned_at: Time,
}

/// Service section with a pool of heterogeneous server units.
pub struct Server {
    config: ServerConfig,
    units: Vec<Vec<Unit>>,
    order: Vec<usize>,
    assignments: BTreeMap<JobId, Assignment>,
    pending: VecDeque<JobId>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let units = config
            .types
            .iter()
            .map(|t| {
                (0..t.units)
                    .map(|_| Unit {
                        state: UnitState::Idle,
                        last_class: None,
                        power_timer: None,
                    })
                    .collect()
            })
            .collect();
        let mut order: Vec<usize> = (0..config.types.len()).collect();
        if config.policy == SchedulingPolicy::Alfs {
            order.sort_by_key(|t| std::cmp::Reverse(config.types[*t].compatible.count()));
        }
        Self {
            config,
            units,
            order,
            assignments: BTreeMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Current type order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn unit_state(&self, server_type: usize, unit: usize) -> UnitState {
        self.units[server_type][unit].state
    }

    /// Units currently assigned to a job.
    pub fn assigned_units(&self, job: JobId) -> Option<&[(usize, usize)]> {
        self.assignments.get(&job).map(|a| a.units.as_slice())
    }

    /// Busy units per server type.
    pub fn busy_by_type(&self) -> Vec<u32> {
        self.units
            .iter()
            .map(|units| units.iter().filter(|u| !u.is_free()).count() as u32)
            .collect()
    }

    fn free_units(&self, server_type: usize) -> Vec<usize> {
        let units = &self.units[server_type];
        let idle = (0..units.len()).filter(|u| units[*u].state == UnitState::Idle);
        let down = (0..units.len()).filter(|u| units[*u].state == UnitState::PoweredDown);
        idle.chain(down).collect()
    }

    fn free_count(&self, class: ClassId) -> u32 {
        self.config
            .types
            .iter()
            .enumerate()
            .filter(|(_, t)| t.compatible.contains(class))
            .map(|(i, _)| self.units[i].iter().filter(|u| u.is_free()).count() as u32)
            .sum()
    }

    fn can_start(&self, class: ClassId) -> bool {
        let compatible = self.config.types.iter().any(|t| t.compatible.contains(class));
        compatible && self.free_count(class) >= self.config.required[class.0]
    }

    fn ready_mask(&self) -> ClassMask {
        let classes = self.config.required.len();
        let mut mask = ClassMask::none(classes);
        for class in (0..classes).map(ClassId) {
            if self.can_start(class) {
                mask.insert(class);
            }
        }
        mask
    }

    fn greedy(&self, types: &[usize], class: ClassId, need: u32) -> Vec<(usize, usize)> {
        let mut chosen = Vec::with_capacity(need as usize);
        for &t in types {
            if chosen.len() as u32 == need {
                break;
            }
            if !self.config.types[t].compatible.contains(class) {
                continue;
            }
            let remaining = need as usize - chosen.len();
            chosen.extend(self.free_units(t).into_iter().take(remaining).map(|u| (t, u)));
        }
        chosen
    }

    /// Picks units for a job of `class` according to the policy.
    fn select_units(
        &self,
        rng: &mut dyn RandomSource,
        class: ClassId,
        population: usize,
    ) -> Option<Vec<(usize, usize)>> {
        if !self.can_start(class) {
            return None;
        }
        let need = self.config.required[class.0];
        let chosen = match self.config.policy {
            SchedulingPolicy::Rais => {
                let free: Vec<(usize, usize)> = (0..self.config.types.len())
                    .filter(|t| self.config.types[*t].compatible.contains(class))
                    .flat_map(|t| self.free_units(t).into_iter().map(move |u| (t, u)))
                    .collect();
                reservoir_sample(rng, &free, need as usize)
            }
            SchedulingPolicy::Fsf => {
                let mut types: Vec<usize> = (0..self.config.types.len()).collect();
                types.sort_by(|a, b| {
                    let expect = |t: usize| {
                        self.config.types[t].service[class.0]
                            .as_ref()
                            .map_or(f64::INFINITY, |d| d.expect(population))
                    };
                    expect(*a).total_cmp(&expect(*b))
                });
                self.greedy(&types, class, need)
            }
            SchedulingPolicy::Fcfs
            | SchedulingPolicy::Alis
            | SchedulingPolicy::Fairness
            | SchedulingPolicy::Alfs => self.greedy(&self.order, class, need),
        };
        (chosen.len() as u32 == need).then_some(chosen)
    }

    fn reorder(&mut self, used: &[(usize, usize)]) {
        let mut used_types: Vec<usize> = Vec::new();
        for (t, _) in used {
            if !used_types.contains(t) {
                used_types.push(*t);
            }
        }
        let to_back: Vec<usize> = match self.config.policy {
            SchedulingPolicy::Alis => used_types
                .into_iter()
                .filter(|t| self.units[*t].iter().all(|u| !u.is_free()))
                .collect(),
            SchedulingPolicy::Fairness => used_types,
            SchedulingPolicy::Fcfs
            | SchedulingPolicy::Rais
            | SchedulingPolicy::Fsf
            | SchedulingPolicy::Alfs => Vec::new(),
        };
        for t in to_back {
            self.order.retain(|o| *o != t);
            self.order.push(t);
        }
    }

    fn update_load(&self, kernel: &mut Kernel<'_>) {
        kernel.set_busy(self.busy_units());
    }

    /// Starts a job if enough compatible units are free.
    fn start(&mut self, kernel: &mut Kernel<'_>, job: JobId) -> Result<bool> {
        let class = kernel.class_of(job)?;
        let population = kernel.population();
        let Some(units) = self.select_units(kernel.rng, class, population) else {
            return Ok(false);
        };

        let primary = units[0].0;
        let pending_demand = kernel.jobs.get_mut(job)?.service_demand.take();
        let demand = match pending_demand {
            Some(demand) => demand,
            None => self.config.types[primary].service[class.0]
                .as_ref()
                .ok_or_else(|| {
                    KernelError::invariant(
                        kernel.here.node,
                        format!("no service time for class {class} on type {primary}"),
                    )
                })?
                .wait(kernel.rng, population),
        };

        let mut setup: f64 = 0.0;
        for &(t, u) in &units {
            let unit = &mut self.units[t][u];
            if let Some(token) = unit.power_timer.take() {
                kernel.scheduler.cancel(token);
            }
            let delay = if unit.state == UnitState::PoweredDown {
                self.config.setup[class.0].as_ref().map(|d| d.wait(kernel.rng, population))
            } else {
                match (&self.config.switchover, unit.last_class) {
                    (Some(matrix), Some(last)) if last != class => matrix[last.0][class.0]
                        .as_ref()
                        .map(|d| d.wait(kernel.rng, population)),
                    _ => None,
                }
            };
            setup = setup.max(delay.unwrap_or(0.0));
        }

        let (state, phase, event, delay) = if setup > 0.0 {
            (UnitState::SettingUp, Phase::SettingUp, Event::SetupDone(job), setup)
        } else {
            (
                UnitState::Running,
                Phase::Running { since: kernel.now },
                Event::ServiceDone(job),
                demand,
            )
        };
        for &(t, u) in &units {
            self.units[t][u].state = state;
        }
        let token = kernel.schedule_self(event, delay)?;
        kernel.jobs.get_mut(job)?.service_start = Some(kernel.now);

        self.reorder(&units);
        trace!(node = kernel.node().0, job = job.0, ?units, setup, demand, "service start");
        self.assignments.insert(
            job,
            Assignment {
                class,
                units,
                demand,
                token: Some(token),
                phase,
                assigned_at: kernel.now,
            },
        );
        self.update_load(kernel);
        Ok(true)
    }

    /// Frees the units of a job, arming delay-off timers.
    fn release(&mut self, kernel: &mut Kernel<'_>, job: JobId, arm_timers: bool) -> Result<Assignment> {
        let mut assignment = self
            .assignments
            .remove(&job)
            .ok_or(KernelError::DoubleRelease { job })?;
        if let Some(token) = assignment.token.take() {
            kernel.scheduler.cancel(token);
        }
        let class = assignment.class;
        for &(t, u) in &assignment.units {
            let unit = &mut self.units[t][u];
            unit.state = UnitState::Idle;
            unit.last_class = Some(class);
            if !arm_timers {
                continue;
            }
            if let Some(off) = &self.config.delay_off[class.0] {
                let wait = off.wait(kernel.rng, 0);
                let token = kernel.schedule_self(
                    Event::PowerDown {
                        server_type: t,
                        unit: u,
                    },
                    wait,
                )?;
                unit.power_timer = Some(token);
            }
        }
        self.update_load(kernel);
        Ok(assignment)
    }

    /// Starts pending jobs, then advertises remaining capacity.
    fn refill(&mut self, kernel: &mut Kernel<'_>) -> Result<()> {
        while let Some(&job) = self.pending.front() {
            if !self.start(kernel, job)? {
                break;
            }
            self.pending.pop_front();
        }
        let mask = self.ready_mask();
        if !mask.is_empty() && self.pending.is_empty() {
            kernel.send_local(SectionKind::Input, Event::Ready(mask))?;
        }
        Ok(())
    }

    fn preempt(&mut self, kernel: &mut Kernel<'_>, job: JobId) -> Result<()> {
        let class = kernel.class_of(job)?;
        let priority = kernel.priority_of(class);
        let need = self.config.required[class.0];
        let free = self.free_count(class);

        let mut candidates: Vec<(i32, Time, JobId)> = self
            .assignments
            .iter()
            .filter(|(_, a)| a.phase != Phase::Done)
            .map(|(id, a)| (kernel.priority_of(a.class), a.assigned_at, *id))
            .filter(|(p, _, _)| *p < priority)
            .collect();
        // Lowest priority first, most recently started among equals.
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.total_cmp(&a.1)).then(b.2.cmp(&a.2)));

        let victim = candidates.into_iter().map(|(_, _, id)| id).find(|id| {
            let freed = self.assignments[id]
                .units
                .iter()
                .filter(|(t, _)| self.config.types[*t].compatible.contains(class))
                .count() as u32;
            free + freed >= need
        });

        let Some(victim) = victim else {
            kernel.send_local(SectionKind::Input, Event::Bounced(job))?;
            return Ok(());
        };

        let now = kernel.now;
        let assignment = self.release(kernel, victim, false)?;
        let residual = match assignment.phase {
            Phase::Running { since } => assignment.demand - (now - since),
            Phase::SettingUp | Phase::Done => assignment.demand,
        };
        if residual < -RESIDUAL_TOLERANCE {
            return Err(KernelError::NegativeResidual {
                job: victim,
                residual,
            });
        }
        let record = kernel.jobs.get_mut(victim)?;
        record.total_service += assignment.demand - residual.max(0.0);
        record.service_demand = Some(residual.max(0.0));
        debug!(node = kernel.node().0, job = job.0, victim = victim.0, residual, "preempted");

        if !self.start(kernel, job)? {
            return Err(KernelError::invariant(
                kernel.here.node,
                format!("preempting job {job} could not start"),
            ));
        }
        kernel.send_local(SectionKind::Input, Event::Preempted(victim))
    }
}

impl Serves for Server {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Start => {
                let node = kernel.node();
                kernel.loads.set_servers(node, f64::from(self.config.total_units()));
                self.refill(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::Job(job) => {
                if self.pending.is_empty() && self.start(kernel, *job)? {
                    self.refill(kernel)?;
                } else {
                    self.pending.push_back(*job);
                }
                Ok(Handled::Consumed)
            }
            Event::SetupDone(job) => {
                let Some(assignment) = self.assignments.get_mut(job) else {
                    return Ok(Handled::Consumed);
                };
                for &(t, u) in &assignment.units {
                    self.units[t][u].state = UnitState::Running;
                }
                assignment.phase = Phase::Running { since: kernel.now };
                let demand = assignment.demand;
                let token = kernel.schedule_self(Event::ServiceDone(*job), demand)?;
                if let Some(assignment) = self.assignments.get_mut(job) {
                    assignment.token = Some(token);
                }
                Ok(Handled::Consumed)
            }
            Event::ServiceDone(job) => {
                let Some(assignment) = self.assignments.get_mut(job) else {
                    return Ok(Handled::Consumed);
                };
                assignment.phase = Phase::Done;
                assignment.token = None;
                let demand = assignment.demand;
                let class = assignment.class;
                let record = kernel.jobs.get_mut(*job)?;
                record.total_service += demand;
                let response = kernel.now - record.node_enter;
                kernel.record_at(Measure::ResponseTime, Some(class), response, 1.0);
                kernel.send_local(SectionKind::Output, Event::Job(*job))?;
                Ok(Handled::Consumed)
            }
            Event::Ack(job) => {
                self.release(kernel, *job, true)?;
                self.refill(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::PreemptRequest(job) => {
                self.preempt(kernel, *job)?;
                Ok(Handled::Consumed)
            }
            Event::PowerDown { server_type, unit } => {
                if let Some(unit) = self
                    .units
                    .get_mut(*server_type)
                    .and_then(|units| units.get_mut(*unit))
                {
                    if unit.state == UnitState::Idle && unit.power_timer.take().is_some() {
                        unit.state = UnitState::PoweredDown;
                    }
                }
                Ok(Handled::Consumed)
            }
            Event::Ready(_)
            | Event::Departed(_)
            | Event::Preempted(_)
            | Event::Bounced(_)
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
        self.busy_by_type().iter().map(|b| f64::from(*b)).sum()
    }

    fn total_units(&self) -> Option<f64> {
        Some(f64::from(self.config.total_units()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SequenceRandom;

    fn server_type(name: &str, units: u32, compatible: &[bool], mean: f64) -> ServerType {
        ServerType {
            name: name.into(),
            units,
            compatible: ClassMask::from_bits(compatible.to_vec()),
            service: vec![Some(Distribution::Deterministic(mean)); compatible.len()],
        }
    }

    fn config(types: Vec<ServerType>, policy: SchedulingPolicy) -> ServerConfig {
        let classes = types[0].service.len();
        ServerConfig {
            types,
            required: vec![1; classes],
            policy,
            switchover: None,
            setup: vec![None; classes],
            delay_off: vec![None; classes],
        }
    }

    #[test]
    fn test_insufficient_servers_rejected() {
        let mut cfg = config(vec![server_type("a", 2, &[true], 1.0)], SchedulingPolicy::Fcfs);
        cfg.required = vec![3];
        assert!(matches!(
            cfg.validate("q", 1),
            Err(ConfigError::InsufficientServers {
                required: 3,
                available: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_alfs_orders_by_descending_breadth() {
        let server = Server::new(config(
            vec![
                server_type("narrow", 1, &[true, false, false], 1.0),
                server_type("wide", 1, &[true, true, true], 1.0),
                server_type("mid", 1, &[true, true, false], 1.0),
            ],
            SchedulingPolicy::Alfs,
        ));
        assert_eq!(server.order(), &[1, 2, 0]);
    }

    #[test]
    fn test_fsf_prefers_fastest_type() {
        let server = Server::new(config(
            vec![
                server_type("slow", 2, &[true], 5.0),
                server_type("fast", 1, &[true], 1.0),
            ],
            SchedulingPolicy::Fsf,
        ));
        let mut rng = SequenceRandom::new(vec![0.5]);
        let units = server.select_units(&mut rng, ClassId(0), 1).unwrap();
        assert_eq!(units, vec![(1, 0)]);
    }

    #[test]
    fn test_fsf_splits_requirement_across_types() {
        let mut cfg = config(
            vec![
                server_type("slow", 2, &[true], 5.0),
                server_type("fast", 1, &[true], 1.0),
            ],
            SchedulingPolicy::Fsf,
        );
        cfg.required = vec![2];
        let server = Server::new(cfg);
        let mut rng = SequenceRandom::new(vec![0.5]);
        let units = server.select_units(&mut rng, ClassId(0), 1).unwrap();
        assert_eq!(units, vec![(1, 0), (0, 0)]);
    }

    #[test]
    fn test_alis_moves_type_back_only_when_full() {
        let mut server = Server::new(config(
            vec![
                server_type("a", 2, &[true], 1.0),
                server_type("b", 1, &[true], 1.0),
            ],
            SchedulingPolicy::Alis,
        ));
        server.units[0][0].state = UnitState::Running;
        server.reorder(&[(0, 0)]);
        assert_eq!(server.order(), &[0, 1]);

        server.units[0][1].state = UnitState::Running;
        server.reorder(&[(0, 1)]);
        assert_eq!(server.order(), &[1, 0]);
    }

    #[test]
    fn test_fairness_rotates_every_used_type() {
        let mut server = Server::new(config(
            vec![
                server_type("a", 2, &[true], 1.0),
                server_type("b", 2, &[true], 1.0),
                server_type("c", 2, &[true], 1.0),
            ],
            SchedulingPolicy::Fairness,
        ));
        server.reorder(&[(0, 0)]);
        assert_eq!(server.order(), &[1, 2, 0]);
        server.reorder(&[(1, 0), (2, 0)]);
        assert_eq!(server.order(), &[0, 1, 2]);
    }

    #[test]
    fn test_rais_picks_among_free_units() {
        let server = Server::new(config(
            vec![
                server_type("a", 2, &[true], 1.0),
                server_type("b", 2, &[true], 1.0),
            ],
            SchedulingPolicy::Rais,
        ));
        // Reservoir of size 1 over four units: draws 0.9, 0.9, 0.2 replace
        // the reservoir only on the last unit.
        let mut rng = SequenceRandom::new(vec![0.9, 0.9, 0.2]);
        let units = server.select_units(&mut rng, ClassId(0), 1).unwrap();
        assert_eq!(units, vec![(1, 1)]);
    }

    #[test]
    fn test_incompatible_class_never_ready() {
        let server = Server::new(config(
            vec![server_type("a", 1, &[true, false], 1.0)],
            SchedulingPolicy::Fcfs,
        ));
        let mask = server.ready_mask();
        assert!(mask.contains(ClassId(0)));
        assert!(!mask.contains(ClassId(1)));
    }
}
