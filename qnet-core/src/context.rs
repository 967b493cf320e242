//! Per-dispatch context handed to every section.
//!
//! A [`Kernel`] bundles the clock, random source, scheduler, statistics
//! sink and the shared registries for the duration of one message. Every
//! operation that moves a job between scopes goes through here so the job
//! table, node registries and network registry change together.

use tracing::debug;

use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::event::{Address, Event, Message, SectionKind};
use crate::forks::ForkTable;
use crate::job::{ClassId, ClassTable, JobId, JobTable, NodeId};
use crate::random::RandomSource;
use crate::registry::{DropReason, NetworkRegistry};
use crate::routing::RouteView;
use crate::scheduler::{EventToken, Scheduler};
use crate::stats::{LoadBoard, Measure, Sample, StatisticsSink};
use crate::topology::Topology;
use crate::warnings::{WarningKind, WarningLog};
use crate::Time;

pub struct Kernel<'a> {
    pub now: Time,
    /// Section currently handling a message.
    pub here: Address,
    pub jobs: &'a mut JobTable,
    pub registry: &'a mut NetworkRegistry,
    pub loads: &'a mut LoadBoard,
    pub forks: &'a mut ForkTable,
    pub topology: &'a Topology,
    pub classes: &'a ClassTable,
    pub config: &'a KernelConfig,
    pub rng: &'a mut dyn RandomSource,
    pub scheduler: &'a mut dyn Scheduler,
    pub stats: &'a mut dyn StatisticsSink,
    pub warnings: &'a mut WarningLog,
    /// Switches still to be mirrored in the station's input section.
    pub(crate) switched: Vec<(JobId, ClassId)>,
}

impl<'a> Kernel<'a> {
    pub fn node(&self) -> NodeId {
        self.here.node
    }

    /// Schedules an event back to the current section.
    ///
    /// # Errors
    ///
    /// - `KernelError::NegativeDelay` - If `delay` is negative
    pub fn schedule_self(&mut self, event: Event, delay: Time) -> Result<EventToken> {
        let message = Message::new(event, self.here, self.here, self.now);
        self.scheduler.schedule(message, delay)
    }

    /// Delivers an event to another section after `delay`.
    ///
    /// # Errors
    ///
    /// - `KernelError::NegativeDelay` - If `delay` is negative
    pub fn send_after(&mut self, to: Address, event: Event, delay: Time) -> Result<EventToken> {
        let message = Message::new(event, self.here, to, self.now);
        self.scheduler.schedule(message, delay)
    }

    /// Delivers an event to another section at the current instant.
    ///
    /// # Errors
    ///
    /// Propagates scheduler failures.
    pub fn send(&mut self, to: Address, event: Event) -> Result<()> {
        self.send_after(to, event, 0.0).map(drop)
    }

    /// Delivers an event to a sibling section of the current station.
    ///
    /// # Errors
    ///
    /// Propagates scheduler failures.
    pub fn send_local(&mut self, section: SectionKind, event: Event) -> Result<()> {
        self.send(Address::new(self.here.node, section), event)
    }

    pub fn cancel(&mut self, token: EventToken) -> bool {
        self.scheduler.cancel(token)
    }

    /// # Errors
    ///
    /// - `KernelError::UnknownJob` - If the job does not exist
    pub fn class_of(&self, job: JobId) -> Result<ClassId> {
        self.jobs.class_of(job)
    }

    pub fn priority_of(&self, class: ClassId) -> i32 {
        self.classes.get(class).priority
    }

    /// Jobs currently resident at the station.
    pub fn population(&self) -> usize {
        self.registry.node(self.here.node).len()
    }

    /// Creates a job of `class` and registers it at network scope.
    ///
    /// # Errors
    ///
    /// Propagates registry failures.
    pub fn create_job(&mut self, class: ClassId) -> Result<JobId> {
        let job = self.jobs.create(class, self.now);
        self.registry.network_mut().add(job, class, self.now)?;
        Ok(job)
    }

    /// Admits a job into the current station's node registry.
    ///
    /// Closed jobs entering their reference station close a cycle: the cycle
    /// time is recorded and a new cycle starts.
    ///
    /// # Errors
    ///
    /// - `KernelError::UnknownJob` - If the job does not exist
    /// - `KernelError::AlreadyRegistered` - If the job is already at this station
    pub fn enter_node(&mut self, job: JobId) -> Result<()> {
        let node = self.here.node;
        let now = self.now;
        let record = self.jobs.get_mut(job)?;
        record.node_enter = now;
        record.current_node = Some(node);
        let class = record.class;

        let class_info = self.classes.get(class);
        if class_info.is_closed() && class_info.reference == Some(node) {
            let cycle = now - record.system_enter;
            record.system_enter = now;
            if record.last_node.is_some() {
                self.record_at(Measure::SystemResponseTime, Some(class), cycle, 1.0);
            }
        }

        self.registry.node_mut(node).add(job, class, now)
    }

    /// Removes a job from the current station's node registry and records
    /// its residence time.
    ///
    /// # Errors
    ///
    /// - `KernelError::NotRegistered` - If the job is not at this station
    pub fn leave_node(&mut self, job: JobId) -> Result<()> {
        let node = self.here.node;
        let registry = self.registry.node_mut(node);
        let entered = registry.entered_at(job).unwrap_or(self.now);
        let class = registry.remove(job, self.now)?;
        let residence = self.now - entered;
        self.loads.observe_residence(node, residence);
        self.record_at(Measure::ResidenceTime, Some(class), residence, 1.0);
        self.record_at(Measure::Throughput, Some(class), 1.0, 1.0);
        if let Ok(record) = self.jobs.get_mut(job) {
            record.last_node = Some(node);
        }
        Ok(())
    }

    /// Removes a job from the node and network scopes and from the job table.
    ///
    /// Section-level registries are the caller's responsibility.
    ///
    /// # Errors
    ///
    /// - `KernelError::UnknownJob` - If the job does not exist
    /// - `KernelError::NotRegistered` - If the job is missing at network scope
    pub fn destroy_job(&mut self, job: JobId, reason: DropReason) -> Result<()> {
        let class = self.jobs.class_of(job)?;
        let now = self.now;
        let node = self.here.node;

        let node_registry = self.registry.node_mut(node);
        node_registry.leave_orbit(job);
        if node_registry.contains(job) {
            match reason {
                DropReason::Completed => {
                    node_registry.remove(job, now)?;
                }
                DropReason::Reneged => {
                    node_registry.renege(job, now)?;
                }
                DropReason::Absorbed => {
                    node_registry.discard(job, now)?;
                }
                DropReason::Dropped
                | DropReason::Balked
                | DropReason::RetrialsExhausted
                | DropReason::Unroutable => {
                    node_registry.drop_job(job, now)?;
                }
            }
        } else {
            match reason {
                DropReason::Balked => node_registry.balk(class),
                DropReason::Dropped | DropReason::RetrialsExhausted => node_registry.refuse(class),
                DropReason::Completed
                | DropReason::Reneged
                | DropReason::Absorbed
                | DropReason::Unroutable => {}
            }
        }

        let network = self.registry.network_mut();
        match reason {
            DropReason::Completed => {
                network.remove(job, now)?;
            }
            DropReason::Absorbed => {
                network.discard(job, now)?;
            }
            DropReason::Reneged => {
                network.renege(job, now)?;
            }
            DropReason::Balked => {
                network.balk(class);
                network.discard(job, now)?;
            }
            DropReason::Dropped | DropReason::RetrialsExhausted | DropReason::Unroutable => {
                network.drop_job(job, now)?;
            }
        }

        let measure = match reason {
            DropReason::Dropped | DropReason::RetrialsExhausted | DropReason::Unroutable => {
                Some(Measure::Dropped)
            }
            DropReason::Balked => Some(Measure::Balked),
            DropReason::Reneged => Some(Measure::Reneged),
            DropReason::Completed | DropReason::Absorbed => None,
        };
        if let Some(measure) = measure {
            self.record_at(measure, Some(class), 1.0, 1.0);
        }

        self.jobs.destroy(job)?;
        debug!(node = node.0, job = job.0, ?reason, "job destroyed");
        Ok(())
    }

    /// Switches a job's class in the job table and every scope holding it.
    /// Returns the previous class.
    ///
    /// Node and network scopes change here. A job resident at the current
    /// station is also queued in [`Kernel::take_switches`], which the station
    /// applies to its input section before the dispatch returns.
    ///
    /// # Errors
    ///
    /// - `KernelError::UnknownJob` - If the job does not exist
    /// - `KernelError::NotRegistered` - If the job is missing at network scope
    pub fn switch_class(&mut self, job: JobId, to: ClassId) -> Result<ClassId> {
        if to.0 >= self.classes.len() {
            return Err(KernelError::invariant(
                self.here.node,
                format!("class switch to unknown class {to}"),
            ));
        }
        let from = self.jobs.class_of(job)?;
        if from == to {
            return Ok(from);
        }
        let now = self.now;
        let current = self.jobs.get(job)?.current_node;
        if current == Some(self.here.node) {
            self.switched.push((job, to));
        }
        let mut scopes = vec![self.here.node];
        scopes.extend(current.filter(|node| *node != self.here.node));
        for node in scopes {
            let registry = self.registry.node_mut(node);
            if registry.contains(job) {
                registry.switch_class(job, to, now)?;
            }
        }
        self.registry.network_mut().switch_class(job, to, now)?;
        self.jobs.get_mut(job)?.class = to;
        debug!(node = self.here.node.0, job = job.0, from = from.0, to = to.0, "class switch");
        Ok(from)
    }

    /// Class switches of jobs resident at the current station, in the order
    /// they happened.
    pub fn take_switches(&mut self) -> Vec<(JobId, ClassId)> {
        std::mem::take(&mut self.switched)
    }

    pub fn warn_once(&mut self, class: Option<ClassId>, kind: WarningKind, message: &str) -> bool {
        self.warnings.warn_once(self.here.node, class, kind, message)
    }

    /// Updates the busy units of the current station and records the
    /// utilization of the interval that just ended, weighted by its length.
    pub fn set_busy(&mut self, busy: f64) {
        let node = self.here.node;
        let (utilization, elapsed) = self.loads.set_busy(node, busy, self.now);
        if elapsed > 0.0 && self.loads.servers(node).is_finite() {
            self.record_at(Measure::Utilization, None, utilization, elapsed);
        }
    }

    /// Records a sample attributed to the current station.
    pub fn record_at(&mut self, measure: Measure, class: Option<ClassId>, value: f64, weight: f64) {
        self.stats.record(Sample {
            measure,
            node: Some(self.here.node),
            class,
            value,
            weight,
            time: self.now,
        });
    }

    /// Read-only view for routing strategies, paired with the random source.
    pub fn route_view(&mut self) -> (RouteView<'_>, &mut dyn RandomSource) {
        (
            RouteView {
                here: self.here.node,
                topology: self.topology,
                classes: self.classes,
                registry: &*self.registry,
                loads: &*self.loads,
                epsilon: self.config.tie_epsilon,
            },
            &mut *self.rng,
        )
    }
}
