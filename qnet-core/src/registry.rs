//! Job registries at section, node and network scope.
//!
//! All three scopes share the same [`JobRegistry`] shape: per-class buckets
//! kept in insertion order, an O(1) id index, a retrial orbit, and per-class
//! counters with a time-integral of the population. A job is in at most one
//! active bucket of a registry; switching class moves it between buckets in
//! a single call.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::error::{KernelError, Result};
use crate::job::{ClassId, JobId, NodeId};
use crate::Time;

/// Why a job left the network before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DropReason {
    /// Rejected by a full station with a drop policy.
    Dropped,
    /// Refused to join a queue.
    Balked,
    /// Abandoned the queue after its patience expired.
    Reneged,
    /// Exceeded its retrial attempts.
    RetrialsExhausted,
    /// No viable output existed.
    Unroutable,
    /// Consumed by a join or a transition.
    Absorbed,
    /// Left through a sink.
    Completed,
}

/// Per-class counters of a registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassCounters {
    pub arrivals: u64,
    pub departures: u64,
    pub dropped: u64,
    pub balked: u64,
    pub reneged: u64,
    pub retrials: u64,
    pub switched_in: u64,
    pub switched_out: u64,
    /// Sum of sojourn times of departed jobs.
    pub sojourn_sum: f64,
    /// Integral of the class population over time.
    pub area: f64,
    last_change: Time,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    class: ClassId,
    sequence: u64,
    entered: Time,
}

/// Registry of jobs at one scope.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    scope: &'static str,
    buckets: Vec<BTreeMap<u64, JobId>>,
    index: HashMap<JobId, Entry>,
    orbit: HashMap<JobId, ClassId>,
    counters: Vec<ClassCounters>,
    next_sequence: u64,
}

impl JobRegistry {
    pub fn new(scope: &'static str, classes: usize) -> Self {
        Self {
            scope,
            buckets: vec![BTreeMap::new(); classes],
            index: HashMap::new(),
            orbit: HashMap::new(),
            counters: vec![ClassCounters::default(); classes],
            next_sequence: 0,
        }
    }

    fn accumulate(&mut self, class: ClassId, now: Time) {
        let population = self.buckets[class.0].len() as f64;
        let counters = &mut self.counters[class.0];
        counters.area += population * (now - counters.last_change).max(0.0);
        counters.last_change = now;
    }

    fn insert(&mut self, job: JobId, class: ClassId, entered: Time, now: Time) {
        self.accumulate(class, now);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.buckets[class.0].insert(sequence, job);
        self.index.insert(
            job,
            Entry {
                class,
                sequence,
                entered,
            },
        );
    }

    fn take(&mut self, job: JobId, now: Time) -> Result<Entry> {
        let entry = self.index.remove(&job).ok_or(KernelError::NotRegistered {
            job,
            scope: self.scope,
        })?;
        self.accumulate(entry.class, now);
        self.buckets[entry.class.0].remove(&entry.sequence);
        Ok(entry)
    }

    /// Registers an arriving job.
    ///
    /// # Errors
    ///
    /// - `KernelError::AlreadyRegistered` - If the job is already active or
    ///   in orbit here
    pub fn add(&mut self, job: JobId, class: ClassId, now: Time) -> Result<()> {
        if self.index.contains_key(&job) || self.orbit.contains_key(&job) {
            return Err(KernelError::AlreadyRegistered {
                job,
                scope: self.scope,
            });
        }
        self.insert(job, class, now, now);
        self.counters[class.0].arrivals += 1;
        Ok(())
    }

    /// Removes a departing job and accounts its sojourn time.
    ///
    /// # Errors
    ///
    /// - `KernelError::NotRegistered` - If the job is not active here
    pub fn remove(&mut self, job: JobId, now: Time) -> Result<ClassId> {
        let entry = self.take(job, now)?;
        let counters = &mut self.counters[entry.class.0];
        counters.departures += 1;
        counters.sojourn_sum += now - entry.entered;
        Ok(entry.class)
    }

    /// Moves a job to another class bucket, keeping its arrival time.
    ///
    /// # Errors
    ///
    /// - `KernelError::NotRegistered` - If the job is not active here
    pub fn switch_class(&mut self, job: JobId, to: ClassId, now: Time) -> Result<()> {
        let current = self.index.get(&job).ok_or(KernelError::NotRegistered {
            job,
            scope: self.scope,
        })?;
        if current.class == to {
            return Ok(());
        }
        let entry = self.take(job, now)?;
        self.counters[entry.class.0].switched_out += 1;
        self.counters[to.0].switched_in += 1;
        self.insert(job, to, entry.entered, now);
        Ok(())
    }

    /// Removes a job that is lost, counting it as dropped.
    ///
    /// # Errors
    ///
    /// - `KernelError::NotRegistered` - If the job is not active here
    pub fn drop_job(&mut self, job: JobId, now: Time) -> Result<ClassId> {
        let entry = self.take(job, now)?;
        self.counters[entry.class.0].dropped += 1;
        Ok(entry.class)
    }

    /// Removes a job without counting a departure, for jobs absorbed by a
    /// join or consumed by a transition.
    ///
    /// # Errors
    ///
    /// - `KernelError::NotRegistered` - If the job is not active here
    pub fn discard(&mut self, job: JobId, now: Time) -> Result<ClassId> {
        Ok(self.take(job, now)?.class)
    }

    /// Counts a job rejected before it was ever registered here.
    pub fn refuse(&mut self, class: ClassId) {
        self.counters[class.0].dropped += 1;
    }

    /// Counts a job that refused to join. Balking jobs are never registered.
    pub fn balk(&mut self, class: ClassId) {
        self.counters[class.0].balked += 1;
    }

    /// Removes a job that abandoned the queue.
    ///
    /// # Errors
    ///
    /// - `KernelError::NotRegistered` - If the job is not active here
    pub fn renege(&mut self, job: JobId, now: Time) -> Result<ClassId> {
        let entry = self.take(job, now)?;
        self.counters[entry.class.0].reneged += 1;
        Ok(entry.class)
    }

    /// Parks a job in the retrial orbit. An active job leaves its bucket.
    ///
    /// # Errors
    ///
    /// - `KernelError::AlreadyRegistered` - If the job is already in orbit
    pub fn move_to_retrial_orbit(&mut self, job: JobId, class: ClassId, now: Time) -> Result<()> {
        if self.orbit.contains_key(&job) {
            return Err(KernelError::AlreadyRegistered {
                job,
                scope: self.scope,
            });
        }
        if self.index.contains_key(&job) {
            self.take(job, now)?;
        }
        self.orbit.insert(job, class);
        Ok(())
    }

    /// Takes a job out of the orbit for a new attempt.
    ///
    /// # Errors
    ///
    /// - `KernelError::NotRegistered` - If the job is not in orbit
    pub fn retry(&mut self, job: JobId) -> Result<ClassId> {
        let class = self.orbit.remove(&job).ok_or(KernelError::NotRegistered {
            job,
            scope: self.scope,
        })?;
        self.counters[class.0].retrials += 1;
        Ok(class)
    }

    /// Removes a job from the orbit without counting a retrial.
    pub fn leave_orbit(&mut self, job: JobId) -> Option<ClassId> {
        self.orbit.remove(&job)
    }

    pub fn contains(&self, job: JobId) -> bool {
        self.index.contains_key(&job)
    }

    pub fn in_orbit(&self, job: JobId) -> bool {
        self.orbit.contains_key(&job)
    }

    pub fn class_of(&self, job: JobId) -> Option<ClassId> {
        self.index.get(&job).map(|e| e.class)
    }

    /// Arrival time of an active job.
    pub fn entered_at(&self, job: JobId) -> Option<Time> {
        self.index.get(&job).map(|e| e.entered)
    }

    /// Total active jobs.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn class_len(&self, class: ClassId) -> usize {
        self.buckets.get(class.0).map_or(0, BTreeMap::len)
    }

    pub fn orbit_len(&self) -> usize {
        self.orbit.len()
    }

    /// Jobs of a class in arrival order.
    pub fn iter_class(&self, class: ClassId) -> impl Iterator<Item = JobId> + '_ {
        self.buckets[class.0].values().copied()
    }

    pub fn counters(&self, class: ClassId) -> &ClassCounters {
        &self.counters[class.0]
    }

    pub fn classes(&self) -> usize {
        self.buckets.len()
    }

    /// Time-averaged population of a class over `[0, now]`.
    pub fn mean_population(&self, class: ClassId, now: Time) -> f64 {
        if now <= 0.0 {
            return 0.0;
        }
        let counters = &self.counters[class.0];
        let pending = self.buckets[class.0].len() as f64 * (now - counters.last_change).max(0.0);
        (counters.area + pending) / now
    }

    /// Mean sojourn time of departed jobs of a class.
    pub fn mean_sojourn(&self, class: ClassId) -> Option<f64> {
        let counters = &self.counters[class.0];
        (counters.departures > 0).then(|| counters.sojourn_sum / counters.departures as f64)
    }

    /// Checks that buckets and index describe the same membership.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn verify(&self) -> std::result::Result<(), String> {
        let bucket_total: usize = self.buckets.iter().map(BTreeMap::len).sum();
        if bucket_total != self.index.len() {
            return Err(format!(
                "{} registry: buckets hold {} jobs, index holds {}",
                self.scope,
                bucket_total,
                self.index.len()
            ));
        }
        for (job, entry) in &self.index {
            if self.buckets[entry.class.0].get(&entry.sequence) != Some(job) {
                return Err(format!(
                    "{} registry: job {job} indexed in class {} but not in its bucket",
                    self.scope, entry.class
                ));
            }
            if self.orbit.contains_key(job) {
                return Err(format!(
                    "{} registry: job {job} both active and in orbit",
                    self.scope
                ));
            }
        }
        Ok(())
    }
}

/// Node-level and network-level registries of a network.
#[derive(Debug, Clone)]
pub struct NetworkRegistry {
    network: JobRegistry,
    nodes: Vec<JobRegistry>,
}

impl NetworkRegistry {
    pub fn new(nodes: usize, classes: usize) -> Self {
        Self {
            network: JobRegistry::new("network", classes),
            nodes: (0..nodes).map(|_| JobRegistry::new("node", classes)).collect(),
        }
    }

    pub fn network(&self) -> &JobRegistry {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut JobRegistry {
        &mut self.network
    }

    pub fn node(&self, node: NodeId) -> &JobRegistry {
        &self.nodes[node.0]
    }

    pub fn node_mut(&mut self, node: NodeId) -> &mut JobRegistry {
        &mut self.nodes[node.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &JobRegistry)> {
        self.nodes.iter().enumerate().map(|(i, r)| (NodeId(i), r))
    }
}
