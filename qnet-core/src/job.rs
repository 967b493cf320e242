//! Jobs, job classes and the job arena.
//!
//! Every job lives in a single [`JobTable`] indexed by a stable [`JobId`].
//! Registries and stations only ever hold ids, so a job appearing in several
//! scopes at once is just the same id present in several index sets.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::error::{KernelError, Result};
use crate::Time;

/// Stable identity of a job for its whole life in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub u64);

/// Index of a job class in the class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClassId(pub usize);

/// Index of a station in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub usize);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a class circulates in a fixed population or arrives from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClassKind {
    Open,
    Closed,
}

/// Shared, read-mostly description of a job class.
#[derive(Debug, Clone)]
pub struct JobClass {
    pub name: String,
    pub kind: ClassKind,
    /// Larger values are served first by priority strategies.
    pub priority: i32,
    pub soft_deadline: Option<f64>,
    /// Station where closed jobs start and where cycle times are measured.
    pub reference: Option<NodeId>,
    /// Number of jobs injected at start for closed classes.
    pub population: u32,
}

impl JobClass {
    /// Creates an open class with default priority.
    pub fn open(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ClassKind::Open,
            priority: 0,
            soft_deadline: None,
            reference: None,
            population: 0,
        }
    }

    /// Creates a closed class circulating `population` jobs from `reference`.
    pub fn closed(name: impl Into<String>, reference: NodeId, population: u32) -> Self {
        Self {
            name: name.into(),
            kind: ClassKind::Closed,
            priority: 0,
            soft_deadline: None,
            reference: Some(reference),
            population,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: f64) -> Self {
        self.soft_deadline = Some(deadline);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.kind == ClassKind::Closed
    }
}

/// Immutable table of all classes of a network.
#[derive(Debug, Clone, Default)]
pub struct ClassTable {
    classes: Vec<JobClass>,
}

impl ClassTable {
    pub fn new(classes: Vec<JobClass>) -> Self {
        Self { classes }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Returns the class description.
    ///
    /// # Panics
    ///
    /// Panics if the id was not issued by this table. Class ids are
    /// validated when the network is linked.
    pub fn get(&self, class: ClassId) -> &JobClass {
        &self.classes[class.0]
    }

    pub fn ids(&self) -> impl Iterator<Item = ClassId> + '_ {
        (0..self.classes.len()).map(ClassId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &JobClass)> {
        self.classes.iter().enumerate().map(|(i, c)| (ClassId(i), c))
    }
}

/// Fixed-size set of classes, also used as a server compatibility bitset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassMask {
    bits: Vec<bool>,
}

impl ClassMask {
    pub fn none(classes: usize) -> Self {
        Self {
            bits: vec![false; classes],
        }
    }

    pub fn all(classes: usize) -> Self {
        Self {
            bits: vec![true; classes],
        }
    }

    pub fn from_bits(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    pub fn insert(&mut self, class: ClassId) {
        if let Some(bit) = self.bits.get_mut(class.0) {
            *bit = true;
        }
    }

    pub fn contains(&self, class: ClassId) -> bool {
        self.bits.get(class.0).copied().unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        !self.bits.iter().any(|b| *b)
    }

    /// Number of classes in the set.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    pub fn width(&self) -> usize {
        self.bits.len()
    }
}

/// Link from a fork fragment back to the job it was split from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkLink {
    pub parent: JobId,
    pub fork_node: NodeId,
}

/// A simulated customer.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub class: ClassId,
    pub created_at: Time,
    /// Start of the current network cycle, used for system response time.
    pub system_enter: Time,
    /// Time of admission into the current station.
    pub node_enter: Time,
    pub service_start: Option<Time>,
    /// Pending service demand: sampled early (SJF) or left over after preemption.
    pub service_demand: Option<f64>,
    pub total_service: f64,
    pub current_node: Option<NodeId>,
    pub last_node: Option<NodeId>,
    pub forked_from: Option<ForkLink>,
    pub retrials: u32,
}

/// Arena owning every live job.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<JobId, Job>,
    next_id: u64,
    created: u64,
    destroyed: u64,
}

impl JobTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a job and returns its fresh id.
    pub fn create(&mut self, class: ClassId, now: Time) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;
        self.created += 1;
        self.jobs.insert(
            id,
            Job {
                id,
                class,
                created_at: now,
                system_enter: now,
                node_enter: now,
                service_start: None,
                service_demand: None,
                total_service: 0.0,
                current_node: None,
                last_node: None,
                forked_from: None,
                retrials: 0,
            },
        );
        id
    }

    /// Removes a job from the arena.
    ///
    /// # Errors
    ///
    /// - `KernelError::UnknownJob` - If the job does not exist
    pub fn destroy(&mut self, job: JobId) -> Result<Job> {
        let removed = self
            .jobs
            .remove(&job)
            .ok_or(KernelError::UnknownJob { job })?;
        self.destroyed += 1;
        Ok(removed)
    }

    /// # Errors
    ///
    /// - `KernelError::UnknownJob` - If the job does not exist
    pub fn get(&self, job: JobId) -> Result<&Job> {
        self.jobs.get(&job).ok_or(KernelError::UnknownJob { job })
    }

    /// # Errors
    ///
    /// - `KernelError::UnknownJob` - If the job does not exist
    pub fn get_mut(&mut self, job: JobId) -> Result<&mut Job> {
        self.jobs.get_mut(&job).ok_or(KernelError::UnknownJob { job })
    }

    /// # Errors
    ///
    /// - `KernelError::UnknownJob` - If the job does not exist
    pub fn class_of(&self, job: JobId) -> Result<ClassId> {
        Ok(self.get(job)?.class)
    }

    pub fn contains(&self, job: JobId) -> bool {
        self.jobs.contains_key(&job)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn destroyed(&self) -> u64 {
        self.destroyed
    }
}
