//! Multi-tier item cache.
//!
//! Each request samples an item from the class popularity vector. A hit may
//! move the item to another tier following the per-tier transition rows; a
//! miss inserts it at the front of tier 0. Tiers are ordered most recently
//! inserted or touched first.

use std::collections::VecDeque;

use tracing::trace;

use crate::context::Kernel;
use crate::distribution::check_probabilities;
use crate::error::{ConfigError, KernelError, Result};
use crate::event::{Event, Handled, Message, SectionKind};
use crate::job::{ClassId, JobId};
use crate::random::{RandomSource, sample_index, uniform_index};
use crate::stats::Measure;
use crate::Time;

use super::Serves;
use super::passthrough::ready_all;

/// Replacement policy choosing the victim of a full tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CachePolicy {
    /// Least recently used.
    Lru,
    /// Oldest insertion.
    Fifo,
    /// Fewest accesses, least recent among equals.
    Lfu,
    /// Uniformly random resident item.
    Random,
    /// Items expire `ttl` after insertion; expired items are swept before
    /// any capacity check, then the least recently used item is evicted.
    Ttl { ttl: f64 },
}

/// How a hit moves an item into another tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveSemantics {
    /// The victim of a full destination tier swaps into the item's old slot.
    #[default]
    ReplaceInPlace,
    /// The victim leaves the cache; the item goes to the destination front.
    EvictThenAppend,
    /// Items never change tier; a hit only refreshes the position.
    MoveToFrontOnly,
}

#[derive(Debug, Clone, Default)]
struct ItemState {
    tier: Option<usize>,
    last_access: Time,
    inserted_at: Time,
    accesses: u64,
    expiry: Option<Time>,
}

/// Tier contents and per-item bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheStore {
    tiers: Vec<VecDeque<usize>>,
    capacities: Vec<usize>,
    items: Vec<ItemState>,
    policy: CachePolicy,
    moves: MoveSemantics,
}

impl CacheStore {
    pub fn new(items: usize, capacities: Vec<usize>, policy: CachePolicy, moves: MoveSemantics) -> Self {
        Self {
            tiers: capacities.iter().map(|c| VecDeque::with_capacity(*c)).collect(),
            capacities,
            items: vec![ItemState::default(); items],
            policy,
            moves,
        }
    }

    pub fn tier_of(&self, item: usize) -> Option<usize> {
        self.items.get(item).and_then(|i| i.tier)
    }

    /// Items of `tier`, front first.
    pub fn contents(&self, tier: usize) -> Vec<usize> {
        self.tiers[tier].iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every item whose TTL has elapsed. Returns how many were removed.
    pub fn sweep(&mut self, now: Time) -> usize {
        let expired: Vec<usize> = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, s)| s.tier.is_some() && s.expiry.is_some_and(|e| e <= now))
            .map(|(i, _)| i)
            .collect();
        for item in &expired {
            self.evict(*item);
        }
        expired.len()
    }

    fn detach(&mut self, item: usize) -> Option<(usize, usize)> {
        let tier = self.items[item].tier?;
        let position = self.tiers[tier].iter().position(|i| *i == item)?;
        self.tiers[tier].remove(position);
        Some((tier, position))
    }

    fn evict(&mut self, item: usize) {
        self.detach(item);
        let state = &mut self.items[item];
        state.tier = None;
        state.expiry = None;
    }

    fn victim(&self, tier: usize, rng: &mut dyn RandomSource) -> Option<usize> {
        let resident = &self.tiers[tier];
        match self.policy {
            CachePolicy::Lru | CachePolicy::Fifo | CachePolicy::Ttl { .. } => resident.back().copied(),
            CachePolicy::Random => {
                (!resident.is_empty()).then(|| resident[uniform_index(rng, resident.len())])
            }
            CachePolicy::Lfu => resident.iter().rev().copied().min_by(|a, b| {
                let (a, b) = (&self.items[*a], &self.items[*b]);
                a.accesses
                    .cmp(&b.accesses)
                    .then(a.last_access.total_cmp(&b.last_access))
            }),
        }
    }

    fn touch(&mut self, item: usize, now: Time) {
        let state = &mut self.items[item];
        state.last_access = now;
        state.accesses += 1;
        let moves_to_front = matches!(self.policy, CachePolicy::Lru | CachePolicy::Ttl { .. });
        if moves_to_front {
            if let Some((tier, _)) = self.detach(item) {
                self.tiers[tier].push_front(item);
            }
        }
    }

    fn insert(&mut self, item: usize, tier: usize, now: Time, rng: &mut dyn RandomSource) {
        if self.capacities[tier] == 0 {
            return;
        }
        if self.tiers[tier].len() >= self.capacities[tier] {
            if let Some(victim) = self.victim(tier, rng) {
                self.evict(victim);
            }
        }
        self.tiers[tier].push_front(item);
        let ttl = match self.policy {
            CachePolicy::Ttl { ttl } => Some(now + ttl),
            CachePolicy::Lru | CachePolicy::Fifo | CachePolicy::Lfu | CachePolicy::Random => None,
        };
        self.items[item] = ItemState {
            tier: Some(tier),
            last_access: now,
            inserted_at: now,
            accesses: 1,
            expiry: ttl,
        };
    }

    /// Moves a hit item from tier `from` to tier `to`.
    fn promote(&mut self, item: usize, to: usize, now: Time, rng: &mut dyn RandomSource) {
        if to >= self.tiers.len() {
            self.touch(item, now);
            return;
        }
        let Some((from, position)) = self.detach(item) else {
            return;
        };
        let state = &mut self.items[item];
        state.last_access = now;
        state.accesses += 1;

        if self.tiers[to].len() >= self.capacities[to] {
            match self.moves {
                MoveSemantics::ReplaceInPlace => {
                    if let Some(victim) = self.victim(to, rng) {
                        let victim_position = self.tiers[to].iter().position(|i| *i == victim);
                        if let Some(slot) = victim_position {
                            self.tiers[to][slot] = item;
                        }
                        let insert_at = position.min(self.tiers[from].len());
                        self.tiers[from].insert(insert_at, victim);
                        self.items[victim].tier = Some(from);
                        self.items[item].tier = Some(to);
                        return;
                    }
                }
                MoveSemantics::EvictThenAppend | MoveSemantics::MoveToFrontOnly => {
                    if let Some(victim) = self.victim(to, rng) {
                        self.evict(victim);
                    }
                }
            }
        }
        if self.capacities[to] == 0 {
            self.tiers[from].insert(position, item);
            return;
        }
        self.tiers[to].push_front(item);
        self.items[item].tier = Some(to);
    }

    /// Serves one request for `item`. Returns whether it was a hit.
    ///
    /// `transitions[tier]` is the probability row over destination tiers
    /// for a hit found in `tier`.
    pub fn request(
        &mut self,
        item: usize,
        now: Time,
        rng: &mut dyn RandomSource,
        transitions: &[Vec<f64>],
    ) -> bool {
        if matches!(self.policy, CachePolicy::Ttl { .. }) {
            self.sweep(now);
        }
        let Some(tier) = self.tier_of(item) else {
            self.insert(item, 0, now, rng);
            return false;
        };
        let destination = match self.moves {
            MoveSemantics::MoveToFrontOnly => tier,
            MoveSemantics::ReplaceInPlace | MoveSemantics::EvictThenAppend => transitions
                .get(tier)
                .and_then(|row| sample_index(rng, row))
                .unwrap_or(tier),
        };
        if destination == tier {
            self.touch(item, now);
        } else {
            self.promote(item, destination, now, rng);
        }
        true
    }

    /// Time the item was inserted, if cached.
    pub fn inserted_at(&self, item: usize) -> Option<Time> {
        let state = self.items.get(item)?;
        state.tier.map(|_| state.inserted_at)
    }
}

/// Cache station settings. Per-class vectors are indexed by class.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub items: usize,
    /// Capacity of each tier, tier 0 first.
    pub tiers: Vec<usize>,
    pub policy: CachePolicy,
    pub moves: MoveSemantics,
    /// Item popularity per class; a class without one cannot be served.
    pub popularity: Vec<Option<Vec<f64>>>,
    /// `transitions[tier]`: destination-tier probabilities after a hit.
    pub transitions: Vec<Vec<f64>>,
    pub hit_class: Vec<Option<ClassId>>,
    pub miss_class: Vec<Option<ClassId>>,
}

impl CacheConfig {
    /// # Errors
    ///
    /// - `ConfigError::ClassArity` - If a per-class or per-tier vector has the
    ///   wrong length
    /// - `ConfigError::InvalidProbabilities` - If a popularity or transition
    ///   row does not sum to one
    /// - `ConfigError::InvalidStation` - If there is no tier
    pub fn validate(&self, node: &str, classes: usize) -> std::result::Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::InvalidStation {
                node: node.to_string(),
                reason: "a cache needs at least one tier".into(),
            });
        }
        let arity = |what: &str, expected: usize, actual: usize| {
            if expected == actual {
                Ok(())
            } else {
                Err(ConfigError::ClassArity {
                    context: format!("cache {what} at {node}"),
                    expected,
                    actual,
                })
            }
        };
        arity("popularity", classes, self.popularity.len())?;
        arity("hit classes", classes, self.hit_class.len())?;
        arity("miss classes", classes, self.miss_class.len())?;
        for popularity in self.popularity.iter().flatten() {
            arity("item popularity", self.items, popularity.len())?;
            check_probabilities(&format!("cache popularity at {node}"), popularity)?;
        }
        // Without transition rows a hit stays in its tier.
        if !self.transitions.is_empty() {
            arity("transition rows", self.tiers.len(), self.transitions.len())?;
        }
        for row in &self.transitions {
            arity("transition row", self.tiers.len(), row.len())?;
            check_probabilities(&format!("cache transitions at {node}"), row)?;
        }
        Ok(())
    }
}

/// Service section of a cache station.
pub struct CacheServer {
    config: CacheConfig,
    store: CacheStore,
    hits: Vec<u64>,
    misses: Vec<u64>,
}

impl CacheServer {
    pub fn new(config: CacheConfig) -> Self {
        let store = CacheStore::new(config.items, config.tiers.clone(), config.policy, config.moves);
        let classes = config.popularity.len();
        Self {
            config,
            store,
            hits: vec![0; classes],
            misses: vec![0; classes],
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Fraction of requests of `class` that hit, `None` before any request.
    pub fn hit_ratio(&self, class: ClassId) -> Option<f64> {
        let hits = self.hits[class.0];
        let total = hits + self.misses[class.0];
        (total > 0).then(|| hits as f64 / total as f64)
    }

    fn serve(&mut self, kernel: &mut Kernel<'_>, job: JobId) -> Result<()> {
        let class = kernel.class_of(job)?;
        let missing = KernelError::MissingPopularity {
            node: kernel.node(),
            class,
        };
        let Some(popularity) = &self.config.popularity[class.0] else {
            return Err(missing);
        };
        let item = sample_index(kernel.rng, popularity).ok_or(missing)?;
        let hit = self
            .store
            .request(item, kernel.now, kernel.rng, &self.config.transitions);
        trace!(node = kernel.node().0, job = job.0, item, hit, "cache request");

        let (measure, target) = if hit {
            self.hits[class.0] += 1;
            (Measure::CacheHit, self.config.hit_class[class.0])
        } else {
            self.misses[class.0] += 1;
            (Measure::CacheMiss, self.config.miss_class[class.0])
        };
        kernel.record_at(measure, Some(class), 1.0, 1.0);
        if let Some(to) = target {
            kernel.switch_class(job, to)?;
        }
        kernel.send_local(SectionKind::Output, Event::Job(job))
    }
}

impl Serves for CacheServer {
    fn handle(&mut self, kernel: &mut Kernel<'_>, message: &Message) -> Result<Handled> {
        match &message.event {
            Event::Start | Event::Ack(_) => {
                ready_all(kernel)?;
                Ok(Handled::Consumed)
            }
            Event::Job(job) => {
                self.serve(kernel, *job)?;
                Ok(Handled::Consumed)
            }
            Event::Ready(_)
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
    use crate::event::Address;
    use crate::job::{ClassTable, JobClass, NodeId};
    use crate::random::SequenceRandom;
    use crate::section::testing::Harness;
    use crate::topology::{NodeKind, Topology};

    fn lru(capacity: usize) -> CacheStore {
        CacheStore::new(4, vec![capacity], CachePolicy::Lru, MoveSemantics::default())
    }

    #[test]
    fn test_lru_reaccess_after_eviction_misses() {
        let mut rng = SequenceRandom::new(vec![0.5]);
        let mut store = lru(2);
        let hits: Vec<bool> = [1, 2, 3, 1]
            .iter()
            .enumerate()
            .map(|(t, item)| store.request(*item, t as f64, &mut rng, &[]))
            .collect();

        assert_eq!(hits, vec![false, false, false, false]);
        assert_eq!(store.contents(0), vec![1, 3]);
    }

    #[test]
    fn test_lru_hit_moves_item_to_front() {
        let mut rng = SequenceRandom::new(vec![0.5]);
        let mut store = lru(2);
        store.request(1, 0.0, &mut rng, &[]);
        store.request(2, 1.0, &mut rng, &[]);
        assert!(store.request(1, 2.0, &mut rng, &[]));
        store.request(3, 3.0, &mut rng, &[]);
        assert_eq!(store.contents(0), vec![3, 1]);
    }

    #[test]
    fn test_fifo_ignores_hits() {
        let mut rng = SequenceRandom::new(vec![0.5]);
        let mut store = CacheStore::new(4, vec![2], CachePolicy::Fifo, MoveSemantics::default());
        store.request(1, 0.0, &mut rng, &[]);
        store.request(2, 1.0, &mut rng, &[]);
        assert!(store.request(1, 2.0, &mut rng, &[]));
        store.request(3, 3.0, &mut rng, &[]);
        assert_eq!(store.contents(0), vec![3, 2]);
    }

    #[test]
    fn test_lfu_evicts_least_used() {
        let mut rng = SequenceRandom::new(vec![0.5]);
        let mut store = CacheStore::new(4, vec![2], CachePolicy::Lfu, MoveSemantics::default());
        store.request(1, 0.0, &mut rng, &[]);
        store.request(1, 1.0, &mut rng, &[]);
        store.request(2, 2.0, &mut rng, &[]);
        store.request(3, 3.0, &mut rng, &[]);
        assert_eq!(store.tier_of(1), Some(0));
        assert_eq!(store.tier_of(2), None);
    }

    #[test]
    fn test_ttl_expires_without_refresh() {
        let mut rng = SequenceRandom::new(vec![0.5]);
        let mut store = CacheStore::new(4, vec![2], CachePolicy::Ttl { ttl: 5.0 }, MoveSemantics::default());
        assert!(!store.request(0, 0.0, &mut rng, &[]));
        assert!(store.request(0, 3.0, &mut rng, &[]));
        // Expiry is fixed at insertion time, so the hit at t=3 did not extend it.
        assert!(!store.request(0, 6.0, &mut rng, &[]));
        assert_eq!(store.inserted_at(0), Some(6.0));
    }

    #[test]
    fn test_replace_in_place_swaps_with_victim() {
        let mut rng = SequenceRandom::new(vec![0.5]);
        let mut store = CacheStore::new(4, vec![2, 1], CachePolicy::Lru, MoveSemantics::ReplaceInPlace);
        let to_upper = vec![vec![0.0, 1.0], vec![0.0, 1.0]];
        store.request(0, 0.0, &mut rng, &to_upper);
        assert!(store.request(0, 1.0, &mut rng, &to_upper));
        assert_eq!(store.contents(1), vec![0]);

        store.request(1, 2.0, &mut rng, &to_upper);
        assert!(store.request(1, 3.0, &mut rng, &to_upper));
        assert_eq!(store.contents(1), vec![1]);
        assert_eq!(store.contents(0), vec![0]);
    }

    #[test]
    fn test_evict_then_append_drops_victim() {
        let mut rng = SequenceRandom::new(vec![0.5]);
        let mut store = CacheStore::new(4, vec![2, 1], CachePolicy::Lru, MoveSemantics::EvictThenAppend);
        let to_upper = vec![vec![0.0, 1.0], vec![0.0, 1.0]];
        store.request(0, 0.0, &mut rng, &to_upper);
        store.request(0, 1.0, &mut rng, &to_upper);
        store.request(1, 2.0, &mut rng, &to_upper);
        store.request(1, 3.0, &mut rng, &to_upper);
        assert_eq!(store.contents(1), vec![1]);
        assert_eq!(store.tier_of(0), None);
    }

    #[test]
    fn test_transition_to_missing_tier_keeps_item() {
        let mut rng = SequenceRandom::new(vec![0.5]);
        let mut store = CacheStore::new(2, vec![1], CachePolicy::Lru, MoveSemantics::EvictThenAppend);
        let too_wide = vec![vec![0.0, 1.0]];
        assert!(!store.request(0, 0.0, &mut rng, &too_wide));
        assert!(store.request(0, 1.0, &mut rng, &too_wide));
        assert_eq!(store.contents(0), vec![0]);
    }

    fn single_tier(transitions: Vec<Vec<f64>>) -> CacheConfig {
        CacheConfig {
            items: 2,
            tiers: vec![1],
            policy: CachePolicy::Lru,
            moves: MoveSemantics::EvictThenAppend,
            popularity: vec![Some(vec![0.5, 0.5])],
            transitions,
            hit_class: vec![None],
            miss_class: vec![None],
        }
    }

    #[test]
    fn test_transition_rows_must_match_tiers() {
        assert!(single_tier(Vec::new()).validate("cache", 1).is_ok());
        assert!(single_tier(vec![vec![1.0]]).validate("cache", 1).is_ok());
        assert!(matches!(
            single_tier(vec![vec![0.0, 1.0]]).validate("cache", 1),
            Err(ConfigError::ClassArity { expected: 1, actual: 2, .. })
        ));
        assert!(matches!(
            single_tier(vec![vec![1.0], vec![1.0]]).validate("cache", 1),
            Err(ConfigError::ClassArity { expected: 1, actual: 2, .. })
        ));
    }

    #[test]
    fn test_missing_popularity_is_fatal() {
        let mut topology = Topology::new();
        topology.add_node("cache", NodeKind::Cache);
        let classes = ClassTable::new(vec![JobClass::open("req")]);
        let mut h = Harness::new(topology, classes);
        let here = Address::service(NodeId(0));
        let mut cache = CacheServer::new(CacheConfig {
            items: 2,
            tiers: vec![1],
            policy: CachePolicy::Lru,
            moves: MoveSemantics::default(),
            popularity: vec![None],
            transitions: Vec::new(),
            hit_class: vec![None],
            miss_class: vec![None],
        });
        let job = h.job_at(ClassId(0), NodeId(0));
        let msg = h.message(Event::Job(job), Address::input(NodeId(0)), here);
        let result = cache.handle(&mut h.kernel(here), &msg);
        assert!(matches!(result, Err(KernelError::MissingPopularity { .. })));
    }

    #[test]
    fn test_hit_and_miss_switch_class() {
        let mut topology = Topology::new();
        topology.add_node("cache", NodeKind::Cache);
        let classes = ClassTable::new(vec![
            JobClass::open("req"),
            JobClass::open("hit"),
            JobClass::open("miss"),
        ]);
        let mut h = Harness::new(topology, classes).with_rng(vec![0.1]);
        let here = Address::service(NodeId(0));
        let mut cache = CacheServer::new(CacheConfig {
            items: 2,
            tiers: vec![1],
            policy: CachePolicy::Lru,
            moves: MoveSemantics::default(),
            popularity: vec![Some(vec![1.0, 0.0]), None, None],
            transitions: Vec::new(),
            hit_class: vec![Some(ClassId(1)), None, None],
            miss_class: vec![Some(ClassId(2)), None, None],
        });

        let first = h.job_at(ClassId(0), NodeId(0));
        let second = h.job_at(ClassId(0), NodeId(0));
        for job in [first, second] {
            let msg = h.message(Event::Job(job), Address::input(NodeId(0)), here);
            cache.handle(&mut h.kernel(here), &msg).unwrap();
        }
        assert_eq!(h.jobs.class_of(first).unwrap(), ClassId(2));
        assert_eq!(h.jobs.class_of(second).unwrap(), ClassId(1));
        assert_eq!(h.registry.node(NodeId(0)).class_len(ClassId(1)), 1);
        assert_eq!(cache.hit_ratio(ClassId(0)), Some(0.5));
    }
}
