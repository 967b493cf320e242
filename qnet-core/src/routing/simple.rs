use crate::job::ClassId;
use crate::random::{RandomSource, uniform_index};

use super::{RouteDecision, RouteView, RoutingState};

pub(super) fn random(
    view: &RouteView<'_>,
    rng: &mut dyn RandomSource,
    class: ClassId,
) -> Option<RouteDecision> {
    let candidates: Vec<_> = view
        .outputs()
        .iter()
        .copied()
        .filter(|node| view.viable(*node, class))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    Some(RouteDecision::to(candidates[uniform_index(rng, candidates.len())]))
}

pub(super) fn round_robin(
    state: &mut RoutingState,
    view: &RouteView<'_>,
    class: ClassId,
) -> Option<RouteDecision> {
    let outputs = view.outputs();
    let n = outputs.len();
    for step in 0..n {
        let idx = (state.counter + step) % n;
        if view.viable(outputs[idx], class) {
            state.counter = (idx + 1) % n;
            return Some(RouteDecision::to(outputs[idx]));
        }
    }
    None
}

pub(super) fn weighted(
    state: &mut RoutingState,
    view: &RouteView<'_>,
    class: ClassId,
) -> Option<RouteDecision> {
    let outputs = view.outputs();
    let period = state.schedule.len();
    for step in 0..period {
        let slot = (state.counter + step) % period;
        let node = outputs[state.schedule[slot]];
        if view.viable(node, class) {
            state.counter = (slot + 1) % period;
            return Some(RouteDecision::to(node));
        }
    }
    None
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Builds one period of the smooth weighted round-robin schedule.
///
/// Weights are reduced by their gcd; each slot credits every output with its
/// weight and picks the largest accumulated credit (lowest index on ties),
/// which then pays back the period length. Each output appears exactly as
/// many times as its reduced weight.
pub fn weighted_schedule(weights: &[u32]) -> Vec<usize> {
    let divisor = weights.iter().copied().fold(0, gcd);
    if divisor == 0 {
        return Vec::new();
    }
    let reduced: Vec<i64> = weights.iter().map(|w| i64::from(w / divisor)).collect();
    let period: i64 = reduced.iter().sum();
    let mut credit = vec![0i64; reduced.len()];
    let mut schedule = Vec::with_capacity(period as usize);
    for _ in 0..period {
        let mut best = 0;
        for (i, weight) in reduced.iter().enumerate() {
            credit[i] += weight;
            if credit[i] > credit[best] {
                best = i;
            }
        }
        credit[best] -= period;
        schedule.push(best);
    }
    schedule
}

#[cfg(test)]
mod tests {
    use super::super::RoutingStrategy;
    use super::super::test_support::*;
    use super::*;
    use crate::job::NodeId;
    use crate::random::SequenceRandom;
    use crate::topology::NodeKind;

    #[test]
    fn test_round_robin_visits_each_output_once() {
        let fixture = Fixture::new(&[NodeKind::Queue, NodeKind::Queue, NodeKind::Queue]);
        let view = fixture.view();
        let mut state = RoutingState::default();

        let first: Vec<_> = (0..3)
            .map(|_| round_robin(&mut state, &view, OPEN).unwrap().target)
            .collect();
        assert_eq!(first, vec![NodeId(1), NodeId(2), NodeId(3)]);

        // Restarting from the same counter reproduces the same cycle.
        let mut restarted = RoutingState::default();
        let second: Vec<_> = (0..3)
            .map(|_| round_robin(&mut restarted, &view, OPEN).unwrap().target)
            .collect();
        assert_eq!(first, second);
        assert_eq!(state, restarted);
    }

    #[test]
    fn test_round_robin_skips_sinks_for_closed_classes() {
        let fixture = Fixture::new(&[NodeKind::Sink, NodeKind::Queue]);
        let view = fixture.view();
        let mut state = RoutingState::default();

        for _ in 0..3 {
            assert_eq!(round_robin(&mut state, &view, CLOSED).unwrap().target, NodeId(2));
        }
        assert_eq!(round_robin(&mut state, &view, OPEN).unwrap().target, NodeId(1));
    }

    #[test]
    fn test_all_sinks_unroutable_for_closed_class() {
        let fixture = Fixture::new(&[NodeKind::Sink, NodeKind::Sink]);
        let view = fixture.view();
        let mut rng = SequenceRandom::new(vec![0.5]);
        assert_eq!(random(&view, &mut rng, CLOSED), None);
        assert_eq!(round_robin(&mut RoutingState::default(), &view, CLOSED), None);
        assert!(random(&view, &mut rng, OPEN).is_some());
    }

    #[test]
    fn test_weighted_schedule_honours_weights_exactly() {
        let schedule = weighted_schedule(&[3, 1]);
        assert_eq!(schedule.len(), 4);
        assert_eq!(schedule.iter().filter(|i| **i == 0).count(), 3);
        assert_eq!(schedule.iter().filter(|i| **i == 1).count(), 1);

        // gcd normalisation keeps the period minimal
        assert_eq!(weighted_schedule(&[6, 2]), schedule);
        assert!(weighted_schedule(&[0, 0]).is_empty());
    }

    #[test]
    fn test_weighted_round_robin_window() {
        let fixture = Fixture::new(&[NodeKind::Queue, NodeKind::Queue]);
        let view = fixture.view();
        let strategy = RoutingStrategy::WeightedRoundRobin(vec![3, 1]);
        let mut state = strategy.initial_state();
        let mut rng = SequenceRandom::new(vec![0.5]);

        for _ in 0..3 {
            let window: Vec<_> = (0..4)
                .map(|_| strategy.select(&mut state, &view, &mut rng, OPEN).unwrap().target)
                .collect();
            assert_eq!(window.iter().filter(|n| **n == NodeId(1)).count(), 3);
            assert_eq!(window.iter().filter(|n| **n == NodeId(2)).count(), 1);
        }
    }

    #[test]
    fn test_zero_weight_output_never_chosen() {
        let schedule = weighted_schedule(&[0, 2, 1]);
        assert!(!schedule.contains(&0));
        assert_eq!(schedule.len(), 3);
    }
}
