use crate::job::{ClassId, NodeId};
use crate::random::{RandomSource, reservoir_sample, uniform_index};

use super::{RouteDecision, RouteView, RoutingState};

#[derive(Debug, Clone, Copy)]
pub(super) enum Property {
    QueueLength,
    ResponseTime,
    Utilization,
}

fn evaluate(view: &RouteView<'_>, node: NodeId, class: ClassId, property: Property) -> f64 {
    if view.topology.is_sink(node) {
        return if view.classes.get(class).is_closed() {
            f64::INFINITY
        } else {
            0.0
        };
    }
    match property {
        Property::QueueLength => view.registry.node(node).len() as f64,
        Property::ResponseTime => view.loads.mean_residence(node),
        Property::Utilization => view.loads.utilization(node),
    }
}

/// Picks the candidate with the smallest property value. Candidates within
/// `epsilon` of the minimum form a tie set resolved uniformly at random.
fn pick_minimum(
    view: &RouteView<'_>,
    rng: &mut dyn RandomSource,
    class: ClassId,
    candidates: &[NodeId],
    property: Property,
) -> Option<NodeId> {
    let values: Vec<f64> = candidates
        .iter()
        .map(|node| evaluate(view, *node, class, property))
        .collect();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    if !min.is_finite() {
        return None;
    }
    let ties: Vec<NodeId> = candidates
        .iter()
        .zip(&values)
        .filter(|(_, v)| (**v - min).abs() <= view.epsilon)
        .map(|(node, _)| *node)
        .collect();
    match ties.len() {
        0 => None,
        1 => Some(ties[0]),
        n => Some(ties[uniform_index(rng, n)]),
    }
}

pub(super) fn minimize(
    view: &RouteView<'_>,
    rng: &mut dyn RandomSource,
    class: ClassId,
    property: Property,
) -> Option<RouteDecision> {
    pick_minimum(view, rng, class, view.outputs(), property).map(RouteDecision::to)
}

pub(super) fn power_of_k(
    state: &mut RoutingState,
    view: &RouteView<'_>,
    rng: &mut dyn RandomSource,
    class: ClassId,
    k: usize,
    memory: bool,
) -> Option<RouteDecision> {
    let outputs = view.outputs();
    let mut candidates = reservoir_sample(rng, outputs, k);
    if memory {
        if let Some(previous) = state.memory {
            if outputs.contains(&previous) && !candidates.contains(&previous) {
                candidates.push(previous);
            }
        }
    }
    let chosen = pick_minimum(view, rng, class, &candidates, Property::QueueLength)?;
    if memory {
        state.memory = Some(chosen);
    }
    Some(RouteDecision::to(chosen))
}
