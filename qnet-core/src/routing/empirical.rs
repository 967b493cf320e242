use crate::job::ClassId;
use crate::random::{RandomSource, sample_index};

use super::{RouteDecision, RouteView};

/// One output of a class-switch routing table.
#[derive(Debug, Clone)]
pub struct SwitchRoute {
    /// Probability of taking this link.
    pub probability: f64,
    /// Distribution of the class the job takes when it does.
    pub classes: Vec<f64>,
}

fn pick(
    probabilities: &[f64],
    view: &RouteView<'_>,
    rng: &mut dyn RandomSource,
    class: ClassId,
) -> Option<RouteDecision> {
    let idx = sample_index(rng, probabilities)?;
    let target = *view.outputs().get(idx)?;
    view.viable(target, class).then(|| RouteDecision::to(target))
}

pub(super) fn empirical(
    probabilities: &[f64],
    view: &RouteView<'_>,
    rng: &mut dyn RandomSource,
    class: ClassId,
) -> Option<RouteDecision> {
    pick(probabilities, view, rng, class)
}

/// Selects the table row whose threshold is the largest not exceeding the
/// station's resident population.
pub(super) fn load_dependent(
    table: &[(usize, Vec<f64>)],
    view: &RouteView<'_>,
    rng: &mut dyn RandomSource,
    class: ClassId,
) -> Option<RouteDecision> {
    let population = view.registry.node(view.here).len();
    let row = table
        .partition_point(|(threshold, _)| *threshold <= population)
        .saturating_sub(1);
    let (_, probabilities) = table.get(row)?;
    pick(probabilities, view, rng, class)
}

pub(super) fn class_switch(
    routes: &[SwitchRoute],
    view: &RouteView<'_>,
    rng: &mut dyn RandomSource,
    class: ClassId,
) -> Option<RouteDecision> {
    let probabilities: Vec<f64> = routes.iter().map(|r| r.probability).collect();
    let idx = sample_index(rng, &probabilities)?;
    let target = *view.outputs().get(idx)?;
    let switch_to = ClassId(sample_index(rng, &routes[idx].classes)?);
    view.viable(target, switch_to).then_some(RouteDecision {
        target,
        switch_to: (switch_to != class).then_some(switch_to),
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::job::{JobId, NodeId};
    use crate::random::SequenceRandom;
    use crate::topology::NodeKind;

    #[test]
    fn test_empirical_skips_zero_probability_links() {
        let fixture = Fixture::new(&[NodeKind::Queue, NodeKind::Queue, NodeKind::Queue]);
        let view = fixture.view();
        let mut rng = SequenceRandom::new(vec![0.0, 0.999]);
        let probabilities = [0.0, 1.0, 0.0];

        for _ in 0..2 {
            let decision = empirical(&probabilities, &view, &mut rng, OPEN).unwrap();
            assert_eq!(decision.target, NodeId(2));
        }
    }

    #[test]
    fn test_load_dependent_uses_population_row() {
        let mut fixture = Fixture::new(&[NodeKind::Queue, NodeKind::Queue]);
        let table = vec![(0, vec![1.0, 0.0]), (2, vec![0.0, 1.0])];
        let mut rng = SequenceRandom::new(vec![0.5]);

        fixture.registry.node_mut(NodeId(0)).add(JobId(1), OPEN, 0.0).unwrap();
        let low = load_dependent(&table, &fixture.view(), &mut rng, OPEN).unwrap();
        assert_eq!(low.target, NodeId(1));

        fixture.registry.node_mut(NodeId(0)).add(JobId(2), OPEN, 0.0).unwrap();
        let high = load_dependent(&table, &fixture.view(), &mut rng, OPEN).unwrap();
        assert_eq!(high.target, NodeId(2));
    }

    #[test]
    fn test_class_switch_routing_reports_new_class() {
        let fixture = Fixture::new(&[NodeKind::Queue, NodeKind::Queue]);
        let routes = vec![
            SwitchRoute {
                probability: 0.0,
                classes: vec![1.0, 0.0],
            },
            SwitchRoute {
                probability: 1.0,
                classes: vec![0.0, 1.0],
            },
        ];
        let mut rng = SequenceRandom::new(vec![0.4]);
        let decision = class_switch(&routes, &fixture.view(), &mut rng, OPEN).unwrap();
        assert_eq!(decision.target, NodeId(2));
        assert_eq!(decision.switch_to, Some(CLOSED));
    }

    #[test]
    fn test_empirical_into_sink_unroutable_for_closed() {
        let fixture = Fixture::new(&[NodeKind::Sink]);
        let mut rng = SequenceRandom::new(vec![0.5]);
        assert!(empirical(&[1.0], &fixture.view(), &mut rng, CLOSED).is_none());
    }
}
