use proptest::prelude::*;
use qnet_core::{ClassId, JobId, JobRegistry};

#[derive(Debug, Clone)]
enum Op {
    Add(u64, usize),
    Remove(u64),
    Switch(u64, usize),
    Drop(u64),
    Orbit(u64, usize),
    Retry(u64),
}

const CLASSES: usize = 3;

fn op() -> impl Strategy<Value = Op> {
    let job = 0u64..12;
    let class = 0usize..CLASSES;
    prop_oneof![
        (job.clone(), class.clone()).prop_map(|(j, c)| Op::Add(j, c)),
        job.clone().prop_map(Op::Remove),
        (job.clone(), class.clone()).prop_map(|(j, c)| Op::Switch(j, c)),
        job.clone().prop_map(Op::Drop),
        (job.clone(), class).prop_map(|(j, c)| Op::Orbit(j, c)),
        job.prop_map(Op::Retry),
    ]
}

proptest! {
    #[test]
    fn prop_buckets_and_index_agree(ops in prop::collection::vec(op(), 1..80)) {
        let mut registry = JobRegistry::new("network", CLASSES);
        let mut now = 0.0;
        for op in ops {
            now += 0.5;
            // Failures are expected for jobs in the wrong state; the
            // registry must stay consistent either way.
            let _ = match op {
                Op::Add(j, c) => registry.add(JobId(j), ClassId(c), now).map(|_| ()),
                Op::Remove(j) => registry.remove(JobId(j), now).map(|_| ()),
                Op::Switch(j, c) => registry.switch_class(JobId(j), ClassId(c), now),
                Op::Drop(j) => registry.drop_job(JobId(j), now).map(|_| ()),
                Op::Orbit(j, c) => registry.move_to_retrial_orbit(JobId(j), ClassId(c), now),
                Op::Retry(j) => registry.retry(JobId(j)).map(|_| ()),
            };

            prop_assert!(registry.verify().is_ok(), "{:?}", registry.verify());
            let per_class: usize = (0..CLASSES).map(|c| registry.class_len(ClassId(c))).sum();
            prop_assert_eq!(per_class, registry.len());
            for c in 0..CLASSES {
                let class = ClassId(c);
                prop_assert!(registry.iter_class(class).all(|j| registry.class_of(j) == Some(class)));
            }
        }
    }

    #[test]
    fn prop_departures_never_exceed_arrivals(ops in prop::collection::vec(op(), 1..80)) {
        let mut registry = JobRegistry::new("node", CLASSES);
        for (step, op) in ops.into_iter().enumerate() {
            let now = step as f64;
            let _ = match op {
                Op::Add(j, c) => registry.add(JobId(j), ClassId(c), now).map(|_| ()),
                Op::Remove(j) => registry.remove(JobId(j), now).map(|_| ()),
                Op::Drop(j) => registry.drop_job(JobId(j), now).map(|_| ()),
                Op::Switch(..) | Op::Orbit(..) | Op::Retry(_) => Ok(()),
            };
        }
        let mut arrivals = 0;
        let mut gone = 0;
        for c in 0..CLASSES {
            let counters = registry.counters(ClassId(c));
            arrivals += counters.arrivals;
            gone += counters.departures + counters.dropped;
        }
        prop_assert_eq!(arrivals - gone, registry.len() as u64);
    }
}

#[test]
fn test_switched_job_keeps_arrival_time() {
    let mut registry = JobRegistry::new("node", 2);
    registry.add(JobId(1), ClassId(0), 1.0).unwrap();
    registry.switch_class(JobId(1), ClassId(1), 3.0).unwrap();

    assert_eq!(registry.entered_at(JobId(1)), Some(1.0));
    assert_eq!(registry.counters(ClassId(0)).switched_out, 1);
    assert_eq!(registry.counters(ClassId(1)).switched_in, 1);

    registry.remove(JobId(1), 5.0).unwrap();
    assert_eq!(registry.mean_sojourn(ClassId(1)), Some(4.0));
    // Two time units in class 0, two in class 1.
    assert!((registry.mean_population(ClassId(0), 5.0) - 0.4).abs() < 1e-12);
    assert!((registry.mean_population(ClassId(1), 5.0) - 0.4).abs() < 1e-12);
}
