use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use qnet_sim::{Scenario, SimulationConfig, simulate};

fn bench_scenario(c: &mut Criterion, scenario: Scenario, horizon: f64) {
    let config = SimulationConfig {
        check_invariants: false,
        ..SimulationConfig::deterministic_testing()
    }
    .with_horizon(horizon);
    c.bench_function(&format!("simulate_{}", scenario.name()), |b| {
        b.iter(|| {
            let network = scenario.build().unwrap();
            black_box(simulate(network, config.clone()).unwrap())
        });
    });
}

fn bench_mm1(c: &mut Criterion) {
    bench_scenario(c, Scenario::Mm1, 1_000.0);
}

fn bench_fork_join(c: &mut Criterion) {
    bench_scenario(c, Scenario::ForkJoin, 1_000.0);
}

fn bench_petri(c: &mut Criterion) {
    bench_scenario(c, Scenario::PetriProducerConsumer, 1_000.0);
}

criterion_group!(benches, bench_mm1, bench_fork_join, bench_petri);
criterion_main!(benches);
