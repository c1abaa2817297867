use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stpp::domain::DomainOptions;
use stpp::{
    Event, EventSet, IntensityModel, ModelConfig, ModelVariant, Prior, PriorRegistry, build_extent,
    build_model,
};

fn random_events(n: usize) -> EventSet {
    let mut rng = StdRng::seed_from_u64(0x5EED_F64 + n as u64);
    let events = (0..n)
        .map(|_| {
            let x: f64 = rng.sample(Standard);
            let y: f64 = rng.sample(Standard);
            let t: f64 = rng.sample(Standard);
            Event::new(x, y, 100.0 * t)
        })
        .collect();
    EventSet::new(events).expect("finite events")
}

fn priors() -> PriorRegistry {
    PriorRegistry::new()
        .with("a_0", Prior::Gamma { shape: 2.0, rate: 1.0 })
        .with("alpha", Prior::Beta { a: 2.0, b: 5.0 })
        .with("beta", Prior::Gamma { shape: 2.0, rate: 1.0 })
        .with("sigma_sq", Prior::HalfNormal { scale: 0.5 })
}

fn benchmark_hawkes_log_likelihood(c: &mut Criterion) {
    let sizes = [100_usize, 400, 1600];
    let priors = priors();

    let mut group = c.benchmark_group("hawkes_log_likelihood");
    for &size in &sizes {
        let events = random_events(size);
        let extent = build_extent(&events, &DomainOptions::default()).expect("extent");
        let model = build_model(
            &ModelConfig::new(ModelVariant::Hawkes),
            &events,
            &extent,
            None,
            &priors,
        )
        .expect("model");
        let params = model
            .layout()
            .assemble(&[("a_0", 0.5), ("alpha", 0.4), ("beta", 1.0), ("sigma_sq", 0.01)])
            .expect("params");

        group.throughput(Throughput::Elements((size * size) as u64));
        group.bench_with_input(BenchmarkId::new("events", size), &params, |b, input| {
            b.iter(|| {
                let ll = model.log_likelihood(black_box(input.view()));
                black_box(ll);
            });
        });
    }
    group.finish();
}

criterion_group!(log_likelihood, benchmark_hawkes_log_likelihood);
criterion_main!(log_likelihood);
