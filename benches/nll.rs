use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use signal_mcmc::{
    Backend, EventData, LookupTable, MetropolisSampler, ModelOptions, NllEvaluator, NllSettings,
    ParameterModel, SignalInfo, Source, StaticLut, WalkSettings,
};

fn model(nsignals: usize) -> ParameterModel {
    let sources: Vec<Source> = (0..nsignals)
        .map(|j| Source::new(format!("rate_{}", j), 1.))
        .collect();
    let signals: Vec<SignalInfo> = (0..nsignals)
        .map(|j| SignalInfo::new(format!("signal_{}", j), j, 1000., 1e5))
        .collect();
    ParameterModel::new(&sources, &signals, &[], &[], ModelOptions::default()).unwrap()
}

fn table(nevents: usize, nsignals: usize) -> LookupTable {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let values = (0..nevents * nsignals).map(|_| rng.random::<f32>()).collect();
    LookupTable::from_values(values, vec![1.; nsignals]).unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let nsignals = 4;
    let model = model(nsignals);
    let position = model.means();

    for nevents in [1_000, 100_000] {
        let table = table(nevents, nsignals);
        for (name, backend) in [("serial", Backend::Serial), ("rayon", Backend::Rayon)] {
            let settings = NllSettings {
                backend,
                ..Default::default()
            };
            let mut eval = NllEvaluator::new(&model, nevents, settings).unwrap();
            c.bench_function(&format!("nll {} {}", name, nevents), |b| {
                b.iter(|| eval.evaluate(black_box(&table), black_box(&position)))
            });
        }
    }

    let nevents = 10_000;
    let data = EventData::from_column("x", vec![0.; nevents]);
    let provider = StaticLut::new(table(nevents, nsignals));
    c.bench_function("walk 1000 steps", |b| {
        b.iter_batched(
            || MetropolisSampler::new(model.clone(), provider.clone()),
            |mut sampler| {
                let space = sampler.run(&data, &WalkSettings::new(1000, 0.1)).unwrap();
                black_box(space.len())
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
