use cellflow_core::{
    Cluster, DataDescription, GuidanceCommand, Position, Targets, Token, Universe, UniverseConfig,
};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn seeded_universe(clusters: usize) -> Universe {
    let mut config = UniverseConfig {
        rng_seed: Some(0xBEEF),
        history_capacity: 1,
        ..UniverseConfig::default()
    };
    config.parameters.radiation_prob = 0.01;
    let mut universe = Universe::new(config).expect("universe");
    let params = universe.parameters().clone();
    let max_branch = params.cell_max_token_branch_number;

    let mut data = DataDescription::new();
    for seed in 0..clusters as u32 {
        let origin = Position::new((seed * 13 % 1_180) as f32, (seed * 37 % 600) as f32);
        let mut cluster = Cluster::horizontal(8, origin, 150.0);
        for (idx, cell) in cluster.cells.iter_mut().enumerate() {
            cell.token_branch_number = idx as u32 % max_branch;
        }
        let mut token = Token::simple(&params);
        let command = if seed % 2 == 0 {
            GuidanceCommand::BalanceCell(Targets { cell: 60.0, token: 20.0 })
        } else {
            GuidanceCommand::BalanceToken(Targets { cell: 60.0, token: 20.0 })
        };
        command.encode_into(&mut token.memory);
        cluster.cells[0].add_token(token);
        data.add_cluster(cluster);
    }
    universe.update_data(data).expect("ingest");
    universe
}

fn bench_universe_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("universe_step");
    group.sample_size(env_or("CF_BENCH_SAMPLES", 30_usize).max(10));
    group.warm_up_time(Duration::from_secs(env_or("CF_BENCH_WARMUP_SECS", 2)));
    group.measurement_time(Duration::from_secs(env_or("CF_BENCH_MEASURE_SECS", 10)));
    let steps: usize = env_or("CF_BENCH_STEPS", 64_usize).max(1);

    for clusters in [500_usize, 2_000, 8_000] {
        group.bench_function(format!("steps{steps}_clusters{clusters}"), |b| {
            b.iter_batched(
                || seeded_universe(clusters),
                |mut universe| {
                    universe.run(steps);
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_universe_steps);
criterion_main!(benches);
