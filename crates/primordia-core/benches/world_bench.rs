use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use primordia_core::{SandboxConfig, SpeciesId, WorldState};
use std::time::Duration;

fn bench_world_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_step");
    let samples: usize = std::env::var("PRIMORDIA_BENCH_SAMPLES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(20);
    let measure: u64 = std::env::var("PRIMORDIA_BENCH_MEASURE_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(8);
    group.sample_size(samples);
    group.measurement_time(Duration::from_secs(measure));

    let steps: usize = std::env::var("PRIMORDIA_BENCH_STEPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(32);
    let populations: Vec<usize> = std::env::var("PRIMORDIA_BENCH_AGENTS")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![500, 2_000]);

    for &population in &populations {
        group.bench_function(format!("steps{steps}_agents{population}"), |b| {
            b.iter_batched(
                || {
                    let config = SandboxConfig {
                        world_width: 1_200.0,
                        world_height: 1_200.0,
                        starting_population: 0,
                        initial_food: 400,
                        crowding_cap: population * 2,
                        history_capacity: 1,
                        rng_seed: Some(0xBEEF),
                        ..SandboxConfig::default()
                    };
                    let founder_count = config.founders.len() as u32;
                    let mut world = WorldState::new(config).expect("world");
                    let mut placed = 0usize;
                    let mut attempt = 0u32;
                    while placed < population {
                        let x = 40.0 + (attempt % 64) as f32 * 17.0;
                        let y = 40.0 + (attempt / 64) as f32 * 17.0;
                        let species = SpeciesId(attempt % founder_count);
                        if world
                            .spawn_individual(species, x % 1_150.0, y % 1_150.0, 100.0)
                            .is_ok()
                        {
                            placed += 1;
                        }
                        attempt += 1;
                    }
                    world
                },
                |mut world| {
                    for _ in 0..steps {
                        world.step();
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_world_steps);
criterion_main!(benches);
