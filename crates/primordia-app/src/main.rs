use anyhow::Result;
use primordia_core::{SandboxConfig, WorldState};
use tracing::{info, warn};

fn main() -> Result<()> {
    init_tracing();
    let config = configure_from_env();
    let tick_limit = env_u64("PRIMORDIA_TICKS").unwrap_or(20_000);
    let log_every = env_u64("PRIMORDIA_LOG_EVERY").unwrap_or(500).max(1);

    let mut world = WorldState::new(config)?;
    info!(
        agents = world.agent_count(),
        species = world.species().len(),
        food = world.food_count(),
        "world seeded"
    );

    // The driver owns pacing; the engine just advances one tick per call.
    for _ in 0..tick_limit {
        let events = world.step();
        if events.tick.0.is_multiple_of(log_every) {
            if let Some(summary) = world.history().last() {
                info!(
                    tick = summary.tick.0,
                    population = summary.population,
                    species_alive = summary.species_alive,
                    food = summary.food_count,
                    births = summary.births,
                    deaths = summary.deaths,
                    mean_energy = summary.mean_energy,
                    day = world.is_day(),
                    "tick summary"
                );
            }
        }
        if events.extinct {
            warn!(tick = events.tick.0, "all individuals died; stopping");
            break;
        }
    }

    report_standings(&world);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn configure_from_env() -> SandboxConfig {
    let mut config = SandboxConfig::default();
    if let Some(seed) = env_u64("PRIMORDIA_SEED") {
        config.rng_seed = Some(seed);
    }
    if let Some(population) = env_u64("PRIMORDIA_STARTING_POPULATION") {
        config.starting_population = population as usize;
    }
    config
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn report_standings(world: &WorldState) {
    let mut standings: Vec<_> = world.species().iter().collect();
    standings.sort_by_key(|s| std::cmp::Reverse((s.peak_population, s.total_replications)));
    for species in standings.iter().take(10) {
        info!(
            id = species.id.0,
            name = %species.name,
            population = species.population,
            peak = species.peak_population,
            kills = species.total_kills,
            food_eaten = species.total_food_eaten,
            replications = species.total_replications,
            extinct_at = species.extinction_tick.map(|t| t.0),
            "species standings"
        );
    }
}
