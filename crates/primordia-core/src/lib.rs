//! Core simulation engine for the Primordia artificial-life sandbox.
//!
//! A bounded 2D world advances one discrete tick at a time: terrain and a
//! diffusing pollutant field shape the environment, individuals belonging to
//! mutable species wander, feed, hunt, flee, fight and replicate, and the
//! scheduler keeps species bookkeeping consistent across births and deaths.
//! Rendering, charts, and any other presentation concerns live entirely
//! outside this crate and consume read-only snapshots.

use ordered_float::OrderedFloat;
use primordia_index::{NeighborhoodIndex, UniformGridIndex};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for individuals backed by a generational slot map.
    pub struct AgentId;
}

new_key_type! {
    /// Stable handle for food pellets.
    pub struct FoodId;
}

/// Convenience alias for associating side data with individuals.
pub type AgentMap<T> = SecondaryMap<AgentId, T>;

/// Combined cap on a species' attack, defense, and stealth investment.
pub const COMBAT_BUDGET: f32 = 1.0;

/// Concentrations below this threshold are culled from the waste field.
const WASTE_RESIDUE_EPSILON: f32 = 0.01;

/// Denominator guard for distance-weighted target scoring.
const SCORE_EPSILON: f32 = 1e-6;

/// Spread applied to a newborn's position relative to its parent.
const BIRTH_SCATTER: f32 = 10.0;

/// Attempts made when sampling an open (non-wall) spawn location.
const PLACEMENT_ATTEMPTS: usize = 64;

fn distance_sq(a: Position, b: Position) -> f32 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    dx * dx + dy * dy
}

/// Normally-distributed sample via the Box-Muller transform.
fn rand_norm(rng: &mut SmallRng, std_dev: f32) -> f32 {
    let mut u: f32 = 0.0;
    while u <= f32::EPSILON {
        u = rng.random::<f32>();
    }
    let v: f32 = rng.random::<f32>();
    (-2.0 * u.ln()).sqrt() * (std::f32::consts::TAU * v).cos() * std_dev
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> [f32; 3] {
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let hp = h.rem_euclid(360.0) / 60.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = l - c / 2.0;
    [r + m, g + m, b + m]
}

fn random_species_color(rng: &mut SmallRng) -> [f32; 3] {
    hsl_to_rgb(rng.random_range(0.0..360.0), 0.7, 0.7)
}

fn clamp_velocity(vel: &mut Velocity, max_speed: f32) {
    let speed = (vel.vx * vel.vx + vel.vy * vel.vy).sqrt();
    if speed > max_speed {
        let scale = if speed > 0.0 { max_speed / speed } else { 0.0 };
        vel.vx *= scale;
        vel.vy *= scale;
    }
}

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Axis-aligned 2D position.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Velocity in world units per tick.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub vx: f32,
    pub vy: f32,
}

impl Velocity {
    /// Construct a new velocity vector.
    #[must_use]
    pub const fn new(vx: f32, vy: f32) -> Self {
        Self { vx, vy }
    }
}

/// Index of a species in the append-only registry.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub struct SpeciesId(pub u32);

/// Terrain classification of a world cell, fixed after generation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Terrain {
    #[default]
    Normal,
    Wall,
    Rough,
    Fertile,
    Vent,
}

/// Errors raised while constructing or reconfiguring a world.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Rejection reasons for externally issued commands.
///
/// Commands never abort a tick; an invalid request is reported and the world
/// is left untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("target location is wall terrain")]
    WallTerrain,
    #[error("food capacity reached")]
    FoodCapReached,
    #[error("coordinate outside world bounds")]
    OutOfBounds,
    #[error("unknown species {0:?}")]
    UnknownSpecies(SpeciesId),
}

/// Static configuration for a sandbox world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Width of the world in world units.
    pub world_width: f32,
    /// Height of the world in world units.
    pub world_height: f32,
    /// Cell size shared by the agent and food spatial indices.
    pub agent_cell_size: f32,
    /// Cell size of the terrain grid.
    pub terrain_cell_size: f32,
    /// Cell size of the waste grid.
    pub waste_cell_size: f32,
    /// Margin kept clear of random spawn placement along each border.
    pub spawn_margin: f32,
    /// Ticks per day/night half-cycle.
    pub cycle_length: u32,
    /// Perception multiplier applied at night.
    pub night_perception_penalty: f32,
    /// Stealth bonus granted at night.
    pub night_stealth_bonus: f32,
    /// Energy drain multiplier applied at night.
    pub night_drain_multiplier: f32,
    /// Food spawn chance multiplier applied at night.
    pub night_food_spawn_multiplier: f32,
    /// Population size above which replication is suppressed.
    pub crowding_cap: usize,
    /// Individuals seeded per founder species at world start.
    pub starting_population: usize,
    /// Pellets seeded at world start.
    pub initial_food: usize,
    /// Energy granted to seeded individuals.
    pub initial_energy: f32,
    /// Chance of one ambient food spawn attempt succeeding per tick.
    pub food_spawn_chance: f32,
    /// Additional spawn chance on fertile terrain.
    pub fertile_spawn_bonus: f32,
    /// Global cap on simultaneously existing pellets.
    pub food_cap: usize,
    /// Energy content of a spawned pellet.
    pub food_energy: f32,
    /// Pellet radius used for the eat-distance check.
    pub food_radius: f32,
    /// Minimum energy required before replication triggers.
    pub replication_min_energy: f32,
    /// Per-tick replication chance once the energy gate is met.
    pub replication_chance: f32,
    /// Fraction of the parent's energy passed to the child.
    pub replication_energy_pass: f32,
    /// Energy paid by the initiator of a same-species contact.
    pub interaction_cost: f32,
    /// Energy paid by both combatants when a fight resolves.
    pub combat_cost: f32,
    /// Base energy reward for winning a fight.
    pub combat_reward_base: f32,
    /// Scale factor on the species drain-rate trait.
    pub energy_drain_base: f32,
    /// Energy ratio below which any predator triggers flight.
    pub flee_energy_threshold: f32,
    /// Strength ratio a predator must exceed to register as dangerous.
    pub flee_strength_ratio: f32,
    /// Radius of same-species flocking attraction.
    pub herd_radius: f32,
    /// Acceleration toward the herd centroid while wandering.
    pub herd_strength: f32,
    /// Random velocity jitter applied each wandering tick.
    pub wander_jitter: f32,
    /// Ticks between AI re-evaluations.
    pub decision_cooldown: u32,
    /// Steering acceleration while approaching a target.
    pub steering_force: f32,
    /// Velocity retained per tick while braking near a target.
    pub braking_factor: f32,
    /// Sideways jitter applied when bouncing off the world border.
    pub wall_bounce_slide: f32,
    /// Waste deposited by every living individual per tick.
    pub waste_per_step: f32,
    /// Fraction of a cell's waste evaporating per tick.
    pub waste_evaporation: f32,
    /// Fraction of a concentration difference diffusing per tick.
    pub waste_diffusion: f32,
    /// Scale on the drain penalty from local waste.
    pub waste_damage_multiplier: f32,
    /// Evaporation multiplier on vent terrain.
    pub vent_evaporation_multiplier: f32,
    /// Speed multiplier on rough terrain.
    pub rough_slow_factor: f32,
    /// Drain multiplier on rough terrain.
    pub rough_drain_multiplier: f32,
    /// Random terrain patches stamped at generation.
    pub terrain_patch_count: u32,
    /// Edge length, in cells, of each terrain patch.
    pub terrain_patch_size: u32,
    /// Base probability scale for mutation at replication.
    pub mutation_chance_base: f32,
    /// Standard deviation for ordinary trait perturbations.
    pub mutation_scale_trait: f32,
    /// Standard deviation for the mutation-rate trait itself.
    pub mutation_scale_meta: f32,
    /// Standard deviation scale for large-magnitude traits.
    pub mutation_scale_big: f32,
    /// Founder species seeded at world start.
    pub founders: Vec<SpeciesSeed>,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            world_width: 3_000.0,
            world_height: 3_000.0,
            agent_cell_size: 25.0,
            terrain_cell_size: 25.0,
            waste_cell_size: 10.0,
            spawn_margin: 20.0,
            cycle_length: 5_000,
            night_perception_penalty: 0.5,
            night_stealth_bonus: 0.2,
            night_drain_multiplier: 1.2,
            night_food_spawn_multiplier: 0.25,
            crowding_cap: 2_500,
            starting_population: 50,
            initial_food: 600,
            initial_energy: 100.0,
            food_spawn_chance: 1.0,
            fertile_spawn_bonus: 0.25,
            food_cap: 1_200,
            food_energy: 70.0,
            food_radius: 3.0,
            replication_min_energy: 80.0,
            replication_chance: 0.5,
            replication_energy_pass: 0.4,
            interaction_cost: 0.1,
            combat_cost: 0.2,
            combat_reward_base: 60.0,
            energy_drain_base: 0.08,
            flee_energy_threshold: 0.3,
            flee_strength_ratio: 1.5,
            herd_radius: 50.0,
            herd_strength: 0.1,
            wander_jitter: 0.5,
            decision_cooldown: 5,
            steering_force: 0.5,
            braking_factor: 0.8,
            wall_bounce_slide: 0.2,
            waste_per_step: 0.02,
            waste_evaporation: 0.01,
            waste_diffusion: 0.25,
            waste_damage_multiplier: 0.5,
            vent_evaporation_multiplier: 5.0,
            rough_slow_factor: 0.5,
            rough_drain_multiplier: 1.5,
            terrain_patch_count: 5,
            terrain_patch_size: 10,
            mutation_chance_base: 0.05,
            mutation_scale_trait: 0.05,
            mutation_scale_meta: 0.05,
            mutation_scale_big: 5.0,
            founders: default_founders(),
            history_capacity: 256,
            rng_seed: None,
        }
    }
}

impl SandboxConfig {
    /// Validates the configuration before a world is built around it.
    pub fn validate(&self) -> Result<(), WorldError> {
        if !(self.world_width > 0.0 && self.world_height > 0.0)
            || !self.world_width.is_finite()
            || !self.world_height.is_finite()
        {
            return Err(WorldError::InvalidConfig(
                "world dimensions must be positive and finite",
            ));
        }
        if self.agent_cell_size <= 0.0
            || self.terrain_cell_size <= 0.0
            || self.waste_cell_size <= 0.0
        {
            return Err(WorldError::InvalidConfig("cell sizes must be positive"));
        }
        if self.spawn_margin < 0.0
            || self.spawn_margin * 2.0 >= self.world_width
            || self.spawn_margin * 2.0 >= self.world_height
        {
            return Err(WorldError::InvalidConfig(
                "spawn_margin must leave room inside the world",
            ));
        }
        if self.cycle_length == 0 {
            return Err(WorldError::InvalidConfig("cycle_length must be non-zero"));
        }
        if self.decision_cooldown == 0 {
            return Err(WorldError::InvalidConfig(
                "decision_cooldown must be non-zero",
            ));
        }
        if !(0.0..=1.0).contains(&self.waste_evaporation)
            || !(0.0..=1.0).contains(&self.waste_diffusion)
        {
            return Err(WorldError::InvalidConfig(
                "waste evaporation and diffusion must be fractions in [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.replication_energy_pass) {
            return Err(WorldError::InvalidConfig(
                "replication_energy_pass must be a fraction in [0, 1]",
            ));
        }
        if self.food_radius <= 0.0 {
            return Err(WorldError::InvalidConfig("food_radius must be positive"));
        }
        if self.food_spawn_chance < 0.0
            || self.fertile_spawn_bonus < 0.0
            || self.night_food_spawn_multiplier < 0.0
            || self.night_perception_penalty < 0.0
            || self.night_stealth_bonus < 0.0
            || self.night_drain_multiplier < 0.0
            || self.interaction_cost < 0.0
            || self.combat_cost < 0.0
            || self.combat_reward_base < 0.0
            || self.energy_drain_base < 0.0
            || self.waste_per_step < 0.0
            || self.waste_damage_multiplier < 0.0
            || self.vent_evaporation_multiplier < 0.0
            || self.rough_slow_factor < 0.0
            || self.rough_drain_multiplier < 0.0
            || self.herd_radius <= 0.0
            || self.steering_force < 0.0
        {
            return Err(WorldError::InvalidConfig(
                "rates and costs must be non-negative, herd_radius positive",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, generating a seed from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        }
    }

    fn terrain_dims(&self) -> (u32, u32) {
        (
            (self.world_width / self.terrain_cell_size).ceil() as u32,
            (self.world_height / self.terrain_cell_size).ceil() as u32,
        )
    }

    fn waste_dims(&self) -> (u32, u32) {
        (
            (self.world_width / self.waste_cell_size).ceil() as u32,
            (self.world_height / self.waste_cell_size).ceil() as u32,
        )
    }
}

/// The 13 heritable trait scalars shared by every member of a species.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SpeciesTraits {
    /// Scales energy gained from food and combat rewards.
    pub replication_rate: f32,
    /// Baseline metabolic drain factor.
    pub drain_rate: f32,
    /// Probability scale for producing a mutant child species.
    pub mutation_rate: f32,
    pub attack: f32,
    pub defense: f32,
    pub stealth: f32,
    pub max_energy: f32,
    pub size: f32,
    /// Maximum age in ticks.
    pub lifespan: f32,
    /// Resistance to pollutant-driven drain, 0 (none) to 1 (immune).
    pub waste_tolerance: f32,
    /// 0 = pure herbivore, 1 = pure carnivore.
    pub diet: f32,
    /// Radius at which food, prey and predators are detected.
    pub perception: f32,
    pub speed: f32,
}

/// Selectable trait targets for externally applied upgrades.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TraitKind {
    ReplicationRate,
    DrainRate,
    MutationRate,
    Attack,
    Defense,
    Stealth,
    MaxEnergy,
    Size,
    Lifespan,
    WasteTolerance,
    Diet,
    Perception,
    Speed,
}

impl SpeciesTraits {
    /// Sum of the three combat-budget traits.
    #[must_use]
    pub fn combat_total(&self) -> f32 {
        self.attack + self.defense + self.stealth
    }

    /// Scales attack/defense/stealth down proportionally when their sum
    /// exceeds the combat budget, so the invariant holds after any change.
    pub fn rebalance_combat(&mut self) {
        let total = self.combat_total();
        if total > COMBAT_BUDGET {
            let ratio = COMBAT_BUDGET / total;
            self.attack = (self.attack * ratio).clamp(0.0, 1.0);
            self.defense = (self.defense * ratio).clamp(0.0, 1.0);
            self.stealth = (self.stealth * ratio).clamp(0.0, 1.0);
        }
    }

    /// Produce a perturbed copy of these traits for a child species.
    ///
    /// Each trait receives a normal delta scaled to its magnitude and is
    /// clamped to its valid range before the combat budget is rebalanced.
    #[must_use]
    pub fn mutated(&self, config: &SandboxConfig, rng: &mut SmallRng) -> Self {
        let t = config.mutation_scale_trait;
        let meta = config.mutation_scale_meta;
        let big = config.mutation_scale_big;
        let mut next = Self {
            replication_rate: (self.replication_rate + rand_norm(rng, t)).clamp(0.1, 5.0),
            drain_rate: (self.drain_rate + rand_norm(rng, t)).max(0.001),
            mutation_rate: (self.mutation_rate + rand_norm(rng, meta)).clamp(0.0, 1.0),
            attack: (self.attack + rand_norm(rng, t)).clamp(0.0, 1.0),
            defense: (self.defense + rand_norm(rng, t)).clamp(0.0, 1.0),
            stealth: (self.stealth + rand_norm(rng, t)).clamp(0.0, 1.0),
            max_energy: (self.max_energy + rand_norm(rng, t * 20.0)).max(20.0),
            size: (self.size + rand_norm(rng, t * 0.5)).clamp(2.0, 10.0),
            lifespan: (self.lifespan + rand_norm(rng, big * 100.0)).max(500.0),
            waste_tolerance: (self.waste_tolerance + rand_norm(rng, t)).clamp(0.0, 1.0),
            diet: (self.diet + rand_norm(rng, t)).clamp(0.0, 1.0),
            perception: (self.perception + rand_norm(rng, big * 5.0)).max(20.0),
            speed: (self.speed + rand_norm(rng, t * 0.5)).clamp(1.0, 5.0),
        };
        next.rebalance_combat();
        next
    }

    /// Apply one externally granted upgrade step to a single trait.
    pub fn apply_upgrade(&mut self, kind: TraitKind) {
        match kind {
            TraitKind::ReplicationRate => {
                self.replication_rate = (self.replication_rate + 0.05).clamp(0.1, 5.0);
            }
            TraitKind::DrainRate => {
                // Upgrading metabolism lowers the drain.
                self.drain_rate = (self.drain_rate - 0.005).clamp(0.001, 1.0);
            }
            TraitKind::MutationRate => {
                self.mutation_rate = (self.mutation_rate + 0.05).clamp(0.0, 1.0);
            }
            TraitKind::Attack => self.attack = (self.attack + 0.05).clamp(0.0, 1.0),
            TraitKind::Defense => self.defense = (self.defense + 0.05).clamp(0.0, 1.0),
            TraitKind::Stealth => self.stealth = (self.stealth + 0.05).clamp(0.0, 1.0),
            TraitKind::MaxEnergy => self.max_energy = (self.max_energy + 10.0).max(20.0),
            TraitKind::Size => self.size = (self.size + 0.2).clamp(2.0, 10.0),
            TraitKind::Lifespan => self.lifespan = (self.lifespan + 100.0).max(500.0),
            TraitKind::WasteTolerance => {
                self.waste_tolerance = (self.waste_tolerance + 0.02).clamp(0.0, 1.0);
            }
            TraitKind::Diet => self.diet = (self.diet + 0.05).clamp(0.0, 1.0),
            TraitKind::Perception => self.perception = (self.perception + 5.0).max(20.0),
            TraitKind::Speed => self.speed = (self.speed + 0.1).clamp(1.0, 5.0),
        }
        if matches!(kind, TraitKind::Attack | TraitKind::Defense | TraitKind::Stealth) {
            self.rebalance_combat();
        }
    }
}

/// A heritable trait template plus its lifetime aggregate statistics.
///
/// Species are never deleted; extinction only stamps `extinction_tick`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Species {
    pub id: SpeciesId,
    /// Lineage link to the species this one mutated from.
    pub parent: Option<SpeciesId>,
    pub name: String,
    pub color: [f32; 3],
    pub traits: SpeciesTraits,
    pub population: u32,
    pub peak_population: u32,
    pub spawn_tick: Tick,
    /// `None` while at least one member is alive.
    pub extinction_tick: Option<Tick>,
    pub total_kills: u64,
    pub total_food_eaten: u64,
    pub total_replications: u64,
    pub total_waste_produced: f32,
    pub peak_avg_energy: f32,
}

/// Founder description used to seed a world's initial species.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeciesSeed {
    pub name: String,
    /// Display color; a random hue is generated when absent.
    pub color: Option<[f32; 3]>,
    pub traits: SpeciesTraits,
}

/// The classic three-way founder lineup: grazer, hunter, generalist.
#[must_use]
pub fn default_founders() -> Vec<SpeciesSeed> {
    vec![
        SpeciesSeed {
            name: "Herbivore".to_string(),
            color: Some([0.15, 0.85, 0.15]),
            traits: SpeciesTraits {
                replication_rate: 1.2,
                drain_rate: 0.1,
                mutation_rate: 0.5,
                attack: 0.0,
                defense: 0.3,
                stealth: 0.3,
                max_energy: 150.0,
                size: 4.0,
                lifespan: 2_500.0,
                waste_tolerance: 0.2,
                diet: 0.0,
                perception: 130.0,
                speed: 2.2,
            },
        },
        SpeciesSeed {
            name: "Carnivore".to_string(),
            color: Some([0.85, 0.15, 0.15]),
            traits: SpeciesTraits {
                replication_rate: 1.2,
                drain_rate: 0.2,
                mutation_rate: 0.5,
                attack: 0.5,
                defense: 0.5,
                stealth: 0.2,
                max_energy: 200.0,
                size: 6.0,
                lifespan: 3_500.0,
                waste_tolerance: 0.1,
                diet: 1.0,
                perception: 180.0,
                speed: 2.9,
            },
        },
        SpeciesSeed {
            name: "Omnivore".to_string(),
            color: Some([0.9, 0.8, 0.1]),
            traits: SpeciesTraits {
                replication_rate: 0.9,
                drain_rate: 0.15,
                mutation_rate: 0.5,
                attack: 0.2,
                defense: 0.3,
                stealth: 0.3,
                max_energy: 120.0,
                size: 5.0,
                lifespan: 3_000.0,
                waste_tolerance: 0.3,
                diet: 0.5,
                perception: 120.0,
                speed: 2.0,
            },
        },
    ]
}

/// Static terrain classification over a bounded cell grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerrainField {
    cell_size: f32,
    width: u32,
    height: u32,
    cells: Vec<Terrain>,
}

impl TerrainField {
    /// Build a field from explicit cells; useful for tests and scripted maps.
    pub fn from_cells(
        cell_size: f32,
        width: u32,
        height: u32,
        cells: Vec<Terrain>,
    ) -> Result<Self, WorldError> {
        if cell_size <= 0.0 || width == 0 || height == 0 {
            return Err(WorldError::InvalidConfig(
                "terrain grid dimensions must be positive",
            ));
        }
        if cells.len() != (width as usize) * (height as usize) {
            return Err(WorldError::InvalidConfig(
                "terrain cell count must match grid dimensions",
            ));
        }
        Ok(Self {
            cell_size,
            width,
            height,
            cells,
        })
    }

    /// Generate the world map: border walls plus random feature patches.
    fn generate(config: &SandboxConfig, rng: &mut SmallRng) -> Result<Self, WorldError> {
        let (width, height) = config.terrain_dims();
        if width == 0 || height == 0 {
            return Err(WorldError::InvalidConfig(
                "terrain grid dimensions must be positive",
            ));
        }
        let mut cells = vec![Terrain::Normal; (width as usize) * (height as usize)];
        for x in 0..width {
            cells[x as usize] = Terrain::Wall;
            cells[((height - 1) * width + x) as usize] = Terrain::Wall;
        }
        for y in 0..height {
            cells[(y * width) as usize] = Terrain::Wall;
            cells[(y * width + width - 1) as usize] = Terrain::Wall;
        }

        let patch = config.terrain_patch_size;
        if patch > 0 && width > patch * 2 && height > patch * 2 {
            for _ in 0..config.terrain_patch_count {
                let px = rng.random_range(patch..width - patch);
                let py = rng.random_range(patch..height - patch);
                let kind = match rng.random_range(0..3) {
                    0 => Terrain::Rough,
                    1 => Terrain::Fertile,
                    _ => Terrain::Vent,
                };
                for x in px..px + patch {
                    for y in py..py + patch {
                        cells[(y * width + x) as usize] = kind;
                    }
                }
            }
        }

        Ok(Self {
            cell_size: config.terrain_cell_size,
            width,
            height,
            cells,
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Raw cell access by grid coordinate.
    #[must_use]
    pub fn get(&self, cx: u32, cy: u32) -> Option<Terrain> {
        if cx < self.width && cy < self.height {
            Some(self.cells[(cy * self.width + cx) as usize])
        } else {
            None
        }
    }

    /// Terrain at a world coordinate. Out-of-bounds reads are walls.
    #[must_use]
    pub fn terrain_at(&self, x: f32, y: f32) -> Terrain {
        let cx = (x / self.cell_size).floor();
        let cy = (y / self.cell_size).floor();
        if cx < 0.0 || cy < 0.0 || cx >= self.width as f32 || cy >= self.height as f32 {
            return Terrain::Wall;
        }
        self.cells[(cy as u32 * self.width + cx as u32) as usize]
    }
}

/// Mutable pollutant concentration grid with double-buffered updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WasteField {
    cell_size: f32,
    width: u32,
    height: u32,
    cells: Vec<f32>,
    #[serde(skip)]
    scratch: Vec<f32>,
}

impl WasteField {
    fn new(cell_size: f32, width: u32, height: u32) -> Result<Self, WorldError> {
        if cell_size <= 0.0 || width == 0 || height == 0 {
            return Err(WorldError::InvalidConfig(
                "waste grid dimensions must be positive",
            ));
        }
        let len = (width as usize) * (height as usize);
        Ok(Self {
            cell_size,
            width,
            height,
            cells: vec![0.0; len],
            scratch: vec![0.0; len],
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Concentrations in row-major order, for overlay rendering.
    #[must_use]
    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    /// Concentration at a world coordinate; zero outside the grid.
    #[must_use]
    pub fn waste_at(&self, x: f32, y: f32) -> f32 {
        let cx = (x / self.cell_size).floor();
        let cy = (y / self.cell_size).floor();
        if cx < 0.0 || cy < 0.0 || cx >= self.width as f32 || cy >= self.height as f32 {
            return 0.0;
        }
        self.cells[(cy as u32 * self.width + cx as u32) as usize]
    }

    /// Deposit waste at a world coordinate. Returns false when the point
    /// falls outside the grid and nothing was added.
    pub fn add(&mut self, x: f32, y: f32, amount: f32) -> bool {
        let cx = (x / self.cell_size).floor();
        let cy = (y / self.cell_size).floor();
        if cx < 0.0 || cy < 0.0 || cx >= self.width as f32 || cy >= self.height as f32 {
            return false;
        }
        self.cells[(cy as u32 * self.width + cx as u32) as usize] += amount;
        true
    }

    /// Total pollutant mass currently held by the field.
    #[must_use]
    pub fn total_mass(&self) -> f32 {
        self.cells.iter().sum()
    }

    /// One forward-difference diffusion-with-decay pass.
    ///
    /// Neighbor reads must observe the pre-update buffer only, hence the
    /// double buffer; concentrations below the residue threshold are culled
    /// so the sparse tail does not accumulate dust forever.
    fn update(&mut self, terrain: &TerrainField, config: &SandboxConfig) {
        let width = self.width as usize;
        let height = self.height as usize;
        if self.scratch.len() != self.cells.len() {
            self.scratch.resize(self.cells.len(), 0.0);
        }
        self.scratch.fill(0.0);
        let spread = config.waste_diffusion / 4.0;

        for cy in 0..height {
            for cx in 0..width {
                let idx = cy * width + cx;
                let concentration = self.cells[idx];
                if concentration < WASTE_RESIDUE_EPSILON {
                    continue;
                }

                let world_x = cx as f32 * self.cell_size;
                let world_y = cy as f32 * self.cell_size;
                let mut evaporation = config.waste_evaporation;
                if terrain.terrain_at(world_x, world_y) == Terrain::Vent {
                    evaporation *= config.vent_evaporation_multiplier;
                }
                let mut retained = concentration * (1.0 - evaporation.min(1.0));

                let neighbors = [
                    (cx.wrapping_sub(1), cy, cx > 0),
                    (cx + 1, cy, cx + 1 < width),
                    (cx, cy.wrapping_sub(1), cy > 0),
                    (cx, cy + 1, cy + 1 < height),
                ];
                for (nx, ny, in_bounds) in neighbors {
                    if !in_bounds {
                        continue;
                    }
                    let neighbor_idx = ny * width + nx;
                    let neighbor = self.cells[neighbor_idx];
                    if concentration > neighbor {
                        let transfer = (concentration - neighbor) * spread;
                        retained -= transfer;
                        self.scratch[neighbor_idx] += transfer;
                    }
                }

                if retained > WASTE_RESIDUE_EPSILON {
                    self.scratch[idx] += retained;
                }
            }
        }

        std::mem::swap(&mut self.cells, &mut self.scratch);
    }
}

/// AI behavior state of an individual.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AiState {
    #[default]
    Wandering,
    Eating,
    Hunting,
    Fleeing,
}

/// Current objective of an individual, stored as a revalidatable key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Target {
    Food(FoodId),
    Agent(AgentId),
}

/// Per-individual state beyond the dense movement columns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentRuntime {
    pub energy: f32,
    pub alive: bool,
    pub state: AiState,
    pub target: Option<Target>,
    /// Ticks remaining before the AI re-evaluates its task.
    pub cooldown: u32,
    pub kills: u32,
    pub food_eaten: u32,
    pub replications: u32,
    pub waste_produced: f32,
}

impl AgentRuntime {
    /// Fresh runtime for a newly spawned individual.
    #[must_use]
    pub fn with_energy(energy: f32) -> Self {
        Self {
            energy,
            alive: true,
            state: AiState::Wandering,
            target: None,
            cooldown: 0,
            kills: 0,
            food_eaten: 0,
            replications: 0,
            waste_produced: 0.0,
        }
    }
}

/// Scalar fields for a single individual used when inserting or
/// snapshotting from the dense store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct IndividualData {
    pub position: Position,
    pub velocity: Velocity,
    pub age: u32,
    pub species: SpeciesId,
}

/// Collection of per-individual columns for hot-path iteration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IndividualColumns {
    positions: Vec<Position>,
    velocities: Vec<Velocity>,
    ages: Vec<u32>,
    species: Vec<SpeciesId>,
}

impl IndividualColumns {
    /// Number of active rows in the columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if there are no active rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, data: IndividualData) {
        self.positions.push(data.position);
        self.velocities.push(data.velocity);
        self.ages.push(data.age);
        self.species.push(data.species);
        self.debug_assert_coherent();
    }

    /// Swap-remove the row at `index` and return its scalar fields.
    pub fn swap_remove(&mut self, index: usize) -> IndividualData {
        let removed = IndividualData {
            position: self.positions.swap_remove(index),
            velocity: self.velocities.swap_remove(index),
            age: self.ages.swap_remove(index),
            species: self.species.swap_remove(index),
        };
        self.debug_assert_coherent();
        removed
    }

    /// Copy the row at `from` into position `to` without altering length.
    pub fn move_row(&mut self, from: usize, to: usize) {
        debug_assert!(from < self.len(), "move_row from out of bounds");
        debug_assert!(to < self.len(), "move_row to out of bounds");
        if from == to {
            return;
        }
        self.positions[to] = self.positions[from];
        self.velocities[to] = self.velocities[from];
        self.ages[to] = self.ages[from];
        self.species[to] = self.species[from];
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        self.positions.swap(a, b);
        self.velocities.swap(a, b);
        self.ages.swap(a, b);
        self.species.swap(a, b);
    }

    /// Truncate all columns to the provided length.
    pub fn truncate(&mut self, len: usize) {
        self.positions.truncate(len);
        self.velocities.truncate(len);
        self.ages.truncate(len);
        self.species.truncate(len);
        self.debug_assert_coherent();
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> IndividualData {
        IndividualData {
            position: self.positions[index],
            velocity: self.velocities[index],
            age: self.ages[index],
            species: self.species[index],
        }
    }

    /// Immutable access to the positions slice.
    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Mutable access to the positions slice.
    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Position] {
        &mut self.positions
    }

    /// Immutable access to the velocities slice.
    #[must_use]
    pub fn velocities(&self) -> &[Velocity] {
        &self.velocities
    }

    /// Mutable access to the velocities slice.
    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut [Velocity] {
        &mut self.velocities
    }

    /// Immutable access to age counters.
    #[must_use]
    pub fn ages(&self) -> &[u32] {
        &self.ages
    }

    /// Mutable access to age counters.
    #[must_use]
    pub fn ages_mut(&mut self) -> &mut [u32] {
        &mut self.ages
    }

    /// Immutable access to species assignments.
    #[must_use]
    pub fn species(&self) -> &[SpeciesId] {
        &self.species
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.ages.len());
        debug_assert_eq!(self.positions.len(), self.species.len());
    }
}

/// Dense SoA storage with generational handles for individual access.
#[derive(Debug, Default)]
pub struct IndividualArena {
    slots: SlotMap<AgentId, usize>,
    handles: Vec<AgentId>,
    columns: IndividualColumns,
}

impl IndividualArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored individuals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when no individuals are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over handles in dense iteration order.
    pub fn iter_handles(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.handles.iter().copied()
    }

    /// Borrow the underlying column storage.
    #[must_use]
    pub fn columns(&self) -> &IndividualColumns {
        &self.columns
    }

    /// Mutably borrow the underlying column storage.
    #[must_use]
    pub fn columns_mut(&mut self) -> &mut IndividualColumns {
        &mut self.columns
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: AgentId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns true if `id` refers to a stored individual.
    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert a new individual and return its handle.
    pub fn insert(&mut self, data: IndividualData) -> AgentId {
        let index = self.columns.len();
        self.columns.push(data);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove `id` returning its scalar data if it was present.
    pub fn remove(&mut self, id: AgentId) -> Option<IndividualData> {
        let index = self.slots.remove(id)?;
        let removed = self.columns.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(removed)
    }

    /// Remove all individuals whose ids are in `dead`, preserving the
    /// relative order of survivors. Returns the number removed.
    pub fn remove_many(&mut self, dead: &HashSet<AgentId>) -> usize {
        if dead.is_empty() {
            return 0;
        }
        let mut write = 0;
        for read in 0..self.handles.len() {
            let id = self.handles[read];
            if dead.contains(&id) {
                self.slots.remove(id);
                continue;
            }
            if write != read {
                self.handles[write] = id;
                self.columns.move_row(read, write);
            }
            if let Some(slot) = self.slots.get_mut(id) {
                *slot = write;
            }
            write += 1;
        }
        let removed = self.handles.len().saturating_sub(write);
        self.handles.truncate(write);
        self.columns.truncate(write);
        removed
    }

    /// Fisher-Yates shuffle of the dense rows, keeping handles coherent.
    ///
    /// Run once per tick before sequential agent scans so iteration order
    /// carries no positional bias.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        for i in (1..self.handles.len()).rev() {
            let j = rng.random_range(0..=i);
            if i == j {
                continue;
            }
            self.handles.swap(i, j);
            self.columns.swap_rows(i, j);
            let moved_i = self.handles[i];
            let moved_j = self.handles[j];
            if let Some(slot) = self.slots.get_mut(moved_i) {
                *slot = i;
            }
            if let Some(slot) = self.slots.get_mut(moved_j) {
                *slot = j;
            }
        }
    }

    /// Produce a copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot(&self, id: AgentId) -> Option<IndividualData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }
}

/// Stationary consumable resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FoodPellet {
    pub position: Position,
    pub energy: f32,
    pub radius: f32,
}

/// Per-agent line of a world snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub species: SpeciesId,
    pub position: Position,
    /// Current energy over the species maximum, in [0, 1].
    pub energy_ratio: f32,
}

/// Per-pellet line of a world snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FoodSnapshot {
    pub id: FoodId,
    pub position: Position,
}

/// Read-only view of the world sufficient for rendering and UI layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldSnapshot {
    pub tick: Tick,
    pub is_day: bool,
    pub agents: Vec<AgentSnapshot>,
    pub food: Vec<FoodSnapshot>,
}

/// Events emitted after processing a world tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct TickEvents {
    pub tick: Tick,
    /// The day/night phase flipped on this tick.
    pub cycle_toggled: bool,
    /// Location of the ambient food spawn, when one landed.
    pub food_spawned: Option<Position>,
    /// No individuals remain alive; the simulation reached its terminal state.
    pub extinct: bool,
}

/// Aggregate numbers describing one completed tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    pub population: usize,
    pub species_alive: usize,
    pub food_count: usize,
    pub births: usize,
    pub deaths: usize,
    pub mean_energy: f32,
}

/// Sink invoked with the summary after every tick.
pub trait TickObserver: Send {
    fn on_tick(&mut self, summary: &TickSummary);
}

/// No-op observer.
#[derive(Debug, Default)]
pub struct NullObserver;

impl TickObserver for NullObserver {
    fn on_tick(&mut self, _summary: &TickSummary) {}
}

#[derive(Debug, Clone, Copy)]
struct BirthOrder {
    species: SpeciesId,
    position: Position,
    energy: f32,
}

/// Aggregate world state advanced tick-by-tick by a single logical thread.
pub struct WorldState {
    config: SandboxConfig,
    tick: Tick,
    rng: SmallRng,
    is_day: bool,
    cycle_timer: u32,
    species: Vec<Species>,
    agents: IndividualArena,
    runtime: AgentMap<AgentRuntime>,
    food: SlotMap<FoodId, FoodPellet>,
    food_handles: Vec<FoodId>,
    terrain: TerrainField,
    waste: WasteField,
    agent_index: UniformGridIndex,
    food_index: UniformGridIndex,
    pending_deaths: Vec<AgentId>,
    pending_births: Vec<BirthOrder>,
    last_births: usize,
    last_deaths: usize,
    history: VecDeque<TickSummary>,
    observer: Box<dyn TickObserver>,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("tick", &self.tick)
            .field("is_day", &self.is_day)
            .field("agent_count", &self.agents.len())
            .field("species_count", &self.species.len())
            .field("food_count", &self.food.len())
            .finish()
    }
}

impl WorldState {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: SandboxConfig) -> Result<Self, WorldError> {
        Self::with_observer(config, Box::new(NullObserver))
    }

    /// Instantiate a new world with a tick observer attached.
    pub fn with_observer(
        config: SandboxConfig,
        observer: Box<dyn TickObserver>,
    ) -> Result<Self, WorldError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let terrain = TerrainField::generate(&config, &mut rng)?;
        let (waste_w, waste_h) = config.waste_dims();
        let waste = WasteField::new(config.waste_cell_size, waste_w, waste_h)?;
        let agent_index = UniformGridIndex::new(config.agent_cell_size);
        let food_index = UniformGridIndex::new(config.agent_cell_size);
        let history_capacity = config.history_capacity;

        let mut world = Self {
            config,
            tick: Tick::zero(),
            rng,
            is_day: true,
            cycle_timer: 0,
            species: Vec::new(),
            agents: IndividualArena::new(),
            runtime: AgentMap::new(),
            food: SlotMap::with_key(),
            food_handles: Vec::new(),
            terrain,
            waste,
            agent_index,
            food_index,
            pending_deaths: Vec::new(),
            pending_births: Vec::new(),
            last_births: 0,
            last_deaths: 0,
            history: VecDeque::with_capacity(history_capacity),
            observer,
        };
        world.seed_founders();
        world.seed_food();
        Ok(world)
    }

    fn seed_founders(&mut self) {
        let founders = self.config.founders.clone();
        let starting_population = self.config.starting_population;
        let initial_energy = self.config.initial_energy;
        for seed in founders {
            let color = seed
                .color
                .unwrap_or_else(|| random_species_color(&mut self.rng));
            let species = self.register_species(seed.name, color, seed.traits, None, Tick::zero());
            for _ in 0..starting_population {
                if let Some(position) = self.random_open_position() {
                    self.insert_individual(species, position, initial_energy);
                }
            }
        }
    }

    fn seed_food(&mut self) {
        let count = self.config.initial_food.min(self.config.food_cap);
        for _ in 0..count {
            if let Some(position) = self.random_open_position() {
                self.insert_food(position);
            }
        }
    }

    fn register_species(
        &mut self,
        name: String,
        color: [f32; 3],
        traits: SpeciesTraits,
        parent: Option<SpeciesId>,
        spawn_tick: Tick,
    ) -> SpeciesId {
        let id = SpeciesId(self.species.len() as u32);
        self.species.push(Species {
            id,
            parent,
            name,
            color,
            traits,
            population: 0,
            peak_population: 0,
            spawn_tick,
            extinction_tick: None,
            total_kills: 0,
            total_food_eaten: 0,
            total_replications: 0,
            total_waste_produced: 0.0,
            peak_avg_energy: 0.0,
        });
        id
    }

    fn insert_individual(
        &mut self,
        species: SpeciesId,
        position: Position,
        energy: f32,
    ) -> AgentId {
        let velocity = Velocity::new(
            (self.rng.random::<f32>() - 0.5) * 2.0,
            (self.rng.random::<f32>() - 0.5) * 2.0,
        );
        let id = self.agents.insert(IndividualData {
            position,
            velocity,
            age: 0,
            species,
        });
        self.runtime.insert(id, AgentRuntime::with_energy(energy));
        let entry = &mut self.species[species.0 as usize];
        entry.population += 1;
        entry.peak_population = entry.peak_population.max(entry.population);
        id
    }

    fn insert_food(&mut self, position: Position) -> Option<FoodId> {
        if self.food.len() >= self.config.food_cap {
            return None;
        }
        Some(self.food.insert(FoodPellet {
            position,
            energy: self.config.food_energy,
            radius: self.config.food_radius,
        }))
    }

    fn random_open_position(&mut self) -> Option<Position> {
        let margin = self.config.spawn_margin;
        for _ in 0..PLACEMENT_ATTEMPTS {
            let x = self
                .rng
                .random_range(margin..self.config.world_width - margin);
            let y = self
                .rng
                .random_range(margin..self.config.world_height - margin);
            if self.terrain.terrain_at(x, y) != Terrain::Wall {
                return Some(Position::new(x, y));
            }
        }
        None
    }

    fn in_bounds(&self, x: f32, y: f32) -> bool {
        (0.0..self.config.world_width).contains(&x) && (0.0..self.config.world_height).contains(&y)
    }

    fn species_of_index(&self, idx: usize) -> SpeciesId {
        self.agents.columns().species()[idx]
    }

    fn traits_of(&self, id: SpeciesId) -> SpeciesTraits {
        self.species[id.0 as usize].traits
    }

    fn is_alive(&self, id: AgentId) -> bool {
        self.runtime.get(id).is_some_and(|rt| rt.alive)
    }

    fn night_stealth_bonus(&self) -> f32 {
        if self.is_day {
            0.0
        } else {
            self.config.night_stealth_bonus
        }
    }

    fn effective_perception(&self, traits: &SpeciesTraits) -> f32 {
        if self.is_day {
            traits.perception
        } else {
            traits.perception * self.config.night_perception_penalty
        }
    }

    fn max_speed_at(&self, position: Position, traits: &SpeciesTraits) -> f32 {
        if self.terrain.terrain_at(position.x, position.y) == Terrain::Rough {
            traits.speed * self.config.rough_slow_factor
        } else {
            traits.speed
        }
    }

    fn combat_roll(&mut self) -> f32 {
        0.8 + self.rng.random::<f32>() * 0.2
    }

    fn kill_agent(&mut self, id: AgentId, species: SpeciesId) {
        if let Some(rt) = self.runtime.get_mut(id) {
            if !rt.alive {
                return;
            }
            rt.alive = false;
        } else {
            return;
        }
        let entry = &mut self.species[species.0 as usize];
        entry.population = entry.population.saturating_sub(1);
        self.pending_deaths.push(id);
    }

    // ---- tick pipeline -------------------------------------------------

    /// Execute one simulation tick, returning the emitted events.
    ///
    /// Sub-phases run in a fixed order; see the stage methods for the
    /// contract each one upholds.
    pub fn step(&mut self) -> TickEvents {
        let next_tick = self.tick.next();
        let cycle_toggled = self.stage_cycle();
        let food_spawned = self.stage_food_spawn();
        self.stage_waste();
        self.stage_rebuild_indices();
        self.stage_agents(next_tick);
        self.stage_movement();
        self.stage_interactions();
        self.stage_death_cleanup();
        self.stage_birth_commit();
        self.stage_extinctions(next_tick);
        self.stage_summary(next_tick);
        self.tick = next_tick;
        TickEvents {
            tick: next_tick,
            cycle_toggled,
            food_spawned,
            extinct: self.agents.is_empty(),
        }
    }

    fn stage_cycle(&mut self) -> bool {
        self.cycle_timer += 1;
        if self.cycle_timer >= self.config.cycle_length {
            self.cycle_timer = 0;
            self.is_day = !self.is_day;
            true
        } else {
            false
        }
    }

    /// One ambient spawn attempt per tick: a random candidate location,
    /// rejected on walls, with the chance shaped by night and fertility.
    fn stage_food_spawn(&mut self) -> Option<Position> {
        let margin = self.config.spawn_margin;
        let x = self
            .rng
            .random_range(margin..self.config.world_width - margin);
        let y = self
            .rng
            .random_range(margin..self.config.world_height - margin);
        let terrain = self.terrain.terrain_at(x, y);
        if terrain == Terrain::Wall {
            return None;
        }
        let mut chance = self.config.food_spawn_chance;
        if !self.is_day {
            chance *= self.config.night_food_spawn_multiplier;
        }
        if terrain == Terrain::Fertile {
            chance += self.config.fertile_spawn_bonus;
        }
        if self.rng.random::<f32>() >= chance {
            return None;
        }
        let position = Position::new(x, y);
        self.insert_food(position).map(|_| position)
    }

    fn stage_waste(&mut self) {
        self.waste.update(&self.terrain, &self.config);
    }

    fn stage_rebuild_indices(&mut self) {
        self.agents.shuffle(&mut self.rng);
        let positions: Vec<(f32, f32)> = self
            .agents
            .columns()
            .positions()
            .iter()
            .map(|p| (p.x, p.y))
            .collect();
        let _ = self.agent_index.rebuild(&positions);

        self.food_handles.clear();
        let mut food_positions = Vec::with_capacity(self.food.len());
        for (id, pellet) in &self.food {
            self.food_handles.push(id);
            food_positions.push((pellet.position.x, pellet.position.y));
        }
        let _ = self.food_index.rebuild(&food_positions);
    }

    /// Pure per-agent drain factors, safe to evaluate in parallel because
    /// nothing here touches the RNG or mutates shared state.
    fn compute_drains(&self) -> Vec<f32> {
        let columns = self.agents.columns();
        let positions = columns.positions();
        let species_ids = columns.species();
        let species = &self.species;
        let waste = &self.waste;
        let terrain = &self.terrain;
        let config = &self.config;
        let night = !self.is_day;

        (0..positions.len())
            .into_par_iter()
            .map(|idx| {
                let traits = &species[species_ids[idx].0 as usize].traits;
                let pos = positions[idx];
                let local_waste = waste.waste_at(pos.x, pos.y);
                let waste_multiplier =
                    1.0 + local_waste * (1.0 - traits.waste_tolerance) * config.waste_damage_multiplier;
                let terrain_multiplier = if terrain.terrain_at(pos.x, pos.y) == Terrain::Rough {
                    config.rough_drain_multiplier
                } else {
                    1.0
                };
                let cycle_multiplier = if night {
                    config.night_drain_multiplier
                } else {
                    1.0
                };
                (traits.drain_rate * config.energy_drain_base
                    + traits.size * 0.01
                    + traits.attack * 0.05
                    + traits.defense * 0.05
                    + traits.speed * 0.02)
                    * waste_multiplier
                    * terrain_multiplier
                    * cycle_multiplier
            })
            .collect()
    }

    /// Aging, drain, death, waste deposition, replication, and the AI pass
    /// for every individual, in the shuffled scan order.
    fn stage_agents(&mut self, next_tick: Tick) {
        let handles: Vec<AgentId> = self.agents.iter_handles().collect();
        if handles.is_empty() {
            return;
        }
        let drains = self.compute_drains();
        let population = handles.len();

        for idx in 0..handles.len() {
            let id = handles[idx];
            let age = {
                let ages = self.agents.columns_mut().ages_mut();
                ages[idx] = ages[idx].saturating_add(1);
                ages[idx]
            };
            let species_id = self.species_of_index(idx);
            let traits = self.traits_of(species_id);

            let energy = {
                let Some(rt) = self.runtime.get_mut(id) else {
                    continue;
                };
                rt.energy -= drains[idx];
                rt.energy
            };
            if energy <= 0.0 || age as f32 > traits.lifespan {
                self.kill_agent(id, species_id);
                continue;
            }

            let deposited = self.config.waste_per_step;
            if deposited > 0.0 {
                let pos = self.agents.columns().positions()[idx];
                if self.waste.add(pos.x, pos.y, deposited) {
                    if let Some(rt) = self.runtime.get_mut(id) {
                        rt.waste_produced += deposited;
                    }
                    self.species[species_id.0 as usize].total_waste_produced += deposited;
                }
            }

            if energy >= self.config.replication_min_energy
                && population < self.config.crowding_cap
                && self.rng.random::<f32>() < self.config.replication_chance
            {
                self.replicate(idx, id, species_id, next_tick);
            }

            self.update_ai(idx, id, &handles);

            if let Some(rt) = self.runtime.get_mut(id) {
                if rt.energy > traits.max_energy {
                    rt.energy = traits.max_energy;
                }
            }
        }
    }

    fn replicate(&mut self, idx: usize, id: AgentId, species_id: SpeciesId, next_tick: Tick) {
        let pass = self.config.replication_energy_pass;
        let cooldown = self.config.decision_cooldown;
        let child_energy = {
            let Some(rt) = self.runtime.get_mut(id) else {
                return;
            };
            let child = rt.energy * pass;
            rt.energy -= child;
            rt.replications += 1;
            rt.state = AiState::Wandering;
            rt.target = None;
            rt.cooldown = cooldown;
            child
        };
        self.species[species_id.0 as usize].total_replications += 1;

        let traits = self.traits_of(species_id);
        let roll: f32 = self.rng.random();
        let child_species = if roll < traits.mutation_rate * self.config.mutation_chance_base {
            self.spawn_mutant(species_id, next_tick)
        } else {
            species_id
        };

        let pos = self.agents.columns().positions()[idx];
        let position = Position::new(
            pos.x + (self.rng.random::<f32>() - 0.5) * BIRTH_SCATTER,
            pos.y + (self.rng.random::<f32>() - 0.5) * BIRTH_SCATTER,
        );
        self.pending_births.push(BirthOrder {
            species: child_species,
            position,
            energy: child_energy,
        });
    }

    fn spawn_mutant(&mut self, parent: SpeciesId, next_tick: Tick) -> SpeciesId {
        let traits = self.traits_of(parent).mutated(&self.config, &mut self.rng);
        let name = format!("Mutant #{}", self.species.len());
        let color = random_species_color(&mut self.rng);
        self.register_species(name, color, traits, Some(parent), next_tick)
    }

    /// Cooldown-gated state transitions followed by per-state steering.
    fn update_ai(&mut self, idx: usize, id: AgentId, handles: &[AgentId]) {
        let Some(rt) = self.runtime.get(id) else {
            return;
        };
        let mut state = rt.state;
        let mut target = rt.target;
        let mut cooldown = rt.cooldown;

        if state != AiState::Fleeing {
            let task_invalid = match (state, target) {
                (AiState::Eating, Some(Target::Food(fid))) => !self.food.contains_key(fid),
                (AiState::Eating, _) => true,
                (AiState::Hunting, Some(Target::Agent(aid))) => !self.is_alive(aid),
                (AiState::Hunting, _) => true,
                _ => false,
            };

            let mut should_find = false;
            if task_invalid {
                state = AiState::Wandering;
                target = None;
                cooldown = 0;
                should_find = true;
            } else if state == AiState::Wandering {
                if cooldown > 0 {
                    cooldown -= 1;
                }
                if cooldown == 0 {
                    should_find = true;
                }
            }

            if should_find {
                if let Some(threat) = self.check_for_danger(idx, id, handles) {
                    state = AiState::Fleeing;
                    target = Some(Target::Agent(threat));
                    cooldown = self.config.decision_cooldown;
                } else {
                    let (next_state, next_target, next_cooldown) =
                        self.find_new_task(idx, id, handles);
                    state = next_state;
                    target = next_target;
                    cooldown = next_cooldown;
                }
            }
        } else {
            if cooldown > 0 {
                cooldown -= 1;
            }
            if cooldown == 0 {
                cooldown = self.config.decision_cooldown;
                if self.check_for_danger(idx, id, handles).is_none() {
                    state = AiState::Wandering;
                    target = None;
                    cooldown = 0;
                }
            }
        }

        if let Some(rt) = self.runtime.get_mut(id) {
            rt.state = state;
            rt.target = target;
            rt.cooldown = cooldown;
        }
        self.execute_state(idx, id, handles);
    }

    /// Nearest visible rival worth running from, if any.
    fn check_for_danger(&mut self, idx: usize, id: AgentId, handles: &[AgentId]) -> Option<AgentId> {
        let my_species = self.species_of_index(idx);
        let my = self.traits_of(my_species);
        let energy = self.runtime.get(id).map_or(0.0, |rt| rt.energy);
        let vulnerable = energy < my.max_energy * self.config.flee_energy_threshold;
        let night_bonus = self.night_stealth_bonus();
        let perception = self.effective_perception(&my);
        let mut best_dist_sq = perception * perception;
        let mut best: Option<AgentId> = None;

        let mut candidates: Vec<(usize, f32)> = Vec::new();
        self.agent_index.neighbors_within(
            idx,
            best_dist_sq,
            &mut |other_idx, dist_sq: OrderedFloat<f32>| {
                candidates.push((other_idx, dist_sq.into_inner()));
            },
        );

        for (other_idx, dist_sq) in candidates {
            let other_id = handles[other_idx];
            if other_id == id || !self.is_alive(other_id) {
                continue;
            }
            let other_species = self.species_of_index(other_idx);
            if other_species == my_species {
                continue;
            }
            let rival = self.traits_of(other_species);
            if my.diet >= 1.0 {
                // Carnivores only fear other carnivores.
                if rival.diet < 1.0 {
                    continue;
                }
            } else if rival.diet < 0.3 {
                continue;
            }
            if self.rng.random::<f32>() < rival.stealth + night_bonus {
                continue;
            }
            if my.diet >= 1.0 && rival.diet >= 1.0 && !vulnerable {
                continue;
            }
            if dist_sq < best_dist_sq {
                let rival_strength = rival.attack + rival.size;
                let my_strength = my.defense + my.size;
                let dangerous = rival_strength > my_strength * self.config.flee_strength_ratio;
                if dangerous || vulnerable {
                    best_dist_sq = dist_sq;
                    best = Some(other_id);
                }
            }
        }
        best
    }

    /// Score food against prey and pick the next task.
    fn find_new_task(
        &mut self,
        idx: usize,
        id: AgentId,
        handles: &[AgentId],
    ) -> (AiState, Option<Target>, u32) {
        let my_species = self.species_of_index(idx);
        let my = self.traits_of(my_species);
        let energy = self.runtime.get(id).map_or(0.0, |rt| rt.energy);
        if energy >= my.max_energy * 0.9 {
            // Sated; rescan next tick.
            return (AiState::Wandering, None, 0);
        }

        let perception = self.effective_perception(&my);
        let perception_sq = perception * perception;
        let pos = self.agents.columns().positions()[idx];
        let wants_food = my.diet < 0.7;
        let wants_prey = my.diet > 0.3;

        let mut best_food: Option<(FoodId, f32)> = None;
        if wants_food {
            let mut candidates: Vec<(usize, f32)> = Vec::new();
            self.food_index.neighbors_near(
                pos.x,
                pos.y,
                perception_sq,
                &mut |food_idx, dist_sq: OrderedFloat<f32>| {
                    candidates.push((food_idx, dist_sq.into_inner()));
                },
            );
            for (food_idx, dist_sq) in candidates {
                let Some(&fid) = self.food_handles.get(food_idx) else {
                    continue;
                };
                let Some(pellet) = self.food.get(fid) else {
                    continue;
                };
                let score = pellet.energy / (dist_sq + SCORE_EPSILON);
                if best_food.is_none_or(|(_, best)| score > best) {
                    best_food = Some((fid, score));
                }
            }
        }

        let mut best_prey: Option<(AgentId, f32)> = None;
        if wants_prey {
            let night_bonus = self.night_stealth_bonus();
            let mut candidates: Vec<(usize, f32)> = Vec::new();
            self.agent_index.neighbors_within(
                idx,
                perception_sq,
                &mut |other_idx, dist_sq: OrderedFloat<f32>| {
                    candidates.push((other_idx, dist_sq.into_inner()));
                },
            );
            for (other_idx, dist_sq) in candidates {
                let other_id = handles[other_idx];
                if other_id == id || !self.is_alive(other_id) {
                    continue;
                }
                let other_species = self.species_of_index(other_idx);
                if other_species == my_species {
                    continue;
                }
                let prey = self.traits_of(other_species);
                if prey.diet >= 1.0 {
                    continue;
                }
                if self.rng.random::<f32>() < prey.stealth + night_bonus {
                    continue;
                }
                let prey_energy = self.runtime.get(other_id).map_or(0.0, |rt| rt.energy);
                let win_margin = (my.attack - prey.defense).max(0.0);
                let score = prey_energy / (dist_sq + SCORE_EPSILON) * (0.1 + win_margin);
                if best_prey.is_none_or(|(_, best)| score > best) {
                    best_prey = Some((other_id, score));
                }
            }
        }

        let cooldown = self.config.decision_cooldown;
        match (best_food, best_prey) {
            (Some((fid, _)), Some((prey_id, _))) => {
                if my.diet <= 0.5 {
                    (AiState::Eating, Some(Target::Food(fid)), cooldown)
                } else {
                    (AiState::Hunting, Some(Target::Agent(prey_id)), cooldown)
                }
            }
            (Some((fid, _)), None) => (AiState::Eating, Some(Target::Food(fid)), cooldown),
            (None, Some((prey_id, _))) => (AiState::Hunting, Some(Target::Agent(prey_id)), cooldown),
            (None, None) => (AiState::Wandering, None, cooldown),
        }
    }

    /// Translate the current state into velocity adjustments.
    fn execute_state(&mut self, idx: usize, id: AgentId, handles: &[AgentId]) {
        let Some(rt) = self.runtime.get(id) else {
            return;
        };
        let mut state = rt.state;
        let mut target = rt.target;
        let mut cooldown = rt.cooldown;

        // A target-requiring state without a target would strand the agent.
        if target.is_none() && state != AiState::Wandering {
            state = AiState::Wandering;
            cooldown = 0;
        }

        match state {
            AiState::Wandering => self.wander(idx, handles),
            AiState::Eating => {
                if let Some(Target::Food(fid)) = target {
                    if let Some(pellet_pos) = self.food.get(fid).map(|p| p.position) {
                        self.steer_toward(idx, pellet_pos);
                    }
                }
            }
            AiState::Hunting => {
                let prey_pos = match target {
                    Some(Target::Agent(aid)) if self.is_alive(aid) => self
                        .agents
                        .index_of(aid)
                        .map(|i| self.agents.columns().positions()[i]),
                    _ => None,
                };
                if let Some(prey_pos) = prey_pos {
                    self.steer_toward(idx, prey_pos);
                } else {
                    state = AiState::Wandering;
                    target = None;
                    cooldown = 0;
                }
            }
            AiState::Fleeing => {
                let threat_pos = match target {
                    Some(Target::Agent(aid)) => self
                        .agents
                        .index_of(aid)
                        .map(|i| self.agents.columns().positions()[i]),
                    _ => None,
                };
                if let Some(threat_pos) = threat_pos {
                    self.flee_from(idx, threat_pos);
                } else {
                    state = AiState::Wandering;
                    target = None;
                    cooldown = 0;
                }
            }
        }

        if let Some(rt) = self.runtime.get_mut(id) {
            rt.state = state;
            rt.target = target;
            rt.cooldown = cooldown;
        }
    }

    /// Flocking drift toward same-species neighbors plus random jitter.
    fn wander(&mut self, idx: usize, handles: &[AgentId]) {
        let my_species = self.species_of_index(idx);
        let traits = self.traits_of(my_species);
        let pos = self.agents.columns().positions()[idx];
        let herd_sq = self.config.herd_radius * self.config.herd_radius;

        let mut candidates: Vec<usize> = Vec::new();
        self.agent_index
            .neighbors_within(idx, herd_sq, &mut |other_idx, _: OrderedFloat<f32>| {
                candidates.push(other_idx);
            });

        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut herd_count = 0usize;
        for other_idx in candidates {
            let other_id = handles[other_idx];
            if !self.is_alive(other_id) || self.species_of_index(other_idx) != my_species {
                continue;
            }
            let other_pos = self.agents.columns().positions()[other_idx];
            sum_x += other_pos.x;
            sum_y += other_pos.y;
            herd_count += 1;
        }

        let mut vel = self.agents.columns().velocities()[idx];
        if herd_count > 0 {
            let centroid_x = sum_x / herd_count as f32;
            let centroid_y = sum_y / herd_count as f32;
            let dx = centroid_x - pos.x;
            let dy = centroid_y - pos.y;
            let dist = (dx * dx + dy * dy).sqrt();
            if dist > 1.0 {
                vel.vx += dx / dist * self.config.herd_strength;
                vel.vy += dy / dist * self.config.herd_strength;
            }
        }
        vel.vx += (self.rng.random::<f32>() - 0.5) * self.config.wander_jitter;
        vel.vy += (self.rng.random::<f32>() - 0.5) * self.config.wander_jitter;
        clamp_velocity(&mut vel, self.max_speed_at(pos, &traits));
        self.agents.columns_mut().velocities_mut()[idx] = vel;
    }

    fn steer_toward(&mut self, idx: usize, goal: Position) {
        let traits = self.traits_of(self.species_of_index(idx));
        let pos = self.agents.columns().positions()[idx];
        let mut vel = self.agents.columns().velocities()[idx];
        let dx = goal.x - pos.x;
        let dy = goal.y - pos.y;
        let dist = (dx * dx + dy * dy).sqrt();
        if dist > 1.0 {
            vel.vx += dx / dist * self.config.steering_force;
            vel.vy += dy / dist * self.config.steering_force;
            clamp_velocity(&mut vel, self.max_speed_at(pos, &traits));
        } else {
            vel.vx *= self.config.braking_factor;
            vel.vy *= self.config.braking_factor;
        }
        self.agents.columns_mut().velocities_mut()[idx] = vel;
    }

    fn flee_from(&mut self, idx: usize, threat: Position) {
        let traits = self.traits_of(self.species_of_index(idx));
        let pos = self.agents.columns().positions()[idx];
        let mut dx = pos.x - threat.x;
        let mut dy = pos.y - threat.y;
        let mut dist = (dx * dx + dy * dy).sqrt();
        if dist < 0.1 {
            dist = 1.0;
            dx = self.rng.random::<f32>() - 0.5;
            dy = self.rng.random::<f32>() - 0.5;
        }
        let max_speed = self.max_speed_at(pos, &traits);
        let vel = Velocity::new(dx / dist * max_speed, dy / dist * max_speed);
        self.agents.columns_mut().velocities_mut()[idx] = vel;
    }

    /// Position integration with wall-cell bounce and border collision.
    fn stage_movement(&mut self) {
        let handles: Vec<AgentId> = self.agents.iter_handles().collect();
        let width = self.config.world_width;
        let height = self.config.world_height;
        let slide = self.config.wall_bounce_slide;

        for (idx, id) in handles.iter().enumerate() {
            if !self.is_alive(*id) {
                continue;
            }
            let traits = self.traits_of(self.species_of_index(idx));
            let (mut pos, mut vel) = {
                let columns = self.agents.columns();
                (columns.positions()[idx], columns.velocities()[idx])
            };

            let next_x = pos.x + vel.vx;
            let next_y = pos.y + vel.vy;
            if self.terrain.terrain_at(next_x, next_y) == Terrain::Wall {
                vel.vx = -vel.vx;
                vel.vy = -vel.vy;
            } else {
                pos.x = next_x;
                pos.y = next_y;
            }

            let radius = traits.size / 2.0;
            if pos.x < radius {
                pos.x = radius;
                vel.vx = -vel.vx;
                vel.vy += (self.rng.random::<f32>() - 0.5) * slide;
            }
            if pos.y < radius {
                pos.y = radius;
                vel.vy = -vel.vy;
                vel.vx += (self.rng.random::<f32>() - 0.5) * slide;
            }
            if pos.x > width - radius {
                pos.x = width - radius;
                vel.vx = -vel.vx;
                vel.vy += (self.rng.random::<f32>() - 0.5) * slide;
            }
            if pos.y > height - radius {
                pos.y = height - radius;
                vel.vy = -vel.vy;
                vel.vx += (self.rng.random::<f32>() - 0.5) * slide;
            }

            let columns = self.agents.columns_mut();
            columns.positions_mut()[idx] = pos;
            columns.velocities_mut()[idx] = vel;
        }
    }

    /// Feeding plus pairwise contact resolution.
    ///
    /// Each unordered pair is resolved at most once: the member with the
    /// higher dense index acts as the initiator when it scans its ring.
    fn stage_interactions(&mut self) {
        let handles: Vec<AgentId> = self.agents.iter_handles().collect();
        let scan_radius_sq = self.config.agent_cell_size * self.config.agent_cell_size;

        for idx in 0..handles.len() {
            let id = handles[idx];
            if !self.is_alive(id) {
                continue;
            }
            if self
                .runtime
                .get(id)
                .is_some_and(|rt| rt.state == AiState::Eating)
            {
                self.try_eat(idx, id);
            }

            let mut candidates: Vec<usize> = Vec::new();
            self.agent_index.neighbors_within(
                idx,
                scan_radius_sq,
                &mut |other_idx, _: OrderedFloat<f32>| {
                    candidates.push(other_idx);
                },
            );
            for other_idx in candidates {
                if other_idx >= idx {
                    continue;
                }
                let other_id = handles[other_idx];
                if !self.is_alive(other_id) {
                    continue;
                }
                self.resolve_contact(idx, id, other_idx, other_id);
                if !self.is_alive(id) {
                    break;
                }
            }
        }
    }

    fn try_eat(&mut self, idx: usize, id: AgentId) {
        let target = self.runtime.get(id).and_then(|rt| rt.target);
        let Some(Target::Food(fid)) = target else {
            if let Some(rt) = self.runtime.get_mut(id) {
                rt.state = AiState::Wandering;
                rt.target = None;
                rt.cooldown = 0;
            }
            return;
        };
        let Some(pellet) = self.food.get(fid).copied() else {
            if let Some(rt) = self.runtime.get_mut(id) {
                rt.state = AiState::Wandering;
                rt.target = None;
                rt.cooldown = 0;
            }
            return;
        };

        let species_id = self.species_of_index(idx);
        let traits = self.traits_of(species_id);
        let pos = self.agents.columns().positions()[idx];
        let eat_dist = traits.size / 2.0 + pellet.radius;
        if distance_sq(pos, pellet.position) >= eat_dist * eat_dist {
            return;
        }

        self.food.remove(fid);
        if let Some(rt) = self.runtime.get_mut(id) {
            rt.energy = (rt.energy + pellet.energy * traits.replication_rate).min(traits.max_energy);
            rt.food_eaten += 1;
            rt.state = AiState::Wandering;
            rt.target = None;
            rt.cooldown = self.config.decision_cooldown;
        }
        self.species[species_id.0 as usize].total_food_eaten += 1;
        let vel = Velocity::new(
            (self.rng.random::<f32>() - 0.5) * traits.speed,
            (self.rng.random::<f32>() - 0.5) * traits.speed,
        );
        self.agents.columns_mut().velocities_mut()[idx] = vel;
    }

    fn resolve_contact(&mut self, idx: usize, id: AgentId, other_idx: usize, other_id: AgentId) {
        let my_species = self.species_of_index(idx);
        let other_species = self.species_of_index(other_idx);
        let my = self.traits_of(my_species);
        let other = self.traits_of(other_species);
        let (my_pos, other_pos) = {
            let positions = self.agents.columns().positions();
            (positions[idx], positions[other_idx])
        };

        let contact_dist = (my.size + other.size) / 2.0;
        if distance_sq(my_pos, other_pos) >= contact_dist * contact_dist {
            return;
        }

        if my_species == other_species {
            // Jostling neighbors costs the initiator a little energy.
            if let Some(rt) = self.runtime.get_mut(id) {
                rt.energy -= self.config.interaction_cost;
            }
            return;
        }

        let night_bonus = self.night_stealth_bonus();
        if self.rng.random::<f32>() < other.stealth + night_bonus {
            if let Some(rt) = self.runtime.get_mut(id) {
                rt.energy -= self.config.interaction_cost;
                rt.state = AiState::Wandering;
                rt.target = None;
                rt.cooldown = 0;
            }
            return;
        }

        let combat_cost = self.config.combat_cost;
        if let Some(rt) = self.runtime.get_mut(id) {
            rt.energy -= combat_cost;
        }
        if let Some(rt) = self.runtime.get_mut(other_id) {
            rt.energy -= combat_cost;
        }

        let my_size_bonus = 1.0 + my.size / 10.0;
        let other_size_bonus = 1.0 + other.size / 10.0;
        let my_attack = my.attack * self.combat_roll() * my_size_bonus;
        let other_attack = other.attack * self.combat_roll() * other_size_bonus;
        let my_defense = my.defense * self.combat_roll() * my_size_bonus;
        let other_defense = other.defense * self.combat_roll() * other_size_bonus;

        if my_attack > other_defense {
            self.award_kill(id, my_species, other_id, other_species);
        } else if other_attack > my_defense {
            self.award_kill(other_id, other_species, id, my_species);
        }
        // Stalemate otherwise: only the combat cost was paid.

        let cooldown = self.config.decision_cooldown;
        for (reset_idx, reset_id, speed) in [(idx, id, my.speed), (other_idx, other_id, other.speed)]
        {
            let vel = Velocity::new(
                (self.rng.random::<f32>() - 0.5) * speed,
                (self.rng.random::<f32>() - 0.5) * speed,
            );
            self.agents.columns_mut().velocities_mut()[reset_idx] = vel;
            if let Some(rt) = self.runtime.get_mut(reset_id) {
                rt.state = AiState::Wandering;
                rt.target = None;
                rt.cooldown = cooldown;
            }
        }
    }

    fn award_kill(
        &mut self,
        winner_id: AgentId,
        winner_species: SpeciesId,
        loser_id: AgentId,
        loser_species: SpeciesId,
    ) {
        let winner = self.traits_of(winner_species);
        let loser = self.traits_of(loser_species);
        let reward =
            (self.config.combat_reward_base + loser.size * 5.0) * winner.replication_rate;
        if let Some(rt) = self.runtime.get_mut(winner_id) {
            rt.energy = (rt.energy + reward).min(winner.max_energy);
            rt.kills += 1;
        }
        self.species[winner_species.0 as usize].total_kills += 1;
        self.kill_agent(loser_id, loser_species);
    }

    fn stage_death_cleanup(&mut self) {
        // Contact costs land after the drain pass; nobody crosses a tick
        // boundary alive with an empty reserve.
        let handles: Vec<AgentId> = self.agents.iter_handles().collect();
        for (idx, id) in handles.iter().enumerate() {
            if self
                .runtime
                .get(*id)
                .is_some_and(|rt| rt.alive && rt.energy <= 0.0)
            {
                let species = self.species_of_index(idx);
                self.kill_agent(*id, species);
            }
        }

        if self.pending_deaths.is_empty() {
            self.last_deaths = 0;
            return;
        }
        let dead: HashSet<AgentId> = self.pending_deaths.drain(..).collect();
        for id in &dead {
            self.runtime.remove(*id);
        }
        self.last_deaths = self.agents.remove_many(&dead);
    }

    fn stage_birth_commit(&mut self) {
        let orders = std::mem::take(&mut self.pending_births);
        self.last_births = orders.len();
        for order in orders {
            self.insert_individual(order.species, order.position, order.energy);
        }
    }

    fn stage_extinctions(&mut self, next_tick: Tick) {
        for species in &mut self.species {
            if species.population == 0 && species.extinction_tick.is_none() {
                species.extinction_tick = Some(next_tick);
            }
        }
    }

    fn stage_summary(&mut self, next_tick: Tick) {
        let mut energy_sums = vec![0.0f32; self.species.len()];
        let mut member_counts = vec![0u32; self.species.len()];
        let mut total_energy = 0.0;
        for (idx, id) in self.agents.iter_handles().enumerate() {
            let energy = self.runtime.get(id).map_or(0.0, |rt| rt.energy);
            let species = self.species_of_index(idx);
            energy_sums[species.0 as usize] += energy;
            member_counts[species.0 as usize] += 1;
            total_energy += energy;
        }
        for (sid, species) in self.species.iter_mut().enumerate() {
            if member_counts[sid] > 0 {
                let avg = energy_sums[sid] / member_counts[sid] as f32;
                if avg > species.peak_avg_energy {
                    species.peak_avg_energy = avg;
                }
            }
        }

        let population = self.agents.len();
        let summary = TickSummary {
            tick: next_tick,
            population,
            species_alive: self.species.iter().filter(|s| s.population > 0).count(),
            food_count: self.food.len(),
            births: self.last_births,
            deaths: self.last_deaths,
            mean_energy: if population > 0 {
                total_energy / population as f32
            } else {
                0.0
            },
        };
        self.observer.on_tick(&summary);
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        self.last_births = 0;
        self.last_deaths = 0;
    }

    // ---- external commands ---------------------------------------------

    /// Drop a food pellet at a world coordinate.
    pub fn spawn_food(&mut self, x: f32, y: f32) -> Result<FoodId, CommandError> {
        if !self.in_bounds(x, y) {
            return Err(CommandError::OutOfBounds);
        }
        if self.terrain.terrain_at(x, y) == Terrain::Wall {
            return Err(CommandError::WallTerrain);
        }
        self.insert_food(Position::new(x, y))
            .ok_or(CommandError::FoodCapReached)
    }

    /// Place a new individual of an existing species.
    pub fn spawn_individual(
        &mut self,
        species: SpeciesId,
        x: f32,
        y: f32,
        energy: f32,
    ) -> Result<AgentId, CommandError> {
        if (species.0 as usize) >= self.species.len() {
            return Err(CommandError::UnknownSpecies(species));
        }
        if !self.in_bounds(x, y) {
            return Err(CommandError::OutOfBounds);
        }
        if self.terrain.terrain_at(x, y) == Terrain::Wall {
            return Err(CommandError::WallTerrain);
        }
        Ok(self.insert_individual(species, Position::new(x, y), energy))
    }

    /// Inject pollutant at a world coordinate.
    pub fn inject_waste(&mut self, x: f32, y: f32, amount: f32) -> Result<(), CommandError> {
        if self.waste.add(x, y, amount) {
            Ok(())
        } else {
            Err(CommandError::OutOfBounds)
        }
    }

    /// Apply one upgrade step to a species trait. Cost accounting is the
    /// caller's concern; the world only validates the species and keeps the
    /// combat budget invariant intact.
    pub fn upgrade_trait(
        &mut self,
        species: SpeciesId,
        kind: TraitKind,
    ) -> Result<(), CommandError> {
        let Some(entry) = self.species.get_mut(species.0 as usize) else {
            return Err(CommandError::UnknownSpecies(species));
        };
        entry.traits.apply_upgrade(kind);
        Ok(())
    }

    // ---- accessors -----------------------------------------------------

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Mutable access to the configuration (for hot edits).
    #[must_use]
    pub fn config_mut(&mut self) -> &mut SandboxConfig {
        &mut self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Whether the world is currently in its day phase.
    #[must_use]
    pub const fn is_day(&self) -> bool {
        self.is_day
    }

    /// All registered species, extinct ones included.
    #[must_use]
    pub fn species(&self) -> &[Species] {
        &self.species
    }

    /// Lookup of one species by id.
    #[must_use]
    pub fn species_get(&self, id: SpeciesId) -> Option<&Species> {
        self.species.get(id.0 as usize)
    }

    /// Read-only access to the individual arena.
    #[must_use]
    pub fn agents(&self) -> &IndividualArena {
        &self.agents
    }

    /// Mutable access to the individual arena.
    #[must_use]
    pub fn agents_mut(&mut self) -> &mut IndividualArena {
        &mut self.agents
    }

    /// Number of stored individuals.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Borrow runtime data for a specific individual.
    #[must_use]
    pub fn agent_runtime(&self, id: AgentId) -> Option<&AgentRuntime> {
        self.runtime.get(id)
    }

    /// Mutably borrow runtime data for a specific individual.
    #[must_use]
    pub fn agent_runtime_mut(&mut self, id: AgentId) -> Option<&mut AgentRuntime> {
        self.runtime.get_mut(id)
    }

    /// The food pellet table.
    #[must_use]
    pub fn food(&self) -> &SlotMap<FoodId, FoodPellet> {
        &self.food
    }

    /// Number of pellets currently in the world.
    #[must_use]
    pub fn food_count(&self) -> usize {
        self.food.len()
    }

    /// The static terrain classification.
    #[must_use]
    pub fn terrain(&self) -> &TerrainField {
        &self.terrain
    }

    /// The pollutant field.
    #[must_use]
    pub fn waste(&self) -> &WasteField {
        &self.waste
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Replace the tick observer.
    pub fn set_observer(&mut self, observer: Box<dyn TickObserver>) {
        self.observer = observer;
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Produce a read-only snapshot for rendering/UI collaborators.
    #[must_use]
    pub fn snapshot(&self) -> WorldSnapshot {
        let mut agents = Vec::with_capacity(self.agents.len());
        for (idx, id) in self.agents.iter_handles().enumerate() {
            let Some(rt) = self.runtime.get(id) else {
                continue;
            };
            let species = self.species_of_index(idx);
            let max_energy = self.traits_of(species).max_energy.max(f32::EPSILON);
            agents.push(AgentSnapshot {
                id,
                species,
                position: self.agents.columns().positions()[idx],
                energy_ratio: (rt.energy / max_energy).clamp(0.0, 1.0),
            });
        }
        let food = self
            .food
            .iter()
            .map(|(id, pellet)| FoodSnapshot {
                id,
                position: pellet.position,
            })
            .collect();
        WorldSnapshot {
            tick: self.tick,
            is_day: self.is_day,
            agents,
            food,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Configuration with every stochastic world process silenced, so
    /// scenarios can stage exactly the situation they assert on.
    fn quiet_config() -> SandboxConfig {
        SandboxConfig {
            world_width: 400.0,
            world_height: 400.0,
            terrain_patch_count: 0,
            starting_population: 0,
            initial_food: 0,
            food_spawn_chance: 0.0,
            waste_per_step: 0.0,
            replication_chance: 0.0,
            replication_min_energy: 1e9,
            founders: Vec::new(),
            rng_seed: Some(7),
            ..SandboxConfig::default()
        }
    }

    /// Harmless stationary phenotype: no combat traits, zero speed.
    fn docile_traits() -> SpeciesTraits {
        SpeciesTraits {
            replication_rate: 1.0,
            drain_rate: 0.0,
            mutation_rate: 0.0,
            attack: 0.0,
            defense: 0.0,
            stealth: 0.0,
            max_energy: 1_000.0,
            size: 8.0,
            lifespan: 1e9,
            waste_tolerance: 1.0,
            diet: 0.0,
            perception: 100.0,
            speed: 0.0,
        }
    }

    fn seed_of(name: &str, traits: SpeciesTraits) -> SpeciesSeed {
        SpeciesSeed {
            name: name.to_string(),
            color: None,
            traits,
        }
    }

    /// Drain on normal terrain, by day, with no local waste.
    fn base_drain(traits: &SpeciesTraits, config: &SandboxConfig) -> f32 {
        traits.drain_rate * config.energy_drain_base
            + traits.size * 0.01
            + traits.attack * 0.05
            + traits.defense * 0.05
            + traits.speed * 0.02
    }

    fn zero_velocity(world: &mut WorldState, id: AgentId) {
        let idx = world.agents().index_of(id).expect("agent index");
        world.agents_mut().columns_mut().velocities_mut()[idx] = Velocity::default();
    }

    #[test]
    fn config_validation_rejects_nonsense() {
        let mut config = SandboxConfig::default();
        config.world_width = 0.0;
        assert!(matches!(
            config.validate(),
            Err(WorldError::InvalidConfig(_))
        ));

        let mut config = SandboxConfig::default();
        config.decision_cooldown = 0;
        assert!(config.validate().is_err());

        let mut config = SandboxConfig::default();
        config.waste_diffusion = 1.5;
        assert!(config.validate().is_err());

        assert!(SandboxConfig::default().validate().is_ok());
    }

    #[test]
    fn world_initialises_from_config() {
        let config = SandboxConfig {
            founders: vec![seed_of("Docile", docile_traits())],
            starting_population: 5,
            initial_food: 8,
            ..quiet_config()
        };
        let world = WorldState::new(config).expect("world");
        assert_eq!(world.tick(), Tick::zero());
        assert!(world.is_day());
        assert_eq!(world.agent_count(), 5);
        assert_eq!(world.food_count(), 8);
        let species = world.species_get(SpeciesId(0)).expect("species");
        assert_eq!(species.population, 5);
        assert_eq!(species.peak_population, 5);
        assert!(species.extinction_tick.is_none());

        let snapshot = world.snapshot();
        assert_eq!(snapshot.agents.len(), 5);
        assert_eq!(snapshot.food.len(), 8);
        assert!(snapshot.agents.iter().all(|a| a.energy_ratio > 0.0));
    }

    #[test]
    fn arena_handles_survive_shuffles_and_removals() {
        let mut arena = IndividualArena::new();
        let ids: Vec<AgentId> = (0..6)
            .map(|age| {
                arena.insert(IndividualData {
                    position: Position::new(age as f32, 0.0),
                    velocity: Velocity::default(),
                    age,
                    species: SpeciesId(0),
                })
            })
            .collect();

        let mut rng = SmallRng::seed_from_u64(3);
        arena.shuffle(&mut rng);
        for (age, id) in ids.iter().enumerate() {
            let data = arena.snapshot(*id).expect("snapshot");
            assert_eq!(data.age, age as u32);
            let idx = arena.index_of(*id).expect("index");
            assert_eq!(arena.iter_handles().nth(idx), Some(*id));
        }

        let dead: HashSet<AgentId> = [ids[1], ids[4]].into_iter().collect();
        assert_eq!(arena.remove_many(&dead), 2);
        assert_eq!(arena.len(), 4);
        assert!(!arena.contains(ids[1]));
        assert!(!arena.contains(ids[4]));
        for id in [ids[0], ids[2], ids[3], ids[5]] {
            assert!(arena.contains(id));
            let idx = arena.index_of(id).expect("index");
            assert_eq!(arena.iter_handles().nth(idx), Some(id));
        }
    }

    #[test]
    fn terrain_has_walled_border_and_stable_lookups() {
        let config = SandboxConfig {
            rng_seed: Some(11),
            ..SandboxConfig::default()
        };
        let mut rng = config.seeded_rng();
        let terrain = TerrainField::generate(&config, &mut rng).expect("terrain");

        assert_eq!(terrain.terrain_at(5.0, 5.0), Terrain::Wall);
        assert_eq!(terrain.terrain_at(2_995.0, 1_500.0), Terrain::Wall);
        assert_eq!(terrain.terrain_at(-10.0, 50.0), Terrain::Wall);
        assert_eq!(terrain.terrain_at(50.0, 1e6), Terrain::Wall);

        let first = terrain.terrain_at(1_234.0, 987.0);
        assert_eq!(terrain.terrain_at(1_234.0, 987.0), first);

        let interior: Vec<Terrain> = (1..terrain.width() - 1)
            .flat_map(|x| (1..terrain.height() - 1).map(move |y| (x, y)))
            .filter_map(|(x, y)| terrain.get(x, y))
            .collect();
        assert!(
            interior.iter().any(|t| *t != Terrain::Normal),
            "patch generation should stamp some feature terrain"
        );
    }

    #[test]
    fn waste_update_moves_mass_downhill_and_never_creates_it() {
        let config = SandboxConfig {
            world_width: 100.0,
            world_height: 100.0,
            terrain_patch_count: 0,
            rng_seed: Some(5),
            ..SandboxConfig::default()
        };
        let mut rng = config.seeded_rng();
        let terrain = TerrainField::generate(&config, &mut rng).expect("terrain");
        let mut waste = WasteField::new(10.0, 10, 10).expect("waste");

        assert!(waste.add(55.0, 55.0, 5.0));
        assert!(!waste.add(-1.0, 55.0, 5.0));
        assert!(!waste.add(55.0, 500.0, 5.0));
        assert!((waste.waste_at(55.0, 55.0) - 5.0).abs() < 1e-6);

        let mut previous = waste.total_mass();
        for _ in 0..20 {
            waste.update(&terrain, &config);
            let mass = waste.total_mass();
            assert!(
                mass <= previous + 1e-4,
                "mass grew from {previous} to {mass}"
            );
            previous = mass;
        }
        assert!(waste.waste_at(45.0, 55.0) > 0.0, "diffusion reaches neighbors");
        assert!(waste.waste_at(55.0, 45.0) > 0.0);
    }

    #[test]
    fn vents_evaporate_waste_faster() {
        let config = SandboxConfig::default();
        let cells = 4 * 4;
        let normal =
            TerrainField::from_cells(25.0, 4, 4, vec![Terrain::Normal; cells]).expect("terrain");
        let vented =
            TerrainField::from_cells(25.0, 4, 4, vec![Terrain::Vent; cells]).expect("terrain");

        let mut on_normal = WasteField::new(10.0, 10, 10).expect("waste");
        let mut on_vent = WasteField::new(10.0, 10, 10).expect("waste");
        assert!(on_normal.add(50.0, 50.0, 10.0));
        assert!(on_vent.add(50.0, 50.0, 10.0));

        on_normal.update(&normal, &config);
        on_vent.update(&vented, &config);
        assert!(
            on_vent.total_mass() < on_normal.total_mass(),
            "vent terrain should shed more mass per tick"
        );
    }

    #[test]
    fn mutation_respects_trait_ranges_and_combat_budget() {
        let config = SandboxConfig::default();
        let mut rng = SmallRng::seed_from_u64(99);
        let mut traits = SpeciesTraits {
            replication_rate: 1.2,
            drain_rate: 0.2,
            mutation_rate: 0.5,
            attack: 0.5,
            defense: 0.5,
            stealth: 0.2,
            max_energy: 200.0,
            size: 6.0,
            lifespan: 3_500.0,
            waste_tolerance: 0.1,
            diet: 1.0,
            perception: 180.0,
            speed: 2.9,
        };
        for _ in 0..200 {
            traits = traits.mutated(&config, &mut rng);
            assert!(traits.combat_total() <= COMBAT_BUDGET + 1e-4);
            assert!((0.1..=5.0).contains(&traits.replication_rate));
            assert!(traits.drain_rate >= 0.001);
            assert!((0.0..=1.0).contains(&traits.mutation_rate));
            assert!((0.0..=1.0).contains(&traits.attack));
            assert!((0.0..=1.0).contains(&traits.defense));
            assert!((0.0..=1.0).contains(&traits.stealth));
            assert!(traits.max_energy >= 20.0);
            assert!((2.0..=10.0).contains(&traits.size));
            assert!(traits.lifespan >= 500.0);
            assert!((0.0..=1.0).contains(&traits.waste_tolerance));
            assert!((0.0..=1.0).contains(&traits.diet));
            assert!(traits.perception >= 20.0);
            assert!((1.0..=5.0).contains(&traits.speed));
        }
    }

    #[test]
    fn trait_upgrades_keep_the_combat_budget() {
        let mut traits = docile_traits();
        traits.attack = 0.4;
        traits.defense = 0.4;
        traits.stealth = 0.2;
        traits.apply_upgrade(TraitKind::Attack);
        assert!((traits.combat_total() - COMBAT_BUDGET).abs() < 1e-4);
        assert!(traits.attack > traits.stealth * 2.0);

        let mut traits = docile_traits();
        traits.apply_upgrade(TraitKind::MaxEnergy);
        assert!((traits.max_energy - 1_010.0).abs() < 1e-3);
        traits.apply_upgrade(TraitKind::Speed);
        assert!((traits.speed - 1.0).abs() < 1e-6, "speed clamps up to its floor");
    }

    #[test]
    fn commands_reject_invalid_requests_without_side_effects() {
        let mut config = quiet_config();
        config.founders = vec![seed_of("Docile", docile_traits())];
        config.food_cap = 1;
        let mut world = WorldState::new(config).expect("world");

        assert_eq!(world.spawn_food(5.0, 5.0), Err(CommandError::WallTerrain));
        assert_eq!(
            world.spawn_food(-5.0, 100.0),
            Err(CommandError::OutOfBounds)
        );
        assert!(world.spawn_food(200.0, 200.0).is_ok());
        assert_eq!(
            world.spawn_food(210.0, 210.0),
            Err(CommandError::FoodCapReached)
        );
        assert_eq!(world.food_count(), 1);

        assert_eq!(
            world.spawn_individual(SpeciesId(9), 200.0, 200.0, 50.0),
            Err(CommandError::UnknownSpecies(SpeciesId(9)))
        );
        assert_eq!(
            world.spawn_individual(SpeciesId(0), 5.0, 5.0, 50.0),
            Err(CommandError::WallTerrain)
        );
        assert_eq!(world.agent_count(), 0);

        assert_eq!(
            world.inject_waste(-1.0, 0.0, 10.0),
            Err(CommandError::OutOfBounds)
        );
        assert!(world.inject_waste(120.0, 120.0, 10.0).is_ok());
        assert!(world.waste().waste_at(120.0, 120.0) > 0.0);

        assert_eq!(
            world.upgrade_trait(SpeciesId(9), TraitKind::Attack),
            Err(CommandError::UnknownSpecies(SpeciesId(9)))
        );
        assert!(world.upgrade_trait(SpeciesId(0), TraitKind::Perception).is_ok());
        let species = world.species_get(SpeciesId(0)).expect("species");
        assert!((species.traits.perception - 105.0).abs() < 1e-3);
    }

    #[test]
    fn same_species_contact_costs_only_the_initiator() {
        let mut config = quiet_config();
        config.founders = vec![seed_of("Docile", docile_traits())];
        let mut world = WorldState::new(config).expect("world");
        let a = world
            .spawn_individual(SpeciesId(0), 200.0, 200.0, 100.0)
            .expect("a");
        let b = world
            .spawn_individual(SpeciesId(0), 200.0, 200.0, 100.0)
            .expect("b");
        zero_velocity(&mut world, a);
        zero_velocity(&mut world, b);

        world.step();

        let drain = base_drain(&docile_traits(), world.config());
        let cost = world.config().interaction_cost;
        let energy_a = world.agent_runtime(a).expect("a runtime").energy;
        let energy_b = world.agent_runtime(b).expect("b runtime").energy;
        assert!(world.agent_runtime(a).expect("a").alive);
        assert!(world.agent_runtime(b).expect("b").alive);

        let untouched = 100.0 - drain;
        let charged = untouched - cost;
        let mut observed = [energy_a, energy_b];
        observed.sort_by(|x, y| x.partial_cmp(y).expect("ordered"));
        assert!((observed[0] - charged).abs() < 1e-3, "initiator pays {cost}");
        assert!((observed[1] - untouched).abs() < 1e-3, "other side unchanged");
    }

    #[test]
    fn combat_kills_the_outmatched_defender_and_rewards_the_winner() {
        let mut raptor = docile_traits();
        raptor.attack = 0.9;
        raptor.size = 2.0;
        let mut grazer = docile_traits();
        grazer.defense = 0.3;
        grazer.size = 2.0;

        let mut config = quiet_config();
        config.founders = vec![seed_of("Raptor", raptor), seed_of("Grazer", grazer)];
        let mut world = WorldState::new(config).expect("world");
        let attacker = world
            .spawn_individual(SpeciesId(0), 200.0, 200.0, 100.0)
            .expect("attacker");
        let defender = world
            .spawn_individual(SpeciesId(1), 200.0, 200.0, 100.0)
            .expect("defender");
        zero_velocity(&mut world, attacker);
        zero_velocity(&mut world, defender);

        world.step();

        assert!(world.agent_runtime(defender).is_none(), "defender removed");
        assert_eq!(world.agent_count(), 1);
        let grazer_species = world.species_get(SpeciesId(1)).expect("grazer");
        assert_eq!(grazer_species.population, 0);
        assert_eq!(grazer_species.extinction_tick, Some(Tick(1)));

        let raptor_species = world.species_get(SpeciesId(0)).expect("raptor");
        assert_eq!(raptor_species.total_kills, 1);

        let runtime = world.agent_runtime(attacker).expect("attacker runtime");
        assert_eq!(runtime.kills, 1);
        let drain = base_drain(&raptor, world.config());
        let reward =
            (world.config().combat_reward_base + grazer.size * 5.0) * raptor.replication_rate;
        let expected = 100.0 - drain - world.config().combat_cost + reward;
        assert!(
            (runtime.energy - expected).abs() < 1e-3,
            "energy {} expected {expected}",
            runtime.energy
        );

        let summary = world.history().last().expect("summary");
        assert_eq!(summary.deaths, 1);
        assert_eq!(summary.population, 1);
    }

    #[test]
    fn adjacent_food_is_consumed_and_the_eater_resets() {
        let mut config = quiet_config();
        config.founders = vec![seed_of("Docile", docile_traits())];
        let mut world = WorldState::new(config).expect("world");
        let eater = world
            .spawn_individual(SpeciesId(0), 200.0, 200.0, 100.0)
            .expect("eater");
        zero_velocity(&mut world, eater);
        let pellet = world.spawn_food(200.0, 200.0).expect("pellet");
        {
            let runtime = world.agent_runtime_mut(eater).expect("runtime");
            runtime.state = AiState::Eating;
            runtime.target = Some(Target::Food(pellet));
            runtime.cooldown = 3;
        }

        world.step();

        assert_eq!(world.food_count(), 0);
        assert!(!world.food().contains_key(pellet));
        let runtime = world.agent_runtime(eater).expect("runtime");
        assert_eq!(runtime.state, AiState::Wandering);
        assert_eq!(runtime.target, None);
        assert_eq!(runtime.food_eaten, 1);
        let drain = base_drain(&docile_traits(), world.config());
        let expected = 100.0 - drain + world.config().food_energy * 1.0;
        assert!(
            (runtime.energy - expected).abs() < 1e-3,
            "energy {} expected {expected}",
            runtime.energy
        );
        assert_eq!(
            world.species_get(SpeciesId(0)).expect("species").total_food_eaten,
            1
        );
    }

    #[test]
    fn replication_splits_energy_between_parent_and_child() {
        let mut config = quiet_config();
        config.founders = vec![seed_of("Docile", docile_traits())];
        config.replication_min_energy = 80.0;
        config.replication_chance = 1.0;
        let mut world = WorldState::new(config).expect("world");
        let parent = world
            .spawn_individual(SpeciesId(0), 200.0, 200.0, 100.0)
            .expect("parent");
        zero_velocity(&mut world, parent);

        world.step();

        assert_eq!(world.agent_count(), 2);
        let child = world
            .agents()
            .iter_handles()
            .find(|id| *id != parent)
            .expect("child");
        let pass = world.config().replication_energy_pass;
        let after_drain = 100.0 - base_drain(&docile_traits(), world.config());
        let parent_energy = world.agent_runtime(parent).expect("parent").energy;
        let child_energy = world.agent_runtime(child).expect("child").energy;
        assert!((child_energy - after_drain * pass).abs() < 1e-3);
        assert!((parent_energy - after_drain * (1.0 - pass)).abs() < 1e-3);

        assert_eq!(world.agent_runtime(parent).expect("parent").replications, 1);
        let species = world.species_get(SpeciesId(0)).expect("species");
        assert_eq!(species.total_replications, 1);
        assert_eq!(species.population, 2);
        assert_eq!(
            world.agents().snapshot(child).expect("child data").species,
            SpeciesId(0),
            "no mutation roll at rate zero"
        );
    }

    #[test]
    fn replication_with_certain_mutation_founds_a_lineage() {
        let mut traits = docile_traits();
        traits.mutation_rate = 1.0;
        let mut config = quiet_config();
        config.founders = vec![seed_of("Docile", traits)];
        config.replication_min_energy = 80.0;
        config.replication_chance = 1.0;
        config.mutation_chance_base = 1.0;
        let mut world = WorldState::new(config).expect("world");
        let parent = world
            .spawn_individual(SpeciesId(0), 200.0, 200.0, 100.0)
            .expect("parent");
        zero_velocity(&mut world, parent);

        world.step();

        assert_eq!(world.species().len(), 2);
        let mutant = world.species_get(SpeciesId(1)).expect("mutant");
        assert_eq!(mutant.parent, Some(SpeciesId(0)));
        assert_eq!(mutant.population, 1);
        assert_eq!(mutant.spawn_tick, Tick(1));
        assert!(mutant.traits.combat_total() <= COMBAT_BUDGET + 1e-4);

        let child = world
            .agents()
            .iter_handles()
            .find(|id| *id != parent)
            .expect("child");
        assert_eq!(
            world.agents().snapshot(child).expect("child data").species,
            SpeciesId(1)
        );
    }

    #[test]
    fn crowding_suppresses_replication() {
        let mut config = quiet_config();
        config.founders = vec![seed_of("Docile", docile_traits())];
        config.replication_min_energy = 80.0;
        config.replication_chance = 1.0;
        config.crowding_cap = 1;
        let mut world = WorldState::new(config).expect("world");
        let only = world
            .spawn_individual(SpeciesId(0), 200.0, 200.0, 100.0)
            .expect("only");
        zero_velocity(&mut world, only);

        world.step();
        assert_eq!(world.agent_count(), 1);
    }

    #[test]
    fn hunter_reverts_to_wandering_when_its_prey_dies() {
        let mut hunter = docile_traits();
        hunter.diet = 1.0;
        let mut config = quiet_config();
        config.founders = vec![seed_of("Hunter", hunter), seed_of("Prey", docile_traits())];
        let mut world = WorldState::new(config).expect("world");
        let predator = world
            .spawn_individual(SpeciesId(0), 100.0, 100.0, 100.0)
            .expect("predator");
        let prey = world
            .spawn_individual(SpeciesId(1), 300.0, 300.0, 0.01)
            .expect("prey");
        zero_velocity(&mut world, predator);
        zero_velocity(&mut world, prey);
        {
            let runtime = world.agent_runtime_mut(predator).expect("runtime");
            runtime.state = AiState::Hunting;
            runtime.target = Some(Target::Agent(prey));
            runtime.cooldown = 5;
        }

        world.step();
        assert!(world.agent_runtime(prey).is_none(), "prey starves tick one");
        world.step();

        let runtime = world.agent_runtime(predator).expect("runtime");
        assert_eq!(runtime.state, AiState::Wandering);
        assert_eq!(runtime.target, None);
    }

    #[test]
    fn lifespan_exhaustion_ends_the_simulation() {
        let mut mayfly = docile_traits();
        mayfly.lifespan = 1.0;
        let mut config = quiet_config();
        config.founders = vec![seed_of("Mayfly", mayfly)];
        config.starting_population = 2;
        let mut world = WorldState::new(config).expect("world");
        assert_eq!(world.agent_count(), 2);

        let events = world.step();
        assert!(!events.extinct);
        let events = world.step();
        assert!(events.extinct, "age 2 exceeds lifespan 1");
        assert_eq!(world.agent_count(), 0);

        let species = world.species_get(SpeciesId(0)).expect("species");
        assert_eq!(species.population, 0);
        assert_eq!(species.extinction_tick, Some(Tick(2)));

        // Further ticks stay terminal without incident.
        let events = world.step();
        assert!(events.extinct);
    }

    #[test]
    fn day_night_cycle_toggles_on_schedule() {
        let mut config = quiet_config();
        config.cycle_length = 4;
        let mut world = WorldState::new(config).expect("world");
        for _ in 0..3 {
            assert!(!world.step().cycle_toggled);
            assert!(world.is_day());
        }
        assert!(world.step().cycle_toggled);
        assert!(!world.is_day());
        for _ in 0..3 {
            assert!(!world.step().cycle_toggled);
        }
        assert!(world.step().cycle_toggled);
        assert!(world.is_day());
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        fn run(seed: u64) -> (Vec<TickSummary>, WorldSnapshot) {
            let config = SandboxConfig {
                world_width: 600.0,
                world_height: 600.0,
                starting_population: 10,
                initial_food: 50,
                history_capacity: 64,
                rng_seed: Some(seed),
                ..SandboxConfig::default()
            };
            let mut world = WorldState::new(config).expect("world");
            for _ in 0..30 {
                world.step();
            }
            (world.history().cloned().collect(), world.snapshot())
        }

        let (history_a, snapshot_a) = run(0xDEAD_BEEF);
        let (history_b, snapshot_b) = run(0xDEAD_BEEF);
        assert_eq!(history_a, history_b, "identical seeds replay identically");
        assert_eq!(snapshot_a, snapshot_b);

        let (history_c, snapshot_c) = run(0xF00D_F00D);
        assert!(
            history_a != history_c || snapshot_a != snapshot_c,
            "different seeds should diverge"
        );
    }
}
