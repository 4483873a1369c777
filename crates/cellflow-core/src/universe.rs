//! Universe state and the per-step simulation pipeline.

use cellflow_index::{IndexError, SpatialIndex, UniformGridIndex};
use rand::{Rng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::guidance::guide_cluster;
use crate::model::{Cell, Cluster, DataDescription, EnergyParticle, Token};
use crate::params::{ParameterError, SimulationParameters, UniverseConfig};
use crate::routing::{BranchNumberRouter, TokenRouter, route_cluster};
use crate::{CellId, ClusterId, ParticleId, Rect, Tick, TokenId, Velocity};

/// Errors raised while building or feeding a universe.
#[derive(Debug, Error, PartialEq)]
pub enum UniverseError {
    #[error(transparent)]
    Parameters(#[from] ParameterError),
    #[error("spatial index error: {0}")]
    Index(#[from] IndexError),
    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: &'static str, id: u64 },
    #[error("cell {cell_index} of cluster {cluster_index} has branch number {branch} (max {max})")]
    InvalidBranchNumber {
        cluster_index: usize,
        cell_index: usize,
        branch: u32,
        max: u32,
    },
    #[error("cell {cell_index} connects to index {target} outside its cluster of {len} cells")]
    DanglingConnection {
        cell_index: usize,
        target: usize,
        len: usize,
    },
    #[error("non-finite energy in ingested {0}")]
    NonFiniteEnergy(&'static str),
    #[error("unknown cell {0}")]
    UnknownCell(CellId),
}

/// Events emitted after processing one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StepEvents {
    pub tick: Tick,
    pub moved_tokens: usize,
    pub transfers: usize,
    pub dissolved_tokens: usize,
    pub radiated_particles: usize,
}

/// Aggregate state retained in the in-memory history.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSummary {
    pub tick: Tick,
    pub cluster_count: usize,
    pub cell_count: usize,
    pub token_count: usize,
    pub particle_count: usize,
    pub transfers: usize,
    pub total_energy: f64,
}

#[derive(Default)]
struct IdSets {
    clusters: HashSet<u64>,
    cells: HashSet<u64>,
    tokens: HashSet<u64>,
    particles: HashSet<u64>,
}

impl IdSets {
    fn claim(set: &mut HashSet<u64>, kind: &'static str, id: u64) -> Result<(), UniverseError> {
        if id != 0 && !set.insert(id) {
            return Err(UniverseError::DuplicateId { kind, id });
        }
        Ok(())
    }
}

/// Simulated universe holding clusters, their tokens, and free energy particles.
pub struct Universe {
    config: UniverseConfig,
    tick: Tick,
    rng: SmallRng,
    clusters: Vec<Cluster>,
    particles: Vec<EnergyParticle>,
    router: Box<dyn TokenRouter>,
    next_id: u64,
    history: VecDeque<StepSummary>,
}

impl fmt::Debug for Universe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Universe")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("router", &self.router.kind())
            .field("cluster_count", &self.clusters.len())
            .field("particle_count", &self.particles.len())
            .finish()
    }
}

impl Universe {
    /// Instantiate an empty universe routing tokens by branch number.
    pub fn new(config: UniverseConfig) -> Result<Self, UniverseError> {
        Self::with_router(config, Box::new(BranchNumberRouter))
    }

    /// Instantiate an empty universe with a custom token router.
    pub fn with_router(
        config: UniverseConfig,
        router: Box<dyn TokenRouter>,
    ) -> Result<Self, UniverseError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            tick: Tick::zero(),
            rng,
            clusters: Vec::new(),
            particles: Vec::new(),
            router,
            next_id: 1,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    #[must_use]
    pub fn config(&self) -> &UniverseConfig {
        &self.config
    }

    #[must_use]
    pub fn parameters(&self) -> &SimulationParameters {
        &self.config.parameters
    }

    /// Replace the rule parameters. Must be called between steps.
    ///
    /// Fails without side effects when the parameters are invalid for this
    /// universe or when an existing cell's branch number would fall out of range.
    pub fn set_parameters(
        &mut self,
        parameters: SimulationParameters,
    ) -> Result<(), UniverseError> {
        self.check_parameters(&parameters)?;
        self.config.parameters = parameters;
        Ok(())
    }

    /// Run every check [`Universe::set_parameters`] applies without replacing anything.
    pub fn check_parameters(
        &self,
        parameters: &SimulationParameters,
    ) -> Result<(), UniverseError> {
        parameters.validate()?;
        parameters.validate_ranges(self.config.universe_size, self.config.grid_size)?;
        let max = parameters.cell_max_token_branch_number;
        for (cluster_index, cluster) in self.clusters.iter().enumerate() {
            check_branch_numbers(cluster_index, cluster, max)?;
        }
        Ok(())
    }

    /// Replace the token routing strategy.
    pub fn set_router(&mut self, router: Box<dyn TokenRouter>) {
        self.router = router;
    }

    #[must_use]
    pub fn router_kind(&self) -> &'static str {
        self.router.kind()
    }

    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    #[must_use]
    pub fn particles(&self) -> &[EnergyParticle] {
        &self.particles
    }

    /// Iterate over retained step summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StepSummary> {
        self.history.iter()
    }

    /// Look up a cell by id across all clusters.
    #[must_use]
    pub fn cell_by_id(&self, id: CellId) -> Option<&Cell> {
        self.clusters
            .iter()
            .flat_map(|cluster| cluster.cells.iter())
            .find(|cell| cell.id == id)
    }

    /// Energy held by cells, tokens, and particles.
    #[must_use]
    pub fn total_energy(&self) -> f64 {
        self.clusters.iter().map(Cluster::total_energy).sum::<f64>()
            + self
                .particles
                .iter()
                .map(|particle| f64::from(particle.energy))
                .sum::<f64>()
    }

    fn existing_ids(&self) -> IdSets {
        let mut ids = IdSets::default();
        for cluster in &self.clusters {
            ids.clusters.insert(cluster.id.0);
            for cell in &cluster.cells {
                ids.cells.insert(cell.id.0);
                ids.tokens.extend(cell.tokens.iter().map(|token| token.id.0));
            }
        }
        ids.particles
            .extend(self.particles.iter().map(|particle| particle.id.0));
        ids
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn reserve_ids_above(&mut self, ids: &IdSets) {
        let highest = [&ids.clusters, &ids.cells, &ids.tokens, &ids.particles]
            .into_iter()
            .flat_map(|set| set.iter().copied())
            .max()
            .unwrap_or(0);
        self.next_id = self.next_id.max(highest + 1);
    }

    /// Run every check [`Universe::update_data`] applies without inserting anything.
    pub fn check_data(&self, data: &DataDescription) -> Result<(), UniverseError> {
        self.validate_data(data).map(|_| ())
    }

    fn validate_data(&self, data: &DataDescription) -> Result<IdSets, UniverseError> {
        let max_branch = self.config.parameters.cell_max_token_branch_number;
        let mut ids = self.existing_ids();
        for (cluster_index, cluster) in data.clusters.iter().enumerate() {
            IdSets::claim(&mut ids.clusters, "cluster", cluster.id.0)?;
            check_branch_numbers(cluster_index, cluster, max_branch)?;
            let len = cluster.cells.len();
            for (cell_index, cell) in cluster.cells.iter().enumerate() {
                IdSets::claim(&mut ids.cells, "cell", cell.id.0)?;
                if !cell.energy.is_finite() {
                    return Err(UniverseError::NonFiniteEnergy("cell"));
                }
                if let Some(&target) = cell
                    .connections
                    .iter()
                    .find(|&&target| target >= len || target == cell_index)
                {
                    return Err(UniverseError::DanglingConnection {
                        cell_index,
                        target,
                        len,
                    });
                }
                for token in &cell.tokens {
                    IdSets::claim(&mut ids.tokens, "token", token.id.0)?;
                    if !token.energy.is_finite() {
                        return Err(UniverseError::NonFiniteEnergy("token"));
                    }
                }
            }
        }
        for particle in &data.particles {
            IdSets::claim(&mut ids.particles, "particle", particle.id.0)?;
            if !particle.energy.is_finite() {
                return Err(UniverseError::NonFiniteEnergy("particle"));
            }
        }
        Ok(ids)
    }

    /// Insert clusters and particles from a description.
    ///
    /// Entries with id `0` receive fresh ids. Validation happens before any
    /// mutation, so a rejected description leaves the universe unchanged.
    pub fn update_data(&mut self, data: DataDescription) -> Result<(), UniverseError> {
        let ids = self.validate_data(&data)?;
        self.reserve_ids_above(&ids);

        for mut cluster in data.clusters {
            if cluster.id.is_unassigned() {
                cluster.id = ClusterId(self.allocate_id());
            }
            for cell in &mut cluster.cells {
                if cell.id.is_unassigned() {
                    cell.id = CellId(self.allocate_id());
                }
                for token in &mut cell.tokens {
                    if token.id.is_unassigned() {
                        token.id = TokenId(self.allocate_id());
                    }
                }
            }
            self.clusters.push(cluster);
        }
        for mut particle in data.particles {
            if particle.id.is_unassigned() {
                particle.id = ParticleId(self.allocate_id());
            }
            self.particles.push(particle);
        }
        Ok(())
    }

    /// Run every check [`Universe::add_token`] applies without attaching anything.
    pub fn check_token(&self, cell_id: CellId, token: &Token) -> Result<(), UniverseError> {
        self.validate_token(cell_id, token).map(|_| ())
    }

    fn validate_token(
        &self,
        cell_id: CellId,
        token: &Token,
    ) -> Result<Option<IdSets>, UniverseError> {
        if !token.energy.is_finite() {
            return Err(UniverseError::NonFiniteEnergy("token"));
        }
        if self.cell_by_id(cell_id).is_none() {
            return Err(UniverseError::UnknownCell(cell_id));
        }
        if token.id.is_unassigned() {
            return Ok(None);
        }
        let mut ids = self.existing_ids();
        IdSets::claim(&mut ids.tokens, "token", token.id.0)?;
        Ok(Some(ids))
    }

    /// Attach a token to an existing cell, returning the token's id.
    pub fn add_token(
        &mut self,
        cell_id: CellId,
        mut token: Token,
    ) -> Result<TokenId, UniverseError> {
        if let Some(ids) = self.validate_token(cell_id, &token)? {
            self.reserve_ids_above(&ids);
        }
        if token.id.is_unassigned() {
            token.id = TokenId(self.allocate_id());
        }
        let id = token.id;
        if let Some(cell) = self
            .clusters
            .iter_mut()
            .flat_map(|cluster| cluster.cells.iter_mut())
            .find(|cell| cell.id == cell_id)
        {
            cell.add_token(token);
        }
        Ok(id)
    }

    /// Describe clusters whose centre lies in `rect` and particles inside it.
    pub fn content(&self, rect: Rect) -> Result<DataDescription, UniverseError> {
        let mut index = UniformGridIndex::new(
            self.config.unit_size(),
            self.config.universe_size.x as f32,
            self.config.universe_size.y as f32,
        );
        let positions: Vec<(f32, f32)> = self
            .clusters
            .iter()
            .map(Cluster::center)
            .chain(self.particles.iter().map(|particle| particle.position))
            .map(|pos| (pos.x, pos.y))
            .collect();
        index.rebuild(&positions)?;

        let mut hits = Vec::new();
        index.query_rect(
            (rect.min.x, rect.min.y),
            (rect.max.x, rect.max.y),
            &mut |idx| hits.push(idx),
        );
        hits.sort_unstable();

        let cluster_count = self.clusters.len();
        let mut data = DataDescription::new();
        for idx in hits {
            if idx < cluster_count {
                data.add_cluster(self.clusters[idx].clone());
            } else {
                data.add_particle(self.particles[idx - cluster_count].clone());
            }
        }
        Ok(data)
    }

    /// Describe the whole universe.
    #[must_use]
    pub fn snapshot(&self) -> DataDescription {
        DataDescription {
            clusters: self.clusters.clone(),
            particles: self.particles.clone(),
        }
    }

    fn stage_token_routing(&mut self) -> usize {
        let router: &dyn TokenRouter = &*self.router;
        let params = &self.config.parameters;
        self.clusters
            .par_iter_mut()
            .map(|cluster| route_cluster(cluster, router, params))
            .sum()
    }

    fn stage_energy_guidance(&mut self) -> usize {
        let limits = self.config.parameters.transfer_limits();
        self.clusters
            .par_iter_mut()
            .map(|cluster| guide_cluster(cluster, &limits))
            .sum()
    }

    fn stage_token_dissolution(&mut self) -> usize {
        let token_min = self.config.parameters.token_min_energy;
        self.clusters
            .par_iter_mut()
            .map(|cluster| {
                let mut dissolved = 0;
                for cell in &mut cluster.cells {
                    let Cell { energy, tokens, .. } = cell;
                    tokens.retain(|token| {
                        if token.energy < token_min {
                            *energy += token.energy;
                            dissolved += 1;
                            false
                        } else {
                            true
                        }
                    });
                }
                dissolved
            })
            .sum()
    }

    fn stage_radiation(&mut self) -> usize {
        let prob = self.config.parameters.radiation_prob;
        if prob <= 0.0 {
            return 0;
        }
        let factor = self.config.parameters.radiation_factor;
        let speed = self.config.parameters.radiation_velocity;
        let mut emitted = Vec::new();
        for cluster in &mut self.clusters {
            for cell in &mut cluster.cells {
                if !self.rng.random_bool(f64::from(prob)) {
                    continue;
                }
                let amount = cell.energy * factor;
                if amount <= 0.0 {
                    continue;
                }
                cell.energy -= amount;
                let velocity = Velocity::new(
                    self.rng.random_range(-speed..=speed),
                    self.rng.random_range(-speed..=speed),
                );
                emitted.push(EnergyParticle {
                    id: ParticleId::UNASSIGNED,
                    position: cell.position,
                    velocity,
                    energy: amount,
                });
            }
        }
        let count = emitted.len();
        for mut particle in emitted {
            particle.id = ParticleId(self.allocate_id());
            self.particles.push(particle);
        }
        count
    }

    fn wrap_position(value: f32, extent: f32) -> f32 {
        if extent <= 0.0 {
            return 0.0;
        }
        let mut v = value % extent;
        if v < 0.0 {
            v += extent;
        }
        if v >= extent { 0.0 } else { v }
    }

    fn stage_particle_drift(&mut self) {
        let width = self.config.universe_size.x as f32;
        let height = self.config.universe_size.y as f32;
        for particle in &mut self.particles {
            particle.position.x =
                Self::wrap_position(particle.position.x + particle.velocity.vx, width);
            particle.position.y =
                Self::wrap_position(particle.position.y + particle.velocity.vy, height);
        }
    }

    fn stage_summary(&mut self, events: &StepEvents) {
        let summary = StepSummary {
            tick: events.tick,
            cluster_count: self.clusters.len(),
            cell_count: self.clusters.iter().map(|cluster| cluster.cells.len()).sum(),
            token_count: self.clusters.iter().map(Cluster::token_count).sum(),
            particle_count: self.particles.len(),
            transfers: events.transfers,
            total_energy: self.total_energy(),
        };
        debug!(
            tick = summary.tick.0,
            clusters = summary.cluster_count,
            tokens = summary.token_count,
            moved = events.moved_tokens,
            transfers = events.transfers,
            dissolved = events.dissolved_tokens,
            radiated = events.radiated_particles,
            total_energy = summary.total_energy,
            "universe step complete"
        );
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    /// Execute one simulation step returning emitted events.
    pub fn step(&mut self) -> StepEvents {
        let next_tick = self.tick.next();
        let moved_tokens = self.stage_token_routing();
        let transfers = self.stage_energy_guidance();
        let dissolved_tokens = self.stage_token_dissolution();
        let radiated_particles = self.stage_radiation();
        self.stage_particle_drift();
        self.tick = next_tick;

        let events = StepEvents {
            tick: next_tick,
            moved_tokens,
            transfers,
            dissolved_tokens,
            radiated_particles,
        };
        self.stage_summary(&events);
        events
    }

    /// Execute `steps` steps, returning the events of the last one.
    pub fn run(&mut self, steps: usize) -> Option<StepEvents> {
        let mut last = None;
        for _ in 0..steps {
            last = Some(self.step());
        }
        last
    }
}

fn check_branch_numbers(
    cluster_index: usize,
    cluster: &Cluster,
    max: u32,
) -> Result<(), UniverseError> {
    match cluster
        .cells
        .iter()
        .enumerate()
        .find(|(_, cell)| cell.token_branch_number >= max)
    {
        Some((cell_index, cell)) => Err(UniverseError::InvalidBranchNumber {
            cluster_index,
            cell_index,
            branch: cell.token_branch_number,
            max,
        }),
        None => Ok(()),
    }
}
