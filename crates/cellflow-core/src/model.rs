//! Cluster, cell, token, and particle model plus the description exchanged with callers.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;

use crate::params::SimulationParameters;
use crate::{CellId, ClusterId, ParticleId, Position, TokenId, Velocity};

/// Default length of a token instruction buffer.
pub const TOKEN_MEMORY_SIZE: usize = 256;

/// Keyed byte buffer carrying a token's instructions.
///
/// Keys are byte offsets. Reads past the end yield zero, so an absent key and a
/// zeroed key are indistinguishable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct TokenMemory(Vec<u8>);

impl TokenMemory {
    /// Buffer of `size` zero bytes.
    #[must_use]
    pub fn zeroed(size: usize) -> Self {
        Self(vec![0; size])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Value stored under `key`, zero when the key lies past the buffer.
    #[must_use]
    pub fn get(&self, key: usize) -> u8 {
        self.0.get(key).copied().unwrap_or(0)
    }

    /// Store `value` under `key`, growing the buffer when needed.
    pub fn set(&mut self, key: usize, value: u8) {
        if key >= self.0.len() {
            self.0.resize(key + 1, 0);
        }
        self.0[key] = value;
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Mobile energy carrier resident on exactly one cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    #[serde(default)]
    pub id: TokenId,
    pub energy: f32,
    #[serde(default)]
    pub memory: TokenMemory,
}

impl Token {
    #[must_use]
    pub fn new(energy: f32, memory: TokenMemory) -> Self {
        Self {
            id: TokenId::UNASSIGNED,
            energy,
            memory,
        }
    }

    /// Token with creation energy and a zeroed instruction buffer.
    #[must_use]
    pub fn simple(params: &SimulationParameters) -> Self {
        Self::new(
            params.token_creation_energy,
            TokenMemory::zeroed(params.token_memory_size),
        )
    }
}

/// Function executed by a cell when tokens reside on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum CellFunction {
    #[default]
    EnergyGuidance,
    Inert,
}

/// Single cell of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cell {
    #[serde(default)]
    pub id: CellId,
    pub position: Position,
    pub energy: f32,
    #[serde(default)]
    pub token_branch_number: u32,
    /// Indices of adjacent cells within the owning cluster.
    #[serde(default)]
    pub connections: SmallVec<[usize; 4]>,
    #[serde(default)]
    pub function: CellFunction,
    #[serde(default)]
    pub tokens: Vec<Token>,
}

impl Cell {
    #[must_use]
    pub fn new(position: Position, energy: f32) -> Self {
        Self {
            id: CellId::UNASSIGNED,
            position,
            energy,
            token_branch_number: 0,
            connections: SmallVec::new(),
            function: CellFunction::default(),
            tokens: Vec::new(),
        }
    }

    pub fn add_token(&mut self, token: Token) {
        self.tokens.push(token);
    }

    /// Cell energy plus the energy of every resident token.
    #[must_use]
    pub fn total_energy(&self) -> f64 {
        f64::from(self.energy)
            + self
                .tokens
                .iter()
                .map(|token| f64::from(token.energy))
                .sum::<f64>()
    }
}

/// Group of connected cells simulated as one body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    #[serde(default)]
    pub id: ClusterId,
    pub cells: Vec<Cell>,
}

impl Cluster {
    #[must_use]
    pub fn new(cells: Vec<Cell>) -> Self {
        Self {
            id: ClusterId::UNASSIGNED,
            cells,
        }
    }

    /// Row of `count` cells spaced one unit apart along x, each connected to its neighbours.
    #[must_use]
    pub fn horizontal(count: usize, origin: Position, cell_energy: f32) -> Self {
        let cells = (0..count)
            .map(|idx| {
                let mut cell = Cell::new(
                    Position::new(origin.x + idx as f32, origin.y),
                    cell_energy,
                );
                if idx > 0 {
                    cell.connections.push(idx - 1);
                }
                if idx + 1 < count {
                    cell.connections.push(idx + 1);
                }
                cell
            })
            .collect();
        Self::new(cells)
    }

    /// Mean cell position; the origin for an empty cluster.
    #[must_use]
    pub fn center(&self) -> Position {
        if self.cells.is_empty() {
            return Position::default();
        }
        let count = self.cells.len() as f32;
        let (sx, sy) = self
            .cells
            .iter()
            .fold((0.0_f32, 0.0_f32), |(sx, sy), cell| {
                (sx + cell.position.x, sy + cell.position.y)
            });
        Position::new(sx / count, sy / count)
    }

    #[must_use]
    pub fn token_count(&self) -> usize {
        self.cells.iter().map(|cell| cell.tokens.len()).sum()
    }

    #[must_use]
    pub fn total_energy(&self) -> f64 {
        self.cells.iter().map(Cell::total_energy).sum()
    }
}

/// Free energy carrier emitted by radiating cells.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnergyParticle {
    #[serde(default)]
    pub id: ParticleId,
    pub position: Position,
    #[serde(default)]
    pub velocity: Velocity,
    pub energy: f32,
}

/// Snapshot of universe content used for ingestion and egress.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataDescription {
    #[serde(default)]
    pub clusters: Vec<Cluster>,
    #[serde(default)]
    pub particles: Vec<EnergyParticle>,
}

impl DataDescription {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cluster(&mut self, cluster: Cluster) {
        self.clusters.push(cluster);
    }

    pub fn add_particle(&mut self, particle: EnergyParticle) {
        self.particles.push(particle);
    }

    /// Lookup table from cell id to cell across all clusters.
    #[must_use]
    pub fn cells_by_id(&self) -> HashMap<CellId, &Cell> {
        self.clusters
            .iter()
            .flat_map(|cluster| cluster.cells.iter())
            .map(|cell| (cell.id, cell))
            .collect()
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
}
