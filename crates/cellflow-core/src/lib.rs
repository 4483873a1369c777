//! Core types and the energy-guidance rule engine shared across the CellFlow workspace.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod control;
pub mod guidance;
pub mod model;
pub mod params;
pub mod routing;
pub mod universe;

pub use control::{ControlCommand, apply_control_command};
pub use guidance::{
    EnergyDelta, GuidanceCommand, GuidanceOpcode, GuidanceSlot, Targets, TransferLimits, evaluate,
};
pub use model::{
    Cell, CellFunction, Cluster, DataDescription, EnergyParticle, TOKEN_MEMORY_SIZE, Token,
    TokenMemory,
};
pub use params::{IntVector2D, ParameterError, SimulationParameters, UniverseConfig};
pub use routing::{BranchNumberRouter, StationaryRouter, TokenRouter};
pub use universe::{StepEvents, StepSummary, Universe, UniverseError};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            Default,
            Serialize,
            Deserialize,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Placeholder id asking the universe to assign a fresh one on ingestion.
            pub const UNASSIGNED: Self = Self(0);

            #[must_use]
            pub const fn is_unassigned(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id! {
    /// Universe-unique cluster identifier.
    ClusterId
}
entity_id! {
    /// Universe-unique cell identifier.
    CellId
}
entity_id! {
    /// Universe-unique token identifier.
    TokenId
}
entity_id! {
    /// Universe-unique energy particle identifier.
    ParticleId
}

/// High level simulation clock (steps processed since creation).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Axis-aligned 2D position in universe coordinates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Per-step displacement of a free particle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub vx: f32,
    pub vy: f32,
}

impl Velocity {
    #[must_use]
    pub const fn new(vx: f32, vy: f32) -> Self {
        Self { vx, vy }
    }
}

/// Closed rectangle used for content queries.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Rect {
    pub min: Position,
    pub max: Position,
}

impl Rect {
    #[must_use]
    pub const fn new(min: Position, max: Position) -> Self {
        Self { min, max }
    }

    /// Returns true when `pos` lies inside the rectangle (edges included).
    #[must_use]
    pub fn contains(&self, pos: Position) -> bool {
        pos.x >= self.min.x && pos.x <= self.max.x && pos.y >= self.min.y && pos.y <= self.max.y
    }
}
