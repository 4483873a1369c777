//! Simulation parameters and universe configuration.

use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::guidance::TransferLimits;

/// Errors raised when validating parameters or universe configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ParameterError {
    /// Indicates an invalid parameter value.
    #[error("invalid parameter: {0}")]
    Invalid(&'static str),
    /// A cell-function range reaches past a single grid unit.
    #[error("{name} ({value}) must be smaller than the grid unit size ({unit})")]
    RangeExceedsUnit {
        name: &'static str,
        value: f32,
        unit: i32,
    },
}

/// Integer 2D extent (universe size, grid size).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntVector2D {
    pub x: i32,
    pub y: i32,
}

impl IntVector2D {
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Process-wide rule parameters. Replaced only between steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationParameters {
    /// Energy floor a cell keeps before it donates to tokens.
    pub cell_min_energy: f32,
    /// Energy floor below which tokens dissolve into their cell.
    pub token_min_energy: f32,
    /// Branch numbers cycle through `0..cell_max_token_branch_number`.
    pub cell_max_token_branch_number: u32,
    /// Per-cell, per-step probability of emitting an energy particle. 0 disables radiation.
    pub radiation_prob: f32,
    /// Fraction of the cell's energy carried away by one emitted particle.
    pub radiation_factor: f32,
    /// Maximum speed of emitted particles along each axis.
    pub radiation_velocity: f32,
    /// Fixed quantum moved by one balancing operation.
    pub token_transfer_energy_amount: f32,
    /// Length of a freshly created token instruction buffer.
    pub token_memory_size: usize,
    /// Energy assigned to tokens created through [`crate::Token::simple`].
    pub token_creation_energy: f32,
    pub cell_function_communicator_range: f32,
    pub cell_function_sensor_range: f32,
    pub cluster_max_radius: f32,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            cell_min_energy: 50.0,
            token_min_energy: 3.0,
            cell_max_token_branch_number: 6,
            radiation_prob: 0.03,
            radiation_factor: 0.002,
            radiation_velocity: 0.5,
            token_transfer_energy_amount: 10.0,
            token_memory_size: crate::model::TOKEN_MEMORY_SIZE,
            token_creation_energy: 60.0,
            cell_function_communicator_range: 50.0,
            cell_function_sensor_range: 50.0,
            cluster_max_radius: 40.0,
        }
    }
}

impl SimulationParameters {
    /// Validates scalar parameter values independent of universe geometry.
    pub fn validate(&self) -> Result<(), ParameterError> {
        if !(self.cell_min_energy.is_finite() && self.cell_min_energy >= 0.0) {
            return Err(ParameterError::Invalid(
                "cell_min_energy must be finite and non-negative",
            ));
        }
        if !(self.token_min_energy.is_finite() && self.token_min_energy >= 0.0) {
            return Err(ParameterError::Invalid(
                "token_min_energy must be finite and non-negative",
            ));
        }
        if self.cell_max_token_branch_number == 0 {
            return Err(ParameterError::Invalid(
                "cell_max_token_branch_number must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.radiation_prob) {
            return Err(ParameterError::Invalid("radiation_prob must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.radiation_factor) {
            return Err(ParameterError::Invalid(
                "radiation_factor must lie in [0, 1]",
            ));
        }
        if !(self.radiation_velocity.is_finite() && self.radiation_velocity >= 0.0) {
            return Err(ParameterError::Invalid(
                "radiation_velocity must be finite and non-negative",
            ));
        }
        if !(self.token_transfer_energy_amount.is_finite()
            && self.token_transfer_energy_amount > 0.0)
        {
            return Err(ParameterError::Invalid(
                "token_transfer_energy_amount must be finite and positive",
            ));
        }
        if self.token_memory_size == 0 {
            return Err(ParameterError::Invalid(
                "token_memory_size must be positive",
            ));
        }
        if !(self.token_creation_energy.is_finite() && self.token_creation_energy >= 0.0) {
            return Err(ParameterError::Invalid(
                "token_creation_energy must be finite and non-negative",
            ));
        }
        let ranges = [
            self.cell_function_communicator_range,
            self.cell_function_sensor_range,
            self.cluster_max_radius,
        ];
        if !ranges.iter().all(|value| value.is_finite() && *value >= 0.0) {
            return Err(ParameterError::Invalid(
                "communicator, sensor, and cluster radius ranges must be finite and non-negative",
            ));
        }
        Ok(())
    }

    /// Checks that every cell-function range fits inside one grid unit.
    pub fn validate_ranges(
        &self,
        universe_size: IntVector2D,
        grid_size: IntVector2D,
    ) -> Result<(), ParameterError> {
        if grid_size.x <= 0 || grid_size.y <= 0 {
            return Err(ParameterError::Invalid("grid size must be positive"));
        }
        let unit = (universe_size.x / grid_size.x).min(universe_size.y / grid_size.y);
        let ranges = [
            (
                "cell_function_communicator_range",
                self.cell_function_communicator_range,
            ),
            ("cell_function_sensor_range", self.cell_function_sensor_range),
            ("cluster_max_radius", self.cluster_max_radius),
        ];
        for (name, value) in ranges {
            if value.is_nan() || value >= unit as f32 {
                return Err(ParameterError::RangeExceedsUnit { name, value, unit });
            }
        }
        Ok(())
    }

    /// Limits consumed by the energy transfer evaluator.
    #[must_use]
    pub fn transfer_limits(&self) -> TransferLimits {
        TransferLimits {
            transfer_amount: self.token_transfer_energy_amount,
            cell_min_energy: self.cell_min_energy,
            token_min_energy: self.token_min_energy,
        }
    }
}

/// Static configuration for a CellFlow universe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UniverseConfig {
    /// Universe extent in world units; positions wrap toroidally.
    pub universe_size: IntVector2D,
    /// Number of grid units along each axis.
    pub grid_size: IntVector2D,
    /// Optional RNG seed for reproducible universes.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent step summaries retained in-memory.
    pub history_capacity: usize,
    pub parameters: SimulationParameters,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            universe_size: IntVector2D::new(1_200, 600),
            grid_size: IntVector2D::new(12, 6),
            rng_seed: None,
            history_capacity: 256,
            parameters: SimulationParameters::default(),
        }
    }
}

impl UniverseConfig {
    /// Validates geometry and parameters together.
    pub fn validate(&self) -> Result<(), ParameterError> {
        if self.universe_size.x <= 0 || self.universe_size.y <= 0 {
            return Err(ParameterError::Invalid(
                "universe dimensions must be positive",
            ));
        }
        if self.grid_size.x > self.universe_size.x || self.grid_size.y > self.universe_size.y {
            return Err(ParameterError::Invalid(
                "grid size cannot exceed universe size",
            ));
        }
        if self.history_capacity == 0 {
            return Err(ParameterError::Invalid("history_capacity must be positive"));
        }
        self.parameters.validate()?;
        self.parameters
            .validate_ranges(self.universe_size, self.grid_size)
    }

    /// Edge length of one grid unit (the smaller axis).
    #[must_use]
    pub fn unit_size(&self) -> f32 {
        let unit_x = self.universe_size.x / self.grid_size.x.max(1);
        let unit_y = self.universe_size.y / self.grid_size.y.max(1);
        unit_x.min(unit_y).max(1) as f32
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    pub(crate) fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}
