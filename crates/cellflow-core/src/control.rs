//! Commands queued by external control surfaces and applied between steps.

use tracing::{info, warn};

use crate::model::{DataDescription, Token};
use crate::params::SimulationParameters;
use crate::universe::{Universe, UniverseError};
use crate::CellId;

/// Mutation requested from outside the simulation loop.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Replace the rule parameters.
    UpdateParameters(Box<SimulationParameters>),
    /// Ingest clusters and particles.
    InsertData(Box<DataDescription>),
    /// Attach a token to an existing cell.
    AddToken { cell: CellId, token: Token },
}

/// Apply a queued command. Rejected commands leave the universe unchanged.
pub fn apply_control_command(
    universe: &mut Universe,
    command: ControlCommand,
) -> Result<(), UniverseError> {
    let result = match command {
        ControlCommand::UpdateParameters(parameters) => universe
            .set_parameters(*parameters)
            .inspect(|_| info!(tick = universe.tick().0, "simulation parameters updated")),
        ControlCommand::InsertData(data) => universe.update_data(*data),
        ControlCommand::AddToken { cell, token } => universe.add_token(cell, token).map(|_| ()),
    };
    if let Err(err) = &result {
        warn!(%err, "control command rejected");
    }
    result
}
