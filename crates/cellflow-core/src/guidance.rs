//! Token instruction decoding and the energy transfer evaluator.
//!
//! Decoding turns a token's keyed byte buffer into a [`GuidanceCommand`]. The
//! evaluator is a pure function from the current cell and token energies to an
//! [`EnergyDelta`] whose components always sum to zero.

use serde::{Deserialize, Serialize};

use crate::model::{Cell, CellFunction, Cluster, TokenMemory};

/// Keys of the energy-guidance fields inside a token instruction buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuidanceSlot {
    Command = 1,
    CellTarget = 2,
    TokenTarget = 3,
}

impl GuidanceSlot {
    #[must_use]
    pub const fn key(self) -> usize {
        self as usize
    }
}

/// Byte values recognised in the command slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum GuidanceOpcode {
    #[default]
    Deactivated = 0,
    BalanceCell = 1,
    BalanceToken = 2,
}

impl GuidanceOpcode {
    /// Maps a raw selector byte; unknown values deactivate guidance.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::BalanceCell,
            2 => Self::BalanceToken,
            _ => Self::Deactivated,
        }
    }
}

/// Energy targets read alongside the command.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Targets {
    pub cell: f32,
    pub token: f32,
}

/// Decoded guidance instruction of one token.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub enum GuidanceCommand {
    #[default]
    None,
    BalanceCell(Targets),
    BalanceToken(Targets),
}

impl GuidanceCommand {
    /// Read the command and both targets from `memory`. Never fails.
    #[must_use]
    pub fn decode(memory: &TokenMemory) -> Self {
        let targets = Targets {
            cell: f32::from(memory.get(GuidanceSlot::CellTarget.key())),
            token: f32::from(memory.get(GuidanceSlot::TokenTarget.key())),
        };
        match GuidanceOpcode::from_byte(memory.get(GuidanceSlot::Command.key())) {
            GuidanceOpcode::Deactivated => Self::None,
            GuidanceOpcode::BalanceCell => Self::BalanceCell(targets),
            GuidanceOpcode::BalanceToken => Self::BalanceToken(targets),
        }
    }

    /// Write this command into `memory`. Targets are rounded into the byte range.
    pub fn encode_into(&self, memory: &mut TokenMemory) {
        let (opcode, targets) = match *self {
            Self::None => (GuidanceOpcode::Deactivated, Targets::default()),
            Self::BalanceCell(targets) => (GuidanceOpcode::BalanceCell, targets),
            Self::BalanceToken(targets) => (GuidanceOpcode::BalanceToken, targets),
        };
        memory.set(GuidanceSlot::Command.key(), opcode as u8);
        memory.set(GuidanceSlot::CellTarget.key(), target_byte(targets.cell));
        memory.set(GuidanceSlot::TokenTarget.key(), target_byte(targets.token));
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::None)
    }
}

fn target_byte(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(0.0, f32::from(u8::MAX)).round() as u8
}

/// Floors and quantum consumed by [`evaluate`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TransferLimits {
    pub transfer_amount: f32,
    pub cell_min_energy: f32,
    pub token_min_energy: f32,
}

/// Signed energy change for a cell and one of its tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct EnergyDelta {
    pub cell: f32,
    pub token: f32,
}

impl EnergyDelta {
    pub const ZERO: Self = Self {
        cell: 0.0,
        token: 0.0,
    };

    #[must_use]
    pub const fn cell_to_token(amount: f32) -> Self {
        Self {
            cell: -amount,
            token: amount,
        }
    }

    #[must_use]
    pub const fn token_to_cell(amount: f32) -> Self {
        Self {
            cell: amount,
            token: -amount,
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.cell == 0.0 && self.token == 0.0
    }
}

/// Decide how much energy moves between a cell and a token this step.
///
/// A side only donates while it stays strictly above `floor + target + amount`.
/// When neither side qualifies the delta is zero.
#[must_use]
pub fn evaluate(
    cell_energy: f32,
    token_energy: f32,
    command: GuidanceCommand,
    limits: &TransferLimits,
) -> EnergyDelta {
    let amount = limits.transfer_amount;
    let cell_surplus =
        |targets: &Targets| cell_energy > limits.cell_min_energy + targets.cell + amount;
    let token_surplus =
        |targets: &Targets| token_energy > limits.token_min_energy + targets.token + amount;

    match command {
        GuidanceCommand::None => EnergyDelta::ZERO,
        GuidanceCommand::BalanceCell(targets) => {
            if cell_surplus(&targets) {
                EnergyDelta::cell_to_token(amount)
            } else if token_surplus(&targets) {
                EnergyDelta::token_to_cell(amount)
            } else {
                EnergyDelta::ZERO
            }
        }
        GuidanceCommand::BalanceToken(targets) => {
            if token_surplus(&targets) {
                EnergyDelta::token_to_cell(amount)
            } else if cell_surplus(&targets) {
                EnergyDelta::cell_to_token(amount)
            } else {
                EnergyDelta::ZERO
            }
        }
    }
}

/// Apply guidance for every token resident on `cell`, in list order.
///
/// Returns the number of non-zero transfers.
pub(crate) fn guide_cell(cell: &mut Cell, limits: &TransferLimits) -> usize {
    let Cell {
        energy,
        tokens,
        function,
        ..
    } = cell;
    if *function != CellFunction::EnergyGuidance {
        return 0;
    }
    let mut transfers = 0;
    for token in tokens.iter_mut() {
        let command = GuidanceCommand::decode(&token.memory);
        if !command.is_active() {
            continue;
        }
        let delta = evaluate(*energy, token.energy, command, limits);
        if delta.is_zero() {
            continue;
        }
        *energy += delta.cell;
        token.energy += delta.token;
        transfers += 1;
    }
    transfers
}

pub(crate) fn guide_cluster(cluster: &mut Cluster, limits: &TransferLimits) -> usize {
    cluster
        .cells
        .iter_mut()
        .map(|cell| guide_cell(cell, limits))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Token;
    use crate::{Position, SimulationParameters};

    const CELL_MIN: f32 = 50.0;
    const TOKEN_MIN: f32 = 3.0;
    const AMOUNT: f32 = 10.0;

    fn limits() -> TransferLimits {
        TransferLimits {
            transfer_amount: AMOUNT,
            cell_min_energy: CELL_MIN,
            token_min_energy: TOKEN_MIN,
        }
    }

    fn targets(cell: f32, token: f32) -> Targets {
        Targets { cell, token }
    }

    #[test]
    fn decode_reads_command_and_targets() {
        let mut memory = TokenMemory::zeroed(16);
        memory.set(GuidanceSlot::Command.key(), GuidanceOpcode::BalanceCell as u8);
        memory.set(GuidanceSlot::CellTarget.key(), 100);
        memory.set(GuidanceSlot::TokenTarget.key(), 30);
        let command = GuidanceCommand::decode(&memory);
        assert_eq!(command, GuidanceCommand::BalanceCell(targets(100.0, 30.0)));
        assert_eq!(GuidanceCommand::decode(&memory), command);
    }

    #[test]
    fn decode_defaults_missing_keys_to_zero() {
        let mut memory = TokenMemory::zeroed(2);
        memory.set(GuidanceSlot::Command.key(), GuidanceOpcode::BalanceToken as u8);
        assert_eq!(
            GuidanceCommand::decode(&memory),
            GuidanceCommand::BalanceToken(targets(0.0, 0.0))
        );
        assert_eq!(
            GuidanceCommand::decode(&TokenMemory::default()),
            GuidanceCommand::None
        );
    }

    #[test]
    fn unknown_selector_decodes_to_none() {
        let mut memory = TokenMemory::zeroed(8);
        memory.set(GuidanceSlot::Command.key(), 0xEE);
        memory.set(GuidanceSlot::CellTarget.key(), 12);
        assert_eq!(GuidanceCommand::decode(&memory), GuidanceCommand::None);
    }

    #[test]
    fn encode_clamps_targets_into_byte_range() {
        let mut memory = TokenMemory::zeroed(4);
        GuidanceCommand::BalanceToken(targets(-4.0, 300.0)).encode_into(&mut memory);
        assert_eq!(
            GuidanceCommand::decode(&memory),
            GuidanceCommand::BalanceToken(targets(0.0, 255.0))
        );
    }

    #[test]
    fn balance_cell_threshold_brackets() {
        let command = GuidanceCommand::BalanceCell(targets(100.0, 30.0));
        let threshold = CELL_MIN + 100.0 + AMOUNT;
        let rich_token = TOKEN_MIN + 30.0 + AMOUNT + 1.0;

        let above = evaluate(threshold + 1.0, rich_token, command, &limits());
        assert_eq!(above, EnergyDelta::cell_to_token(AMOUNT));

        let below = evaluate(threshold - 1.0, rich_token, command, &limits());
        assert_eq!(below, EnergyDelta::token_to_cell(AMOUNT));

        let at = evaluate(threshold, rich_token, command, &limits());
        assert_eq!(at, EnergyDelta::token_to_cell(AMOUNT));
    }

    #[test]
    fn balance_token_threshold_brackets() {
        let command = GuidanceCommand::BalanceToken(targets(100.0, 30.0));
        let threshold = TOKEN_MIN + 30.0 + AMOUNT;
        let rich_cell = CELL_MIN + 100.0 + AMOUNT + 1.0;

        let above = evaluate(rich_cell, threshold + 1.0, command, &limits());
        assert_eq!(above, EnergyDelta::token_to_cell(AMOUNT));

        let below = evaluate(rich_cell, threshold - 1.0, command, &limits());
        assert_eq!(below, EnergyDelta::cell_to_token(AMOUNT));

        let at = evaluate(rich_cell, threshold, command, &limits());
        assert_eq!(at, EnergyDelta::cell_to_token(AMOUNT));
    }

    #[test]
    fn both_floors_violated_moves_nothing() {
        let poor_cell = CELL_MIN + 100.0;
        let poor_token = TOKEN_MIN + 30.0;
        for command in [
            GuidanceCommand::BalanceCell(targets(100.0, 30.0)),
            GuidanceCommand::BalanceToken(targets(100.0, 30.0)),
        ] {
            assert_eq!(
                evaluate(poor_cell, poor_token, command, &limits()),
                EnergyDelta::ZERO
            );
        }
    }

    #[test]
    fn inactive_command_is_zero_delta() {
        assert!(evaluate(1e6, 1e6, GuidanceCommand::None, &limits()).is_zero());
    }

    #[test]
    fn deltas_always_conserve_energy() {
        let commands = [
            GuidanceCommand::None,
            GuidanceCommand::BalanceCell(targets(0.0, 0.0)),
            GuidanceCommand::BalanceCell(targets(100.0, 30.0)),
            GuidanceCommand::BalanceToken(targets(20.0, 255.0)),
        ];
        for cell_energy in [0.0_f32, 49.0, 60.5, 161.0, 1_000.0] {
            for token_energy in [0.0_f32, 3.0, 13.5, 44.0, 500.0] {
                for command in commands {
                    let delta = evaluate(cell_energy, token_energy, command, &limits());
                    assert_eq!(delta.cell + delta.token, 0.0);
                }
            }
        }
    }

    #[test]
    fn guide_cell_processes_tokens_in_order() {
        let params = SimulationParameters::default();
        let mut cell = crate::Cell::new(Position::default(), CELL_MIN + 15.0);
        for _ in 0..2 {
            let mut token = Token::simple(&params);
            token.energy = 5.0;
            GuidanceCommand::BalanceCell(targets(0.0, 0.0)).encode_into(&mut token.memory);
            cell.add_token(token);
        }

        let transfers = guide_cell(&mut cell, &params.transfer_limits());
        assert_eq!(transfers, 1);
        assert_eq!(cell.energy, CELL_MIN + 5.0);
        assert_eq!(cell.tokens[0].energy, 15.0);
        assert_eq!(cell.tokens[1].energy, 5.0);
    }

    #[test]
    fn inert_cells_skip_guidance() {
        let params = SimulationParameters::default();
        let mut cell = crate::Cell::new(Position::default(), 1_000.0);
        cell.function = CellFunction::Inert;
        let mut token = Token::simple(&params);
        GuidanceCommand::BalanceCell(targets(0.0, 0.0)).encode_into(&mut token.memory);
        cell.add_token(token);
        assert_eq!(guide_cell(&mut cell, &params.transfer_limits()), 0);
        assert_eq!(cell.energy, 1_000.0);
    }
}
