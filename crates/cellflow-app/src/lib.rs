//! Shared application plumbing for CellFlow control surfaces.

use std::sync::{Arc, Mutex};

use cellflow_core::Universe;

pub type SharedUniverse = Arc<Mutex<Universe>>;

pub mod command;
pub mod control;

pub use command::{CommandReceiver, CommandSender, create_command_bus, drain_pending_commands};
pub use control::{
    ControlError, ControlHandle, KnobEntry, KnobKind, KnobUpdate, ParameterSnapshot,
};
