use cellflow_core::{ControlCommand, Universe, apply_control_command};
use crossfire::mpmc;
use crossfire::{MAsyncTx, MRx, TryRecvError, detect_backoff_cfg};
use tracing::debug;

pub type CommandSender = MAsyncTx<ControlCommand>;
pub type CommandReceiver = MRx<ControlCommand>;

pub fn create_command_bus(capacity: usize) -> (CommandSender, CommandReceiver) {
    detect_backoff_cfg();
    mpmc::bounded_tx_async_rx_blocking(capacity)
}

/// Apply every queued command. Returns how many were accepted.
pub fn drain_pending_commands(receiver: &CommandReceiver, universe: &mut Universe) -> usize {
    let mut applied = 0;
    loop {
        match receiver.try_recv() {
            Ok(command) => {
                debug!(?command, "applying control command");
                if apply_control_command(universe, command).is_ok() {
                    applied += 1;
                }
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }
    applied
}
