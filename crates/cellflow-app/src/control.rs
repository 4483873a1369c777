use std::sync::{MutexGuard, PoisonError};

use cellflow_core::{
    CellId, ControlCommand, DataDescription, Rect, SimulationParameters, StepSummary, Tick, Token,
    Universe, UniverseError,
};
use crossfire::TrySendError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use thiserror::Error;

use crate::SharedUniverse;
use crate::command::CommandSender;

/// Parameters as seen by external clients at a given tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub tick: u64,
    pub parameters: Value,
}

impl ParameterSnapshot {
    fn new(parameters: &SimulationParameters, tick: Tick) -> Result<Self, ControlError> {
        let parameters = serde_json::to_value(parameters).map_err(ControlError::serialization)?;
        Ok(Self {
            tick: tick.0,
            parameters,
        })
    }
}

/// Primitive type of a knob.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KnobKind {
    Number,
    Integer,
}

/// Public descriptor for a single parameter knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnobEntry {
    pub path: String,
    pub kind: KnobKind,
    pub value: Value,
}

/// Request payload for updating a parameter knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnobUpdate {
    pub path: String,
    pub value: Value,
}

/// Errors produced by the control surface.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to lock universe state")]
    Lock,
    #[error("{0}")]
    InvalidPatch(String),
    #[error("unknown knob path: {0}")]
    UnknownPath(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Universe(#[from] UniverseError),
    #[error("command queue is full; retry later")]
    CommandQueueFull,
    #[error("command queue has been closed")]
    CommandQueueClosed,
}

impl ControlError {
    fn serialization(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<PoisonError<MutexGuard<'_, Universe>>> for ControlError {
    fn from(_: PoisonError<MutexGuard<'_, Universe>>) -> Self {
        ControlError::Lock
    }
}

/// Shared handle used by control surfaces to inspect and steer the running universe.
///
/// Reads lock the universe directly. Mutations are validated here and then
/// queued, so they only take effect when the runner drains commands between steps.
#[derive(Clone)]
pub struct ControlHandle {
    shared_universe: SharedUniverse,
    commands: CommandSender,
}

impl ControlHandle {
    pub fn new(shared_universe: SharedUniverse, commands: CommandSender) -> Self {
        Self {
            shared_universe,
            commands,
        }
    }

    fn lock_universe(&self) -> Result<MutexGuard<'_, Universe>, ControlError> {
        self.shared_universe.lock().map_err(|err| err.into())
    }

    /// Current parameters.
    pub fn snapshot(&self) -> Result<ParameterSnapshot, ControlError> {
        let universe = self.lock_universe()?;
        ParameterSnapshot::new(universe.parameters(), universe.tick())
    }

    /// Most recent step summary, if any step has run.
    pub fn latest_summary(&self) -> Result<Option<StepSummary>, ControlError> {
        let universe = self.lock_universe()?;
        Ok(universe.history().last().cloned())
    }

    /// Clusters and particles inside `rect`.
    pub fn content(&self, rect: Rect) -> Result<DataDescription, ControlError> {
        let universe = self.lock_universe()?;
        Ok(universe.content(rect)?)
    }

    /// Flatten the parameters into individual knob descriptors.
    pub fn knobs(&self) -> Result<Vec<KnobEntry>, ControlError> {
        let value = {
            let universe = self.lock_universe()?;
            serde_json::to_value(universe.parameters()).map_err(ControlError::serialization)?
        };
        let mut entries = Vec::new();
        let mut prefix = String::new();
        flatten_value(&mut prefix, &value, &mut entries);
        Ok(entries)
    }

    /// Deep-merge a JSON object onto the current parameters and queue the result.
    pub fn apply_patch(&self, patch: Value) -> Result<ParameterSnapshot, ControlError> {
        if !patch.is_object() {
            return Err(ControlError::InvalidPatch(
                "parameter patch must be a JSON object".into(),
            ));
        }

        let universe = self.lock_universe()?;
        let current_tick = universe.tick();
        let mut value =
            serde_json::to_value(universe.parameters()).map_err(ControlError::serialization)?;
        let mut path = SmallVec::<[&str; 8]>::new();
        merge_value(&mut value, &patch, &mut path)?;

        let parameters: SimulationParameters = serde_path_to_error::deserialize(value)
            .map_err(|err| ControlError::InvalidPatch(format!("{} at {}", err, err.path())))?;
        universe
            .check_parameters(&parameters)
            .map_err(|err| ControlError::InvalidPatch(err.to_string()))?;

        let snapshot = ParameterSnapshot::new(&parameters, current_tick)?;
        drop(universe);
        self.enqueue(ControlCommand::UpdateParameters(Box::new(parameters)))?;
        Ok(snapshot)
    }

    /// Apply a list of knob updates by dotted path.
    pub fn apply_updates(
        &self,
        updates: &[KnobUpdate],
    ) -> Result<ParameterSnapshot, ControlError> {
        let mut patch_map = Map::new();
        for update in updates {
            insert_path(&mut patch_map, &update.path, update.value.clone())?;
        }
        self.apply_patch(Value::Object(patch_map))
    }

    /// Validate clusters and particles against the current universe and queue them for ingestion.
    pub fn insert_data(&self, data: DataDescription) -> Result<(), ControlError> {
        let universe = self.lock_universe()?;
        universe.check_data(&data)?;
        drop(universe);
        self.enqueue(ControlCommand::InsertData(Box::new(data)))
    }

    /// Validate a token against the current universe and queue it for attachment to `cell`.
    pub fn add_token(&self, cell: CellId, token: Token) -> Result<(), ControlError> {
        let universe = self.lock_universe()?;
        universe.check_token(cell, &token)?;
        drop(universe);
        self.enqueue(ControlCommand::AddToken { cell, token })
    }

    fn enqueue(&self, command: ControlCommand) -> Result<(), ControlError> {
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ControlError::CommandQueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ControlError::CommandQueueClosed),
        }
    }
}

fn insert_path(
    map: &mut Map<String, Value>,
    path: &str,
    value: Value,
) -> Result<(), ControlError> {
    let mut segments = path.split('.').filter(|s| !s.is_empty());
    let Some(mut seg) = segments.next() else {
        return Err(ControlError::InvalidPatch("empty knob path".into()));
    };
    let mut cur = map;

    for next in segments {
        let entry = cur
            .entry(seg.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        cur = entry.as_object_mut().ok_or_else(|| {
            ControlError::InvalidPatch(format!("intermediate segment '{seg}' is not an object"))
        })?;
        seg = next;
    }

    cur.insert(seg.to_owned(), value);
    Ok(())
}

fn path_display(path: &[&str]) -> String {
    path.join(".")
}

fn type_mismatch(path: &[&str]) -> ControlError {
    ControlError::InvalidPatch(format!("type mismatch at {}", path_display(path)))
}

fn merge_value<'a>(
    target: &mut Value,
    patch: &'a Value,
    path: &mut SmallVec<[&'a str; 8]>,
) -> Result<(), ControlError> {
    match target {
        Value::Object(target_map) => {
            let Value::Object(patch_map) = patch else {
                return Err(type_mismatch(path));
            };
            for (key, patch_value) in patch_map {
                path.push(key);
                let Some(target_value) = target_map.get_mut(key) else {
                    return Err(ControlError::UnknownPath(path_display(path)));
                };
                merge_value(target_value, patch_value, path)?;
                path.pop();
            }
            Ok(())
        }
        Value::Number(_) => match patch {
            Value::Number(n) => {
                *target = Value::Number(n.clone());
                Ok(())
            }
            // Numeric strings take the number type of the current value.
            Value::String(s) => {
                let s = s.trim();
                let invalid = || ControlError::InvalidPatch(path_display(path));
                if target.as_u64().is_some() {
                    *target = Value::from(s.parse::<u64>().map_err(|_| invalid())?);
                } else if target.as_i64().is_some() {
                    *target = Value::from(s.parse::<i64>().map_err(|_| invalid())?);
                } else {
                    let v: f64 = s.parse().map_err(|_| invalid())?;
                    let number = serde_json::Number::from_f64(v).ok_or_else(|| {
                        ControlError::InvalidPatch(format!(
                            "non-finite float at {}",
                            path_display(path)
                        ))
                    })?;
                    *target = Value::Number(number);
                }
                Ok(())
            }
            _ => Err(type_mismatch(path)),
        },
        _ => {
            if std::mem::discriminant(target) == std::mem::discriminant(patch) {
                *target = patch.clone();
                Ok(())
            } else {
                Err(type_mismatch(path))
            }
        }
    }
}

fn flatten_value(prefix: &mut String, value: &Value, entries: &mut Vec<KnobEntry>) {
    match value {
        Value::Object(map) => {
            let base = prefix.len();
            for (k, v) in map {
                if base != 0 {
                    prefix.push('.');
                }
                prefix.push_str(k);
                flatten_value(prefix, v, entries);
                prefix.truncate(base);
            }
        }
        Value::Number(n) => entries.push(KnobEntry {
            path: prefix.clone(),
            kind: if n.is_f64() {
                KnobKind::Number
            } else {
                KnobKind::Integer
            },
            value: value.clone(),
        }),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandReceiver, create_command_bus, drain_pending_commands};
    use cellflow_core::{Cluster, Position, UniverseConfig};
    use std::sync::{Arc, Mutex};

    fn handle(capacity: usize) -> (ControlHandle, CommandReceiver) {
        let universe = Universe::new(UniverseConfig::default()).expect("universe");
        let (sender, receiver) = create_command_bus(capacity);
        let handle = ControlHandle::new(Arc::new(Mutex::new(universe)), sender);
        (handle, receiver)
    }

    #[test]
    fn patch_updates_single_field() {
        let (handle, receiver) = handle(4);
        let updates = vec![KnobUpdate {
            path: "token_transfer_energy_amount".to_string(),
            value: Value::from(25.0),
        }];
        let snapshot = handle.apply_updates(&updates).expect("patch");
        let value = snapshot
            .parameters
            .get("token_transfer_energy_amount")
            .and_then(Value::as_f64)
            .expect("token_transfer_energy_amount");
        assert!((value - 25.0).abs() < 1e-6);

        // Not applied until the queue is drained.
        let mut universe = handle.lock_universe().expect("universe lock");
        assert_eq!(universe.parameters().token_transfer_energy_amount, 10.0);
        assert_eq!(drain_pending_commands(&receiver, &mut universe), 1);
        assert_eq!(universe.parameters().token_transfer_energy_amount, 25.0);
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let (handle, _receiver) = handle(4);
        let snapshot = handle
            .apply_updates(&[KnobUpdate {
                path: "cell_max_token_branch_number".into(),
                value: Value::from(" 8 "),
            }])
            .expect("patch");
        assert_eq!(
            snapshot.parameters["cell_max_token_branch_number"],
            Value::from(8)
        );
    }

    #[test]
    fn unknown_path_errors() {
        let (handle, _receiver) = handle(4);
        let err = handle
            .apply_updates(&[KnobUpdate {
                path: "does.not.exist".into(),
                value: Value::from(1),
            }])
            .expect_err("unknown path");
        assert!(matches!(err, ControlError::UnknownPath(path) if path == "does"));
    }

    #[test]
    fn type_mismatches_are_rejected() {
        let (handle, _receiver) = handle(4);
        let err = handle
            .apply_patch(serde_json::json!({ "cell_min_energy": true }))
            .expect_err("bool into float");
        assert!(matches!(
            err,
            ControlError::InvalidPatch(message) if message.contains("cell_min_energy")
        ));

        let err = handle
            .apply_patch(serde_json::json!({ "cell_max_token_branch_number": 2.5 }))
            .expect_err("float into integer");
        assert!(matches!(
            err,
            ControlError::InvalidPatch(message)
                if message.contains("cell_max_token_branch_number")
        ));
    }

    #[test]
    fn ranges_beyond_grid_unit_are_rejected() {
        let (handle, receiver) = handle(4);
        let err = handle
            .apply_updates(&[KnobUpdate {
                path: "cell_function_sensor_range".into(),
                value: Value::from(150.0),
            }])
            .expect_err("sensor range too large");
        match err {
            ControlError::InvalidPatch(message) => {
                assert!(message.contains("grid unit"), "unexpected message: {message}");
            }
            other => panic!("expected InvalidPatch, got {other:?}"),
        }
        assert!(matches!(receiver.try_recv(), Err(crossfire::TryRecvError::Empty)));
    }

    #[test]
    fn branch_maximum_below_live_cells_is_rejected_before_queueing() {
        let (handle, receiver) = handle(4);
        {
            let mut universe = handle.lock_universe().expect("universe lock");
            let mut cluster = Cluster::horizontal(6, Position::new(30.0, 30.0), 90.0);
            for (idx, cell) in cluster.cells.iter_mut().enumerate() {
                cell.token_branch_number = idx as u32;
            }
            let mut data = DataDescription::new();
            data.add_cluster(cluster);
            universe.update_data(data).expect("ingest");
        }

        let err = handle
            .apply_updates(&[KnobUpdate {
                path: "cell_max_token_branch_number".into(),
                value: Value::from(3),
            }])
            .expect_err("cells carry branch numbers up to 5");
        match err {
            ControlError::InvalidPatch(message) => {
                assert!(message.contains("branch number 3"), "unexpected message: {message}");
            }
            other => panic!("expected InvalidPatch, got {other:?}"),
        }
        assert!(matches!(receiver.try_recv(), Err(crossfire::TryRecvError::Empty)));
        let universe = handle.lock_universe().expect("universe lock");
        assert_eq!(universe.parameters().cell_max_token_branch_number, 6);
    }

    #[test]
    fn invalid_data_and_tokens_are_rejected_before_queueing() {
        let (handle, receiver) = handle(4);
        let mut cluster = Cluster::horizontal(2, Position::new(10.0, 10.0), 90.0);
        cluster.cells[0].connections.push(7);
        let mut data = DataDescription::new();
        data.add_cluster(cluster);
        let err = handle.insert_data(data).expect_err("dangling connection");
        assert!(matches!(
            err,
            ControlError::Universe(UniverseError::DanglingConnection { target: 7, .. })
        ));

        let token = Token::simple(&SimulationParameters::default());
        let err = handle
            .add_token(CellId(42), token)
            .expect_err("no such cell");
        assert!(matches!(
            err,
            ControlError::Universe(UniverseError::UnknownCell(CellId(42)))
        ));
        assert!(matches!(receiver.try_recv(), Err(crossfire::TryRecvError::Empty)));
    }

    #[test]
    fn knobs_list_scalar_parameters() {
        let (handle, _receiver) = handle(4);
        let knobs = handle.knobs().expect("knobs");
        let amount = knobs
            .iter()
            .find(|knob| knob.path == "token_transfer_energy_amount")
            .expect("transfer amount knob");
        assert_eq!(amount.kind, KnobKind::Number);
        let memory = knobs
            .iter()
            .find(|knob| knob.path == "token_memory_size")
            .expect("memory size knob");
        assert_eq!(memory.kind, KnobKind::Integer);
        assert_eq!(memory.value, Value::from(256));
    }

    #[test]
    fn full_queue_reports_backpressure() {
        let (handle, _receiver) = handle(1);
        handle
            .insert_data(DataDescription::new())
            .expect("first command fits");
        let err = handle
            .insert_data(DataDescription::new())
            .expect_err("queue is full");
        assert!(matches!(err, ControlError::CommandQueueFull));
    }

    #[test]
    fn queued_data_and_tokens_apply_on_drain() {
        let (handle, receiver) = handle(4);
        let mut data = DataDescription::new();
        data.add_cluster(Cluster::horizontal(3, Position::new(40.0, 40.0), 90.0));
        handle.insert_data(data).expect("enqueue data");
        {
            let mut universe = handle.lock_universe().expect("universe lock");
            drain_pending_commands(&receiver, &mut universe);
        }

        let content = handle
            .content(Rect::new(Position::new(0.0, 0.0), Position::new(100.0, 100.0)))
            .expect("content");
        let cell = content.clusters[0].cells[2].id;
        let token = {
            let universe = handle.lock_universe().expect("universe lock");
            Token::simple(universe.parameters())
        };
        handle.add_token(cell, token).expect("enqueue token");

        let mut universe = handle.lock_universe().expect("universe lock");
        assert_eq!(drain_pending_commands(&receiver, &mut universe), 1);
        assert_eq!(universe.cell_by_id(cell).expect("cell").tokens.len(), 1);
    }
}
