use anyhow::{Context, Result};
use cellflow_app::{
    ControlHandle, KnobUpdate, SharedUniverse, create_command_bus, drain_pending_commands,
};
use cellflow_core::{
    Cluster, DataDescription, GuidanceCommand, Position, Targets, Token, Universe, UniverseConfig,
};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const CONFIG_ENV: &str = "CELLFLOW_CONFIG";
const DEMO_STEPS: u64 = 120;

fn main() -> Result<()> {
    init_tracing();
    let config = load_config()?;
    let universe = bootstrap_universe(config)?;
    info!("Starting CellFlow simulation shell");
    run_demo(universe)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Read a JSON universe configuration from `CELLFLOW_CONFIG`, or fall back to defaults.
fn load_config() -> Result<UniverseConfig> {
    let Ok(path) = std::env::var(CONFIG_ENV) else {
        return Ok(UniverseConfig {
            rng_seed: Some(0xCE11_F10E),
            history_capacity: 600,
            ..UniverseConfig::default()
        });
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read configuration from {path}"))?;
    let mut de = serde_json::Deserializer::from_str(&raw);
    let config: UniverseConfig = serde_path_to_error::deserialize(&mut de)
        .with_context(|| format!("invalid configuration in {path}"))?;
    info!(path = %path, "loaded universe configuration");
    Ok(config)
}

fn bootstrap_universe(config: UniverseConfig) -> Result<SharedUniverse> {
    let mut universe = Universe::new(config)?;
    let params = universe.parameters().clone();
    let max_branch = params.cell_max_token_branch_number;

    let mut data = DataDescription::new();
    let spacing = 120.0;
    for row in 0..4 {
        for col in 0..4 {
            let origin = Position::new(col as f32 * spacing + 20.0, row as f32 * spacing + 20.0);
            let mut cluster = Cluster::horizontal(max_branch as usize, origin, 150.0);
            for (idx, cell) in cluster.cells.iter_mut().enumerate() {
                cell.token_branch_number = idx as u32 % max_branch;
            }
            let targets = Targets {
                cell: 40.0,
                token: 20.0,
            };
            let command = if (row + col) % 2 == 0 {
                GuidanceCommand::BalanceCell(targets)
            } else {
                GuidanceCommand::BalanceToken(targets)
            };
            let mut token = Token::simple(&params);
            command.encode_into(&mut token.memory);
            cluster.cells[0].add_token(token);
            data.add_cluster(cluster);
        }
    }
    universe.update_data(data)?;
    info!(
        clusters = universe.clusters().len(),
        total_energy = universe.total_energy(),
        "seeded demo clusters",
    );
    Ok(Arc::new(Mutex::new(universe)))
}

fn run_demo(universe: SharedUniverse) -> Result<()> {
    let (sender, receiver) = create_command_bus(64);
    let control = ControlHandle::new(Arc::clone(&universe), sender);

    for step in 0..DEMO_STEPS {
        if step == DEMO_STEPS / 2 {
            let snapshot = control.apply_updates(&[KnobUpdate {
                path: "token_transfer_energy_amount".into(),
                value: serde_json::Value::from(5.0),
            }])?;
            info!(tick = snapshot.tick, "queued transfer amount update");
        }
        let mut guard = universe
            .lock()
            .map_err(|_| anyhow::anyhow!("universe lock poisoned"))?;
        drain_pending_commands(&receiver, &mut guard);
        guard.step();
    }

    match control.latest_summary()? {
        Some(summary) => info!(
            tick = summary.tick.0,
            clusters = summary.cluster_count,
            tokens = summary.token_count,
            particles = summary.particle_count,
            transfers = summary.transfers,
            total_energy = summary.total_energy,
            "demo run complete",
        ),
        None => warn!("demo run completed without step summaries"),
    }
    Ok(())
}
