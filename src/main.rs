//! act-cache: runs a synthetic training loop through the activation cache.
//!
//! Useful for checking a configuration (bit width, offload, prefetch) before
//! wiring the controller into a real training job: it reports per-step
//! reconstruction error and transfer activity, then dumps the metrics.

use clap::Parser;
use tracing::info;

use act_cache::config::{Cli, Config};
use act_cache::simulation::Simulation;
use act_cache::CacheController;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "act_cache=debug"
    } else {
        "act_cache=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());

    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("act-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    config.validate()?;

    info!(
        bits = config.controller.bits,
        offload = config.controller.offload_to_host,
        prefetch = config.controller.prefetch,
        bypass = config.controller.bypass,
        host_budget = config.transfer.host_budget_bytes,
        "Configuration loaded"
    );

    let shape = config.simulation.activation_shape();
    info!(
        ?shape,
        layers = config.simulation.layers,
        steps = config.simulation.steps,
        packed_bytes = config.packed_activation_bytes(),
        "Simulated network"
    );

    let mut cache = CacheController::new(&config)?;
    let simulation = Simulation::new(config.simulation.clone());
    let reports = simulation.run(&mut cache).await?;
    cache.synchronize().await?;

    let worst = reports
        .iter()
        .map(|r| r.max_abs_error)
        .fold(0.0f32, f32::max);
    info!(steps = reports.len(), max_abs_error = worst, "Simulation complete");

    println!("{}", serde_json::to_string_pretty(&cache.stats())?);
    print!("{}", cache.metrics().encode_text()?);

    Ok(())
}
