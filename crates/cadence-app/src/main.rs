//! Cadence server binary - composition root.
//!
//! 1. Parse CLI flags and load configuration from TOML
//! 2. Initialize tracing
//! 3. Build the account registry with the simulated action client
//! 4. Serve the REST + WebSocket API until ctrl-c, then stop every worker

mod cli;

use std::sync::Arc;

use clap::Parser;

use cadence_api::routes;
use cadence_api::state::AppState;
use cadence_core::CadenceConfig;
use cadence_scheduler::SimulatedClient;

use crate::cli::CliArgs;

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for ctrl-c"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config is read before tracing is up, so load problems are reported after init.
    let config_file = args.resolve_config_path();
    let loaded = if config_file.exists() {
        Some(CadenceConfig::load(&config_file))
    } else {
        None
    };

    let config_level = match &loaded {
        Some(Ok(config)) => config.general.log_level.clone(),
        _ => "info".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(args.resolve_log_level(&config_level))
            }),
        )
        .init();

    tracing::info!("Starting cadence v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match loaded {
        Some(Ok(config)) => config,
        Some(Err(e)) => {
            // Includes limits above the hard ceiling.
            tracing::error!(path = %config_file.display(), error = %e, "Invalid configuration");
            return Err(e.into());
        }
        None => {
            tracing::info!(path = %config_file.display(), "No config file; using defaults");
            CadenceConfig::default()
        }
    };
    config.general.port = args.resolve_port(config.general.port);
    config.general.bind = args.resolve_bind(&config.general.bind);

    let client = SimulatedClient::new(config.simulator.clone());
    tracing::info!(
        success_rate = config.simulator.success_rate,
        "Using simulated action client"
    );

    let state = AppState::new(config.clone(), Arc::new(client));
    let registry = Arc::clone(&state.registry);

    if let Err(e) = routes::start_server(&config, state, shutdown_signal()).await {
        tracing::error!(error = %e, "API server failed");
        registry.shutdown_all().await;
        return Err(e.into());
    }

    registry.shutdown_all().await;
    tracing::info!("Cadence stopped");
    Ok(())
}
