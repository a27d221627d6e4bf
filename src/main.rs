use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use epsilon_bridge::config::BridgeConfig;
use epsilon_bridge::fusion::coordinator::{FusionCoordinator, SnapshotEvent};
use epsilon_bridge::fusion::ingest::{run_broadcast_ingest, run_maintenance};
use epsilon_bridge::metrics::{self, Metrics};
use epsilon_bridge::net::decoder::BroadcastDecoder;
use epsilon_bridge::query::{ExecClient, QueryPoller};
use epsilon_bridge::util::shutdown::{Shutdown, ShutdownTrigger};

/// How often snapshot states are re-evaluated between inputs
const MAINTENANCE_PERIOD: Duration = Duration::from_millis(250);
/// Upper bound on waiting for tasks after Ctrl+C
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bridges EmptyEpsilon's broadcast and query interfaces into live ship snapshots
#[derive(Parser, Debug)]
#[command(name = "epsilon-bridge", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Print the game server's hardware.ini for the configured channel map and exit
    HardwareIni,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging (RUST_LOG overrides)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = BridgeConfig::load_or_default();
    config.validate().context("invalid configuration")?;
    let channel_map = Arc::new(config.channel_map()?);

    if let Some(Command::HardwareIni) = cli.command {
        print!("{}", channel_map.to_hardware_ini());
        return Ok(());
    }

    info!("Epsilon Bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Query API {} every {:?}, broadcast universe {} on {}:{} ({} variables)",
        config.base_url(),
        config.poll_interval,
        config.sacn_universe,
        config.sacn_bind_address,
        config.sacn_port,
        channel_map.len()
    );

    let metrics = Arc::new(Metrics::new());
    let coordinator = Arc::new(FusionCoordinator::new(config.fusion_settings(), metrics.clone()));
    let shutdown = ShutdownTrigger::new();
    let mut tasks = Vec::new();

    // Broadcast path
    let (decoder, link) = BroadcastDecoder::new(config.decoder_settings(), channel_map.clone(), metrics.clone());
    tasks.push(tokio::spawn(decoder.run(shutdown.subscribe())));
    tasks.push(tokio::spawn(run_broadcast_ingest(
        coordinator.clone(),
        link.frames,
        link.liveness,
        shutdown.subscribe(),
    )));
    tasks.push(tokio::spawn(run_maintenance(
        coordinator.clone(),
        MAINTENANCE_PERIOD,
        shutdown.subscribe(),
    )));

    // Query path
    let client = ExecClient::new(&config.base_url(), config.query_timeout)?;
    let poller = QueryPoller::new(client, coordinator.clone(), config.poller_settings(), metrics.clone());
    tasks.push(tokio::spawn(poller.run(shutdown.subscribe())));

    #[cfg(feature = "metrics_server")]
    {
        let metrics = metrics.clone();
        let coordinator = coordinator.clone();
        let port = config.metrics_port;
        let stop = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(metrics, coordinator, port, stop).await {
                error!("Metrics server error: {}", e);
            }
        }));
    }

    tasks.push(tokio::spawn(log_snapshot_events(coordinator.subscribe(), shutdown.subscribe())));

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("Shutdown signal received");
    shutdown.trigger();

    let join_all = async {
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Task ended abnormally: {}", e);
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all).await.is_err() {
        warn!("Tasks still running after {:?}, exiting anyway", SHUTDOWN_TIMEOUT);
    }

    info!("Bridge stopped");
    Ok(())
}

async fn log_snapshot_events(mut events: broadcast::Receiver<SnapshotEvent>, mut shutdown: Shutdown) {
    loop {
        let event = tokio::select! {
            _ = shutdown.wait() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(SnapshotEvent::Changed(_)) => {}
            Ok(SnapshotEvent::StateChanged { scope, state }) => info!("{} is now {}", scope, state.as_str()),
            Ok(SnapshotEvent::Created(key)) => debug!("Snapshot created for '{}'", key),
            Ok(SnapshotEvent::Retired(key)) => debug!("Snapshot retired for '{}'", key),
            Ok(SnapshotEvent::Purged(key)) => debug!("Snapshot purged for '{}'", key),
            Ok(SnapshotEvent::PrimaryChanged(Some(key))) => info!("Primary ship is now '{}'", key),
            Ok(SnapshotEvent::PrimaryChanged(None)) => info!("No primary ship"),
            Err(RecvError::Lagged(skipped)) => debug!("Event log skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_arguments_runs_the_bridge() {
        let cli = Cli::try_parse_from(["epsilon-bridge"]).unwrap();
        assert_eq!(cli.command, None);
    }

    #[test]
    fn test_hardware_ini_subcommand() {
        let cli = Cli::try_parse_from(["epsilon-bridge", "hardware-ini"]).unwrap();
        assert_eq!(cli.command, Some(Command::HardwareIni));
    }

    #[test]
    fn test_unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["epsilon-bridge", "hardwareini"]).is_err());
        assert!(Cli::try_parse_from(["epsilon-bridge", "--bogus"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
