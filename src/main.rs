//! dbmon Binary Entry Point
//!
//! Loads the configuration, builds sources, credentials and sinks, and runs
//! the scheduler until SIGINT or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dbmon::{
    AppConfig, ConnectionRegistry, CredentialStore, Orchestrator, SinkSet, SqlSource,
    config::parse_duration, scheduler::OrchestratorOptions,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// dbmon - Database Metric Scheduler
#[derive(Parser, Debug)]
#[command(name = "dbmon", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/dbmon.yaml",
        env = "DBMON_CONFIG"
    )]
    config: String,

    /// Validate the configuration, print the metric catalog and exit
    #[arg(long)]
    check: bool,

    /// Scheduler tick (overrides config file), e.g. "500ms"
    #[arg(long, env = "DBMON_TICK", value_parser = parse_duration)]
    tick: Option<Duration>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dbmon=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load(&cli.config)?;

    // CLI > ENV > config file
    if let Some(tick) = cli.tick {
        config.scheduler.tick = tick;
        config.validate()?;
    }

    let catalog = config.catalog()?;
    tracing::info!(
        metrics = catalog.len(),
        sources = config.sources.len(),
        sinks = config.sinks.len(),
        tick = ?config.scheduler.tick,
        reconnect = %config.scheduler.reconnect_policy(),
        "Configuration loaded"
    );

    if cli.check {
        for metric in catalog.iter() {
            println!(
                "{:<24} every {:>4} {:<8} login={} sink={}",
                metric.id,
                metric.interval,
                metric.unit.as_ref(),
                metric.login,
                metric.sink
            );
        }
        println!("configuration OK: {} metric(s)", catalog.len());
        return Ok(());
    }

    let source = Arc::new(SqlSource::new(config.sources.clone()));
    let registry = ConnectionRegistry::new(source, CredentialStore::from_config(&config.credentials))
        .with_policy(config.scheduler.reconnect_policy())
        .with_connect_timeout(config.scheduler.connect_timeout);
    let sinks = SinkSet::from_config(&config.sinks).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let mut orchestrator = Orchestrator::new(catalog, registry, sinks, shutdown)
        .with_options(OrchestratorOptions::from(&config.scheduler));

    tracing::info!("Press Ctrl+C to shutdown");
    let totals = orchestrator.run().await;

    tracing::info!(
        executed = totals.executed,
        connection_failures = totals.connection_failures,
        query_failures = totals.query_failures,
        points = totals.points_written,
        forward_failures = totals.forward_failures,
        "Shutdown complete"
    );
    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    token.cancel();
}
