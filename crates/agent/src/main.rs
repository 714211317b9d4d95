//! Usage meter agent
//!
//! Runs on every host, tracks labelled containers, samples their resource
//! usage and reports lifecycle changes and samples to the reporting backend.

use anyhow::{Context, Result};
use clap::Parser;
use meter_lib::{
    api::{self, AppState},
    Agent, Factories, HealthRegistry, StructuredLogger,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::{AgentConfig, LogFormat};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "meter-agent", version, about = "Per-host container usage meter")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, short, env = "METER_CONFIG")]
    config: Option<PathBuf>,
}

fn init_tracing(log: &config::LogConfig) {
    // RUST_LOG takes precedence over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    match log.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init(),
    }
}

/// Resolves once the process is asked to stop, naming the signal
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => {
                interrupted.context("Failed to listen for shutdown signal")?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        Ok("ctrl-c")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AgentConfig::load(cli.config.as_deref())?;
    init_tracing(&config.log);

    info!(instance_id = %config.instance_id, "Agent configured");

    let factories = Factories::with_defaults();
    let driver = factories
        .create_driver(&config.containers.driver, &config.driver_settings())
        .context("Failed to create container driver")?;
    let reporter = factories
        .create_reporter(&config.reporting.driver, &config.reporter_settings())
        .context("Failed to create reporter")?;

    let health_registry = HealthRegistry::new();
    let agent = Agent::builder()
        .meter_id(&config.instance_id)
        .driver(driver)
        .reporter(reporter)
        .tracking(config.tracking_policy())
        .service_key_label(&config.tracking.service_key_label)
        .collector(config.collector_config())
        .dispatcher(config.dispatcher_config())
        .health(health_registry.clone())
        .build()?;

    let logger = StructuredLogger::new(&config.instance_id);
    logger.log_startup(
        AGENT_VERSION,
        &config.containers.driver,
        &config.reporting.driver,
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    let app_state = Arc::new(AppState::new(health_registry, agent.registry()));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));
    let mut agent_handle = tokio::spawn(agent.run(shutdown_tx.subscribe()));

    let agent_result = tokio::select! {
        signal = shutdown_signal() => {
            let signal = signal?;
            info!(signal, "Shutting down");
            let _ = shutdown_tx.send(());
            (&mut agent_handle).await
        }
        result = &mut agent_handle => {
            let _ = shutdown_tx.send(());
            result
        }
    };

    let outcome = match agent_result {
        Ok(Ok(summary)) => {
            info!(
                processed = summary.processed,
                failed = summary.failed,
                "Agent stopped"
            );
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(e) => Err(e).context("Agent task panicked"),
    };

    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }

    outcome
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_triggers_shutdown() {
        let waiting = tokio::spawn(shutdown_signal());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = Command::new("sh")
            .arg("-c")
            .arg(format!("kill -TERM {}", std::process::id()))
            .status()
            .unwrap();
        assert!(status.success());

        let signal = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(signal, "SIGTERM");
    }
}
