//! Roomcast server
//!
//! Main entry point: loads configuration, starts the fan-out engine and
//! waits for a shutdown signal.

mod startup;

use anyhow::Context;
use clap::Parser;
use roomcast_shared::config::{ConfigLoader, LoggingConfig};
use startup::shutdown::{GracefulShutdown, ShutdownConfig, start_signal_handler};
use std::path::PathBuf;
use tracing::{info, warn};

/// CLI arguments for roomcast-server
#[derive(clap::Parser, Debug)]
#[command(name = "roomcast-server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Roomcast realtime fan-out server", long_about = None)]
struct Args {
    /// Enable debug logging, overriding RUST_LOG
    #[arg(short, long)]
    debug: bool,

    /// Use the in-process broker instead of RabbitMQ
    #[arg(long)]
    dev: bool,

    /// Load variables from this .env file before reading the environment
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ConfigLoader::new(args.env_file)
        .with_dev_mode(args.dev)
        .load_server_config()
        .context("Invalid configuration")?;

    setup_logging(args.debug, &config.logging)?;

    let server = startup::run(config).await?;

    let shutdown = GracefulShutdown::new(ShutdownConfig::default());
    start_signal_handler(&shutdown);
    let signal = shutdown.wait_for_signal().await;
    info!(%signal, "Shutting down gracefully...");

    if !server.shutdown(shutdown.config().timeout).await {
        warn!("Shutdown did not finish in time");
    }
    shutdown.complete();
    Ok(())
}

/// Directive handed to `EnvFilter`; `--debug` overrides the configured level
fn filter_directive(debug: bool, logging: &LoggingConfig) -> &str {
    if debug { "debug" } else { logging.level.as_str() }
}

/// Setup logging from the loaded configuration and the debug flag.
fn setup_logging(debug: bool, logging: &LoggingConfig) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let directive = filter_directive(debug, logging);
    let env_filter = EnvFilter::try_new(directive)
        .with_context(|| format!("Invalid log level '{}'", directive))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    info!(level = directive, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_drives_the_filter() {
        let logging = LoggingConfig {
            level: "warn,roomcast_server_application=debug".to_string(),
        };
        assert_eq!(
            filter_directive(false, &logging),
            "warn,roomcast_server_application=debug"
        );
        assert_eq!(filter_directive(true, &logging), "debug");
    }

    #[test]
    fn test_default_level_is_a_valid_filter() {
        let logging = LoggingConfig::default();
        assert!(tracing_subscriber::EnvFilter::try_new(filter_directive(false, &logging)).is_ok());
    }
}
