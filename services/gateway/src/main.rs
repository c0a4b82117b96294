use std::env;
use std::sync::Arc;

use clap::Parser;
use gateway::config::{GatewayConfig, DEFAULT_CONFIG_PATH};
use gateway::notification::NullNotificationPort;
use gateway::Gateway;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("failed to load config from {}: {e}", cli.config);
        std::process::exit(1);
    });

    // No production notification sink ships with this core; a real
    // deployment wires a webhook dispatcher here behind the same trait.
    let notifier = Arc::new(NullNotificationPort);

    let gateway = Gateway::bind(config, notifier).await.unwrap_or_else(|e| {
        eprintln!("failed to bind listener: {e}");
        std::process::exit(1);
    });

    let shutdown = gateway.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    info!("gateway starting");
    gateway.serve().await;
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
