//! avroom Daemon - Main Entry Point
//!
//! Loads the room configuration, builds the system controller with one
//! headless UI host per configured panel, and serves IPC requests until
//! SIGTERM or SIGINT.

use avroom_common::tracing;
use avroomd::config::{ConfigManager, DEFAULT_CONFIG_PATH};
use avroomd::ipc::IpcServer;
use avroomd::ui::TracingUiHost;
use avroomd::SystemController;
use std::env;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let mut config_manager = ConfigManager::new(&config_path);
    let load_result = config_manager.load_config().await;
    let config = config_manager.config().clone();

    tracing_subscriber::fmt()
        .with_max_level(config.log_level())
        .with_target(false)
        .init();

    info!("Starting avroom daemon v{}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = load_result {
        error!("Failed to load configuration from {}: {}", config_path, e);
        return Err(e.into());
    }

    let socket_path = config.daemon.socket_path.clone();
    let mut builder = SystemController::builder(config.clone());
    for host in &config.ui_hosts {
        info!("Registering UI host {} ({})", host.id, host.name);
        builder = builder.ui_host(Arc::new(TracingUiHost::new(host.id.clone())));
    }

    let controller = Arc::new(builder.build()?);
    controller.start().await?;

    let mut ipc_server = IpcServer::new(&socket_path)?;
    ipc_server.start(Arc::clone(&controller)).await?;
    info!("IPC server listening on {}", socket_path);

    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = terminate.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = interrupt.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }

    controller.shutdown().await;
    ipc_server.shutdown().await?;
    info!("avroom daemon shutdown complete");
    Ok(())
}
