// src/main.rs - modax-host: loads config, registers devices, serves the HTTP API
use clap::Parser;
use modax::config::{self, Config};
use modax::coordinator::advisory::{AdvisoryBridge, TcpAdvisoryClient};
use modax::coordinator::DeviceCoordinator;
use modax::transport::DefaultLinkConnector;
use std::path::PathBuf;
use std::sync::Arc;

/// Supervisory control host
#[derive(Parser, Debug)]
#[command(name = "modax-host", about = "Supervisory control core for networked CNC machines.")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, default_value = "modax.toml")]
    config: PathBuf,

    /// Maximum log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    tracing::info!("Starting modax-host");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.to_string_lossy().to_string();
    let config = if args.config.exists() {
        tracing::info!("Loading configuration from: {}", config_path);
        config::load_config(&config_path).map_err(|e| {
            tracing::error!("Failed to load config from '{}': {}", config_path, e);
            Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
        })?
    } else {
        tracing::warn!("No config at '{}', using defaults", config_path);
        Config::default()
    };

    let advisory = match (config.advisory.enabled, config.advisory.address.as_deref()) {
        (true, Some(address)) => {
            tracing::info!("Advisory tier at {}", address);
            let client = Arc::new(TcpAdvisoryClient::new(address));
            Some(AdvisoryBridge::spawn(client, &config.advisory))
        }
        (true, None) => {
            tracing::info!("Advisory tier enabled but no address configured; running without it");
            None
        }
        (false, _) => None,
    };

    let connector = Arc::new(DefaultLinkConnector::from_config(&config.coordinator));
    let devices = config.devices.clone();
    let bind = format!("{}:{}", config.web.bind_address, config.web.port);
    let coordinator = DeviceCoordinator::new(config, connector, advisory);

    for device in &devices {
        if let Err(e) = coordinator.register(&device.id, Some(&device.address)).await {
            tracing::error!("Failed to register device {}: {}", device.id, e);
        }
    }

    let app = modax::web::create_router(coordinator.clone());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("HTTP API listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await?;

    for id in coordinator.device_ids().await {
        let _ = coordinator.deregister(&id).await;
    }
    Ok(())
}
