//! TrackerSHV - AIS-140 Tracker Emulator
//!
//! Emulates a vehicle tracking unit: builds login and position report packets
//! and streams them to one or more tracking servers over TCP or an HTTP relay.

mod config;
mod device;
mod packet;
mod session;
mod transport;
mod web;

use config::ServerConfig;
use device::DeviceProfile;
use session::{spawn_record_logger, SessionManager, StatusMonitor, TransmissionLog};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("trackershv=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting TrackerSHV on port {}...", cfg.http_port);

    let transport = cfg.build_transport()?;
    match &transport {
        transport::Transport::Tcp(_) => tracing::info!("Using direct TCP transport"),
        transport::Transport::Http(relay) => {
            tracing::info!("Using HTTP relay at {}", relay.url())
        }
    }

    // Create session manager
    let log = TransmissionLog::new();
    let _record_logger = spawn_record_logger(&log);
    let manager = Arc::new(SessionManager::new(transport, log, cfg.session_settings()));

    let monitor = StatusMonitor::new(manager.clone(), cfg.status_interval);
    let monitor_task = monitor.start().await;

    // Start transmitting a saved profile, if any
    if let Some(path) = &cfg.profile_path {
        tracing::info!("Loading device profile from {}", path);
        let profile = DeviceProfile::load(path)?;
        let (device, targets) = profile.into_parts()?;
        manager.start_all(device, targets).await?;
    }

    // Start web server
    let server = Server::new(cfg, manager.clone());
    server.start().await?;

    monitor.stop().await;
    let _ = monitor_task.await;
    manager.stop_all_sessions().await;

    let log = manager.log();
    if !log.is_empty() {
        tracing::info!("Recorded {} transmission(s) this run", log.len());
    }
    tracing::info!("TrackerSHV stopped");

    Ok(())
}
