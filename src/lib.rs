//! VentusFlow orchestrator
//!
//! Bridges a browser client to an HPC cluster: job commands run over SSH,
//! job folders sync over SFTP, and a WebSocket control channel carries
//! status lines, passphrase prompts and progress events.

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (WebSocket frames, output chunks)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod auth;
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod sftp;
pub mod ssh;
pub mod state;

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bridge::ControlServer;
use config::{SettingsStorage, StorageError};
use state::AppState;

/// Failures that stop the orchestrator from starting or serving
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to load settings: {0}")]
    Settings(#[from] StorageError),

    #[error("Failed to bind control server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Control server stopped: {0}")]
    Serve(#[from] std::io::Error),
}

pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load settings, serve the control channel, and shut down cleanly on
/// Ctrl-C or SIGTERM.
pub async fn run() -> Result<(), RunError> {
    let storage = SettingsStorage::new()?;
    let settings = storage.load_or_init().await?;
    info!(
        "VentusFlow orchestrator v{} (settings: {:?})",
        env!("CARGO_PKG_VERSION"),
        storage.path()
    );

    let listen_addr = settings.listen_addr.clone();
    let state = Arc::new(AppState::new(settings, storage.dir()));

    let server = ControlServer::bind(&listen_addr, state.clone())
        .await
        .map_err(|source| RunError::Bind {
            addr: listen_addr.clone(),
            source,
        })?;

    let result = tokio::select! {
        result = server.serve() => result.map_err(RunError::from),
        _ = shutdown_signal() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    state.shutdown().await;
    info!("Orchestrator stopped");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
