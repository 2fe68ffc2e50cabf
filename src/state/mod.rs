//! Process-wide state
//!
//! Holds the settings, the credential cache shared by every client, the
//! command dispatcher, and the long-lived connection used by export
//! validation.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::auth::CredentialStore;
use crate::config::Settings;
use crate::dispatch::CommandDispatcher;
use crate::error::OrchestratorError;
use crate::session::ClientContext;
use crate::ssh::{
    ConnectMode, Connection, ConnectionManager, RemoteConnector, RusshConnector, SessionConfig,
};

pub struct AppState {
    pub settings: Arc<Settings>,
    /// Directory holding `settings.json`; relative export paths resolve here
    pub settings_dir: PathBuf,
    pub credentials: Arc<CredentialStore>,
    pub manager: Arc<ConnectionManager>,
    pub dispatcher: Arc<CommandDispatcher>,
    validation: Mutex<Option<Connection>>,
}

impl AppState {
    pub fn new(settings: Settings, settings_dir: PathBuf) -> Self {
        let connector = Arc::new(RusshConnector::new(settings.connect_options()));
        Self::with_connector(settings, settings_dir, connector)
    }

    pub fn with_connector(
        settings: Settings,
        settings_dir: PathBuf,
        connector: Arc<dyn RemoteConnector>,
    ) -> Self {
        let settings = Arc::new(settings);
        let credentials = Arc::new(CredentialStore::new());
        let manager = Arc::new(ConnectionManager::new(connector, credentials.clone()));
        let dispatcher = Arc::new(CommandDispatcher::new(manager.clone(), settings.clone()));

        Self {
            settings,
            settings_dir,
            credentials,
            manager,
            dispatcher,
            validation: Mutex::new(None),
        }
    }

    /// Check that `target` is reachable, keeping the connection open for
    /// later exports. A stored connection to the same target is reused while
    /// it still answers keep-alive probes.
    pub async fn validate_connection(
        &self,
        target: &SessionConfig,
        ctx: &ClientContext,
    ) -> Result<(), OrchestratorError> {
        {
            let stored = self.validation.lock().await;
            if let Some(connection) = stored.as_ref() {
                if connection.target().same_target(target) && connection.is_alive().await {
                    ctx.sink.text("Reusing existing SSH connection.");
                    return Ok(());
                }
            }
        }

        ctx.sink.text(format!(
            "Testing SSH connection to {}@{} on port {}...",
            target.user, target.host, self.settings.ssh_port
        ));

        // Connect without holding the lock: the attempt may wait on a prompt
        let connection = self
            .manager
            .connect(target, &ctx.negotiator, ConnectMode::Interactive)
            .await?;
        ctx.sink
            .text(format!("SSH connection to {} established.", target.host));
        info!("Validated connection {} to {}", connection.id(), target.display_target());

        let previous = self.validation.lock().await.replace(connection);
        if let Some(mut previous) = previous {
            debug!("Closing superseded connection {}", previous.id());
            previous.close().await;
        }
        Ok(())
    }

    /// Close the long-lived connection, if any
    pub async fn shutdown(&self) {
        if let Some(mut connection) = self.validation.lock().await.take() {
            connection.close().await;
        }
    }
}
