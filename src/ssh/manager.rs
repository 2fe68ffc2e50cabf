//! Connection Manager
//!
//! Opens authenticated connections and drives the authentication retry
//! loop:
//!
//! ```text
//! Disconnected → Connecting ──ok──────────────▶ Ready → Closed
//!                   │  ▲
//!     auth failure  │  │ passphrase received
//!                   ▼  │
//!             AwaitingPassphrase ──cancel──▶ Closed
//!
//! Connecting ──network / timeout──▶ Failed
//! ```
//!
//! Connections are not pooled: every caller gets its own.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::SessionConfig;
use super::error::SshError;
use super::remote::{InteractivePrompter, RemoteConnector, RemoteSession};
use crate::auth::{CredentialStore, PassphraseNegotiator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingPassphrase,
    Ready,
    Closed,
    Failed,
}

/// Whether a connection attempt may prompt the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Interactive,
    /// Background polls: fail instead of prompting
    NonInteractive,
}

/// A live (or finished) SSH connection for one operation
pub struct Connection {
    id: String,
    target: SessionConfig,
    state: ConnectionState,
    session: Option<Box<dyn RemoteSession>>,
}

impl Connection {
    fn new(target: SessionConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target,
            state: ConnectionState::Disconnected,
            session: None,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!("Connection {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn target(&self) -> &SessionConfig {
        &self.target
    }

    pub fn session(&self) -> Result<&dyn RemoteSession, SshError> {
        match (&self.session, self.state) {
            (Some(session), ConnectionState::Ready) => Ok(session.as_ref()),
            _ => Err(SshError::Disconnected),
        }
    }

    /// Ready and the transport still answers keep-alive probes
    pub async fn is_alive(&self) -> bool {
        match self.session() {
            Ok(session) => session.is_connected() && session.ping().await,
            Err(_) => false,
        }
    }

    /// Close the connection. Closing twice, or closing a connection that
    /// never opened, does nothing.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            self.transition(ConnectionState::Closed);
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn RemoteConnector>,
    credentials: Arc<CredentialStore>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn RemoteConnector>, credentials: Arc<CredentialStore>) -> Self {
        Self {
            connector,
            credentials,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Open a connection to `target`.
    ///
    /// Authentication failures clear the cached passphrase and, in
    /// interactive mode, ask the client for a new one before retrying. The
    /// loop ends on success, on a non-auth error, or when the user cancels.
    pub async fn connect(
        &self,
        target: &SessionConfig,
        negotiator: &PassphraseNegotiator,
        mode: ConnectMode,
    ) -> Result<Connection, SshError> {
        let mut connection = Connection::new(target.clone());
        let mut candidate = self.credentials.cached();

        loop {
            connection.transition(ConnectionState::Connecting);

            let prompter = NegotiatingPrompter {
                target,
                negotiator,
                credentials: &self.credentials,
                mode,
                answer: Mutex::new(None),
            };

            match self
                .connector
                .connect(target, candidate.as_deref(), &prompter)
                .await
            {
                Ok(session) => {
                    if let Some(secret) = prompter.answer.lock().take().or(candidate) {
                        self.credentials.store(secret);
                    }
                    connection.session = Some(session);
                    connection.transition(ConnectionState::Ready);
                    info!(
                        "Connection {} ready ({})",
                        connection.id,
                        target.display_target()
                    );
                    return Ok(connection);
                }
                Err(e) if e.needs_passphrase() => {
                    self.credentials.clear();

                    if mode == ConnectMode::NonInteractive {
                        connection.transition(ConnectionState::Failed);
                        return Err(e);
                    }

                    // The server's own prompt was answered and rejected. The
                    // prompter asks again during the next attempt.
                    if prompter.answer.lock().take().is_some() {
                        debug!("Keyboard-interactive answer rejected: {}", e);
                        continue;
                    }

                    debug!("Authentication needs a passphrase: {}", e);
                    connection.transition(ConnectionState::AwaitingPassphrase);
                    match negotiator
                        .request_passphrase(&target.user, &target.host)
                        .await
                    {
                        Ok(passphrase) => candidate = Some(passphrase),
                        Err(e) => {
                            connection.transition(ConnectionState::Closed);
                            return Err(e.into());
                        }
                    }
                }
                Err(SshError::Cancelled) => {
                    connection.transition(ConnectionState::Closed);
                    return Err(SshError::Cancelled);
                }
                Err(e) => {
                    warn!(
                        "Connection to {} failed: {}",
                        target.display_target(),
                        e
                    );
                    connection.transition(ConnectionState::Failed);
                    return Err(e);
                }
            }
        }
    }
}

/// Answers keyboard-interactive prompts by asking the client. The cached
/// passphrase is never offered to the server's own prompt.
struct NegotiatingPrompter<'a> {
    target: &'a SessionConfig,
    negotiator: &'a PassphraseNegotiator,
    credentials: &'a CredentialStore,
    mode: ConnectMode,
    answer: Mutex<Option<String>>,
}

#[async_trait]
impl InteractivePrompter for NegotiatingPrompter<'_> {
    async fn answer(&self, prompts: &[String]) -> Result<String, SshError> {
        debug!("Keyboard-interactive prompts: {:?}", prompts);
        self.credentials.clear();

        if self.mode == ConnectMode::NonInteractive {
            return Err(SshError::AuthenticationFailed(
                "Server requested interactive authentication".to_string(),
            ));
        }

        let answer = self
            .negotiator
            .request_passphrase(&self.target.user, &self.target.host)
            .await?;
        *self.answer.lock() = Some(answer.clone());
        Ok(answer)
    }
}
