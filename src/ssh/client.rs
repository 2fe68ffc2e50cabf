//! SSH Client implementation using russh

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::agent::{is_agent_available, SshAgentClient};
use super::config::{ConnectOptions, SessionConfig};
use super::error::SshError;
use super::known_hosts::KnownHosts;
use super::remote::{InteractivePrompter, RemoteConnector, RemoteSession};
use super::session::SshSession;
use crate::auth::load_private_key_async;

/// One connection attempt against a job target
pub struct SshClient {
    target: SessionConfig,
    options: ConnectOptions,
}

impl SshClient {
    pub fn new(target: SessionConfig, options: ConnectOptions) -> Self {
        Self { target, options }
    }

    /// Connect and authenticate: agent first, then the key file, then
    /// keyboard-interactive if the server rejects the key.
    pub async fn connect(
        self,
        passphrase: Option<&str>,
        prompter: &dyn InteractivePrompter,
    ) -> Result<SshSession, SshError> {
        let addr = format!("{}:{}", self.target.host, self.options.port);
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.options.keepalive_interval(),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(self.target.host.clone(), self.options.port);

        let mut handle = tokio::time::timeout(
            self.options.timeout(),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))??;

        debug!("SSH handshake completed");

        if is_agent_available() {
            match self.authenticate_with_agent(&mut handle).await {
                Ok(()) => return Ok(self.into_session(handle)),
                Err(e) => warn!("SSH Agent authentication failed, falling back to key file: {}", e),
            }
        }

        self.authenticate_with_key(&mut handle, passphrase, prompter)
            .await?;

        Ok(self.into_session(handle))
    }

    async fn authenticate_with_agent(
        &self,
        handle: &mut Handle<ClientHandler>,
    ) -> Result<(), SshError> {
        let mut agent = SshAgentClient::connect().await?;
        agent.authenticate(handle, &self.target.user).await
    }

    async fn authenticate_with_key(
        &self,
        handle: &mut Handle<ClientHandler>,
        passphrase: Option<&str>,
        prompter: &dyn InteractivePrompter,
    ) -> Result<(), SshError> {
        let key = load_private_key_async(&self.options.key_path, passphrase).await?;
        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

        let result = handle
            .authenticate_publickey(&self.target.user, key_with_hash)
            .await?;

        if result.success() {
            info!("SSH key authentication successful");
            return Ok(());
        }

        debug!("Server rejected public key, trying keyboard-interactive");
        self.authenticate_keyboard_interactive(handle, prompter)
            .await
    }

    /// Drive keyboard-interactive rounds until the server decides.
    /// Every non-empty round is answered with a freshly requested secret.
    async fn authenticate_keyboard_interactive(
        &self,
        handle: &mut Handle<ClientHandler>,
        prompter: &dyn InteractivePrompter,
    ) -> Result<(), SshError> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(&self.target.user, None::<String>)
            .await?;

        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => {
                    info!("Keyboard-interactive authentication successful");
                    return Ok(());
                }
                KeyboardInteractiveAuthResponse::Failure { .. } => {
                    return Err(SshError::AuthenticationFailed(
                        "Authentication rejected by server".to_string(),
                    ));
                }
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    let answers = if prompts.is_empty() {
                        Vec::new()
                    } else {
                        let texts: Vec<String> = prompts.iter().map(|p| p.prompt.clone()).collect();
                        let answer = prompter.answer(&texts).await?;
                        vec![answer; prompts.len()]
                    };
                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await?;
                }
            }
        }
    }

    fn into_session(self, handle: Handle<ClientHandler>) -> SshSession {
        info!("SSH authentication successful for {}", self.target.display_target());
        SshSession::start(handle, self.target.display_target())
    }
}

/// Production connector: a fresh russh connection per call
pub struct RusshConnector {
    options: ConnectOptions,
}

impl RusshConnector {
    pub fn new(options: ConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl RemoteConnector for RusshConnector {
    async fn connect(
        &self,
        target: &SessionConfig,
        passphrase: Option<&str>,
        prompter: &dyn InteractivePrompter,
    ) -> Result<Box<dyn RemoteSession>, SshError> {
        let session = SshClient::new(target.clone(), self.options.clone())
            .connect(passphrase, prompter)
            .await?;
        Ok(Box::new(session))
    }
}

/// Client handler for russh callbacks: host key verification against
/// `~/.ssh/known_hosts`. Unknown hosts are learned, changed keys rejected.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        KnownHosts::user_default().check_and_learn(&self.host, self.port, server_public_key)?;
        Ok(true)
    }
}
