//! SSH Agent authentication
//!
//! Signing is delegated to the agent behind `SSH_AUTH_SOCK`; the private key
//! never enters this process.

use std::future::Future;
use std::path::Path;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Send-safe [`Signer`] over the agent connection.
///
/// The built-in `impl Signer for AgentClient` borrows the `PublicKey` from the
/// server's sign request across an `.await`, which the compiler cannot prove
/// `Send`. Cloning the key up front leaves the future owning everything it
/// touches.
struct AgentSigner<'a> {
    agent: &'a mut AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

pub struct SshAgentClient {
    agent: AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl SshAgentClient {
    /// Connect to the agent named by `SSH_AUTH_SOCK`
    pub async fn connect() -> Result<Self, SshError> {
        #[cfg(unix)]
        {
            let agent = AgentClient::connect_env().await.map_err(|e| {
                SshError::AgentNotAvailable(format!("Failed to connect to SSH Agent: {}", e))
            })?;
            debug!("Connected to SSH Agent via SSH_AUTH_SOCK");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(unix))]
        {
            Err(SshError::AgentNotAvailable(
                "SSH Agent sockets are only supported on Unix".to_string(),
            ))
        }
    }

    /// Try every agent identity until the server accepts one
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<(), SshError> {
        let keys = self
            .agent
            .request_identities()
            .await
            .map_err(|e| SshError::AgentError(format!("Failed to list agent keys: {}", e)))?;

        if keys.is_empty() {
            return Err(SshError::AgentError("SSH Agent has no keys loaded".to_string()));
        }

        let mut last_error: Option<String> = None;
        for key in &keys {
            debug!("Trying agent key: {} ({})", key.algorithm(), key.comment());

            match handle
                .authenticate_publickey_with(
                    username,
                    key.clone(),
                    None,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await
            {
                Ok(result) if result.success() => {
                    info!("SSH Agent authentication succeeded with key: {}", key.comment());
                    return Ok(());
                }
                Ok(_) => debug!("Key rejected by server: {}", key.comment()),
                Err(e) => {
                    warn!("Agent signing error for key {}: {}", key.comment(), e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(SshError::AgentError(format!(
            "No agent key was accepted by the server (tried {} key(s)){}",
            keys.len(),
            last_error
                .map(|e| format!(". Last error: {}", e))
                .unwrap_or_default()
        )))
    }
}

/// `SSH_AUTH_SOCK` is set and names an existing socket
pub fn is_agent_available() -> bool {
    match std::env::var_os("SSH_AUTH_SOCK") {
        Some(sock) => cfg!(unix) && Path::new(&sock).exists(),
        None => false,
    }
}
