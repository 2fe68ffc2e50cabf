//! Passphrase negotiation with the remote client
//!
//! ```text
//! Client                                 Orchestrator
//!    │                                        │ connect needs a passphrase
//!    │◀──── {type:"passphrase_required"} ─────│ request parked in the slot
//!    │                                        │
//!    │───── {type:"passphrase", ...} ────────▶│ respond(): resolve / cancel / re-prompt
//!    │                                        │ suspended attempt resumes
//! ```
//!
//! One negotiator exists per client session. Its slot holds at most one
//! pending request; concurrent requesters queue on `turn` and are prompted
//! one after the other.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::credential::CredentialStore;
use crate::protocol::{ClientSink, PassphraseResponse, ServerEvent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("SSH connection cancelled by user.")]
    Cancelled,

    #[error("No passphrase was requested.")]
    NoRequestPending,

    #[error("No passphrase provided. Please enter the passphrase.")]
    EmptyPassphrase,

    #[error("Client disconnected while a passphrase was pending.")]
    ClientGone,
}

impl serde::Serialize for AuthError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// What a valid response did to the pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespondOutcome {
    Accepted,
    Cancelled,
}

struct PendingAuthRequest {
    id: String,
    user: String,
    host: String,
    reply: oneshot::Sender<Result<String, AuthError>>,
}

pub struct PassphraseNegotiator {
    sink: ClientSink,
    credentials: Arc<CredentialStore>,
    pending: Mutex<Option<PendingAuthRequest>>,
    turn: tokio::sync::Mutex<()>,
}

impl PassphraseNegotiator {
    pub fn new(sink: ClientSink, credentials: Arc<CredentialStore>) -> Self {
        Self {
            sink,
            credentials,
            pending: Mutex::new(None),
            turn: tokio::sync::Mutex::new(()),
        }
    }

    /// Ask the client for a passphrase and wait for the answer
    pub async fn request_passphrase(&self, user: &str, host: &str) -> Result<String, AuthError> {
        let _turn = self.turn.lock().await;

        // Whoever held the turn before us may have unlocked the key already
        if let Some(cached) = self.credentials.cached() {
            debug!("Passphrase became available while queued, skipping prompt");
            return Ok(cached);
        }

        let (reply, rx) = oneshot::channel();
        let id = uuid::Uuid::new_v4().to_string();
        *self.pending.lock() = Some(PendingAuthRequest {
            id: id.clone(),
            user: user.to_string(),
            host: host.to_string(),
            reply,
        });

        info!("Passphrase request {} for {}@{}", id, user, host);
        self.prompt(user, host);

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                self.pending.lock().take();
                Err(AuthError::ClientGone)
            }
        }
    }

    /// Apply a client response to the pending request.
    ///
    /// An empty passphrase leaves the request pending and prompts again.
    pub fn respond(&self, response: PassphraseResponse) -> Result<RespondOutcome, AuthError> {
        let mut slot = self.pending.lock();

        if slot.as_ref().map_or(true, |p| p.reply.is_closed()) {
            *slot = None;
            return Err(AuthError::NoRequestPending);
        }

        if response.canceled {
            if let Some(pending) = slot.take() {
                info!("Passphrase request {} cancelled by user", pending.id);
                let _ = pending.reply.send(Err(AuthError::Cancelled));
            }
            return Ok(RespondOutcome::Cancelled);
        }

        match response.passphrase.filter(|p| !p.is_empty()) {
            Some(passphrase) => {
                if let Some(pending) = slot.take() {
                    debug!("Passphrase request {} answered", pending.id);
                    let _ = pending.reply.send(Ok(passphrase));
                }
                Ok(RespondOutcome::Accepted)
            }
            None => {
                let target = slot.as_ref().map(|p| (p.user.clone(), p.host.clone()));
                drop(slot);
                if let Some((user, host)) = target {
                    self.prompt(&user, &host);
                }
                Err(AuthError::EmptyPassphrase)
            }
        }
    }

    /// Abort the pending request because its client went away
    pub fn cancel_pending(&self) {
        if let Some(pending) = self.pending.lock().take() {
            debug!("Dropping passphrase request {} for departed client", pending.id);
            let _ = pending.reply.send(Err(AuthError::ClientGone));
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|p| !p.reply.is_closed())
    }

    fn prompt(&self, user: &str, host: &str) {
        self.sink
            .text(format!("SSH key passphrase requested for {}@{}.", user, host));
        self.sink.event(ServerEvent::PassphraseRequired {
            user: user.to_string(),
            host: host.to_string(),
        });
    }
}
