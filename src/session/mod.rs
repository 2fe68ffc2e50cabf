//! Client sessions
//!
//! One [`ClientSession`] actor runs per connected client. It owns that
//! client's active target, routes control messages, and drives the
//! progress poll timer. Commands and exports run as their own tasks so a
//! suspended passphrase prompt never blocks the message loop that will
//! deliver the answer.

mod export;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Interval;
use tracing::{debug, info, warn};

pub use export::{run_export, run_preprocessor, write_payload};

use crate::auth::{CredentialStore, PassphraseNegotiator, RespondOutcome};
use crate::dispatch::OutputMode;
use crate::progress::progress_ticker;
use crate::protocol::{ClientMessage, ClientSink, CommandRequest, ExportRequest, PassphraseResponse};
use crate::ssh::SessionConfig;
use crate::state::AppState;

/// Per-client handles shared with the tasks a session spawns
#[derive(Clone)]
pub struct ClientContext {
    pub sink: ClientSink,
    pub negotiator: Arc<PassphraseNegotiator>,
}

impl ClientContext {
    pub fn new(sink: ClientSink, credentials: Arc<CredentialStore>) -> Self {
        Self {
            negotiator: Arc::new(PassphraseNegotiator::new(sink.clone(), credentials)),
            sink,
        }
    }
}

/// The authoritative target of one client session
#[derive(Debug, Default)]
pub struct SessionContext {
    target: Option<SessionConfig>,
}

impl SessionContext {
    pub fn target(&self) -> Option<&SessionConfig> {
        self.target.as_ref()
    }

    /// Adopt the values carried by a request. A request without a root
    /// folder keeps the current one. Returns whether user, host or remote
    /// directory changed.
    pub fn apply(&mut self, incoming: SessionConfig) -> bool {
        let changed = self
            .target
            .as_ref()
            .map_or(true, |current| !current.same_target(&incoming));

        let root_folder = incoming
            .root_folder
            .clone()
            .or_else(|| self.target.as_ref().and_then(|t| t.root_folder.clone()));
        self.target = Some(incoming.with_root_folder(root_folder));

        changed
    }
}

pub struct ClientSession {
    id: String,
    state: Arc<AppState>,
    ctx: ClientContext,
    context: SessionContext,
}

impl ClientSession {
    pub fn new(state: Arc<AppState>, sink: ClientSink) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ctx: ClientContext::new(sink, state.credentials.clone()),
            state,
            context: SessionContext::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process inbound frames until the client goes away
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<String>) {
        info!("Client session {} started", self.id);
        let mut ticker = self.state.settings.progress_interval().map(progress_ticker);

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(raw) => self.handle_frame(&raw),
                    None => break,
                },
                _ = next_tick(&mut ticker) => self.poll_progress(),
            }
        }

        self.ctx.negotiator.cancel_pending();
        info!("Client session {} ended", self.id);
    }

    fn handle_frame(&mut self, raw: &str) {
        match ClientMessage::parse(raw) {
            Ok(ClientMessage::Command(request)) => self.handle_command(request),
            Ok(ClientMessage::Export(request)) => self.handle_export(request),
            Ok(ClientMessage::Passphrase(response)) => self.handle_passphrase(response),
            Err(e) => {
                debug!("Rejected frame from {}: {}", self.id, e);
                self.ctx.sink.text(e.to_string());
            }
        }
    }

    fn handle_command(&mut self, request: CommandRequest) {
        if let Some(target) = request.target() {
            let had_target = self.context.target().is_some();
            if self.context.apply(target) && had_target {
                self.ctx.sink.text("SSH configuration updated.");
            }
        }

        let dispatcher = self.state.dispatcher.clone();
        let ctx = self.ctx.clone();
        let target = self.context.target().cloned();

        tokio::spawn(async move {
            let result = dispatcher
                .dispatch(
                    target.as_ref(),
                    request.command.as_deref(),
                    request.custom_command.as_deref(),
                    OutputMode::Normal,
                    &ctx,
                )
                .await;
            if let Err(e) = result {
                warn!("Command {:?} failed: {}", request.command, e);
                ctx.sink.text(e.to_string());
            }
        });
    }

    fn handle_export(&mut self, request: ExportRequest) {
        // Without user and host the payload is still written, just not validated
        let target = match request.target() {
            Some(target) => {
                self.context.apply(target);
                self.context.target().cloned()
            }
            None => None,
        };

        let state = self.state.clone();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            if let Err(e) = run_export(&state, &ctx, &request.payload, target.as_ref()).await {
                warn!("Export failed: {}", e);
                ctx.sink.text(e.to_string());
            }
        });
    }

    fn handle_passphrase(&self, response: PassphraseResponse) {
        match self.ctx.negotiator.respond(response) {
            Ok(RespondOutcome::Accepted) => debug!("Passphrase accepted for session {}", self.id),
            // The suspended operation reports the cancellation itself
            Ok(RespondOutcome::Cancelled) => {}
            Err(e) => self.ctx.sink.text(e.to_string()),
        }
    }

    /// Background progress poll. Output is suppressed, so failures stay in
    /// the log.
    fn poll_progress(&self) {
        let Some(target) = self
            .context
            .target()
            .filter(|t| !t.remote_dir.is_empty())
            .cloned()
        else {
            return;
        };

        let dispatcher = self.state.dispatcher.clone();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let result = dispatcher
                .dispatch(
                    Some(&target),
                    Some("progress"),
                    None,
                    OutputMode::Suppressed,
                    &ctx,
                )
                .await;
            if let Err(e) = result {
                debug!("Progress poll failed: {}", e);
            }
        });
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
