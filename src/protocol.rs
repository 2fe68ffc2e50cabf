//! Control channel messages
//!
//! Clients send JSON envelopes tagged by `type`. The server answers with
//! plain text frames for human-readable lines and JSON envelopes for
//! structured events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::OrchestratorError;
use crate::ssh::SessionConfig;

/// Structured server → client events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    PassphraseRequired { user: String, host: String },
    Progress { progress: String },
}

/// One outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Text(String),
    Event(ServerEvent),
}

impl ServerMessage {
    /// Wire form of the frame
    pub fn to_frame(&self) -> String {
        match self {
            ServerMessage::Text(text) => text.clone(),
            ServerMessage::Event(event) => serde_json::to_string(event)
                .unwrap_or_else(|e| format!("Failed to encode event: {}", e)),
        }
    }
}

/// Outbound half of one client connection
#[derive(Debug, Clone)]
pub struct ClientSink {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Send a status/output line. Lines sent after the client left are dropped.
    pub fn text(&self, line: impl Into<String>) {
        let _ = self.tx.send(ServerMessage::Text(line.into()));
    }

    pub fn event(&self, event: ServerEvent) {
        let _ = self.tx.send(ServerMessage::Event(event));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// `{type: "command", ...}`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub custom_command: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub remote_dir: Option<String>,
}

impl CommandRequest {
    /// Target carried by the request, if it names both user and host
    pub fn target(&self) -> Option<SessionConfig> {
        target_from(&self.user, &self.host, &self.remote_dir)
    }
}

/// `{type: "passphrase", passphrase?, canceled?}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PassphraseResponse {
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub canceled: bool,
}

/// `{type: "export", ...jobConfig}`; the whole envelope is the job configuration
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub user: Option<String>,
    pub host: Option<String>,
    pub remote_dir: Option<String>,
    pub root_folder: Option<String>,
    pub payload: Value,
}

impl ExportRequest {
    fn from_value(payload: Value) -> Self {
        let field = |name: &str| {
            payload
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_owned)
        };
        Self {
            user: field("user"),
            host: field("host"),
            remote_dir: field("remoteDir"),
            root_folder: field("rootFolder"),
            payload,
        }
    }

    pub fn target(&self) -> Option<SessionConfig> {
        target_from(&self.user, &self.host, &self.remote_dir)
            .map(|t| t.with_root_folder(self.root_folder.clone()))
    }
}

fn target_from(
    user: &Option<String>,
    host: &Option<String>,
    remote_dir: &Option<String>,
) -> Option<SessionConfig> {
    let user = user.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
    let host = host.as_deref().map(str::trim).filter(|h| !h.is_empty())?;
    Some(SessionConfig::new(
        user,
        host,
        remote_dir.as_deref().unwrap_or_default().trim(),
    ))
}

/// Client → server messages
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Export(ExportRequest),
    Command(CommandRequest),
    Passphrase(PassphraseResponse),
}

impl ClientMessage {
    pub fn parse(raw: &str) -> Result<Self, OrchestratorError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| OrchestratorError::Protocol(format!("Malformed message: {}", e)))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        match kind.as_str() {
            "export" => Ok(ClientMessage::Export(ExportRequest::from_value(value))),
            "command" => serde_json::from_value(value)
                .map(ClientMessage::Command)
                .map_err(|e| OrchestratorError::Protocol(format!("Malformed command: {}", e))),
            "passphrase" => serde_json::from_value(value)
                .map(ClientMessage::Passphrase)
                .map_err(|e| OrchestratorError::Protocol(format!("Malformed passphrase response: {}", e))),
            other => Err(OrchestratorError::Protocol(format!(
                "Unknown message type: {}",
                other
            ))),
        }
    }
}
