//! Orchestrator error taxonomy
//!
//! Everything that reaches the client is rendered through `Display` as a
//! plain-text line; no variant ends the process.

use std::path::PathBuf;

use thiserror::Error;

use crate::auth::AuthError;
use crate::config::StorageError;
use crate::sftp::SftpError;
use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("SSH configuration missing. Please run an export first.")]
    ConfigurationMissing,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("SSH connection cancelled by user.")]
    Cancelled,

    #[error("SSH connection error: {0}")]
    Connection(String),

    #[error("Command failed with exit code {}: {command}", crate::sftp::transfer::exit_code_text(*.code))]
    RemoteCommand { command: String, code: Option<u32> },

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Local folder '{}' not found!", .0.display())]
    LocalPathMissing(PathBuf),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Protocol(String),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Settings error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SshError> for OrchestratorError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::Cancelled => OrchestratorError::Cancelled,
            SshError::PassphraseRequired | SshError::AuthenticationFailed(_) => {
                OrchestratorError::AuthenticationFailed(err.to_string())
            }
            other => OrchestratorError::Connection(other.to_string()),
        }
    }
}

impl From<AuthError> for OrchestratorError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Cancelled | AuthError::ClientGone => OrchestratorError::Cancelled,
            other => OrchestratorError::AuthenticationFailed(other.to_string()),
        }
    }
}

impl From<SftpError> for OrchestratorError {
    fn from(err: SftpError) -> Self {
        OrchestratorError::Transfer(err.to_string())
    }
}

impl serde::Serialize for OrchestratorError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
