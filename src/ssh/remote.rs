//! Seams between the orchestration logic and the SSH transport
//!
//! The production implementations live in `client.rs` / `session.rs`; tests
//! plug in the in-memory double from `mock.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::config::SessionConfig;
use super::error::SshError;
use crate::sftp::RemoteFs;

/// One chunk of remote process output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Answers keyboard-interactive prompts raised by the remote host
#[async_trait]
pub trait InteractivePrompter: Send + Sync {
    async fn answer(&self, prompts: &[String]) -> Result<String, SshError>;
}

/// Opens authenticated sessions
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// One connection attempt. Authentication order is agent, then the key
    /// file unlocked with `passphrase`, then keyboard-interactive via `prompter`.
    async fn connect(
        &self,
        target: &SessionConfig,
        passphrase: Option<&str>,
        prompter: &dyn InteractivePrompter,
    ) -> Result<Box<dyn RemoteSession>, SshError>;
}

/// An authenticated session
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Runs `command`, streaming output into `output`. Returns the exit
    /// status, or `None` when the process ended without one (killed by signal).
    async fn exec(
        &self,
        command: &str,
        output: mpsc::UnboundedSender<ExecOutput>,
    ) -> Result<Option<u32>, SshError>;

    /// Opens the file-transfer sub-channel
    async fn open_fs(&self) -> Result<Arc<dyn RemoteFs>, SshError>;

    /// Keep-alive probe
    async fn ping(&self) -> bool;

    fn is_connected(&self) -> bool;

    async fn close(&self);
}

/// Fully collected output of a short remote command
#[derive(Debug, Clone, Default)]
pub struct ExecCapture {
    pub exit_status: Option<u32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecCapture {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Run a command and collect its output instead of streaming it
pub async fn capture(session: &dyn RemoteSession, command: &str) -> Result<ExecCapture, SshError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let exit_status = session.exec(command, tx).await?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        match chunk {
            ExecOutput::Stdout(data) => stdout.extend_from_slice(&data),
            ExecOutput::Stderr(data) => stderr.extend_from_slice(&data),
        }
    }

    Ok(ExecCapture {
        exit_status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}
