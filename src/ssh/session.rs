//! Authenticated SSH session over the handle owner task

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::Handle;
use russh::ChannelMsg;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController, PingResult};
use super::remote::{ExecOutput, RemoteSession};
use crate::sftp::{RemoteFs, SftpFs};

pub struct SshSession {
    id: String,
    controller: HandleController,
}

impl SshSession {
    /// Hand the authenticated handle to its owner task
    pub fn start(handle: Handle<ClientHandler>, id: String) -> Self {
        let controller = spawn_handle_owner_task(handle, id.clone());
        Self { id, controller }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(
        &self,
        command: &str,
        output: mpsc::UnboundedSender<ExecOutput>,
    ) -> Result<Option<u32>, SshError> {
        let mut channel = self.controller.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to exec command: {}", e)))?;

        debug!("[{}] exec: {}", self.id, command);

        // Exit status may arrive after EOF, so only Close ends the loop
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    let _ = output.send(ExecOutput::Stdout(data.to_vec()));
                }
                ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    let _ = output.send(ExecOutput::Stderr(data.to_vec()));
                }
                ChannelMsg::ExitStatus { exit_status: code } => {
                    exit_status = Some(code);
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    warn!("[{}] remote process killed by signal {:?}", self.id, signal_name);
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(exit_status)
    }

    async fn open_fs(&self) -> Result<Arc<dyn RemoteFs>, SshError> {
        let fs = SftpFs::open(&self.controller)
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        Ok(Arc::new(fs))
    }

    async fn ping(&self) -> bool {
        self.controller.ping().await == PingResult::Ok
    }

    fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    async fn close(&self) {
        self.controller.disconnect().await;
    }
}
