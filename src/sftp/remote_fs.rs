//! Remote filesystem access over the SFTP subsystem

use std::path::Path;

use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::error::SftpError;
use super::path_utils::join_remote_path;
use crate::ssh::HandleController;

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// File operations the transfer engine needs from the remote side
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Entries of `path`, without `.` and `..`
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError>;

    /// Create one directory. Fails with `AlreadyExists` when a directory is
    /// already there.
    async fn create_dir(&self, path: &str) -> Result<(), SftpError>;

    /// Create `remote`, or truncate it when it exists, and write the local
    /// file into it. Returns the number of bytes written.
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<u64, SftpError>;

    /// Returns the number of bytes written
    async fn download_file(&self, remote: &str, local: &Path) -> Result<u64, SftpError>;
}

pub struct SftpFs {
    sftp: RusshSftpSession,
}

impl SftpFs {
    /// Open the SFTP subsystem on a fresh channel of the connection
    pub async fn open(controller: &HandleController) -> Result<Self, SftpError> {
        let channel = controller
            .open_session_channel()
            .await
            .map_err(|e| SftpError::ChannelError(e.to_string()))?;

        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SftpError::SubsystemNotAvailable(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        let fs = Self::from_stream(channel.into_stream()).await?;
        info!("SFTP subsystem opened");
        Ok(fs)
    }

    /// Run the SFTP client over an already established byte stream
    pub async fn from_stream<S>(stream: S) -> Result<Self, SftpError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let sftp = RusshSftpSession::new(stream)
            .await
            .map_err(|e| SftpError::SubsystemNotAvailable(e.to_string()))?;
        Ok(Self { sftp })
    }
}

#[async_trait]
impl RemoteFs for SftpFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError> {
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }

            let metadata = entry.metadata();
            entries.push(RemoteEntry {
                path: join_remote_path(path, &name),
                is_dir: metadata.is_dir(),
                size: metadata.size.unwrap_or(0),
                name,
            });
        }

        debug!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        if let Err(e) = self.sftp.create_dir(path).await {
            // SFTP reports an existing directory as a generic failure
            return match self.sftp.metadata(path).await {
                Ok(attrs) if attrs.is_dir() => Err(SftpError::AlreadyExists(path.to_string())),
                _ => Err(map_sftp_error(e, path)),
            };
        }
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<u64, SftpError> {
        let content = tokio::fs::read(local).await?;

        // Create if missing, truncate if present
        let mut file = self
            .sftp
            .open_with_flags(
                remote,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| map_sftp_error(e, remote))?;

        file.write_all(&content).await.map_err(|e| {
            SftpError::TransferError(format!("Failed to write {}: {}", remote, e))
        })?;

        // Waits for every write and the close to be acknowledged
        file.shutdown().await.map_err(|e| {
            SftpError::TransferError(format!("Failed to close {}: {}", remote, e))
        })?;

        debug!("Uploaded {} bytes to {}", content.len(), remote);
        Ok(content.len() as u64)
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<u64, SftpError> {
        let content = self
            .sftp
            .read(remote)
            .await
            .map_err(|e| map_sftp_error(e, remote))?;

        tokio::fs::write(local, &content).await?;
        Ok(content.len() as u64)
    }
}

fn map_sftp_error(err: SftpErrorInner, path: &str) -> SftpError {
    if let SftpErrorInner::Status(status) = &err {
        match status.status_code {
            StatusCode::NoSuchFile => return SftpError::FileNotFound(path.to_string()),
            StatusCode::PermissionDenied => return SftpError::PermissionDenied(path.to_string()),
            _ => {}
        }
    }

    let err_str = err.to_string();
    if err_str.contains("No such file") || err_str.contains("not found") {
        SftpError::FileNotFound(path.to_string())
    } else if err_str.contains("Permission denied") {
        SftpError::PermissionDenied(path.to_string())
    } else {
        SftpError::ProtocolError(err_str)
    }
}
