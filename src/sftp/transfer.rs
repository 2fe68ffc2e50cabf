//! Recursive Transfer Engine
//!
//! Mirrors directory trees between the local workspace and the remote job
//! directory. Children of a directory are transferred concurrently and the
//! directory completes once every child has reported, success or failure.
//! A failing file never aborts its siblings.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::SftpError;
use super::path_utils::{join_remote_path, remote_file_name, trim_remote_path};
use super::remote_fs::RemoteFs;
use crate::ssh::{capture, RemoteSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Push,
    Pull,
}

/// Progress of a running transfer, one per item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    FileTransferred {
        direction: TransferDirection,
        path: String,
        bytes: u64,
    },
    FileFailed {
        direction: TransferDirection,
        path: String,
        error: String,
    },
    /// A directory could not be created or listed; its subtree is skipped
    DirectoryFailed { path: String, error: String },
    DirectoryComplete {
        path: String,
        transferred: usize,
        failed: usize,
    },
    /// The timestamped local folder for a fetch
    LocalFolderCreated { path: String },
    ResultsFound { path: String },
    ResultsMissing { path: String, exit_status: Option<u32> },
    LogFilesFound { count: usize },
    NoLogFiles,
    LogSearchFailed { exit_status: Option<u32> },
    LogsComplete { transferred: usize, failed: usize },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferEvent::FileTransferred {
                direction: TransferDirection::Push,
                path,
                ..
            } => write!(f, "Uploaded: {}", path),
            TransferEvent::FileTransferred { path, .. } => write!(f, "Downloaded: {}", path),
            TransferEvent::FileFailed {
                direction: TransferDirection::Push,
                path,
                error,
            } => write!(f, "Error uploading {}: {}", path, error),
            TransferEvent::FileFailed { path, error, .. } => {
                write!(f, "Error downloading {}: {}", path, error)
            }
            TransferEvent::DirectoryFailed { path, error } => {
                write!(f, "Error processing directory {}: {}", path, error)
            }
            TransferEvent::DirectoryComplete {
                path,
                transferred,
                failed,
            } => write!(
                f,
                "Directory {} complete ({} files, {} failed).",
                path, transferred, failed
            ),
            TransferEvent::LocalFolderCreated { path } => {
                write!(f, "Created new local folder: {}", path)
            }
            TransferEvent::ResultsFound { path } => write!(f, "Results folder found: {}", path),
            TransferEvent::ResultsMissing { path, exit_status } => write!(
                f,
                "Results folder {} does not exist or is empty. Exit code: {}",
                path,
                exit_code_text(*exit_status)
            ),
            TransferEvent::LogFilesFound { count } => {
                write!(f, "{} log files found, downloading...", count)
            }
            TransferEvent::NoLogFiles => write!(f, "No log files found."),
            TransferEvent::LogSearchFailed { exit_status } => write!(
                f,
                "Log file search failed. Exit code: {}",
                exit_code_text(*exit_status)
            ),
            TransferEvent::LogsComplete { transferred, failed } => write!(
                f,
                "All log files processed ({} downloaded, {} failed).",
                transferred, failed
            ),
        }
    }
}

pub(crate) fn exit_code_text(status: Option<u32>) -> String {
    status.map_or_else(|| "none".to_string(), |code| code.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub path: String,
    pub error: String,
}

/// Aggregated outcome of a (sub)tree transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub transferred: usize,
    pub bytes: u64,
    pub failures: Vec<TransferFailure>,
}

impl TransferReport {
    fn failure(path: impl Into<String>, error: impl ToString) -> Self {
        Self {
            failures: vec![TransferFailure {
                path: path.into(),
                error: error.to_string(),
            }],
            ..Default::default()
        }
    }

    pub fn merge(&mut self, other: TransferReport) {
        self.transferred += other.transferred;
        self.bytes += other.bytes;
        self.failures.extend(other.failures);
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Name filters for fetching results. Both are resolved on the remote host
/// with a listing command rather than matched locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullFilters {
    /// Subdirectory mirrored recursively when present
    pub results_subdir: String,
    /// `find -name` pattern for top-level files fetched in any case
    pub log_pattern: String,
}

impl Default for PullFilters {
    fn default() -> Self {
        Self {
            results_subdir: "VTK".to_string(),
            log_pattern: "log.*".to_string(),
        }
    }
}

impl PullFilters {
    pub fn results_probe_command(&self, remote_root: &str) -> String {
        format!("ls -la {}/{}", trim_remote_path(remote_root), self.results_subdir)
    }

    pub fn log_listing_command(&self, remote_root: &str) -> String {
        format!(
            "find {} -maxdepth 1 -name \"{}\"",
            trim_remote_path(remote_root),
            self.log_pattern
        )
    }
}

pub struct TransferEngine {
    fs: Arc<dyn RemoteFs>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferEngine {
    pub fn new(fs: Arc<dyn RemoteFs>, events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self { fs, events }
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    /// Mirror `local_root` into `remote_root`. The remote root is created
    /// when missing.
    pub async fn push_tree(&self, local_root: &Path, remote_root: &str) -> TransferReport {
        let remote_root = trim_remote_path(remote_root).to_string();
        info!("Pushing {:?} to {}", local_root, remote_root);

        if let Err(e) = self.ensure_remote_dir(&remote_root).await {
            self.emit(TransferEvent::DirectoryFailed {
                path: remote_root.clone(),
                error: e.to_string(),
            });
            return TransferReport::failure(remote_root, e);
        }

        let report = self.push_dir(local_root.to_path_buf(), remote_root).await;
        info!(
            "Push complete: {} files, {} failed",
            report.transferred,
            report.failures.len()
        );
        report
    }

    async fn ensure_remote_dir(&self, path: &str) -> Result<(), SftpError> {
        match self.fs.create_dir(path).await {
            Ok(()) | Err(SftpError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn push_dir(&self, local: PathBuf, remote: String) -> BoxFuture<'_, TransferReport> {
        async move {
            let entries = match read_local_dir(&local).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Failed to read {:?}: {}", local, e);
                    let path = local.to_string_lossy().to_string();
                    self.emit(TransferEvent::DirectoryFailed {
                        path: path.clone(),
                        error: e.to_string(),
                    });
                    return TransferReport::failure(path, e);
                }
            };

            let children = entries.into_iter().map(|entry| {
                let remote_path = join_remote_path(&remote, &entry.name);
                async move {
                    let is_dir = match entry.is_dir {
                        Ok(is_dir) => is_dir,
                        Err(e) => {
                            warn!("Failed to stat {:?}: {}", entry.path, e);
                            let path = entry.path.to_string_lossy().to_string();
                            self.emit(TransferEvent::FileFailed {
                                direction: TransferDirection::Push,
                                path: path.clone(),
                                error: e.to_string(),
                            });
                            return TransferReport::failure(path, e);
                        }
                    };
                    let local_path = entry.path;
                    if is_dir {
                        if let Err(e) = self.ensure_remote_dir(&remote_path).await {
                            self.emit(TransferEvent::DirectoryFailed {
                                path: remote_path.clone(),
                                error: e.to_string(),
                            });
                            return TransferReport::failure(remote_path, e);
                        }
                        self.push_dir(local_path, remote_path).await
                    } else {
                        self.push_file(&local_path, remote_path).await
                    }
                }
            });

            let mut report = TransferReport::default();
            for child in join_all(children).await {
                report.merge(child);
            }

            self.emit(TransferEvent::DirectoryComplete {
                path: remote,
                transferred: report.transferred,
                failed: report.failures.len(),
            });
            report
        }
        .boxed()
    }

    async fn push_file(&self, local: &Path, remote: String) -> TransferReport {
        match self.fs.upload_file(local, &remote).await {
            Ok(bytes) => {
                self.emit(TransferEvent::FileTransferred {
                    direction: TransferDirection::Push,
                    path: remote,
                    bytes,
                });
                TransferReport {
                    transferred: 1,
                    bytes,
                    failures: Vec::new(),
                }
            }
            Err(e) => {
                self.emit(TransferEvent::FileFailed {
                    direction: TransferDirection::Push,
                    path: remote.clone(),
                    error: e.to_string(),
                });
                TransferReport::failure(remote, e)
            }
        }
    }

    /// Mirror `remote_root` into `local_root`, creating local directories as
    /// needed. Existing local files are overwritten.
    pub async fn pull_tree(&self, remote_root: &str, local_root: &Path) -> TransferReport {
        let remote_root = trim_remote_path(remote_root).to_string();
        info!("Pulling {} to {:?}", remote_root, local_root);

        if let Err(e) = tokio::fs::create_dir_all(local_root).await {
            let path = local_root.to_string_lossy().to_string();
            self.emit(TransferEvent::DirectoryFailed {
                path: path.clone(),
                error: e.to_string(),
            });
            return TransferReport::failure(path, e);
        }

        self.pull_dir(remote_root, local_root.to_path_buf()).await
    }

    fn pull_dir(&self, remote: String, local: PathBuf) -> BoxFuture<'_, TransferReport> {
        async move {
            let entries = match self.fs.read_dir(&remote).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Failed to list {}: {}", remote, e);
                    self.emit(TransferEvent::DirectoryFailed {
                        path: remote.clone(),
                        error: e.to_string(),
                    });
                    return TransferReport::failure(remote, e);
                }
            };

            let children = entries.into_iter().map(|entry| {
                let local_path = local.join(&entry.name);
                async move {
                    if entry.is_dir {
                        if let Err(e) = tokio::fs::create_dir_all(&local_path).await {
                            self.emit(TransferEvent::DirectoryFailed {
                                path: entry.path.clone(),
                                error: e.to_string(),
                            });
                            return TransferReport::failure(entry.path, e);
                        }
                        self.pull_dir(entry.path, local_path).await
                    } else {
                        self.pull_file(entry.path, &local_path).await
                    }
                }
            });

            let mut report = TransferReport::default();
            for child in join_all(children).await {
                report.merge(child);
            }

            self.emit(TransferEvent::DirectoryComplete {
                path: remote,
                transferred: report.transferred,
                failed: report.failures.len(),
            });
            report
        }
        .boxed()
    }

    async fn pull_file(&self, remote: String, local: &Path) -> TransferReport {
        match self.fs.download_file(&remote, local).await {
            Ok(bytes) => {
                self.emit(TransferEvent::FileTransferred {
                    direction: TransferDirection::Pull,
                    path: remote,
                    bytes,
                });
                TransferReport {
                    transferred: 1,
                    bytes,
                    failures: Vec::new(),
                }
            }
            Err(e) => {
                self.emit(TransferEvent::FileFailed {
                    direction: TransferDirection::Pull,
                    path: remote.clone(),
                    error: e.to_string(),
                });
                TransferReport::failure(remote, e)
            }
        }
    }

    /// Download individual remote files into `local_dir`, keeping their names
    pub async fn pull_files(&self, remote_paths: Vec<String>, local_dir: &Path) -> TransferReport {
        let downloads = remote_paths.into_iter().map(|remote| {
            let local = local_dir.join(remote_file_name(&remote));
            async move { self.pull_file(remote, &local).await }
        });

        let mut report = TransferReport::default();
        for child in join_all(downloads).await {
            report.merge(child);
        }
        report
    }

    /// Fetch simulation results: the results subdirectory when it exists
    /// remotely, then the top-level log files. A missing results folder
    /// is reported and skipped.
    pub async fn fetch_results(
        &self,
        session: &dyn RemoteSession,
        remote_root: &str,
        local_root: &Path,
        filters: &PullFilters,
    ) -> Result<TransferReport, SftpError> {
        let remote_root = trim_remote_path(remote_root);
        let mut report = TransferReport::default();

        let probe_command = filters.results_probe_command(remote_root);
        let probe = capture(session, &probe_command)
            .await
            .map_err(|e| SftpError::RemoteCommand {
                command: probe_command.clone(),
                message: e.to_string(),
            })?;

        tokio::fs::create_dir_all(local_root).await?;
        self.emit(TransferEvent::LocalFolderCreated {
            path: local_root.display().to_string(),
        });

        let results_path = join_remote_path(remote_root, &filters.results_subdir);
        if probe.success() && !probe.stdout.trim().is_empty() {
            self.emit(TransferEvent::ResultsFound {
                path: results_path.clone(),
            });
            let local_results = local_root.join(&filters.results_subdir);
            report.merge(self.pull_tree(&results_path, &local_results).await);
        } else {
            debug!("Results probe stderr: {}", probe.stderr.trim());
            self.emit(TransferEvent::ResultsMissing {
                path: results_path,
                exit_status: probe.exit_status,
            });
        }

        let listing_command = filters.log_listing_command(remote_root);
        let listing = capture(session, &listing_command)
            .await
            .map_err(|e| SftpError::RemoteCommand {
                command: listing_command.clone(),
                message: e.to_string(),
            })?;

        if !listing.success() {
            self.emit(TransferEvent::LogSearchFailed {
                exit_status: listing.exit_status,
            });
            report.merge(TransferReport::failure(
                listing_command,
                format!("exit code {}", exit_code_text(listing.exit_status)),
            ));
            return Ok(report);
        }

        let log_files: Vec<String> = listing
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        if log_files.is_empty() {
            self.emit(TransferEvent::NoLogFiles);
            return Ok(report);
        }

        self.emit(TransferEvent::LogFilesFound {
            count: log_files.len(),
        });
        tokio::fs::create_dir_all(local_root).await?;
        let logs = self.pull_files(log_files, local_root).await;
        self.emit(TransferEvent::LogsComplete {
            transferred: logs.transferred,
            failed: logs.failures.len(),
        });
        report.merge(logs);

        Ok(report)
    }
}

struct LocalEntry {
    name: String,
    path: PathBuf,
    /// Resolved through symlinks; an entry that cannot be stat'ed carries
    /// its own error so siblings still transfer
    is_dir: std::io::Result<bool>,
}

/// Entries of a local directory, sorted by name
async fn read_local_dir(path: &Path) -> std::io::Result<Vec<LocalEntry>> {
    let mut dir = tokio::fs::read_dir(path).await?;
    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        let is_dir = tokio::fs::metadata(&path).await.map(|m| m.is_dir());
        entries.push(LocalEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            path,
            is_dir,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Local results folder name for a fetch started at `now`
pub fn timestamp_dir_name(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%Y-%m-%dT%H%M%S%3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::mock::MockRemote;
    use chrono::TimeZone;
    use std::collections::BTreeSet;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn engine(remote: &MockRemote) -> (TransferEngine, UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransferEngine::new(remote.fs(), tx), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn local_files(root: &Path) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    out.insert(path.strip_prefix(root).unwrap().to_string_lossy().to_string());
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn test_push_tree_completes_after_every_file() {
        let local = tempfile::tempdir().unwrap();
        write(local.path(), "Allrun.slurm", "#!/bin/bash");
        write(local.path(), "system/controlDict", "a");
        write(local.path(), "system/fvSchemes", "b");
        write(local.path(), "constant/polyMesh/points", "c");
        write(local.path(), "constant/transportProperties", "d");
        std::fs::create_dir_all(local.path().join("0.orig")).unwrap();

        let remote = MockRemote::new();
        remote.fs().add_dir("/scratch");
        let (engine, mut rx) = engine(&remote);
        let report = engine.push_tree(local.path(), "/scratch/job1").await;

        assert_eq!(report.transferred, 5);
        assert!(report.is_complete());

        let events = drain(&mut rx);
        let files = events
            .iter()
            .filter(|e| matches!(e, TransferEvent::FileTransferred { .. }))
            .count();
        assert_eq!(files, 5);

        // Root completion is the last event, after every file
        assert_eq!(
            events.last(),
            Some(&TransferEvent::DirectoryComplete {
                path: "/scratch/job1".into(),
                transferred: 5,
                failed: 0
            })
        );
        assert!(events.contains(&TransferEvent::DirectoryComplete {
            path: "/scratch/job1/0.orig".into(),
            transferred: 0,
            failed: 0
        }));

        let fs = remote.fs();
        assert!(fs.is_dir("/scratch/job1/0.orig"));
        assert_eq!(fs.file("/scratch/job1/constant/polyMesh/points"), Some(b"c".to_vec()));
    }

    #[tokio::test]
    async fn test_one_failing_file_does_not_abort_siblings() {
        let local = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c", "d", "e"] {
            write(local.path(), name, name);
        }

        let remote = MockRemote::new();
        remote.fs().add_dir("/scratch/job1");
        remote.fs().fail_transfer("c");
        let (engine, mut rx) = engine(&remote);
        let report = engine.push_tree(local.path(), "/scratch/job1").await;

        assert_eq!(report.transferred, 4);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "/scratch/job1/c");

        let events = drain(&mut rx);
        assert_eq!(
            events.last(),
            Some(&TransferEvent::DirectoryComplete {
                path: "/scratch/job1".into(),
                transferred: 4,
                failed: 1
            })
        );
    }

    #[tokio::test]
    async fn test_push_tolerates_existing_directories() {
        let local = tempfile::tempdir().unwrap();
        write(local.path(), "system/controlDict", "new");

        let remote = MockRemote::new();
        remote.fs().add_file("/scratch/job1/system/controlDict", b"old");
        let (engine, _rx) = engine(&remote);
        let report = engine.push_tree(local.path(), "/scratch/job1/").await;

        assert!(report.is_complete());
        assert_eq!(
            remote.fs().file("/scratch/job1/system/controlDict"),
            Some(b"new".to_vec())
        );
    }

    #[tokio::test]
    async fn test_push_missing_local_root() {
        let remote = MockRemote::new();
        remote.fs().add_dir("/scratch/job1");
        let (engine, mut rx) = engine(&remote);
        let report = engine
            .push_tree(Path::new("/nonexistent/job"), "/scratch/job1")
            .await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "/nonexistent/job");
        assert!(matches!(
            drain(&mut rx).first(),
            Some(TransferEvent::DirectoryFailed { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_push_follows_directory_symlinks() {
        let shared = tempfile::tempdir().unwrap();
        write(shared.path(), "polyMesh/points", "p");
        write(shared.path(), "polyMesh/faces", "f");

        let local = tempfile::tempdir().unwrap();
        write(local.path(), "system/controlDict", "a");
        std::fs::create_dir_all(local.path().join("constant")).unwrap();
        std::os::unix::fs::symlink(
            shared.path().join("polyMesh"),
            local.path().join("constant/polyMesh"),
        )
        .unwrap();

        let remote = MockRemote::new();
        remote.fs().add_dir("/scratch");
        let (engine, _rx) = engine(&remote);
        let report = engine.push_tree(local.path(), "/scratch/job1").await;

        assert!(report.is_complete());
        assert_eq!(report.transferred, 3);
        let fs = remote.fs();
        assert!(fs.is_dir("/scratch/job1/constant/polyMesh"));
        assert_eq!(fs.file("/scratch/job1/constant/polyMesh/points"), Some(b"p".to_vec()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_push_reports_dangling_symlink_and_continues() {
        let local = tempfile::tempdir().unwrap();
        write(local.path(), "a", "a");
        write(local.path(), "c", "c");
        std::os::unix::fs::symlink(local.path().join("missing"), local.path().join("b")).unwrap();

        let remote = MockRemote::new();
        remote.fs().add_dir("/scratch/job1");
        let (engine, mut rx) = engine(&remote);
        let report = engine.push_tree(local.path(), "/scratch/job1").await;

        assert_eq!(report.transferred, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].path.ends_with("/b"));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            TransferEvent::FileFailed { direction: TransferDirection::Push, path, .. }
                if path.ends_with("/b")
        )));
        assert_eq!(
            events.last(),
            Some(&TransferEvent::DirectoryComplete {
                path: "/scratch/job1".into(),
                transferred: 2,
                failed: 1
            })
        );
        assert_eq!(remote.fs().file("/scratch/job1/c"), Some(b"c".to_vec()));
    }

    #[tokio::test]
    async fn test_pull_twice_is_idempotent() {
        let remote = MockRemote::new();
        let fs = remote.fs();
        fs.add_file("/scratch/job1/VTK/case_0.vtk", b"0");
        fs.add_file("/scratch/job1/VTK/case_100/internal.vtu", b"100");
        fs.add_file("/scratch/job1/VTK/case_100/boundary/inlet.vtp", b"in");

        let local = tempfile::tempdir().unwrap();
        let (engine, _rx) = engine(&remote);

        let first = engine.pull_tree("/scratch/job1/VTK", local.path()).await;
        let files_first = local_files(local.path());
        let second = engine.pull_tree("/scratch/job1/VTK", local.path()).await;

        assert!(first.is_complete());
        assert!(second.is_complete());
        assert_eq!(first.transferred, 3);
        assert_eq!(files_first, local_files(local.path()));
        assert_eq!(
            std::fs::read(local.path().join("case_100/internal.vtu")).unwrap(),
            b"100"
        );
    }

    #[tokio::test]
    async fn test_fetch_results_with_results_folder() {
        let remote = MockRemote::new();
        let fs = remote.fs();
        fs.add_file("/scratch/job1/VTK/case_0.vtk", b"0");
        fs.add_file("/scratch/job1/log.simpleFoam", b"log");
        fs.add_file("/scratch/job1/log.blockMesh", b"log");
        fs.add_file("/scratch/job1/controlDict", b"skip");
        let session = remote.session();

        let local = tempfile::tempdir().unwrap();
        let (engine, mut rx) = engine(&remote);
        let report = engine
            .fetch_results(&session, "/scratch/job1", local.path(), &PullFilters::default())
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.transferred, 3);
        assert_eq!(
            local_files(local.path()),
            BTreeSet::from([
                "VTK/case_0.vtk".to_string(),
                "log.blockMesh".to_string(),
                "log.simpleFoam".to_string(),
            ])
        );

        let events = drain(&mut rx);
        assert!(events.contains(&TransferEvent::ResultsFound {
            path: "/scratch/job1/VTK".into()
        }));
        assert!(events.contains(&TransferEvent::LogFilesFound { count: 2 }));
        assert_eq!(
            remote.executed(),
            vec![
                "ls -la /scratch/job1/VTK".to_string(),
                "find /scratch/job1 -maxdepth 1 -name \"log.*\"".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_results_without_results_folder_fetches_logs() {
        let remote = MockRemote::new();
        remote.fs().add_file("/scratch/job1/log.run", b"log");
        let session = remote.session();

        let local = tempfile::tempdir().unwrap();
        let (engine, mut rx) = engine(&remote);
        let report = engine
            .fetch_results(&session, "/scratch/job1", local.path(), &PullFilters::default())
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(local_files(local.path()), BTreeSet::from(["log.run".to_string()]));
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, TransferEvent::ResultsMissing { exit_status: Some(2), .. })));
    }

    #[tokio::test]
    async fn test_fetch_results_nothing_to_fetch() {
        let remote = MockRemote::new();
        remote.fs().add_dir("/scratch/job1");
        let session = remote.session();

        let local = tempfile::tempdir().unwrap();
        let (engine, mut rx) = engine(&remote);
        let report = engine
            .fetch_results(&session, "/scratch/job1", local.path(), &PullFilters::default())
            .await
            .unwrap();

        assert_eq!(report, TransferReport::default());
        assert_eq!(drain(&mut rx).last(), Some(&TransferEvent::NoLogFiles));
    }

    #[tokio::test]
    async fn test_fetch_results_leaves_no_folder_when_probe_fails() {
        let remote = MockRemote::new();
        remote.fs().add_file("/scratch/job1/log.run", b"log");
        let session = remote.session();
        remote.drop_connections();

        let parent = tempfile::tempdir().unwrap();
        let local = parent.path().join("2024-03-05T140709042Z");
        let (engine, mut rx) = engine(&remote);
        let result = engine
            .fetch_results(&session, "/scratch/job1", &local, &PullFilters::default())
            .await;

        assert!(matches!(result, Err(SftpError::RemoteCommand { .. })));
        assert!(!local.exists());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_fetch_results_creates_folder_after_probe() {
        let remote = MockRemote::new();
        remote.fs().add_dir("/scratch/job1");
        let session = remote.session();

        let parent = tempfile::tempdir().unwrap();
        let local = parent.path().join("2024-03-05T140709042Z");
        let (engine, mut rx) = engine(&remote);
        engine
            .fetch_results(&session, "/scratch/job1", &local, &PullFilters::default())
            .await
            .unwrap();

        assert!(local.is_dir());
        assert_eq!(
            drain(&mut rx).first(),
            Some(&TransferEvent::LocalFolderCreated {
                path: local.display().to_string()
            })
        );
    }

    #[test]
    fn test_pull_filter_commands() {
        let filters = PullFilters::default();
        assert_eq!(
            filters.results_probe_command("/scratch/job1/"),
            "ls -la /scratch/job1/VTK"
        );
        assert_eq!(
            filters.log_listing_command("/scratch/job1"),
            "find /scratch/job1 -maxdepth 1 -name \"log.*\""
        );
    }

    #[test]
    fn test_timestamp_dir_name() {
        let now = chrono::Utc
            .with_ymd_and_hms(2024, 3, 5, 14, 7, 9)
            .unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(timestamp_dir_name(now), "2024-03-05T140709042Z");
    }

    #[test]
    fn test_event_lines() {
        assert_eq!(
            TransferEvent::FileTransferred {
                direction: TransferDirection::Push,
                path: "/a/b".into(),
                bytes: 1
            }
            .to_string(),
            "Uploaded: /a/b"
        );
        assert_eq!(TransferEvent::NoLogFiles.to_string(), "No log files found.");
    }
}
