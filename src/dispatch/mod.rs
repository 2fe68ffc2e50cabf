//! Command Dispatcher
//!
//! Maps the logical command names sent by the client onto remote shell
//! invocations or transfer tasks, and runs each one over its own connection.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::OrchestratorError;
use crate::progress::ProgressFilter;
use crate::protocol::ServerEvent;
use crate::session::ClientContext;
use crate::sftp::{timestamp_dir_name, TransferEngine, TransferEvent, TransferReport};
use crate::ssh::{
    capture, ConnectMode, Connection, ConnectionManager, ExecOutput, RemoteSession, SessionConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Sync,
    Clean,
    Pre,
    Run,
    Status,
    Post,
    All,
    Custom,
    FetchResults,
    Progress,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Sync => "sync",
            CommandKind::Clean => "clean",
            CommandKind::Pre => "pre",
            CommandKind::Run => "run",
            CommandKind::Status => "status",
            CommandKind::Post => "post",
            CommandKind::All => "all",
            CommandKind::Custom => "custom",
            CommandKind::FetchResults => "fetch-results",
            CommandKind::Progress => "progress",
        }
    }
}

impl FromStr for CommandKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(CommandKind::Sync),
            "clean" => Ok(CommandKind::Clean),
            "pre" => Ok(CommandKind::Pre),
            "run" => Ok(CommandKind::Run),
            "status" => Ok(CommandKind::Status),
            "post" => Ok(CommandKind::Post),
            "all" => Ok(CommandKind::All),
            "custom" => Ok(CommandKind::Custom),
            // Older clients still send the results folder name
            "fetch-results" | "fetch_results" | "VTK" => Ok(CommandKind::FetchResults),
            "progress" => Ok(CommandKind::Progress),
            other => Err(OrchestratorError::InvalidRequest(format!(
                "Unknown command: {}",
                other
            ))),
        }
    }
}

/// What a job does once connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    Remote(String),
    Push,
    FetchResults,
}

/// Remote shell invocation for a command kind, `None` for transfer kinds
pub fn shell_command_for(kind: CommandKind, remote_dir: &str, custom: Option<&str>) -> Option<String> {
    let command = match kind {
        CommandKind::Clean => format!("cd {} && ./Allclean", remote_dir),
        CommandKind::Pre => format!("cd {} && ./Allpre", remote_dir),
        CommandKind::Run => format!("cd {} && sbatch Allrun.slurm", remote_dir),
        CommandKind::Status => format!("squeue && cd {} && ./utilCalcProgress", remote_dir),
        CommandKind::Post => format!("cd {} && ./Allpost", remote_dir),
        CommandKind::All => format!(
            "cd {} && ./Allclean && ./Allpre && sbatch Allrun.slurm",
            remote_dir
        ),
        // Arbitrary shell on the cluster, passed through verbatim
        CommandKind::Custom => format!("cd {} && {}", remote_dir, custom?),
        CommandKind::Progress => format!("cd {} && ./utilCalcProgress", remote_dir),
        CommandKind::Sync | CommandKind::FetchResults => return None,
    };
    Some(command)
}

/// One logical operation requested by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandJob {
    pub kind: CommandKind,
    pub action: JobAction,
}

impl CommandJob {
    pub fn parse(
        command: Option<&str>,
        custom: Option<&str>,
        remote_dir: &str,
    ) -> Result<Self, OrchestratorError> {
        let command = command
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| OrchestratorError::InvalidRequest("No command specified.".into()))?;
        let kind: CommandKind = command.parse()?;
        let custom = custom.map(str::trim).filter(|c| !c.is_empty());

        let action = match kind {
            CommandKind::Sync => JobAction::Push,
            CommandKind::FetchResults => JobAction::FetchResults,
            _ => JobAction::Remote(shell_command_for(kind, remote_dir, custom).ok_or_else(
                || OrchestratorError::InvalidRequest("No custom command specified.".into()),
            )?),
        };

        Ok(Self { kind, action })
    }
}

/// How much of a job's output reaches the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Normal,
    /// Background polls: no status lines, no output, no prompts
    Suppressed,
}

pub struct CommandDispatcher {
    manager: Arc<ConnectionManager>,
    settings: Arc<Settings>,
}

impl CommandDispatcher {
    pub fn new(manager: Arc<ConnectionManager>, settings: Arc<Settings>) -> Self {
        Self { manager, settings }
    }

    /// Run one command against `target`.
    ///
    /// Status lines and output are streamed to the client as they arrive.
    /// The connection opened for the job is closed whatever the outcome.
    pub async fn dispatch(
        &self,
        target: Option<&SessionConfig>,
        command: Option<&str>,
        custom: Option<&str>,
        mode: OutputMode,
        ctx: &ClientContext,
    ) -> Result<(), OrchestratorError> {
        let target = target.ok_or(OrchestratorError::ConfigurationMissing)?;
        let job = CommandJob::parse(command, custom, &target.remote_dir)?;
        let quiet = mode == OutputMode::Suppressed || job.kind == CommandKind::Progress;
        let connect_mode = match mode {
            OutputMode::Normal => ConnectMode::Interactive,
            OutputMode::Suppressed => ConnectMode::NonInteractive,
        };

        debug!("Dispatching {:?} for {}", job.kind, target.display_target());

        match &job.action {
            JobAction::Remote(shell) => {
                if !quiet {
                    ctx.sink.text(format!("Executing command: {}", shell));
                }
                let mut connection = self.open(target, ctx, connect_mode, quiet).await?;
                let result = self
                    .run_remote(&connection, &job, shell, quiet, ctx)
                    .await;
                connection.close().await;
                result
            }
            JobAction::Push => self.run_push(target, ctx, connect_mode).await,
            JobAction::FetchResults => self.run_fetch(target, ctx, connect_mode).await,
        }
    }

    async fn open(
        &self,
        target: &SessionConfig,
        ctx: &ClientContext,
        mode: ConnectMode,
        quiet: bool,
    ) -> Result<Connection, OrchestratorError> {
        if !quiet {
            ctx.sink
                .text(format!("Connecting to {}...", target.display_target()));
        }
        let connection = self.manager.connect(target, &ctx.negotiator, mode).await?;
        if !quiet {
            ctx.sink
                .text(format!("SSH connection to {} established.", target.host));
        }
        Ok(connection)
    }

    async fn run_remote(
        &self,
        connection: &Connection,
        job: &CommandJob,
        shell: &str,
        quiet: bool,
        ctx: &ClientContext,
    ) -> Result<(), OrchestratorError> {
        let session = connection.session()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let filter_progress = job.kind == CommandKind::Progress;

        let forward = async {
            let mut filter = ProgressFilter::new();
            let mut stdout = Utf8Chunks::default();
            let mut stderr = Utf8Chunks::default();
            let emit_stdout = |filter: &mut ProgressFilter, text: String| {
                if filter_progress {
                    for progress in filter.feed(&text) {
                        ctx.sink.event(ServerEvent::Progress { progress });
                    }
                } else if !quiet && !text.is_empty() {
                    ctx.sink.text(text);
                }
            };
            let emit_stderr = |text: String| {
                if !quiet && !text.is_empty() {
                    ctx.sink.text(format!("Error: {}", text));
                }
            };

            while let Some(chunk) = rx.recv().await {
                match chunk {
                    ExecOutput::Stdout(data) => emit_stdout(&mut filter, stdout.decode(&data)),
                    ExecOutput::Stderr(data) => emit_stderr(stderr.decode(&data)),
                }
            }
            emit_stdout(&mut filter, stdout.finish());
            emit_stderr(stderr.finish());
            if let Some(progress) = filter.finish() {
                ctx.sink.event(ServerEvent::Progress { progress });
            }
        };

        let (exit_status, ()) = tokio::join!(session.exec(shell, tx), forward);

        match exit_status? {
            Some(0) => {
                info!("Command '{}' finished", job.kind.name());
                if !quiet {
                    ctx.sink.text(format!(
                        "Command '{}' executed successfully.",
                        job.kind.name()
                    ));
                }
                Ok(())
            }
            code => Err(OrchestratorError::RemoteCommand {
                command: shell.to_string(),
                code,
            }),
        }
    }

    async fn run_push(
        &self,
        target: &SessionConfig,
        ctx: &ClientContext,
        mode: ConnectMode,
    ) -> Result<(), OrchestratorError> {
        let local_root = self.settings.local_root(target.root_folder.as_deref());
        if !local_root.is_dir() {
            return Err(OrchestratorError::LocalPathMissing(local_root));
        }
        ctx.sink
            .text(format!("Using local folder: {}", local_root.display()));

        let mut connection = self.open(target, ctx, mode, false).await?;
        let result = async {
            let session = connection.session()?;
            ctx.sink.text(format!(
                "Starting transfer from {} to {}...",
                local_root.display(),
                target.remote_dir
            ));

            let mkdir = format!("mkdir -p {}", target.remote_dir);
            let created = capture(session, &mkdir).await?;
            if !created.success() {
                return Err(OrchestratorError::RemoteCommand {
                    command: mkdir,
                    code: created.exit_status,
                });
            }

            let local_root = local_root.as_path();
            let report = self
                .with_engine(session, ctx, |engine| async move {
                    engine.push_tree(local_root, &target.remote_dir).await
                })
                .await?;
            ctx.sink.text(summary("Local->Remote synchronization", &report));
            Ok::<_, OrchestratorError>(())
        }
        .await;

        connection.close().await;
        result
    }

    async fn run_fetch(
        &self,
        target: &SessionConfig,
        ctx: &ClientContext,
        mode: ConnectMode,
    ) -> Result<(), OrchestratorError> {
        // Created by the engine once the remote side has answered
        let local_root: PathBuf = self
            .settings
            .results_dir()
            .join(timestamp_dir_name(chrono::Utc::now()));

        let mut connection = self.open(target, ctx, mode, false).await?;
        let result = async {
            let session = connection.session()?;
            ctx.sink.text(format!(
                "Starting transfer from {} to {}...",
                target.remote_dir,
                local_root.display()
            ));
            ctx.sink.text(format!(
                "Searching for results and logs in {}...",
                target.remote_dir
            ));

            let filters = self.settings.pull_filters();
            let (local_root, filters) = (local_root.as_path(), &filters);
            let report = self
                .with_engine(session, ctx, |engine| async move {
                    engine
                        .fetch_results(session, &target.remote_dir, local_root, filters)
                        .await
                })
                .await??;
            ctx.sink.text(summary("Remote->Local transfer", &report));
            Ok::<_, OrchestratorError>(())
        }
        .await;

        connection.close().await;
        result
    }

    /// Run `work` with a transfer engine whose events are forwarded to the
    /// client as status lines. Returns once every event has been sent.
    async fn with_engine<F, Fut, T>(
        &self,
        session: &dyn RemoteSession,
        ctx: &ClientContext,
        work: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnOnce(TransferEngine) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let fs = session.open_fs().await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<TransferEvent>();

        let forward = async {
            while let Some(event) = rx.recv().await {
                ctx.sink.text(event.to_string());
            }
        };

        let (output, ()) = tokio::join!(work(TransferEngine::new(fs, tx)), forward);
        Ok(output)
    }
}

/// Decodes a byte stream chunk by chunk. A multi-byte character split
/// across chunks is held back until its remaining bytes arrive.
#[derive(Default)]
struct Utf8Chunks {
    pending: Vec<u8>,
}

impl Utf8Chunks {
    fn decode(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid);
                        }
                        // Truncated sequence at the end; wait for more bytes
                        None => {
                            self.pending.drain(..valid_up_to);
                            return text;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is still held back once the stream has ended
    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

fn summary(what: &str, report: &TransferReport) -> String {
    if report.is_complete() {
        format!("{} complete ({} files).", what, report.transferred)
    } else {
        format!(
            "{} finished with errors ({} files, {} failed).",
            what,
            report.transferred,
            report.failures.len()
        )
    }
}
