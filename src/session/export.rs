//! Export flow: persist the job configuration, run the preprocessor, then
//! validate the SSH target.

use std::path::Path;
use std::process::Stdio;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use super::ClientContext;
use crate::config::Settings;
use crate::error::OrchestratorError;
use crate::protocol::ClientSink;
use crate::ssh::SessionConfig;
use crate::state::AppState;

pub async fn run_export(
    state: &AppState,
    ctx: &ClientContext,
    payload: &Value,
    target: Option<&SessionConfig>,
) -> Result<(), OrchestratorError> {
    if target.is_none() {
        ctx.sink.text("Error: User or host not specified!");
    }

    let path = state.settings.export_path(&state.settings_dir);
    if let Err(e) = write_payload(&path, payload).await {
        warn!("Failed to save export to {}: {}", path.display(), e);
        ctx.sink.text(format!("Error saving: {}", e));
        return Ok(());
    }
    ctx.sink.text("Simulation data saved successfully.");

    match run_preprocessor(&state.settings, &path, &ctx.sink).await {
        Ok(true) => ctx.sink.text("Preprocessing completed successfully."),
        Ok(false) => {}
        Err(e) => {
            warn!("Preprocessor could not be started: {}", e);
            ctx.sink.text(format!(
                "Error: could not start preprocessing ({}): {}",
                state.settings.preprocess_program, e
            ));
        }
    }

    if let Some(target) = target {
        state.validate_connection(target, ctx).await?;
        ctx.sink.text("Export completed and SSH configuration saved.");
    }

    Ok(())
}

/// Write the payload as pretty-printed JSON, creating parent directories
pub async fn write_payload(path: &Path, payload: &Value) -> Result<(), OrchestratorError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(payload)
        .map_err(|e| OrchestratorError::Export(e.to_string()))?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

/// Run the preprocessor on `input`, forwarding its output line by line.
/// Returns whether it exited successfully; a failing exit is reported to
/// the client here.
pub async fn run_preprocessor(
    settings: &Settings,
    input: &Path,
    sink: &ClientSink,
) -> std::io::Result<bool> {
    info!(
        "Running preprocessor {} {:?} on {}",
        settings.preprocess_program,
        settings.preprocess_args,
        input.display()
    );

    let mut child = Command::new(&settings.preprocess_program)
        .args(&settings.preprocess_args)
        .arg(input)
        .current_dir(&settings.workspace_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::join!(
        forward_lines(stdout, sink, ""),
        forward_lines(stderr, sink, "Error: "),
    );

    let status = child.wait().await?;
    if !status.success() {
        match status.code() {
            Some(code) => sink.text(format!("Error: preprocessing exited with code {}", code)),
            None => sink.text("Error: preprocessing was terminated by a signal"),
        }
    }
    Ok(status.success())
}

async fn forward_lines<R>(stream: Option<R>, sink: &ClientSink, prefix: &str)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else { return };
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink.text(format!("{}{}", prefix, line));
    }
}
