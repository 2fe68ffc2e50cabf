//! Settings types
//!
//! Every field carries a serde default so a partial (or empty) settings file
//! still yields a usable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sftp::PullFilters;
use crate::ssh::ConnectOptions;

/// Current settings format version
pub const SETTINGS_VERSION: u32 = 1;

/// Orchestrator settings, persisted as `settings.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Address the WebSocket control server binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// SSH port of the compute cluster login node
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Private key used when no agent is available
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Keep-alive probe interval, 0 disables probes
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Progress poll interval, 0 disables polling
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,

    /// Local directory holding job folders
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Job folder pushed by `sync` when the client names none
    #[serde(default = "default_root_folder")]
    pub default_root_folder: String,

    /// Where fetched results land; defaults to `<workspace>/result`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_dir: Option<PathBuf>,

    #[serde(default = "default_results_subdir")]
    pub results_subdir: String,

    #[serde(default = "default_log_pattern")]
    pub log_pattern: String,

    /// Where exported job configuration is written; defaults to the settings directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_path: Option<PathBuf>,

    #[serde(default = "default_preprocess_program")]
    pub preprocess_program: String,

    #[serde(default = "default_preprocess_args")]
    pub preprocess_args: Vec<String>,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_listen_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_ssh_port() -> u16 {
    31022
}

fn default_key_path() -> PathBuf {
    PathBuf::from("~/.ssh/id_ed25519")
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive_interval() -> u64 {
    60
}

fn default_progress_interval() -> u64 {
    100
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_root_folder() -> String {
    "offshorewindpark_VentusFlow".to_string()
}

fn default_results_subdir() -> String {
    "VTK".to_string()
}

fn default_log_pattern() -> String {
    "log.*".to_string()
}

fn default_preprocess_program() -> String {
    "python3".to_string()
}

fn default_preprocess_args() -> Vec<String> {
    vec!["process_input.py".to_string()]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            listen_addr: default_listen_addr(),
            ssh_port: default_ssh_port(),
            key_path: default_key_path(),
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            progress_interval_secs: default_progress_interval(),
            workspace_dir: default_workspace_dir(),
            default_root_folder: default_root_folder(),
            results_dir: None,
            results_subdir: default_results_subdir(),
            log_pattern: default_log_pattern(),
            export_path: None,
            preprocess_program: default_preprocess_program(),
            preprocess_args: default_preprocess_args(),
        }
    }
}

impl Settings {
    /// Connection parameters shared by every SSH connection
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            port: self.ssh_port,
            key_path: self.key_path.clone(),
            timeout_secs: self.connect_timeout_secs,
            keepalive_interval_secs: self.keepalive_interval_secs,
        }
    }

    /// `None` when polling is disabled
    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_interval_secs > 0).then(|| Duration::from_secs(self.progress_interval_secs))
    }

    /// Local folder pushed by `sync`
    pub fn local_root(&self, root_folder: Option<&str>) -> PathBuf {
        let folder = root_folder
            .filter(|f| !f.trim().is_empty())
            .unwrap_or(&self.default_root_folder);
        self.workspace_dir.join(folder)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.results_dir
            .clone()
            .unwrap_or_else(|| self.workspace_dir.join("result"))
    }

    /// Export target, resolved against the settings directory when unset
    pub fn export_path(&self, settings_dir: &Path) -> PathBuf {
        self.export_path
            .clone()
            .unwrap_or_else(|| settings_dir.join("simulation_parameters.json"))
    }

    pub fn pull_filters(&self) -> PullFilters {
        PullFilters {
            results_subdir: self.results_subdir.clone(),
            log_pattern: self.log_pattern.clone(),
        }
    }
}
