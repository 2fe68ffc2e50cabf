//! SSH target and connection parameters

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The job target a client session operates on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Cluster login user
    pub user: String,

    /// Cluster login host
    pub host: String,

    /// Job directory on the cluster
    #[serde(default)]
    pub remote_dir: String,

    /// Local job folder pushed by `sync`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_folder: Option<String>,
}

impl SessionConfig {
    pub fn new(user: impl Into<String>, host: impl Into<String>, remote_dir: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            remote_dir: remote_dir.into(),
            root_folder: None,
        }
    }

    pub fn with_root_folder(mut self, root_folder: Option<String>) -> Self {
        self.root_folder = root_folder.filter(|f| !f.trim().is_empty());
        self
    }

    /// `user@host`
    pub fn display_target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Same login endpoint and job directory
    pub fn same_target(&self, other: &SessionConfig) -> bool {
        self.user == other.user && self.host == other.host && self.remote_dir == other.remote_dir
    }
}

/// Parameters shared by every connection the orchestrator opens
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub port: u16,
    pub key_path: PathBuf,
    pub timeout_secs: u64,
    /// 0 disables keep-alive probes
    pub keepalive_interval_secs: u64,
}

impl ConnectOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            port: 31022,
            key_path: PathBuf::from("~/.ssh/id_ed25519"),
            timeout_secs: 30,
            keepalive_interval_secs: 60,
        }
    }
}
