//! Host key verification against an OpenSSH `known_hosts` file
//!
//! Unknown hosts are learned on first contact; a key that differs from the
//! recorded one for the same algorithm is rejected.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use tracing::{debug, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyStatus {
    Verified,
    Unknown { fingerprint: String },
    Changed { expected: String, actual: String },
}

pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    /// `~/.ssh/known_hosts`
    pub fn user_default() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"));
        Self { path }
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Host pattern as OpenSSH writes it: bare for port 22, `[host]:port` otherwise
    fn host_pattern(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    pub fn fingerprint(key: &PublicKey) -> String {
        key.fingerprint(HashAlg::Sha256).to_string()
    }

    /// Recorded keys for `host:port`; hashed entries are skipped
    fn recorded_keys(&self, host: &str, port: u16) -> Vec<PublicKey> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        let pattern = Self::host_pattern(host, port);

        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let (hosts, key) = line.split_once(char::is_whitespace)?;
                let matches = hosts
                    .split(',')
                    .any(|h| !h.starts_with('|') && h.to_lowercase() == pattern);
                if !matches {
                    return None;
                }
                match PublicKey::from_openssh(key.trim()) {
                    Ok(k) => Some(k),
                    Err(e) => {
                        debug!("Skipping unparsable known_hosts entry for {}: {}", pattern, e);
                        None
                    }
                }
            })
            .collect()
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        let recorded = self.recorded_keys(host, port);
        let same_algorithm: Vec<&PublicKey> = recorded
            .iter()
            .filter(|k| k.algorithm() == key.algorithm())
            .collect();

        if same_algorithm.iter().any(|k| k.key_data() == key.key_data()) {
            return HostKeyStatus::Verified;
        }

        match same_algorithm.first() {
            Some(expected) => HostKeyStatus::Changed {
                expected: Self::fingerprint(expected),
                actual: Self::fingerprint(key),
            },
            None => HostKeyStatus::Unknown {
                fingerprint: Self::fingerprint(key),
            },
        }
    }

    /// Append `key` for `host:port`
    pub fn learn(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut entry_key = key.clone();
        entry_key.set_comment("");
        let encoded = entry_key
            .to_openssh()
            .map_err(|e| SshError::KeyError(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {}", Self::host_pattern(host, port), encoded.trim())?;

        Ok(())
    }

    /// Full verification policy used during the handshake
    pub fn check_and_learn(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        match self.verify(host, port, key) {
            HostKeyStatus::Verified => {
                debug!("Host key verified for {}:{}", host, port);
                Ok(())
            }
            HostKeyStatus::Unknown { fingerprint } => {
                tracing::info!(
                    "New host {}:{}, adding to known_hosts (fingerprint: {})",
                    host, port, fingerprint
                );
                if let Err(e) = self.learn(host, port, key) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(())
            }
            HostKeyStatus::Changed { expected, actual } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    host, port, expected, actual
                );
                Err(SshError::ConnectionFailed(format!(
                    "Host key verification failed: key for {}:{} has changed \
                     (expected {}, got {}). If the change is legitimate, remove the \
                     old entry from known_hosts",
                    host, port, expected, actual
                )))
            }
        }
    }
}
