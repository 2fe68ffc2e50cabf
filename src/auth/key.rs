//! Private key loading
//!
//! Handles OpenSSH and PEM private keys, encrypted or not. Whether a key is
//! encrypted is only known after trying to decode it without a passphrase.

use russh::keys::PrivateKey;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read key file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse key: {0}")]
    ParseError(String),

    #[error("Encrypted key requires passphrase")]
    PassphraseRequired,

    #[error("Invalid passphrase")]
    InvalidPassphrase,
}

/// Load a private key off the async runtime
pub async fn load_private_key_async(
    path: &Path,
    passphrase: Option<&str>,
) -> Result<PrivateKey, KeyError> {
    let path = expand_tilde(path);
    let passphrase = passphrase.map(|p| zeroize::Zeroizing::new(p.to_string()));

    tokio::task::spawn_blocking(move || {
        load_private_key(&path, passphrase.as_ref().map(|p| p.as_str()))
    })
    .await
    .map_err(|e| KeyError::ParseError(format!("Task join error: {}", e)))?
}

pub fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<PrivateKey, KeyError> {
    let path = expand_tilde(path);
    if !path.exists() {
        return Err(KeyError::NotFound(path));
    }

    debug!("Loading key from: {:?}", path);
    let key_data = std::fs::read_to_string(&path)?;
    decode_private_key(&key_data, passphrase)
}

/// Decode key text, mapping decoder failures onto the passphrase cases
pub fn decode_private_key(key_data: &str, passphrase: Option<&str>) -> Result<PrivateKey, KeyError> {
    // Legacy PEM keys announce encryption in their headers
    let pem_encrypted = key_data.contains("ENCRYPTED");
    if pem_encrypted && passphrase.is_none() {
        return Err(KeyError::PassphraseRequired);
    }

    russh::keys::decode_secret_key(key_data, passphrase).map_err(|e| {
        let message = e.to_string().to_lowercase();
        match passphrase {
            None if message.contains("encrypted") => KeyError::PassphraseRequired,
            Some(_)
                if message.contains("decrypt")
                    || message.contains("password")
                    || message.contains("passphrase")
                    || message.contains("crypto") =>
            {
                KeyError::InvalidPassphrase
            }
            _ => KeyError::ParseError(e.to_string()),
        }
    })
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    path.to_path_buf()
}
