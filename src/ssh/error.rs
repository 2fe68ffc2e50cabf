//! SSH Error types

use thiserror::Error;

use crate::auth::{AuthError, KeyError};

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The private key is encrypted and no passphrase was supplied
    #[error("Private key requires a passphrase")]
    PassphraseRequired,

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("SSH Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH Agent error: {0}")]
    AgentError(String),

    #[error("Authentication cancelled by user")]
    Cancelled,
}

impl SshError {
    /// Errors that are resolved by asking the user for a (new) passphrase
    pub fn needs_passphrase(&self) -> bool {
        matches!(
            self,
            SshError::PassphraseRequired | SshError::AuthenticationFailed(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect
            | russh::Error::HUP
            | russh::Error::ConnectionTimeout
            | russh::Error::KeepaliveTimeout
            | russh::Error::InactivityTimeout
            | russh::Error::SendError
            | russh::Error::RecvError
            | russh::Error::IO(_) => SshError::ConnectionFailed(err.to_string()),
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl From<KeyError> for SshError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::PassphraseRequired => SshError::PassphraseRequired,
            KeyError::InvalidPassphrase => {
                SshError::AuthenticationFailed("Invalid key passphrase".to_string())
            }
            other => SshError::KeyError(other.to_string()),
        }
    }
}

impl From<AuthError> for SshError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Cancelled | AuthError::ClientGone => SshError::Cancelled,
            other => SshError::AuthenticationFailed(other.to_string()),
        }
    }
}

impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
