//! SSH module - connections to the compute cluster
//!
//! This module provides the SSH transport using the russh library.
//!
//! # Features
//! - Agent authentication, falling back to a private key + passphrase
//! - Keyboard-interactive authentication routed to the client
//! - Host key verification via ~/.ssh/known_hosts
//! - Per-connection state machine with passphrase retry (see `manager`)

mod agent;
mod client;
mod config;
mod error;
mod handle_owner;
pub mod known_hosts;
mod manager;
#[cfg(test)]
pub(crate) mod mock;
mod remote;
mod session;

pub use agent::{is_agent_available, SshAgentClient};
pub use client::{ClientHandler, RusshConnector, SshClient};
pub use config::{ConnectOptions, SessionConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use known_hosts::{HostKeyStatus, KnownHosts};
pub use manager::{ConnectMode, Connection, ConnectionManager, ConnectionState};
pub use remote::{
    capture, ExecCapture, ExecOutput, InteractivePrompter, RemoteConnector, RemoteSession,
};
pub use session::SshSession;
