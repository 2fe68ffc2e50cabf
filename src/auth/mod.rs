//! Credentials: the passphrase cache, private key loading and the
//! passphrase round-trip with the client.

pub mod credential;
pub mod key;
pub mod negotiator;

pub use credential::CredentialStore;
pub use key::{expand_tilde, load_private_key, load_private_key_async, KeyError};
pub use negotiator::{AuthError, PassphraseNegotiator, RespondOutcome};
