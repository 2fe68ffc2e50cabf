//! Process-lifetime passphrase cache
//!
//! Holds the last passphrase that unlocked a connection. It lives only in
//! memory, is zeroed on drop, and is cleared on any authentication failure.

use parking_lot::Mutex;
use zeroize::Zeroizing;

#[derive(Default)]
pub struct CredentialStore {
    passphrase: Mutex<Option<Zeroizing<String>>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self) -> Option<String> {
        self.passphrase.lock().as_ref().map(|p| p.as_str().to_owned())
    }

    /// Replace any previously cached value
    pub fn store(&self, passphrase: String) {
        *self.passphrase.lock() = Some(Zeroizing::new(passphrase));
    }

    pub fn clear(&self) {
        if self.passphrase.lock().take().is_some() {
            tracing::debug!("Cached passphrase cleared");
        }
    }

    pub fn is_cached(&self) -> bool {
        self.passphrase.lock().is_some()
    }
}
