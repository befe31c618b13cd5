//! Trust-on-first-use certificate pinning.
//!
//! The first fingerprint seen for a username is pinned forever. Later
//! presentations are accepted only when they match the pin.

use crate::history::{HistoryError, HistoryStore};
use peerchat_common::{Fingerprint, Username};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Outcome of a [`TrustStore::verify_or_pin`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// No pin existed; the presented fingerprint is now pinned
    FirstUse,
    /// The presented fingerprint matches the pin
    Match,
    /// The presented fingerprint differs from the pin
    Mismatch { pinned: Fingerprint },
}

pub struct TrustStore {
    store: Arc<dyn HistoryStore>,
    /// Serializes check-then-pin so two first contacts cannot both pin
    guard: Mutex<()>,
}

impl TrustStore {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            guard: Mutex::new(()),
        }
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    /// Check `presented` against the pin for `username`, pinning it if there
    /// is none. A pin is never overwritten.
    pub fn verify_or_pin(
        &self,
        username: &Username,
        presented: Fingerprint,
    ) -> Result<TrustDecision, TrustError> {
        let _guard = self.guard.lock().map_err(|_| TrustError::Poisoned)?;

        match self.store.pinned_fingerprint(username)? {
            None => {
                self.store.pin_fingerprint(username, presented)?;
                info!("Pinned {} to {}", username, presented);
                Ok(TrustDecision::FirstUse)
            }
            Some(pinned) if pinned == presented => {
                debug!("Fingerprint for {} matches pin", username);
                Ok(TrustDecision::Match)
            }
            Some(pinned) => {
                warn!(
                    "Fingerprint mismatch for {}: pinned {}, presented {}",
                    username, pinned, presented
                );
                Ok(TrustDecision::Mismatch { pinned })
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("Trust store error: {0}")]
    Store(#[from] HistoryError),

    #[error("Trust store lock poisoned")]
    Poisoned,
}
