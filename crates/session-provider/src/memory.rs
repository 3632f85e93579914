//! In-memory persistence backend
//!
//! Used when no credential file is configured, and by tests that need to
//! observe what the gateway saved.

use std::sync::Mutex;

use tracing::debug;

use crate::{BoxFuture, Credential, CredentialPersistence, PersistenceError};

/// Keeps the credential in process memory only.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    slot: Mutex<Option<Credential>>,
    saves: Mutex<usize>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a credential already stored.
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            slot: Mutex::new(Some(credential)),
            saves: Mutex::new(0),
        }
    }

    /// Currently stored credential.
    pub fn stored(&self) -> Option<Credential> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// How many times `save` has been called.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CredentialPersistence for MemoryPersistence {
    fn load(&self) -> BoxFuture<'_, Result<Option<Credential>, PersistenceError>> {
        let stored = self.stored();
        Box::pin(async move { Ok(stored) })
    }

    fn save<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Result<(), PersistenceError>> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(credential.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        debug!("credential saved in memory");
        Box::pin(async { Ok(()) })
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), PersistenceError>> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        debug!("in-memory credential cleared");
        Box::pin(async { Ok(()) })
    }
}
