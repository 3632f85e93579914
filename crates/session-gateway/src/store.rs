//! Credential store: the single live credential for the gateway
//!
//! Readers take an `Arc<Credential>` snapshot, so a request always carries a
//! consistent token pair even if a renewal swaps the credential a moment
//! later. Writers replace the whole snapshot and never mutate it in place.
//!
//! The lock is a std `RwLock` held only for the pointer swap, never across
//! an `.await`. Persistence happens after the swap and its failures are
//! logged: the in-memory credential is authoritative for this process.
//!
//! Writes to persistence are serialized and re-checked against memory once
//! they hold the persistence lock. A save only lands if its snapshot is still
//! current, a clear only if the store is still empty, so persistence ends up
//! matching the latest in-memory state whatever order the writers finish in.

use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use session_provider::{Credential, CredentialPersistence};
use tracing::{debug, info, warn};

pub struct CredentialStore {
    current: RwLock<Option<Arc<Credential>>>,
    persistence: Arc<dyn CredentialPersistence>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl CredentialStore {
    /// Empty store (signed out).
    pub fn new(persistence: Arc<dyn CredentialPersistence>) -> Self {
        Self::from_parts(None, persistence)
    }

    /// Store seeded with a credential, without writing it back.
    pub fn with_credential(credential: Credential, persistence: Arc<dyn CredentialPersistence>) -> Self {
        Self::from_parts(Some(Arc::new(credential)), persistence)
    }

    /// Read the persisted credential once, at startup.
    ///
    /// A backend error starts the store empty rather than failing startup.
    pub async fn load(persistence: Arc<dyn CredentialPersistence>) -> Self {
        let initial = match persistence.load().await {
            Ok(Some(credential)) => {
                info!("restored persisted credential");
                Some(Arc::new(credential))
            }
            Ok(None) => {
                info!("no persisted credential, starting signed out");
                None
            }
            Err(e) => {
                warn!(error = %e, "failed to load persisted credential, starting signed out");
                None
            }
        };
        Self::from_parts(initial, persistence)
    }

    fn from_parts(initial: Option<Arc<Credential>>, persistence: Arc<dyn CredentialPersistence>) -> Self {
        Self {
            current: RwLock::new(initial),
            persistence,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current credential snapshot.
    pub fn current(&self) -> Option<Arc<Credential>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current().is_some()
    }

    /// Swap in a new credential, then write it through to persistence.
    ///
    /// Returns the snapshot that is now current.
    pub async fn replace(&self, credential: Credential) -> Arc<Credential> {
        let snapshot = Arc::new(credential);
        *self.write() = Some(snapshot.clone());
        debug!("credential replaced");

        self.persist(&snapshot).await;
        snapshot
    }

    /// Swap in `credential` only while `expected` is still the current
    /// snapshot, then write it through.
    ///
    /// Returns `None`, touching nothing, if the store was cleared or replaced
    /// since `expected` was read.
    pub async fn replace_if_current(
        &self,
        expected: &Arc<Credential>,
        credential: Credential,
    ) -> Option<Arc<Credential>> {
        let snapshot = {
            let mut current = self.write();
            if !current.as_ref().is_some_and(|c| Arc::ptr_eq(c, expected)) {
                return None;
            }
            let snapshot = Arc::new(credential);
            *current = Some(snapshot.clone());
            snapshot
        };
        debug!("credential replaced");

        self.persist(&snapshot).await;
        Some(snapshot)
    }

    /// Drop the in-memory credential without touching persistence.
    ///
    /// For callers that can't await (the invalidation hook); pair with
    /// `clear_persisted`.
    pub fn forget(&self) -> Option<Arc<Credential>> {
        self.write().take()
    }

    /// Remove the persisted credential, unless a new one was stored since
    /// the in-memory credential was dropped.
    pub async fn clear_persisted(&self) {
        let _persisting = self.persist_lock.lock().await;
        if self.is_authenticated() {
            debug!("signed in again since sign-out, keeping persisted credential");
            return;
        }
        if let Err(e) = self.persistence.clear().await {
            warn!(error = %e, "failed to clear persisted credential");
        }
    }

    /// Sign out: forget the credential and remove it from persistence.
    pub async fn clear(&self) {
        if self.forget().is_some() {
            info!("credential cleared");
        }
        self.clear_persisted().await;
    }

    async fn persist(&self, snapshot: &Arc<Credential>) {
        let _persisting = self.persist_lock.lock().await;
        let still_current = self
            .current()
            .is_some_and(|current| Arc::ptr_eq(&current, snapshot));
        if !still_current {
            debug!("credential superseded before it was persisted");
            return;
        }
        if let Err(e) = self.persistence.save(snapshot).await {
            warn!(error = %e, "failed to persist credential");
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Arc<Credential>>> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }
}
