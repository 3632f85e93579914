//! Credential file for the session's token pair
//!
//! Holds exactly one credential as JSON. All writes use atomic temp-file +
//! rename to prevent corruption on crash, and a tokio Mutex serializes
//! writes from sign-in, renewal and sign-out.
//!
//! Each save is stamped with `savedAt`. A credential older than the
//! configured max age (30 days by default) loads as absent, so a stale
//! session starts signed out instead of failing its first request.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use session_provider::{BoxFuture, Credential, CredentialPersistence, PersistenceError};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::CREDENTIAL_MAX_AGE;
use crate::error::{Error, Result};

/// On-disk shape: the token pair plus when it was written.
///
/// `saved_at` is a unix timestamp in milliseconds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCredential {
    #[serde(flatten)]
    credential: Credential,
    saved_at: u64,
}

/// File-backed credential persistence.
pub struct CredentialFile {
    path: PathBuf,
    max_age: Duration,
    write_lock: Mutex<()>,
}

impl CredentialFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            max_age: CREDENTIAL_MAX_AGE,
            write_lock: Mutex::new(()),
        }
    }

    /// Override how long a saved credential remains valid.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored credential.
    ///
    /// Returns `None` when the file is missing or the credential has outlived
    /// `max_age`.
    pub async fn read(&self) -> Result<Option<Credential>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no credential file");
            return Ok(None);
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
        let stored: StoredCredential = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;

        let age_millis = now_millis().saturating_sub(stored.saved_at);
        if u128::from(age_millis) > self.max_age.as_millis() {
            info!(
                path = %self.path.display(),
                age_secs = age_millis / 1000,
                "stored credential older than max age, ignoring"
            );
            return Ok(None);
        }

        info!(path = %self.path.display(), "loaded stored credential");
        Ok(Some(stored.credential))
    }

    /// Persist a credential, replacing whatever was stored.
    pub async fn write(&self, credential: &Credential) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let stored = StoredCredential {
            credential: credential.clone(),
            saved_at: now_millis(),
        };
        write_atomic(&self.path, &stored).await
    }

    /// Delete the stored credential. A missing file is not an error.
    pub async fn remove(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "credential file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(format!("removing credential file: {e}"))),
        }
    }
}

impl CredentialPersistence for CredentialFile {
    fn load(&self) -> BoxFuture<'_, std::result::Result<Option<Credential>, PersistenceError>> {
        Box::pin(async move { self.read().await.map_err(PersistenceError::from) })
    }

    fn save<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> BoxFuture<'a, std::result::Result<(), PersistenceError>> {
        Box::pin(async move { self.write(credential).await.map_err(PersistenceError::from) })
    }

    fn clear(&self) -> BoxFuture<'_, std::result::Result<(), PersistenceError>> {
        Box::pin(async move { self.remove().await.map_err(PersistenceError::from) })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Write the credential atomically with 0600 permissions (unix).
async fn write_atomic(path: &Path, data: &StoredCredential) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credential.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential");
    Ok(())
}
