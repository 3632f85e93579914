//! Seams between the session gateway core and its collaborators
//!
//! The gateway never talks to a renewal endpoint, a credential file, or the
//! surrounding application directly. It holds trait objects for each:
//! - `Renewer` exchanges a refresh token for a fresh credential pair
//! - `CredentialPersistence` loads the credential at startup and saves every replacement
//! - `SessionInvalidation` tears the session down when the server rejects a credential outright
//!
//! Traits return `Pin<Box<dyn Future>>` so they stay dyn-compatible (`Arc<dyn Renewer>`).

pub mod memory;

pub use memory::MemoryPersistence;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the seam traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An access/refresh token pair.
///
/// Serialized with the server's field names (`token`, `refreshToken`) so the
/// same type reads sign-in and renewal responses and the persisted file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "token")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// `Authorization` header value for this credential.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

/// Why a renewal did not produce a credential.
///
/// Cloneable because one renewal outcome is broadcast to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenewalError {
    #[error("renewal request failed: {0}")]
    Transport(String),

    /// The endpoint refused the refresh token (401/403).
    #[error("refresh token rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("renewal endpoint returned {status}: {message}")]
    Endpoint { status: u16, message: String },

    #[error("invalid renewal response: {0}")]
    InvalidResponse(String),

    #[error("no credential available to renew")]
    NoCredential,

    /// The leader was dropped before the renewal settled.
    #[error("renewal abandoned before completion")]
    Abandoned,

    /// A follower gave up waiting on the in-flight renewal.
    #[error("timed out waiting for in-flight renewal")]
    TimedOut,
}

impl RenewalError {
    /// True when the renewal endpoint itself refused the refresh token.
    pub fn is_rejection(&self) -> bool {
        matches!(self, RenewalError::Rejected { .. })
    }
}

/// Whether a failed renewal also ends the session.
///
/// `KeepSession` leaves the credential in place and only fails the waiting
/// requests. The other two run the invalidation hook once per failed renewal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalFailurePolicy {
    #[default]
    KeepSession,
    SignOutOnRejection,
    SignOut,
}

impl RenewalFailurePolicy {
    pub fn should_sign_out(&self, error: &RenewalError) -> bool {
        match self {
            RenewalFailurePolicy::KeepSession => false,
            RenewalFailurePolicy::SignOutOnRejection => error.is_rejection(),
            // Abandoned/TimedOut never reach the policy; they are not endpoint outcomes.
            RenewalFailurePolicy::SignOut => true,
        }
    }
}

/// Exchanges a refresh token for a new credential pair.
pub trait Renewer: Send + Sync {
    /// Identifier for logging (e.g. "http")
    fn id(&self) -> &str;

    fn renew<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<Credential, RenewalError>>;
}

/// Application callback run when the credential can no longer be used.
///
/// Implemented for any `Fn() + Send + Sync` closure.
pub trait SessionInvalidation: Send + Sync {
    fn on_unrecoverable(&self);
}

impl<F> SessionInvalidation for F
where
    F: Fn() + Send + Sync,
{
    fn on_unrecoverable(&self) {
        self()
    }
}

/// Errors from a persistence backend.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential parse error: {0}")]
    Parse(String),
}

/// Durable home of the credential between process restarts.
pub trait CredentialPersistence: Send + Sync {
    /// Read the stored credential, if any is present and still valid.
    fn load(&self) -> BoxFuture<'_, Result<Option<Credential>, PersistenceError>>;

    fn save<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Result<(), PersistenceError>>;

    fn clear(&self) -> BoxFuture<'_, Result<(), PersistenceError>>;
}
