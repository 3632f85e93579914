//! Authenticated HTTP gateway with single-flight token renewal
//!
//! Sends requests to an upstream API with the current bearer token and
//! recovers from expired access tokens without involving the caller:
//! 1. `Dispatcher` sends the request with the `CredentialStore`'s token
//! 2. Upstream answers 401 `token.expired` → `RefreshCoordinator` renews
//! 3. Concurrent expired requests park on a `WaiterQueue` behind one renewal
//! 4. Every parked request is retried once with the new token
//!
//! Any other 401 means the session is unrecoverable: the application's
//! `SessionInvalidation` hook runs and the request fails. Non-401 errors are
//! returned untouched.

pub mod classify;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod store;
pub mod waiters;

#[cfg(test)]
mod test_support;

pub use classify::{ResponseClass, TOKEN_EXPIRED_CODE, classify};
pub use coordinator::{CoordinatorConfig, CoordinatorStats, RefreshCoordinator};
pub use dispatcher::{ApiResponse, Dispatcher, DispatcherConfig, RequestSpec};
pub use error::{Error, Result};
pub use store::CredentialStore;
pub use waiters::{Outcome, PendingRequest, Settlement, WaiterQueue};
