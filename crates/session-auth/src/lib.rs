//! Session authentication library
//!
//! Talks to the upstream's auth endpoints and keeps the credential on disk.
//! Standalone: no dependency on the gateway core, which only sees the
//! `Renewer` and `CredentialPersistence` traits implemented here.
//!
//! Credential flow:
//! 1. `AuthClient::sign_in()` trades email + password for a token pair and the user's roles
//! 2. The gateway stores the pair and attaches the access token to every request
//! 3. On `token.expired` the gateway calls `AuthClient` (as `Renewer`) with the refresh token
//! 4. Every new pair is written through `CredentialFile` (as `CredentialPersistence`)

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::CredentialFile;
pub use error::{Error, Result};
pub use token::{AuthClient, SessionResponse, UserProfile};
