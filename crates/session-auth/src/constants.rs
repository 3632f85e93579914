//! Default endpoint paths and credential lifetime
//!
//! Paths are relative to the upstream base URL and can be overridden per
//! deployment through `AuthClient::with_paths`.

use std::time::Duration;

/// Sign-in endpoint: `{email, password}` in, token pair plus roles/permissions out
pub const SIGN_IN_PATH: &str = "/sessions";

/// Renewal endpoint: `{refreshToken}` in, token pair out
pub const REFRESH_PATH: &str = "/refresh";

/// Current user's profile
pub const PROFILE_PATH: &str = "/me";

/// How long a persisted credential stays loadable after it was saved.
pub const CREDENTIAL_MAX_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 30);
