//! Sign-in and token renewal against the upstream's auth endpoints
//!
//! Both calls POST JSON to the upstream base URL and read back a token pair:
//! 1. Sign-in (`/sessions`): email + password, also returns roles/permissions
//! 2. Renewal (`/refresh`): refresh token, exposed to the gateway as a `Renewer`
//!
//! Renewal goes out on a plain client, never through the gateway's
//! dispatcher, so a rejected renewal can't re-enter the expiry path.

use serde::{Deserialize, Serialize};
use session_provider::{BoxFuture, Credential, RenewalError, Renewer};
use tracing::{debug, info, warn};

use crate::constants::{REFRESH_PATH, SIGN_IN_PATH};
use crate::error::{Error, Result};

/// Sign-in response: the token pair plus the user's authorization attributes.
#[derive(Debug, Deserialize, Serialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub credential: Credential,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// The signed-in user as reported by the profile endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserProfile {
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Serialize)]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Client for the upstream's sign-in and renewal endpoints.
#[derive(Clone)]
pub struct AuthClient {
    client: reqwest::Client,
    base_url: String,
    sign_in_path: String,
    refresh_path: String,
}

impl AuthClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sign_in_path: SIGN_IN_PATH.to_string(),
            refresh_path: REFRESH_PATH.to_string(),
        }
    }

    /// Override the sign-in and renewal paths.
    pub fn with_paths(mut self, sign_in_path: &str, refresh_path: &str) -> Self {
        self.sign_in_path = sign_in_path.to_string();
        self.refresh_path = refresh_path.to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Exchange email + password for a session.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SessionResponse> {
        let response = self
            .client
            .post(self.url(&self.sign_in_path))
            .json(&SignInRequest { email, password })
            .send()
            .await
            .map_err(|e| Error::Http(format!("sign-in request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::InvalidCredentials(format!(
                    "sign-in rejected ({status}): {body}"
                )));
            }
            return Err(Error::Endpoint(format!("sign-in returned {status}: {body}")));
        }

        let session = response
            .json::<SessionResponse>()
            .await
            .map_err(|e| Error::InvalidResponse(format!("invalid sign-in response: {e}")))?;

        info!(
            roles = session.roles.len(),
            permissions = session.permissions.len(),
            "signed in"
        );
        Ok(session)
    }

    /// Exchange a refresh token for a new token pair.
    pub async fn refresh(&self, refresh_token: &str) -> std::result::Result<Credential, RenewalError> {
        debug!(path = %self.refresh_path, "requesting token renewal");
        let response = self
            .client
            .post(self.url(&self.refresh_path))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RenewalError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            warn!(status = status.as_u16(), "renewal endpoint refused request");

            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(RenewalError::Rejected {
                    status: status.as_u16(),
                    message: body,
                });
            }
            return Err(RenewalError::Endpoint {
                status: status.as_u16(),
                message: body,
            });
        }

        let credential = response
            .json::<Credential>()
            .await
            .map_err(|e| RenewalError::InvalidResponse(e.to_string()))?;

        if credential.access_token.is_empty() {
            return Err(RenewalError::InvalidResponse(
                "renewal response has an empty token".into(),
            ));
        }
        Ok(credential)
    }
}

impl Renewer for AuthClient {
    fn id(&self) -> &str {
        "http"
    }

    fn renew<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, std::result::Result<Credential, RenewalError>> {
        Box::pin(self.refresh(refresh_token))
    }
}
