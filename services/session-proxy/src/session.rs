//! Session API: sign in, inspect and sign out of the proxy's upstream session
//!
//! Endpoints:
//! - POST   /session: trade `{email, password}` for a token pair, remember the user
//! - GET    /session: `{authenticated, user}`, fetching the profile on demand
//! - DELETE /session: sign out through the invalidation hook
//!
//! The same `SignOut` hook runs when the upstream rejects the credential
//! outright, so an unrecoverable 401 on any proxied request also ends the
//! session here.

use std::sync::{Arc, PoisonError, RwLock};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use session_auth::{AuthClient, UserProfile};
use session_gateway::{CredentialStore, Dispatcher, RequestSpec};
use session_provider::SessionInvalidation;
use tracing::{info, warn};

use crate::error::Error;

/// The signed-in user, shared between the session and its sign-out hook.
#[derive(Clone, Default)]
pub struct ProfileCache(Arc<RwLock<Option<UserProfile>>>);

impl ProfileCache {
    pub fn get(&self) -> Option<UserProfile> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, profile: UserProfile) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(profile);
    }

    pub fn clear(&self) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Invalidation hook: forget the credential and the user, then remove the
/// persisted credential in the background.
pub struct SignOut {
    store: Arc<CredentialStore>,
    profile: ProfileCache,
}

impl SignOut {
    pub fn new(store: Arc<CredentialStore>, profile: ProfileCache) -> Self {
        Self { store, profile }
    }
}

impl SessionInvalidation for SignOut {
    fn on_unrecoverable(&self) {
        let had_session = self.store.forget().is_some();
        self.profile.clear();
        if had_session {
            info!("signed out");
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move { store.clear_persisted().await });
            }
            Err(_) => warn!("no runtime available, persisted credential left in place"),
        }
    }
}

/// Sign-in, profile and sign-out on top of the dispatcher.
pub struct Session {
    auth: AuthClient,
    dispatcher: Arc<Dispatcher>,
    profile: ProfileCache,
    profile_path: String,
}

impl Session {
    pub fn new(
        auth: AuthClient,
        dispatcher: Arc<Dispatcher>,
        profile: ProfileCache,
        profile_path: impl Into<String>,
    ) -> Self {
        Self {
            auth,
            dispatcher,
            profile,
            profile_path: profile_path.into(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Sign in and make the returned credential current.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserProfile, Error> {
        let session = self.auth.sign_in(email, password).await?;
        self.dispatcher.store().replace(session.credential).await;

        let profile = UserProfile {
            email: email.to_string(),
            roles: session.roles,
            permissions: session.permissions,
        };
        self.profile.set(profile.clone());
        info!(roles = profile.roles.len(), "session established");
        Ok(profile)
    }

    /// The signed-in user, loaded from the profile endpoint on first use.
    pub async fn profile(&self) -> Result<Option<UserProfile>, Error> {
        if !self.dispatcher.store().is_authenticated() {
            return Ok(None);
        }
        if let Some(profile) = self.profile.get() {
            return Ok(Some(profile));
        }

        let response = self
            .dispatcher
            .send(RequestSpec::get(self.profile_path.as_str()))
            .await?;
        let profile: UserProfile = response.json()?;
        self.profile.set(profile.clone());
        Ok(Some(profile))
    }

    /// End the session the same way an unrecoverable 401 does.
    pub async fn sign_out(&self) {
        self.dispatcher.coordinator().invalidate_session("sign_out");
        // The hook clears persistence in the background; finish it before
        // replying. The store drops whichever clear arrives after a new sign-in.
        self.dispatcher.store().clear_persisted().await;
    }
}

#[derive(Deserialize)]
struct SignInRequest {
    email: String,
    password: String,
}

/// Build the session router.
pub fn build_session_router(session: Arc<Session>) -> Router {
    Router::new()
        .route(
            "/session",
            get(session_status).post(sign_in).delete(sign_out),
        )
        .with_state(session)
}

fn request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// POST /session: sign in. Never echoes tokens back.
async fn sign_in(
    State(session): State<Arc<Session>>,
    body: Result<axum::Json<SignInRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let axum::Json(body) = match body {
        Ok(body) => body,
        Err(e) => {
            return Error::InvalidRequest(e.body_text()).into_response_with_id(&request_id());
        }
    };

    match session.sign_in(&body.email, &body.password).await {
        Ok(profile) => (StatusCode::OK, axum::Json(profile)).into_response(),
        Err(e) => {
            warn!(error = %e, "sign-in failed");
            e.into_response_with_id(&request_id())
        }
    }
}

/// GET /session: whether a session exists and who it belongs to.
async fn session_status(State(session): State<Arc<Session>>) -> Response {
    match session.profile().await {
        Ok(user) => axum::Json(serde_json::json!({
            "authenticated": user.is_some(),
            "user": user,
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "failed to load profile");
            e.into_response_with_id(&request_id())
        }
    }
}

/// DELETE /session: sign out.
async fn sign_out(State(session): State<Arc<Session>>) -> StatusCode {
    session.sign_out().await;
    StatusCode::NO_CONTENT
}
