//! Single-flight credential renewal
//!
//! The coordinator is either `Idle` or `InFlight` with a queue of waiters.
//! The first caller to find it idle becomes the leader: it flips the state
//! to in-flight and calls the renewer. Callers arriving while a renewal is
//! in flight become followers and park on the queue. The state check and
//! the transition (or the enqueue) happen under one lock, so two callers
//! can never both lead.
//!
//! When the renewal settles the leader:
//! 1. replaces the credential in the store (on success), unless the session
//!    was signed out or replaced while the renewal ran; then the waiters get
//!    whatever the store holds now
//! 2. runs the invalidation hook if the failure policy asks for it
//! 3. returns the state to `Idle` and settles every waiter in enqueue order
//!
//! The lock is never held across an `.await`. If the leader's future is
//! dropped mid-renewal, a guard settles the waiters with `Abandoned` so the
//! state can't stay in-flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use session_provider::{Credential, RenewalError, RenewalFailurePolicy, Renewer, SessionInvalidation};
use tracing::{debug, info, warn};

use crate::store::CredentialStore;
use crate::waiters::{Outcome, PendingRequest, WaiterQueue};

/// Coordinator behavior knobs.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub policy: RenewalFailurePolicy,
    /// Longest a follower waits on someone else's renewal. `None` waits as
    /// long as the leader takes.
    pub follower_timeout: Option<Duration>,
}

#[derive(Debug)]
enum RefreshState {
    Idle,
    InFlight(WaiterQueue),
}

enum Role {
    Leader(Arc<Credential>),
    Follower(PendingRequest),
    /// The rejected token was already superseded.
    Fresh(Arc<Credential>),
}

/// Point-in-time counters, exposed on the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub renewals_started: u64,
    pub renewals_succeeded: u64,
    pub renewals_failed: u64,
    pub renewals_abandoned: u64,
    /// Renewals whose result was dropped because the session changed meanwhile.
    pub renewals_discarded: u64,
    pub waiters_enqueued: u64,
    pub waiters_resolved: u64,
    pub waiters_timed_out: u64,
    pub superseded_rejections: u64,
    pub invalidations: u64,
}

#[derive(Default)]
struct Counters {
    renewals_started: AtomicU64,
    renewals_succeeded: AtomicU64,
    renewals_failed: AtomicU64,
    renewals_abandoned: AtomicU64,
    renewals_discarded: AtomicU64,
    waiters_enqueued: AtomicU64,
    waiters_resolved: AtomicU64,
    waiters_timed_out: AtomicU64,
    superseded_rejections: AtomicU64,
    invalidations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CoordinatorStats {
        CoordinatorStats {
            renewals_started: self.renewals_started.load(Ordering::Relaxed),
            renewals_succeeded: self.renewals_succeeded.load(Ordering::Relaxed),
            renewals_failed: self.renewals_failed.load(Ordering::Relaxed),
            renewals_abandoned: self.renewals_abandoned.load(Ordering::Relaxed),
            renewals_discarded: self.renewals_discarded.load(Ordering::Relaxed),
            waiters_enqueued: self.waiters_enqueued.load(Ordering::Relaxed),
            waiters_resolved: self.waiters_resolved.load(Ordering::Relaxed),
            waiters_timed_out: self.waiters_timed_out.load(Ordering::Relaxed),
            superseded_rejections: self.superseded_rejections.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    store: Arc<CredentialStore>,
    renewer: Arc<dyn Renewer>,
    hook: Arc<dyn SessionInvalidation>,
    config: CoordinatorConfig,
    counters: Counters,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        renewer: Arc<dyn Renewer>,
        hook: Arc<dyn SessionInvalidation>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            state: Mutex::new(RefreshState::Idle),
            store,
            renewer,
            hook,
            config,
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock_state(), RefreshState::InFlight(_))
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.counters.snapshot()
    }

    /// Renew the credential, or join the renewal already in flight.
    pub async fn refresh_or_wait(&self) -> Outcome {
        self.refresh(None).await
    }

    /// Renew after the server rejected `rejected_access_token` as expired.
    ///
    /// If no renewal is in flight and the store already holds a different
    /// access token, a renewal finished after that request went out: the
    /// current credential is returned without renewing again.
    pub async fn refresh_after_rejection(&self, rejected_access_token: &str) -> Outcome {
        self.refresh(Some(rejected_access_token)).await
    }

    /// Run the application's invalidation hook.
    pub fn invalidate_session(&self, reason: &'static str) {
        warn!(reason, "session is unrecoverable, invalidating");
        Counters::bump(&self.counters.invalidations);
        metrics::counter!("session_invalidations_total", "reason" => reason).increment(1);
        self.hook.on_unrecoverable();
    }

    async fn refresh(&self, rejected: Option<&str>) -> Outcome {
        let role = {
            let mut state = self.lock_state();
            match &mut *state {
                RefreshState::InFlight(queue) => Role::Follower(queue.enqueue()),
                RefreshState::Idle => match self.store.current() {
                    None => return Err(RenewalError::NoCredential),
                    Some(current) if rejected.is_some_and(|r| r != current.access_token) => {
                        Role::Fresh(current)
                    }
                    Some(current) => {
                        *state = RefreshState::InFlight(WaiterQueue::new());
                        Role::Leader(current)
                    }
                },
            }
        };

        match role {
            Role::Leader(credential) => self.lead(credential).await,
            Role::Follower(pending) => self.follow(pending).await,
            Role::Fresh(credential) => {
                Counters::bump(&self.counters.superseded_rejections);
                debug!("rejected token already superseded, skipping renewal");
                Ok(credential)
            }
        }
    }

    async fn lead(&self, credential: Arc<Credential>) -> Outcome {
        let mut guard = InFlightGuard {
            coordinator: self,
            armed: true,
        };
        Counters::bump(&self.counters.renewals_started);
        info!(renewer = self.renewer.id(), "renewing credential");

        let renewed = self.renewer.renew(&credential.refresh_token).await;
        let (outcome, superseded) = match renewed {
            Ok(fresh) => match self.store.replace_if_current(&credential, fresh).await {
                Some(stored) => (Ok(stored), false),
                // Signed out or signed in again while renewing: the session
                // the renewal belonged to is gone, so is its result.
                None => (self.store.current().ok_or(RenewalError::NoCredential), true),
            },
            Err(e) => (Err(e), false),
        };
        guard.armed = false;

        match &outcome {
            _ if superseded => {
                Counters::bump(&self.counters.renewals_discarded);
                metrics::counter!("session_renewals_total", "outcome" => "discarded").increment(1);
                info!(
                    signed_in = outcome.is_ok(),
                    "session changed during renewal, discarding renewed credential"
                );
            }
            Ok(_) => {
                Counters::bump(&self.counters.renewals_succeeded);
                metrics::counter!("session_renewals_total", "outcome" => "success").increment(1);
                info!("credential renewed");
            }
            Err(e) => {
                Counters::bump(&self.counters.renewals_failed);
                metrics::counter!("session_renewals_total", "outcome" => "failure").increment(1);
                warn!(error = %e, "credential renewal failed");
                if self.config.policy.should_sign_out(e) {
                    self.invalidate_session("renewal_failed");
                }
            }
        }

        self.finish(&outcome);
        outcome
    }

    async fn follow(&self, pending: PendingRequest) -> Outcome {
        Counters::bump(&self.counters.waiters_enqueued);
        metrics::counter!("session_waiters_total").increment(1);
        debug!(waiter = pending.id(), "waiting on in-flight renewal");

        let Some(limit) = self.config.follower_timeout else {
            return pending.wait().await;
        };
        match tokio::time::timeout(limit, pending.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                Counters::bump(&self.counters.waiters_timed_out);
                warn!(timeout_ms = limit.as_millis() as u64, "gave up waiting on in-flight renewal");
                Err(RenewalError::TimedOut)
            }
        }
    }

    /// Return to `Idle` and settle the waiters that queued meanwhile.
    fn finish(&self, outcome: &Outcome) {
        let queue = match std::mem::replace(&mut *self.lock_state(), RefreshState::Idle) {
            RefreshState::InFlight(queue) => queue,
            RefreshState::Idle => return,
        };
        let settlement = queue.settle(outcome);
        self.counters
            .waiters_resolved
            .fetch_add(settlement.resolved.len() as u64, Ordering::Relaxed);
        if !settlement.resolved.is_empty() {
            debug!(
                waiters = settlement.resolved.len(),
                unclaimed = settlement.unclaimed,
                "settled renewal waiters"
            );
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Settles the queue if the leader is dropped before it finishes.
struct InFlightGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("renewal dropped before completion, releasing waiters");
            Counters::bump(&self.coordinator.counters.renewals_abandoned);
            metrics::counter!("session_renewals_total", "outcome" => "abandoned").increment(1);
            self.coordinator.finish(&Err(RenewalError::Abandoned));
        }
    }
}
