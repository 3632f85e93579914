//! Scripted collaborators for gateway tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use session_provider::{
    BoxFuture, Credential, MemoryPersistence, RenewalError, RenewalFailurePolicy, Renewer,
    SessionInvalidation,
};
use tokio::sync::Semaphore;

use crate::coordinator::{CoordinatorConfig, RefreshCoordinator};
use crate::store::CredentialStore;

/// Renewer that answers from a script and counts calls.
///
/// With an empty script, call `n` returns `at_n` / `rt_n`. A gated renewer
/// parks every call until the test releases it.
pub struct ScriptedRenewer {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<Credential, RenewalError>>>,
    seen: Mutex<Vec<String>>,
    gate: Option<Semaphore>,
}

impl ScriptedRenewer {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn then(self, result: Result<Credential, RenewalError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    /// Let one parked renewal finish.
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Refresh tokens presented, in call order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl Renewer for ScriptedRenewer {
    fn id(&self) -> &str {
        "scripted"
    }

    fn renew<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<Credential, RenewalError>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().unwrap().push(refresh_token.to_string());
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| Ok(Credential::new(format!("at_{n}"), format!("rt_{n}"))))
        })
    }
}

/// Invalidation hook that counts how often it ran.
#[derive(Clone, Default)]
pub struct CountingHook(Arc<AtomicUsize>);

impl CountingHook {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl SessionInvalidation for CountingHook {
    fn on_unrecoverable(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything a coordinator test needs to make assertions.
pub struct Harness {
    pub coordinator: Arc<RefreshCoordinator>,
    pub renewer: Arc<ScriptedRenewer>,
    pub hook: CountingHook,
    pub persistence: Arc<MemoryPersistence>,
}

impl Harness {
    /// Store seeded with `at_0` / `rt_0`.
    pub fn new(renewer: ScriptedRenewer) -> Self {
        Self::with_config(renewer, CoordinatorConfig::default())
    }

    pub fn with_policy(renewer: ScriptedRenewer, policy: RenewalFailurePolicy) -> Self {
        Self::with_config(
            renewer,
            CoordinatorConfig {
                policy,
                ..CoordinatorConfig::default()
            },
        )
    }

    pub fn with_config(renewer: ScriptedRenewer, config: CoordinatorConfig) -> Self {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = Arc::new(CredentialStore::with_credential(
            Credential::new("at_0", "rt_0"),
            persistence.clone(),
        ));
        let renewer = Arc::new(renewer);
        let hook = CountingHook::default();
        let coordinator = Arc::new(RefreshCoordinator::new(
            store,
            renewer.clone(),
            Arc::new(hook.clone()),
            config,
        ));
        Self {
            coordinator,
            renewer,
            hook,
            persistence,
        }
    }

    /// Yield until `n` followers are parked on the in-flight renewal.
    pub async fn wait_for_followers(&self, n: u64) {
        while self.coordinator.stats().waiters_enqueued < n {
            tokio::task::yield_now().await;
        }
    }

    /// Yield until a leader has reached the renewer.
    pub async fn wait_for_renewal_calls(&self, n: usize) {
        while self.renewer.calls() < n {
            tokio::task::yield_now().await;
        }
    }
}
