//! Waiter queue for callers blocked on an in-flight renewal
//!
//! Each follower gets a `PendingRequest` backed by a oneshot channel. The
//! queue keeps the senders in enqueue order and `settle` consumes the whole
//! queue, so every waiter is resolved exactly once: the sender is moved out
//! and used a single time, and a settled queue can't be settled again.

use std::collections::VecDeque;
use std::sync::Arc;

use session_provider::{Credential, RenewalError};
use tokio::sync::oneshot;

/// What a renewal resolves to: the new credential or why there isn't one.
pub type Outcome = Result<Arc<Credential>, RenewalError>;

/// A follower's handle on the in-flight renewal.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    receiver: oneshot::Receiver<Outcome>,
}

impl PendingRequest {
    /// Position in the queue it was created from.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the renewal to settle.
    ///
    /// A queue dropped without settling resolves as `Abandoned`.
    pub async fn wait(self) -> Outcome {
        self.receiver.await.unwrap_or(Err(RenewalError::Abandoned))
    }
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    sender: oneshot::Sender<Outcome>,
}

/// Result of settling a queue.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Waiter ids in the order they were resolved.
    pub resolved: Vec<u64>,
    /// Waiters that had stopped listening (timed out or cancelled).
    pub unclaimed: usize,
}

/// Ordered collection of waiters for one renewal.
#[derive(Debug, Default)]
pub struct WaiterQueue {
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

impl WaiterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a waiter at the back of the queue.
    pub fn enqueue(&mut self) -> PendingRequest {
        let (sender, receiver) = oneshot::channel();
        let id = self.next_id;
        self.next_id += 1;
        self.waiters.push_back(Waiter { id, sender });
        PendingRequest { id, receiver }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Resolve every waiter with `outcome`, front to back.
    pub fn settle(self, outcome: &Outcome) -> Settlement {
        let mut settlement = Settlement::default();
        for waiter in self.waiters {
            if waiter.sender.send(outcome.clone()).is_err() {
                settlement.unclaimed += 1;
            }
            settlement.resolved.push(waiter.id);
        }
        settlement
    }
}
