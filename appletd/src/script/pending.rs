//! Ticket table for bridge-issued calls awaiting a host reply.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;

use crate::bridge::protocol::{Ticket, TrustDecision, ValueKind};

/// A host answer to a ticketed request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value { kind: ValueKind, value: String },
    Trust(TrustDecision),
}

#[derive(Default)]
struct Waiting {
    closed: bool,
    calls: HashMap<Ticket, oneshot::Sender<Reply>>,
}

/// Per-context map from ticket to the one caller waiting on it.
pub struct PendingCalls {
    next: AtomicU64,
    waiting: Mutex<Waiting>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            waiting: Mutex::new(Waiting::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Waiting> {
        self.waiting.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Pending call table mutex poisoned");
            poisoned.into_inner()
        })
    }

    /// Mint a ticket and the receiver its reply will arrive on.
    ///
    /// Returns `None` once the table has been closed by [`fail_all`](Self::fail_all).
    pub fn register(&self) -> Option<(Ticket, oneshot::Receiver<Reply>)> {
        let ticket = Ticket::new(self.next.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let mut waiting = self.lock();
        if waiting.closed {
            return None;
        }
        waiting.calls.insert(ticket, tx);
        Some((ticket, rx))
    }

    /// Hand `reply` to the caller holding `ticket`. False on a lookup miss.
    pub fn resolve(&self, ticket: Ticket, reply: Reply) -> bool {
        let Some(tx) = self.lock().calls.remove(&ticket) else {
            return false;
        };
        tx.send(reply).is_ok()
    }

    /// Forget a ticket whose caller stopped waiting.
    pub fn abandon(&self, ticket: Ticket) {
        self.lock().calls.remove(&ticket);
    }

    /// Wake every waiter with a closed channel and refuse new tickets.
    pub fn fail_all(&self) -> usize {
        let mut waiting = self.lock();
        waiting.closed = true;
        let count = waiting.calls.len();
        waiting.calls.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
