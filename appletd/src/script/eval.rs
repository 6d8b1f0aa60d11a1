//! Single-outstanding `eval` slot.
//!
//! Eval replies carry no ticket, so each context admits one evaluation at a
//! time: callers queue on `turn`, and the armed sender receives whatever the
//! next `__lc_ret` write delivers.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use super::CallError;

#[derive(Default)]
struct Armed {
    closed: bool,
    waiter: Option<oneshot::Sender<String>>,
}

#[derive(Default)]
pub struct EvalSlot {
    turn: tokio::sync::Mutex<()>,
    armed: Mutex<Armed>,
}

/// Clears the armed sender on every exit path, including cancellation.
struct Disarm<'a>(&'a EvalSlot);

impl Drop for Disarm<'_> {
    fn drop(&mut self) {
        self.0.lock().waiter = None;
    }
}

impl EvalSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Armed> {
        self.armed.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Eval slot mutex poisoned");
            poisoned.into_inner()
        })
    }

    /// Arm the slot, run `send`, and wait up to `timeout` for the raw reply.
    pub async fn run<F>(&self, timeout: Duration, send: F) -> Result<String, CallError>
    where
        F: FnOnce() -> Result<(), CallError>,
    {
        let _turn = self.turn.lock().await;

        let rx = {
            let mut armed = self.lock();
            if armed.closed {
                return Err(CallError::ContextClosed);
            }
            let (tx, rx) = oneshot::channel();
            armed.waiter = Some(tx);
            rx
        };
        let _disarm = Disarm(self);

        send()?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(raw)) => Ok(raw),
            Ok(Err(_)) => Err(CallError::ContextClosed),
            Err(_) => Err(CallError::NoResponse(timeout)),
        }
    }

    /// Deliver a reply to the armed waiter. False when nobody is waiting.
    pub fn deliver(&self, raw: String) -> bool {
        match self.lock().waiter.take() {
            Some(tx) => tx.send(raw).is_ok(),
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock().waiter.is_some()
    }

    /// Fail the current waiter and every later call.
    pub fn close(&self) {
        let mut armed = self.lock();
        armed.closed = true;
        armed.waiter = None;
    }
}
