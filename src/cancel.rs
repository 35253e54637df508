//! Cancellation of a running map/reduce invocation.

use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{self as channel, Receiver, Sender, TryRecvError};

/// A cloneable handle that aborts a run. Cancelling disconnects an internal channel which
/// every engine conduit selects on, so all blocked sends and receives wake up at once.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        let (trigger, signal) = channel::bounded(0);
        CancelToken {
            inner: Arc::new(Inner {
                trigger: Mutex::new(Some(trigger)),
                signal: signal,
            }),
        }
    }

    /// Cancel the token. Returns true if this call was the one that cancelled it.
    pub fn cancel(&self) -> bool {
        let mut trigger = self
            .inner
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        trigger.take().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Receiver that becomes ready (disconnected) once the token is cancelled.
    pub(crate) fn signal(&self) -> Receiver<()> {
        self.inner.signal.clone()
    }

    /// Returns a guard that cancels this token when dropped, including while unwinding.
    pub fn cancel_on_drop(&self) -> CancelGuard {
        CancelGuard {
            token: self.clone(),
        }
    }
}

/// Cancels its token on drop. See `CancelToken::cancel_on_drop`.
#[derive(Debug)]
pub struct CancelGuard {
    token: CancelToken,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Default for CancelToken {
    fn default() -> CancelToken {
        CancelToken::new()
    }
}
