//! Typed, unbuffered channels connecting the stages of a run.
//!
//! A conduit is a rendezvous channel: a send blocks until a receiver takes the value, which
//! gives the pipeline its backpressure. It closes once every `Emitter` feeding it has been
//! dropped; receivers then see the end of the stream. Conduits created by the engine are
//! additionally bound to the invocation's `CancelToken`, and stop blocking as soon as it is
//! cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{self as channel, select, Receiver, Sender, TryRecvError};

use crate::cancel::CancelToken;
use crate::error::{MRError, Result};

/// Sending half of a conduit. Used by `input()` producers, `map()` and `reduce()` to emit
/// records.
pub struct Emitter<T> {
    tx: Sender<T>,
    cancel: Receiver<()>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Emitter<T> {
        Emitter {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> Emitter<T> {
    /// Send one record, blocking until a receiver takes it.
    ///
    /// Fails with `MRError::Closed` if no receiver is left and with `MRError::Cancelled` if
    /// the run this conduit belongs to has been cancelled.
    pub fn emit(&self, item: T) -> Result<()> {
        if self.is_cancelled() {
            return Err(MRError::Cancelled);
        }
        select! {
            send(self.tx, item) -> res => res.map_err(|_| MRError::Closed),
            recv(self.cancel) -> _ => Err(MRError::Cancelled),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.cancel.try_recv(), Err(TryRecvError::Disconnected))
    }
}

/// Receiving half of a conduit. Iterate over it (or call `recv()`) until it returns `None`.
pub struct Conduit<T> {
    rx: Receiver<T>,
    cancel: Receiver<()>,
    received: Arc<AtomicU64>,
}

impl<T> Clone for Conduit<T> {
    fn clone(&self) -> Conduit<T> {
        Conduit {
            rx: self.rx.clone(),
            cancel: self.cancel.clone(),
            received: self.received.clone(),
        }
    }
}

impl<T> Conduit<T> {
    /// Receive the next record. Returns `None` once the conduit is closed and drained, or
    /// once the run has been cancelled.
    pub fn recv(&self) -> Option<T> {
        if self.is_cancelled() {
            return None;
        }
        let item = select! {
            recv(self.rx) -> msg => msg.ok(),
            recv(self.cancel) -> _ => None,
        };
        if item.is_some() {
            self.received.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter { conduit: self }
    }

    /// How many records have been received from this conduit, over all of its clones.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.cancel.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Rebind a conduit (e.g. the one returned by `input()`) to a run's cancel token.
    pub(crate) fn bind(self, token: &CancelToken) -> Conduit<T> {
        Conduit {
            rx: self.rx,
            cancel: token.signal(),
            received: self.received,
        }
    }

    /// Whether all emitters are gone and nothing is left. Only meaningful once the receiving
    /// side is done with the conduit, as it may take a pending record off it.
    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub(crate) fn tally(&self) -> Arc<AtomicU64> {
        self.received.clone()
    }
}

pub struct Iter<'a, T> {
    conduit: &'a Conduit<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.conduit.recv()
    }
}

impl<'a, T> IntoIterator for &'a Conduit<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;
    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

pub struct IntoIter<T> {
    conduit: Conduit<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.conduit.recv()
    }
}

impl<T> IntoIterator for Conduit<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;
    fn into_iter(self) -> IntoIter<T> {
        IntoIter { conduit: self }
    }
}

fn with_cancel<T>(cancel: Receiver<()>) -> (Emitter<T>, Conduit<T>) {
    let (tx, rx) = channel::bounded(0);
    (
        Emitter {
            tx: tx,
            cancel: cancel.clone(),
        },
        Conduit {
            rx: rx,
            cancel: cancel,
            received: Arc::new(AtomicU64::new(0)),
        },
    )
}

/// Create a new unbuffered conduit that is not bound to any run.
pub fn conduit<T>() -> (Emitter<T>, Conduit<T>) {
    with_cancel(channel::never())
}

/// Create a conduit whose sends and receives give up once `token` is cancelled.
pub fn bound_conduit<T>(token: &CancelToken) -> (Emitter<T>, Conduit<T>) {
    with_cancel(token.signal())
}

/// Feed the items of an iterator into a fresh conduit from a background thread. The thread
/// stops early once the receiving side goes away.
pub fn from_iter<I>(items: I) -> Conduit<I::Item>
where
    I: IntoIterator + Send + 'static,
    I::IntoIter: Send,
    I::Item: Send + 'static,
{
    let (emitter, conduit) = conduit();
    thread::spawn(move || {
        for item in items {
            if emitter.emit(item).is_err() {
                break;
            }
        }
    });
    conduit
}
