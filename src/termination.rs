//! Closes a shared conduit once all workers feeding it are done.
//!
//! Every worker pool writes into one shared downstream conduit. The conduit may only close
//! after the last worker has finished, so the downstream emitter is owned by a
//! `TerminationCounter` which drops it after exactly `size` completion signals. Workers get
//! their own emitter through a `Completion` guard; the guard signals when it is completed
//! or dropped, so a worker that returns early or panics still counts.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, trace};

use crate::conduit::Emitter;
use crate::error::{MRError, Result};

struct CounterState<T> {
    size: usize,
    issued: usize,
    received: usize,
    downstream: Option<Emitter<T>>,
}

pub struct TerminationCounter<T> {
    state: Arc<Mutex<CounterState<T>>>,
}

impl<T> Clone for TerminationCounter<T> {
    fn clone(&self) -> TerminationCounter<T> {
        TerminationCounter {
            state: self.state.clone(),
        }
    }
}

impl<T> TerminationCounter<T> {
    /// Take ownership of `downstream` and close it after `size` signals. A counter of size
    /// zero closes its conduit right away.
    pub fn new(downstream: Emitter<T>, size: usize) -> TerminationCounter<T> {
        let downstream = if size == 0 { None } else { Some(downstream) };
        TerminationCounter {
            state: Arc::new(Mutex::new(CounterState {
                size: size,
                issued: 0,
                received: 0,
                downstream: downstream,
            })),
        }
    }

    /// Create a counter for a pool of `size` workers together with one guard per worker.
    pub fn split(downstream: Emitter<T>, size: usize) -> (TerminationCounter<T>, Vec<Completion<T>>) {
        let counter = TerminationCounter::new(downstream.clone(), size);
        let guards = (0..size)
            .map(|_| Completion {
                emitter: downstream.clone(),
                counter: counter.clone(),
                done: false,
            })
            .collect();
        counter.lock().issued = size;
        (counter, guards)
    }

    fn lock(&self) -> MutexGuard<'_, CounterState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a guard for one worker. At most `size` guards can be issued.
    pub fn completion(&self) -> Result<Completion<T>> {
        let mut state = self.lock();
        if state.issued >= state.size {
            return Err(MRError::TerminationOverflow { size: state.size });
        }
        let emitter = match state.downstream {
            Some(ref em) => em.clone(),
            None => return Err(MRError::Closed),
        };
        state.issued += 1;
        Ok(Completion {
            emitter: emitter,
            counter: self.clone(),
            done: false,
        })
    }

    /// Count one completion. Returns true if this signal closed the conduit.
    pub fn signal(&self) -> Result<bool> {
        let mut state = self.lock();
        if state.received >= state.size {
            return Err(MRError::TerminationOverflow { size: state.size });
        }
        state.received += 1;
        trace!(received = state.received, size = state.size, "completion signal");
        if state.received == state.size {
            state.downstream = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Signals still missing before the conduit closes.
    pub fn remaining(&self) -> usize {
        let state = self.lock();
        state.size - state.received
    }

    pub fn is_closed(&self) -> bool {
        self.lock().downstream.is_none()
    }
}

/// A worker's handle on the downstream conduit, counted by a `TerminationCounter`.
pub struct Completion<T> {
    emitter: Emitter<T>,
    counter: TerminationCounter<T>,
    done: bool,
}

impl<T> Completion<T> {
    pub fn emitter(&self) -> &Emitter<T> {
        &self.emitter
    }

    /// Signal completion explicitly. Returns true if this closed the conduit.
    pub fn complete(mut self) -> Result<bool> {
        self.done = true;
        self.counter.signal()
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.counter.signal() {
            error!("completion guard could not signal: {}", e);
        }
    }
}
