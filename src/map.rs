//! Implements the Map phase.
//!

use std::sync::atomic::Ordering;

use scoped_threadpool::Scope;
use tracing::{debug, error, warn};

use crate::conduit::{bound_conduit, Conduit, Emitter};
use crate::controller::Invocation;
use crate::mapreducer::MapReducer;
use crate::termination::{Completion, TerminationCounter};

/// The mapping phase: one dispatcher distributing input records round-robin over a fixed
/// pool of map workers, which all emit into the same intermediate conduit.
pub(crate) struct MapStage<'s, MR: MapReducer> {
    inv: &'s Invocation<'s, MR>,
    workers: usize,
}

impl<'s, MR: MapReducer> MapStage<'s, MR> {
    pub fn new(inv: &'s Invocation<'s, MR>, workers: usize) -> MapStage<'s, MR> {
        MapStage {
            inv: inv,
            workers: workers,
        }
    }

    /// Spawn the workers and the dispatcher. `output` is closed once every worker is done.
    pub fn start<'pool>(self, scope: &Scope<'pool, 's>, output: Emitter<MR::Mapped>) {
        let inv = self.inv;
        let (_counter, guards) = TerminationCounter::split(output, self.workers);
        let mut worker_inputs = Vec::with_capacity(self.workers);

        for (worker, done) in guards.into_iter().enumerate() {
            let (em, input) = bound_conduit(&inv.token);
            worker_inputs.push(em);
            let span = inv.span.clone();
            scope.execute(move || {
                let _entered = span.enter();
                map_worker(inv, worker, input, done);
            });
        }

        let input = inv.mr.input().bind(&inv.token);
        let span = inv.span.clone();
        scope.execute(move || {
            let _entered = span.enter();
            dispatch(inv, input, worker_inputs);
        });
    }
}

fn map_worker<MR: MapReducer>(
    inv: &Invocation<'_, MR>,
    worker: usize,
    input: Conduit<MR::Input>,
    done: Completion<MR::Mapped>,
) {
    debug!(worker, "map worker starting");
    for record in &input {
        if let Err(e) = inv.mr.map(record, done.emitter()) {
            warn!(worker, error = ?e, "map() failed, aborting run");
            inv.fail(e);
            break;
        }
    }
    debug!(worker, records = input.received(), "map worker done");
    if let Err(e) = done.complete() {
        error!(worker, "map worker could not signal completion: {}", e);
    }
}

/// Hands record number i to worker i mod K, then closes all worker conduits by dropping
/// their emitters.
fn dispatch<MR: MapReducer>(
    inv: &Invocation<'_, MR>,
    input: Conduit<MR::Input>,
    workers: Vec<Emitter<MR::Input>>,
) {
    let n = workers.len();
    let mut dispatched: u64 = 0;

    for (i, record) in input.iter().enumerate() {
        if let Err(e) = workers[i % n].emit(record) {
            debug!(worker = i % n, "map dispatch stopped: {}", e);
            break;
        }
        dispatched += 1;
    }

    inv.records_in.store(dispatched, Ordering::Relaxed);
    debug!(records = dispatched, "map dispatch done");
}
