//! Implements the Reduce phase.
//!

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::Ordering;

use scoped_threadpool::Scope;
use tracing::{debug, error, warn};

use crate::conduit::{bound_conduit, Conduit, Emitter};
use crate::controller::Invocation;
use crate::error::{MRError, Result};
use crate::mapreducer::MapReducer;
use crate::record_types::Identifiable;
use crate::termination::{Completion, TerminationCounter};

/// The reducing phase: one dispatcher partitions the mapped records by identity over a fixed
/// pool of reduce workers. Every record with a given id reaches the same worker, so workers
/// can aggregate without talking to each other.
pub(crate) struct ReduceStage<'s, MR: MapReducer> {
    inv: &'s Invocation<'s, MR>,
    workers: usize,
}

impl<'s, MR: MapReducer> ReduceStage<'s, MR> {
    pub fn new(inv: &'s Invocation<'s, MR>, workers: usize) -> ReduceStage<'s, MR> {
        ReduceStage {
            inv: inv,
            workers: workers,
        }
    }

    /// Spawn the workers and the partitioning dispatcher. `output` is closed once every
    /// reduce worker has returned.
    pub fn start<'pool>(
        self,
        scope: &Scope<'pool, 's>,
        input: Conduit<MR::Mapped>,
        output: Emitter<MR::Output>,
    ) {
        let inv = self.inv;
        let (_counter, guards) = TerminationCounter::split(output, self.workers);
        let mut worker_inputs = Vec::with_capacity(self.workers);

        for (worker, done) in guards.into_iter().enumerate() {
            let (em, input) = bound_conduit(&inv.token);
            worker_inputs.push(em);
            let span = inv.span.clone();
            scope.execute(move || {
                let _entered = span.enter();
                reduce_worker(inv, worker, input, done);
            });
        }

        let span = inv.span.clone();
        scope.execute(move || {
            let _entered = span.enter();
            partition(inv, input, worker_inputs);
        });
    }
}

fn reduce_worker<MR: MapReducer>(
    inv: &Invocation<'_, MR>,
    worker: usize,
    input: Conduit<MR::Mapped>,
    done: Completion<MR::Output>,
) {
    debug!(worker, "reduce worker starting");
    // Keeps the worker's conduit open until a failure has been recorded; otherwise the
    // dispatcher could report the closed conduit before the actual error.
    let hold = input.clone();

    match inv.mr.reduce(input, done.emitter()) {
        Err(e) => {
            warn!(worker, error = ?e, "reduce() failed, aborting run");
            inv.fail(e);
        }
        Ok(()) if !hold.is_closed() && !inv.token.is_cancelled() => {
            error!(worker, "reduce() returned before its input was closed");
            inv.fail(MRError::AbandonedInput { reducer: worker }.into());
        }
        Ok(()) => {}
    }
    debug!(worker, records = hold.received(), "reduce worker done");
    drop(hold);
    if let Err(e) = done.complete() {
        error!(worker, "reduce worker could not signal completion: {}", e);
    }
}

/// Routes every mapped record to reduce worker `shard(K, id)`, then closes all worker
/// conduits by dropping their emitters.
fn partition<MR: MapReducer>(
    inv: &Invocation<'_, MR>,
    input: Conduit<MR::Mapped>,
    workers: Vec<Emitter<MR::Mapped>>,
) {
    let n = workers.len();
    let mut routed: u64 = 0;

    for record in &input {
        let shard = {
            let id = record.id();
            inv.mr.shard(n, &id) % n
        };
        match workers[shard].emit(record) {
            Ok(()) => routed += 1,
            Err(MRError::Closed) => {
                error!(reducer = shard, "reducer returned before its input was closed");
                inv.fail(MRError::AbandonedInput { reducer: shard }.into());
                break;
            }
            Err(e) => {
                debug!(reducer = shard, "partitioning stopped: {}", e);
                break;
            }
        }
    }

    inv.records_mapped.store(routed, Ordering::Relaxed);
    debug!(records = routed, "partitioning done");
}

/// The common reduce policy: aggregate all records with the same id using `merge`, then
/// emit one record per id once `input` is closed.
///
/// `merge` is called with the accumulated record and the next one with the same id. Since
/// records of one id arrive in no particular order, it should be associative and
/// commutative.
pub fn reduce_by_id<T, F>(input: Conduit<T>, emit: &Emitter<T>, mut merge: F) -> Result<()>
where
    T: Identifiable,
    F: FnMut(&mut T, T),
{
    let mut memory: HashMap<String, T> = HashMap::new();

    for record in input {
        let id = record.id().into_owned();
        match memory.entry(id) {
            Entry::Occupied(mut e) => merge(e.get_mut(), record),
            Entry::Vacant(e) => {
                e.insert(record);
            }
        }
    }

    for (_, record) in memory {
        emit.emit(record)?;
    }
    Ok(())
}
