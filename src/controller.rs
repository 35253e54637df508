//! Controls the execution of a mapreduce instance.
//!
//! One invocation wires four stages together:
//!
//! ```text
//! input() -> map dispatcher -> K map workers -> intermediate conduit
//!         -> partition dispatcher -> K reduce workers -> output conduit -> consume()
//! ```
//!
//! Every stage closes its outbound conduit only after its inbound conduit is drained, and
//! `consume()` runs on the calling thread. All workers run on a scoped thread pool that is
//! created and joined within the call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::select;
use scoped_threadpool::{Pool, Scope};
use tracing::{debug, info, info_span, warn, Span};

use crate::cancel::CancelToken;
use crate::conduit::bound_conduit;
use crate::error::MRError;
use crate::map::MapStage;
use crate::mapreducer::MapReducer;
use crate::parameters::MRParameters;
use crate::reduce::ReduceStage;

/// Counters collected over one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunStats {
    /// Records taken from `input()` and handed to map workers.
    pub records_in: u64,
    /// Records emitted by `map()` and routed to reduce workers.
    pub records_mapped: u64,
    /// Records delivered to `consume()`.
    pub records_out: u64,
    pub mappers: usize,
    pub reducers: usize,
    pub elapsed: Duration,
    /// Set when `consume()` returned before the output conduit was closed, so the rest of
    /// the pipeline was cancelled rather than drained.
    pub cancelled: bool,
}

/// State shared by all workers of one invocation.
pub(crate) struct Invocation<'a, MR: MapReducer> {
    pub mr: &'a MR,
    pub token: CancelToken,
    pub span: Span,
    pub records_in: AtomicU64,
    pub records_mapped: AtomicU64,
    first_error: Mutex<Option<MR::Error>>,
}

impl<'a, MR: MapReducer> Invocation<'a, MR> {
    fn new(mr: &'a MR, span: Span) -> Invocation<'a, MR> {
        Invocation {
            mr: mr,
            token: CancelToken::new(),
            span: span,
            records_in: AtomicU64::new(0),
            records_mapped: AtomicU64::new(0),
            first_error: Mutex::new(None),
        }
    }

    /// Record a stage failure and abort the run. Only the first failure is kept; errors
    /// raised after the run has been cancelled are consequences of the cancellation.
    pub fn fail(&self, err: MR::Error) {
        let mut slot = self.first_error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() && !self.token.is_cancelled() {
            *slot = Some(err);
            self.token.cancel();
        }
    }

    fn take_error(&self) -> Option<MR::Error> {
        self.first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

pub struct MRController;

impl MRController {
    /// Run `mr` to completion with the given parameters.
    pub fn run<MR: MapReducer>(mr: &MR, params: MRParameters) -> Result<RunStats, MR::Error> {
        MRController::run_with_cancel(mr, params, &CancelToken::new())
    }

    /// Run `mr`, aborting early once `cancel` is cancelled. An aborted run returns
    /// `MRError::Cancelled` unless `consume()` or a stage failed first.
    pub fn run_with_cancel<MR: MapReducer>(
        mr: &MR,
        params: MRParameters,
        cancel: &CancelToken,
    ) -> Result<RunStats, MR::Error> {
        params.validate()?;

        let span = info_span!(
            "map_reduce",
            mappers = params.mappers,
            reducers = params.reducers
        );
        let _entered = span.enter();
        let start = Instant::now();

        let inv = Invocation::new(mr, span.clone());
        let (mapped_em, mapped) = bound_conduit(&inv.token);
        let (output_em, output) = bound_conduit(&inv.token);
        let records_out = output.tally();
        // Held until the run is cancelled below, so reducers never see a closed output
        // conduit just because consume() returned early.
        let output_hold = output.clone();

        let mut pool = Pool::new(params.pool_threads() as u32);
        let (consumed, aborted, cut_short) = pool.scoped(|scope| {
            // Must be dropped before the scope joins its workers, which only return once the
            // invocation is cancelled. A panic in input() or consume() unwinds through it.
            let cancel_on_exit = inv.token.cancel_on_drop();
            watch_cancel(scope, &inv, cancel);
            ReduceStage::new(&inv, params.reducers).start(scope, mapped, output_em);
            MapStage::new(&inv, params.mappers).start(scope, mapped_em);

            debug!("consuming output");
            let consumed = mr.consume(output);
            let aborted = inv.token.is_cancelled();
            let cut_short = !aborted && !output_hold.is_closed();
            if cut_short {
                debug!("consume() returned before the output was closed, cancelling the run");
            }
            drop(cancel_on_exit);
            drop(output_hold);
            (consumed, aborted, cut_short)
        });

        let stats = RunStats {
            records_in: inv.records_in.load(Ordering::Relaxed),
            records_mapped: inv.records_mapped.load(Ordering::Relaxed),
            records_out: records_out.load(Ordering::Relaxed),
            mappers: params.mappers,
            reducers: params.reducers,
            elapsed: start.elapsed(),
            cancelled: aborted || cut_short,
        };
        info!(
            records_in = stats.records_in,
            records_mapped = stats.records_mapped,
            records_out = stats.records_out,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            cancelled = stats.cancelled,
            "map/reduce finished"
        );

        consumed?;
        if let Some(err) = inv.take_error() {
            return Err(err);
        }
        if aborted {
            warn!("map/reduce run was cancelled");
            return Err(MRError::Cancelled.into());
        }
        Ok(stats)
    }
}

/// Forwards a cancellation of the caller's token to the invocation. Exits once either
/// token is cancelled; the invocation token always is at the end of a run.
fn watch_cancel<'pool, 'scope, MR: MapReducer>(
    scope: &Scope<'pool, 'scope>,
    inv: &'scope Invocation<'scope, MR>,
    cancel: &CancelToken,
) {
    let external = cancel.signal();
    let internal = inv.token.signal();
    let span = inv.span.clone();
    scope.execute(move || {
        let _entered = span.enter();
        select! {
            recv(external) -> _ => {
                if inv.token.cancel() {
                    warn!("cancellation requested by caller");
                }
            }
            recv(internal) -> _ => {}
        }
    });
}

/// Run `mr` with parameters taken from the environment (see `MRParameters::from_env`),
/// returning the result of `consume()`.
pub fn map_reduce<MR: MapReducer>(mr: &MR) -> Result<(), MR::Error> {
    MRController::run(mr, MRParameters::from_env()).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure_mr::ClosureMapReducer;
    use crate::conduit::{from_iter, Conduit, Emitter};
    use crate::record_types::Identifiable;
    use crate::reduce::reduce_by_id;
    use std::borrow::Cow;
    use std::collections::{HashMap, HashSet};
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Clone, Debug, PartialEq)]
    struct Count {
        id: String,
        n: u64,
    }

    impl Identifiable for Count {
        fn id(&self) -> Cow<'_, str> {
            Cow::Borrowed(&self.id)
        }
    }

    #[derive(Debug, PartialEq)]
    enum TestError {
        Sentinel,
        Engine(MRError),
    }

    impl From<MRError> for TestError {
        fn from(e: MRError) -> TestError {
            TestError::Engine(e)
        }
    }

    type CountMR<'a> = ClosureMapReducer<'a, Count, Count, Count, TestError>;

    fn counts(ids: &[(&str, u64)]) -> Vec<Count> {
        ids.iter()
            .map(|&(id, n)| Count {
                id: String::from(id),
                n: n,
            })
            .collect()
    }

    fn identity_map(c: Count, em: &Emitter<Count>) -> Result<(), TestError> {
        Ok(em.emit(c)?)
    }

    fn summing_reduce(inp: Conduit<Count>, em: &Emitter<Count>) -> Result<(), TestError> {
        Ok(reduce_by_id(inp, em, |acc, c| acc.n += c.n)?)
    }

    fn passthrough_reduce(inp: Conduit<Count>, em: &Emitter<Count>) -> Result<(), TestError> {
        for c in &inp {
            em.emit(c)?;
        }
        Ok(())
    }

    fn collect_into<'a>(
        out: &'a mut HashMap<String, u64>,
    ) -> impl FnMut(Conduit<Count>) -> Result<(), TestError> + Send + 'a {
        move |inp| {
            for c in inp {
                assert!(out.insert(c.id.clone(), c.n).is_none(), "each id only once");
            }
            Ok(())
        }
    }

    fn params() -> MRParameters {
        MRParameters::new().set_concurrency(4, 3)
    }

    #[test]
    fn test_sums_per_identity() {
        let input = counts(&[("a", 1), ("a", 2), ("b", 5)]);
        let mut out = HashMap::new();
        let mr: CountMR = ClosureMapReducer::new(
            move || from_iter(input.clone()),
            identity_map,
            summing_reduce,
            collect_into(&mut out),
        );

        let stats = MRController::run(&mr, params()).unwrap();
        drop(mr);

        assert_eq!(out.len(), 2);
        assert_eq!(out["a"], 3);
        assert_eq!(out["b"], 5);
        assert_eq!(stats.records_in, 3);
        assert_eq!(stats.records_mapped, 3);
        assert_eq!(stats.records_out, 2);
        assert_eq!(stats.mappers, 4);
        assert_eq!(stats.reducers, 3);
        assert!(!stats.cancelled);
    }

    #[test]
    fn test_empty_input() {
        let mut out = HashMap::new();
        let mr: CountMR = ClosureMapReducer::new(
            || from_iter(Vec::new()),
            identity_map,
            summing_reduce,
            collect_into(&mut out),
        );

        let stats = MRController::run(&mr, params()).unwrap();
        drop(mr);

        assert!(out.is_empty());
        assert_eq!(stats.records_in, 0);
        assert_eq!(stats.records_out, 0);
    }

    #[test]
    fn test_map_reduce_default_parameters() {
        let input: Vec<Count> = (0..1000)
            .map(|i| Count {
                id: format!("k{}", i % 10),
                n: 1,
            })
            .collect();
        let mut out = HashMap::new();
        let mr: CountMR = ClosureMapReducer::new(
            move || from_iter(input.clone()),
            identity_map,
            summing_reduce,
            collect_into(&mut out),
        );

        assert_eq!(map_reduce(&mr), Ok(()));
        drop(mr);
        assert_eq!(out.len(), 10);
        assert!(out.values().all(|&n| n == 100));
    }

    #[test]
    fn test_consume_error_is_returned() {
        let input = counts(&[("a", 1); 1000]);
        let mr: CountMR = ClosureMapReducer::new(
            move || from_iter(input.clone()),
            identity_map,
            passthrough_reduce,
            |_| Err(TestError::Sentinel),
        );

        assert_eq!(MRController::run(&mr, params()), Err(TestError::Sentinel));
    }

    #[test]
    fn test_consume_may_stop_early() {
        let input = counts(&[("a", 1); 10000]);
        let mr: CountMR = ClosureMapReducer::new(
            move || from_iter(input.clone()),
            identity_map,
            passthrough_reduce,
            |inp| {
                assert!(inp.recv().is_some());
                Ok(())
            },
        );

        let stats = MRController::run(&mr, params()).unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.records_out, 1);
    }

    #[test]
    fn test_map_error_aborts_run() {
        let mut input = counts(&[("a", 1); 5000]);
        input[2500].id = String::from("bad");
        let mut out = HashMap::new();
        let mr: CountMR = ClosureMapReducer::new(
            move || from_iter(input.clone()),
            |c, em| {
                if c.id == "bad" {
                    return Err(TestError::Sentinel);
                }
                identity_map(c, em)
            },
            summing_reduce,
            collect_into(&mut out),
        );

        assert_eq!(MRController::run(&mr, params()), Err(TestError::Sentinel));
    }

    #[test]
    fn test_reduce_error_aborts_run() {
        let input = counts(&[("a", 1), ("b", 1), ("c", 1)]);
        let mr: CountMR = ClosureMapReducer::new(
            move || from_iter(input.clone()),
            identity_map,
            |inp, _| {
                for _ in &inp {}
                Err(TestError::Sentinel)
            },
            |inp| {
                for _ in inp {}
                Ok(())
            },
        );

        assert_eq!(MRController::run(&mr, params()), Err(TestError::Sentinel));
    }

    #[test]
    fn test_abandoned_input() {
        let input = counts(&[("a", 1); 10]);
        let mr: CountMR = ClosureMapReducer::new(
            move || from_iter(input.clone()),
            identity_map,
            |_, _| Ok(()),
            |inp| {
                for _ in inp {}
                Ok(())
            },
        );

        assert_eq!(
            MRController::run(&mr, MRParameters::new().set_concurrency(2, 1)),
            Err(TestError::Engine(MRError::AbandonedInput { reducer: 0 }))
        );
    }

    #[test]
    fn test_external_cancel() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let mr: CountMR = ClosureMapReducer::new(
            || {
                from_iter((0u64..).map(|i| Count {
                    id: (i % 10).to_string(),
                    n: 1,
                }))
            },
            identity_map,
            passthrough_reduce,
            move |inp| {
                for (i, _) in inp.iter().enumerate() {
                    if i == 100 {
                        trigger.cancel();
                    }
                }
                Ok(())
            },
        );

        assert_eq!(
            MRController::run_with_cancel(&mr, params(), &cancel),
            Err(TestError::Engine(MRError::Cancelled))
        );
    }

    #[test]
    fn test_invalid_parameters() {
        let mr: CountMR = ClosureMapReducer::new(
            || from_iter(Vec::new()),
            identity_map,
            summing_reduce,
            |_| Ok(()),
        );

        assert!(matches!(
            MRController::run(&mr, MRParameters::new().set_concurrency(0, 1)),
            Err(TestError::Engine(MRError::InvalidParameters(_)))
        ));
    }

    #[test]
    fn test_same_id_same_reducer() {
        let input: Vec<Count> = (0..2000)
            .map(|i| Count {
                id: format!("k{}", i % 37),
                n: 1,
            })
            .collect();
        let reducers = AtomicUsize::new(0);
        let seen: Mutex<HashMap<String, HashSet<usize>>> = Mutex::new(HashMap::new());
        let mut out = HashMap::new();

        let mr: CountMR = ClosureMapReducer::new(
            move || from_iter(input.clone()),
            |c, em| {
                em.emit(c.clone())?;
                Ok(em.emit(c)?)
            },
            |inp, em| {
                let me = reducers.fetch_add(1, Ordering::SeqCst);
                let mut local = HashMap::new();
                for c in &inp {
                    *local.entry(c.id.clone()).or_insert(0) += c.n;
                }
                {
                    let mut seen = seen.lock().unwrap();
                    for id in local.keys() {
                        seen.entry(id.clone()).or_default().insert(me);
                    }
                }
                for (id, n) in local {
                    em.emit(Count { id: id, n: n })?;
                }
                Ok(())
            },
            collect_into(&mut out),
        );

        let stats = MRController::run(&mr, MRParameters::new().set_concurrency(8, 5)).unwrap();
        drop(mr);

        assert_eq!(reducers.load(Ordering::SeqCst), 5);
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 37);
        assert!(seen.values().all(|r| r.len() == 1));
        assert_eq!(out.len(), 37);
        assert_eq!(out.values().sum::<u64>(), 4000);
        assert_eq!(stats.records_mapped, 4000);
    }

    /// Runs `f` on its own thread and reports whether it panicked. Fails the test if `f`
    /// neither returns nor panics in time.
    fn panics<F: FnOnce() + Send + 'static>(f: F) -> bool {
        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let res = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(res.is_err());
        });
        rx.recv_timeout(Duration::from_secs(30))
            .expect("run did not return within 30s")
    }

    fn ab() -> Vec<Count> {
        counts(&[("a", 1), ("b", 1)])
    }

    fn drain(inp: Conduit<Count>) -> Result<(), TestError> {
        for _ in inp {}
        Ok(())
    }

    #[test]
    fn test_panic_in_map_propagates() {
        assert!(panics(|| {
            let mr: CountMR = ClosureMapReducer::new(
                || from_iter(ab()),
                |c, em| {
                    assert_ne!(c.id, "b", "map failed");
                    identity_map(c, em)
                },
                passthrough_reduce,
                drain,
            );
            let _ = MRController::run(&mr, params());
        }));
    }

    #[test]
    fn test_panic_in_reduce_propagates() {
        assert!(panics(|| {
            let mr: CountMR = ClosureMapReducer::new(
                || from_iter(ab()),
                identity_map,
                |_, _| panic!("reduce failed"),
                drain,
            );
            let _ = MRController::run(&mr, params());
        }));
    }

    #[test]
    fn test_panic_in_consume_propagates() {
        assert!(panics(|| {
            let mr: CountMR = ClosureMapReducer::new(
                || from_iter(ab()),
                identity_map,
                passthrough_reduce,
                |inp| {
                    drain(inp)?;
                    panic!("consume failed")
                },
            );
            let _ = MRController::run(&mr, params());
        }));
    }

    #[test]
    fn test_panic_in_consume_before_draining_propagates() {
        assert!(panics(|| {
            let mr: CountMR = ClosureMapReducer::new(
                || from_iter(counts(&[("a", 1); 1000])),
                identity_map,
                passthrough_reduce,
                |inp| {
                    inp.recv();
                    panic!("consume failed")
                },
            );
            let _ = MRController::run(&mr, params());
        }));
    }

    #[test]
    fn test_panic_in_input_propagates() {
        assert!(panics(|| {
            let mr: CountMR = ClosureMapReducer::new(
                || panic!("no input"),
                identity_map,
                passthrough_reduce,
                drain,
            );
            let _ = MRController::run(&mr, params());
        }));
    }

    #[test]
    fn test_completed_run_is_not_cancelled() {
        assert!(!panics(|| {
            let mr: CountMR =
                ClosureMapReducer::new(|| from_iter(ab()), identity_map, summing_reduce, drain);
            let stats = MRController::run(&mr, params()).unwrap();
            assert!(!stats.cancelled);
        }));
    }
}
