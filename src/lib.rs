//! Implements an in-memory mapreduce process bounded to one machine. Records flow through
//! unbuffered conduits from an input producer over a pool of map workers and a pool of
//! reduce workers (partitioned by record identity) to a consumer.
//!
//! Implement `MapReducer` (or use `ClosureMapReducer`) and pass it to `map_reduce()`.
//!

pub mod cancel;
pub mod closure_mr;
pub mod conduit;
pub mod controller;
pub mod error;
mod map;
pub mod mapreducer;
pub mod parameters;
pub mod record_types;
pub mod reduce;
pub mod termination;

pub use cancel::{CancelGuard, CancelToken};
pub use closure_mr::ClosureMapReducer;
pub use conduit::{conduit, from_iter, Conduit, Emitter};
pub use controller::{map_reduce, MRController, RunStats};
pub use error::MRError;
pub use mapreducer::{std_shard, MapReducer};
pub use parameters::MRParameters;
pub use record_types::{Identifiable, Record};
pub use reduce::reduce_by_id;
pub use termination::{Completion, TerminationCounter};
