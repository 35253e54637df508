//! The MapReducer trait and the default sharding function.

use std::fmt;

use crate::conduit::{Conduit, Emitter};
use crate::error::MRError;
use crate::record_types::Identifiable;

/// Default sharding function: CRC-32 of the identity, modulo the number of shards.
/// Returns a number in [0; n). `n` must not be zero.
pub fn std_shard(n: usize, id: &str) -> usize {
    crc32fast::hash(id.as_bytes()) as usize % n
}

/// Implemented by the caller to supply input, mapping, reducing and consuming; the engine
/// provides the runtime around it.
///
/// `map()`, `reduce()` and `shard()` are called concurrently from many worker threads, hence
/// the `Sync` bound. `consume()` runs on the thread that started the run.
pub trait MapReducer: Sync {
    type Input: Identifiable + Send;
    type Mapped: Identifiable + Send;
    type Output: Identifiable + Send;
    type Error: From<MRError> + fmt::Debug + Send;

    /// Returns the conduit delivering the records to process. The producer has to drop its
    /// emitter when it is exhausted; it runs concurrently with the rest of the pipeline.
    fn input(&self) -> Conduit<Self::Input>;

    /// Called once per input record, on an arbitrary map worker. May emit any number of
    /// records.
    fn map(&self, record: Self::Input, emit: &Emitter<Self::Mapped>) -> Result<(), Self::Error>;

    /// Called once per reduce worker. Has to drain `input` until it is closed; all records
    /// with the same identity arrive at the same reduce worker.
    fn reduce(
        &self,
        input: Conduit<Self::Mapped>,
        emit: &Emitter<Self::Output>,
    ) -> Result<(), Self::Error>;

    /// Called once with the reduced records. Its result is the result of the run.
    fn consume(&self, input: Conduit<Self::Output>) -> Result<(), Self::Error>;

    /// Determines which reduce worker a mapped record goes to.
    /// Returns a number in [0; n); the same id must always yield the same number.
    fn shard(&self, n: usize, id: &str) -> usize {
        std_shard(n, id)
    }
}
