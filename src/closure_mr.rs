//! A MapReducer that uses supplied input/map/reduce/consume closures.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::conduit::{Conduit, Emitter};
use crate::error::MRError;
use crate::mapreducer::{std_shard, MapReducer};
use crate::record_types::Identifiable;

/// input() closure type.
pub type InputF<'a, I> = Box<dyn Fn() -> Conduit<I> + Send + Sync + 'a>;
/// map() closure type. The Emitter argument is used to emit records from the map() function.
pub type MapperF<'a, I, M, E> = Box<dyn Fn(I, &Emitter<M>) -> Result<(), E> + Send + Sync + 'a>;
/// reduce() closure type. Has to drain the conduit; emits via the Emitter argument.
pub type ReducerF<'a, M, O, E> =
    Box<dyn Fn(Conduit<M>, &Emitter<O>) -> Result<(), E> + Send + Sync + 'a>;
/// consume() closure type. Runs exactly once, so it may mutate captured state.
pub type ConsumerF<'a, O, E> = Box<dyn FnMut(Conduit<O>) -> Result<(), E> + Send + 'a>;
/// A function used to determine the shard an id belongs in.
/// The first argument is the number of shards, the second one the id;
/// the return value should be in [0; n).
pub type SharderF = fn(usize, &str) -> usize;

/// This type implements the MapReducer trait. You can use it to provide your own closures to a
/// MapReduce process. If you need more flexibility, however, you may want to simply implement your
/// own type that fulfills MapReducer.
pub struct ClosureMapReducer<'a, I, M, O, E> {
    input: InputF<'a, I>,
    mapper: MapperF<'a, I, M, E>,
    reducer: ReducerF<'a, M, O, E>,
    consumer: Mutex<ConsumerF<'a, O, E>>,
    sharder: SharderF,
}

impl<'a, I, M, O, E> ClosureMapReducer<'a, I, M, O, E> {
    /// Create a new MapReducer from the supplied closures.
    pub fn new<In, Map, Red, Con>(
        input: In,
        mapper: Map,
        reducer: Red,
        consumer: Con,
    ) -> ClosureMapReducer<'a, I, M, O, E>
    where
        In: Fn() -> Conduit<I> + Send + Sync + 'a,
        Map: Fn(I, &Emitter<M>) -> Result<(), E> + Send + Sync + 'a,
        Red: Fn(Conduit<M>, &Emitter<O>) -> Result<(), E> + Send + Sync + 'a,
        Con: FnMut(Conduit<O>) -> Result<(), E> + Send + 'a,
    {
        ClosureMapReducer {
            input: Box::new(input),
            mapper: Box::new(mapper),
            reducer: Box::new(reducer),
            consumer: Mutex::new(Box::new(consumer)),
            sharder: std_shard,
        }
    }

    /// Set the function used for sharding.
    pub fn set_sharder(&mut self, s: SharderF) {
        self.sharder = s;
    }
}

impl<'a, I, M, O, E> MapReducer for ClosureMapReducer<'a, I, M, O, E>
where
    I: Identifiable + Send,
    M: Identifiable + Send,
    O: Identifiable + Send,
    E: From<MRError> + fmt::Debug + Send,
{
    type Input = I;
    type Mapped = M;
    type Output = O;
    type Error = E;

    fn input(&self) -> Conduit<I> {
        (self.input)()
    }
    fn map(&self, record: I, emit: &Emitter<M>) -> Result<(), E> {
        (self.mapper)(record, emit)
    }
    fn reduce(&self, input: Conduit<M>, emit: &Emitter<O>) -> Result<(), E> {
        (self.reducer)(input, emit)
    }
    fn consume(&self, input: Conduit<O>) -> Result<(), E> {
        let mut consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);
        (*consumer)(input)
    }
    fn shard(&self, n: usize, id: &str) -> usize {
        (self.sharder)(n, id)
    }
}
