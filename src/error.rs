//! Errors raised by the engine itself.

use thiserror::Error;

/// Engine-side failures. User error types plug into a run through
/// `MapReducer::Error: From<MRError>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MRError {
    /// Emitted on a conduit whose receivers are all gone.
    #[error("conduit is closed")]
    Closed,

    /// The invocation was cancelled while blocked on a conduit.
    #[error("map/reduce run was cancelled")]
    Cancelled,

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// More completion signals than the counter was created for.
    #[error("termination counter of size {size} signalled too often")]
    TerminationOverflow { size: usize },

    /// A reducer returned before its input conduit was closed.
    #[error("reducer {reducer} stopped draining its input")]
    AbandonedInput { reducer: usize },
}

pub type Result<T> = std::result::Result<T, MRError>;
