//! Error types for bmcfront

use thiserror::Error;

use crate::bus::BusError;
use crate::filter::ParseError;
use crate::task::TaskState;

/// The main error type for bmcfront operations.
///
/// Authorization has no variant here: a failed check is a
/// [`Decision::Forbidden`](crate::authz::Decision), not an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A privilege name that is not in the privilege table
    #[error("unknown privilege '{0}'")]
    UnknownPrivilege(String),

    #[error(transparent)]
    Filter(#[from] ParseError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("task {0} not found")]
    TaskNotFound(String),

    /// Requested task state change that the state machine does not allow
    #[error("task cannot move from {from} to {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("session: {0}")]
    Session(String),

    #[error("config: {0}")]
    Config(String),
}

/// Result type alias for bmcfront operations
pub type Result<T> = std::result::Result<T, Error>;
