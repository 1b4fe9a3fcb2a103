//! Error handling
//!
//! Every communication entry point returns [`Result`]. Errors that indicate a defect in the
//! calling program (a rank outside of a communicator, mismatched buffer lengths in a collective,
//! an incomplete request being dropped) are not reported through `Error` but cause a panic.

use std::io;

use thiserror::Error;

use crate::datatype::Primitive;
use crate::topology::Rank;

/// Set of error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid argument of some other kind.
    Arg,
    /// Invalid dimension argument.
    Dims,
    /// Error in the underlying transport.
    Io,
    /// The process group was aborted.
    Aborted,
    /// Invalid operation.
    Op,
    /// Known error not in this list.
    Other,
    /// Message truncated on receive.
    Truncate,
    /// Invalid datatype argument.
    Type,
}

/// Errors reported by communication and setup operations
#[derive(Error, Debug)]
pub enum Error {
    /// `initialize()` was called more than once in this process.
    #[error("the process has already been initialized")]
    AlreadyInitialized,

    /// The environment or an explicit `Config` is malformed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A message did not fit into the receive buffer.
    #[error("message truncated: received {received} bytes into a buffer of {capacity} bytes")]
    Truncated {
        /// Size of the incoming message
        received: usize,
        /// Size of the receive buffer
        capacity: usize,
    },

    /// A message is not a whole number of elements of the receive datatype.
    #[error("message of {received} bytes is not a whole number of {element_size} byte elements")]
    TypeMismatch {
        /// Size of the incoming message
        received: usize,
        /// Packed size of one element of the receive datatype
        element_size: usize,
    },

    /// A reduction operation is not defined for a primitive type.
    #[error("operation {operation} is not defined for {primitive:?}")]
    InvalidOperation {
        /// Name of the operation
        operation: &'static str,
        /// The primitive it was applied to
        primitive: Primitive,
    },

    /// A topology was requested with dimensions that cannot hold the process group.
    #[error("invalid dimensions: {0}")]
    Dims(String),

    /// Some rank aborted the process group.
    #[error("rank {rank} aborted the process group with code {code}")]
    Aborted {
        /// World rank of the aborting process
        rank: Rank,
        /// The error code it passed to `abort`
        code: i32,
    },

    /// A peer hung up before the process group finalized.
    #[error("lost connection to rank {peer}")]
    Disconnected {
        /// World rank of the peer
        peer: Rank,
    },

    /// The transport failed.
    #[error("transport failure: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The class this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyInitialized => ErrorKind::Other,
            Error::Config(_) => ErrorKind::Arg,
            Error::Truncated { .. } => ErrorKind::Truncate,
            Error::TypeMismatch { .. } => ErrorKind::Type,
            Error::InvalidOperation { .. } => ErrorKind::Op,
            Error::Dims(_) => ErrorKind::Dims,
            Error::Aborted { .. } => ErrorKind::Aborted,
            Error::Disconnected { .. } | Error::Io(_) => ErrorKind::Io,
        }
    }
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
