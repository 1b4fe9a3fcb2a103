#![deny(missing_docs)]
#![warn(missing_copy_implementations)]
#![warn(trivial_casts)]
#![warn(trivial_numeric_casts)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_qualifications)]

//! Message passing for single-program-multiple-data process groups
//!
//! A fixed set of cooperating processes (ranks) exchange typed messages through communicators.
//! The crate follows the programming model of the Message Passing Interface: a world
//! communicator is obtained from a [`Universe`](environment::Universe), sub-communicators are
//! derived by splitting or by imposing a Cartesian topology, and data moves through
//! point-to-point operations and collective operations described by datatypes.
//!
//! # Usage
//!
//! Add the `spmd` crate as a dependency in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! spmd = "0.1.0"
//! ```
//!
//! Then use it in your program like this:
//!
//! ```no_run
//! use spmd::traits::*;
//!
//! fn main() -> spmd::Result<()> {
//!     let universe = spmd::initialize()?;
//!     let world = universe.world();
//!     let size = world.size();
//!     let rank = world.rank();
//!
//!     if size != 2 {
//!         panic!("Size of the world communicator must be 2, but is {}!", size);
//!     }
//!
//!     match rank {
//!         0 => {
//!             let msg = vec![4.0f64, 8.0, 15.0];
//!             world.process_at_rank(rank + 1).send(&msg[..])?;
//!         }
//!         1 => {
//!             let (msg, status) = world.any_process().receive_vec::<f64>()?;
//!             println!("Process {} got message {:?}.\nStatus is: {:?}", rank, msg, status);
//!         }
//!         _ => unreachable!(),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Processes are started by an external launcher that sets `SPMD_RANK` and `SPMD_PEERS` (see
//! [`environment::Config`]). Without those variables the program runs as a world of size one.
//! For tests, [`environment::run_threaded`] runs a whole world inside one process.
//!
//! # Features
//!
//! - **Communicators and groups**: world communicator, duplication, splitting by color and
//!   key or by group, group set operations.
//! - **Point to point communication**: standard mode send, receive in blocking and non-blocking
//!   variants, send-receive, probe and matched probe.
//! - **Collective communication**: barrier, broadcast, (all) gather, scatter, all to all,
//!   (all) reduce, inclusive and exclusive scan, with exchangeable algorithm sets.
//! - **Datatypes**: bridging between Rust types and primitive datatypes as well as derived
//!   datatypes (contiguous, vector, indexed, structured) which can act as views into buffers.
//! - **Topologies**: Cartesian communicators with periodic dimensions and balanced
//!   dimension factorization.
//! - **Transports**: in-process threads and TCP.

/// Re-exports all traits.
pub mod traits {
    pub use crate::collective::traits::*;
    pub use crate::datatype::traits::*;
    pub use crate::point_to_point::traits::*;
    pub use crate::raw::traits::*;
    pub use crate::request::traits::*;
    pub use crate::topology::traits::*;

    #[cfg(feature = "derive")]
    pub use spmd_derive::Equivalence;
}

#[doc(hidden)]
pub mod internal {
    #[cfg(feature = "derive")]
    pub use memoffset;
    pub use once_cell;
}

pub mod collective;
pub mod datatype;
pub mod environment;
pub mod error;
pub mod fabric;
pub mod point_to_point;
pub mod raw;
pub mod request;
pub mod topology;

pub use crate::environment::{initialize, initialize_with_config, Universe};
pub use crate::error::{Error, ErrorKind, Result};

/// Encodes number of values in multi-value messages.
pub type Count = i32;

/// Can be used to tag messages on the sender side and match on the receiver side.
pub type Tag = i32;

/// An address in memory
pub type Address = isize;

/// Small inline storage for per-dimension integer data
pub(crate) type IntArray = smallvec::SmallVec<[Count; 8]>;
