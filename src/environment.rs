//! Environmental management
//!
//! This module provides ways for a program to join its process group and interact with its
//! environment.
//!
//! A process joins the group exactly once, through [`initialize`] or
//! [`initialize_with_config`]. The returned [`Universe`] hands out the world communicator;
//! dropping it leaves the group. For tests and demos, [`run_threaded`] runs a whole group as
//! threads of the calling process.
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing::{debug, error, info, warn};

use crate::collective::traits::*;
use crate::error::{Error, Result};
use crate::fabric::{Endpoint, Fabric, LocalFabric, TcpFabric};
use crate::topology::{RawCommunicator, SystemCommunicator};

pub mod config;

pub use self::config::{Collectives, Config};

/// Exit code signalled to the group when a rank panics while holding a `Universe`
const PANIC_EXIT_CODE: i32 = 101;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Global context
///
/// Dropping the `Universe` synchronizes the world with a barrier and shuts the fabric down. If
/// the owning thread is panicking, the barrier is skipped and the rest of the group is told to
/// abort instead.
pub struct Universe {
    world: SystemCommunicator,
    endpoint: Arc<Endpoint>,
}

impl Universe {
    /// The 'world communicator'
    ///
    /// Contains all processes initially partaking in the computation.
    ///
    /// # Examples
    /// See `demos/hello.rs`
    pub fn world(&self) -> SystemCommunicator {
        self.world.clone()
    }

    /// Time in seconds since an arbitrary time in the past.
    ///
    /// Same as [`time`].
    pub fn get_time(&self) -> f64 {
        time()
    }

    /// Resolution of timer used in [`Universe::get_time`] in seconds
    pub fn get_time_res(&self) -> f64 {
        time_resolution()
    }
}

impl std::fmt::Debug for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Universe").field("world", &self.world).finish()
    }
}

impl Drop for Universe {
    fn drop(&mut self) {
        let rank = self.endpoint.world_rank();
        if thread::panicking() {
            error!(rank, "rank panicked while holding the universe");
            self.endpoint.signal_abort(PANIC_EXIT_CODE);
        } else if let Err(e) = self.world.barrier() {
            warn!(rank, error = %e, "final barrier failed");
        }
        self.endpoint.shutdown();
        info!(rank, "finalized");
    }
}

/// Joins the process group described by the environment.
///
/// See [`Config::from_env`] for the variables read. Without any of them the process forms a
/// world of size one.
///
/// # Errors
/// `Error::AlreadyInitialized` if the process has joined before, `Error::Config` on malformed
/// variables and `Error::Io` if the peers cannot be reached.
///
/// # Examples
/// See `demos/hello.rs`
pub fn initialize() -> Result<Universe> {
    initialize_with_config(Config::from_env()?)
}

/// Joins the process group described by `config`.
///
/// Connects to the peers over TCP unless `config.peers` is empty.
pub fn initialize_with_config(config: Config) -> Result<Universe> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(Error::AlreadyInitialized);
    }
    let fabric: Result<Box<dyn Fabric>> = if config.peers.is_empty() {
        Ok(Box::new(LocalFabric::create(1).remove(0)))
    } else {
        TcpFabric::bind(config.rank, config.peers.clone(), config.connect_timeout)
            .map(|fabric| Box::new(fabric) as Box<dyn Fabric>)
    };
    match fabric {
        Ok(fabric) => Ok(universe(fabric, &config)),
        Err(e) => {
            INITIALIZED.store(false, Ordering::SeqCst);
            Err(e)
        }
    }
}

/// Joins a process group over a caller-supplied fabric.
///
/// Only `config.collectives` and `config.poll_interval` are used; rank and size come from the
/// fabric. Unlike [`initialize`], this may be called any number of times, once per fabric.
pub fn initialize_with_fabric<F>(fabric: F, config: &Config) -> Universe
where
    F: Fabric + 'static,
{
    universe(Box::new(fabric), config)
}

fn universe(fabric: Box<dyn Fabric>, config: &Config) -> Universe {
    Lazy::force(&EPOCH);
    let endpoint = Arc::new(Endpoint::new(fabric, config.poll_interval));
    debug!(collectives = %config.collectives, "selected collective algorithms");
    let world = SystemCommunicator::from_raw(RawCommunicator::world(
        endpoint.clone(),
        config.collectives.algorithms(),
    ));
    info!(
        rank = endpoint.world_rank(),
        size = endpoint.world_size(),
        "initialized"
    );
    Universe { world, endpoint }
}

/// Runs `f` on `size` ranks, each a thread of the calling process, and returns their results
/// in rank order.
///
/// A panic on any rank aborts the group and is resumed on the calling thread once all ranks
/// have stopped.
///
/// # Examples
///
/// ```
/// use spmd::traits::*;
///
/// let ranks = spmd::environment::run_threaded(3, |universe| universe.world().rank());
/// assert_eq!(ranks, vec![0, 1, 2]);
/// ```
pub fn run_threaded<F, R>(size: usize, f: F) -> Vec<R>
where
    F: Fn(Universe) -> R + Sync,
    R: Send,
{
    run_threaded_with_config(size, &Config::default(), f)
}

/// Like [`run_threaded`], with the collective algorithms and poll interval taken from `config`.
pub fn run_threaded_with_config<F, R>(size: usize, config: &Config, f: F) -> Vec<R>
where
    F: Fn(Universe) -> R + Sync,
    R: Send,
{
    assert!(size > 0, "A process group needs at least one rank.");
    let f = &f;
    let outcomes: Vec<thread::Result<R>> = thread::scope(|s| {
        let handles: Vec<_> = LocalFabric::create(size)
            .into_iter()
            .map(|fabric| {
                thread::Builder::new()
                    .name(format!("spmd-rank-{}", fabric.rank()))
                    .spawn_scoped(s, move || f(initialize_with_fabric(fabric, config)))
                    .expect("Failed to spawn a rank thread.")
            })
            .collect();
        handles.into_iter().map(|handle| handle.join()).collect()
    });
    outcomes
        .into_iter()
        .map(|outcome| outcome.unwrap_or_else(|payload| panic::resume_unwind(payload)))
        .collect()
}

/// Time in seconds since an arbitrary time in the past.
///
/// The epoch is fixed process-wide at the first use, so values are only comparable within
/// one process.
pub fn time() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

/// Resolution of timer used in `time()` in seconds
pub fn time_resolution() -> f64 {
    1e-9
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::traits::*;

    #[test]
    fn time_is_monotonic() {
        let a = time();
        let b = time();
        assert!(b >= a);
        assert!(time_resolution() > 0.0);
    }

    #[test]
    fn threaded_results_come_back_in_rank_order() {
        let sizes = run_threaded(4, |universe| {
            let world = universe.world();
            (world.rank(), world.size())
        });
        assert_eq!(sizes, vec![(0, 4), (1, 4), (2, 4), (3, 4)]);
    }

    #[test]
    #[should_panic(expected = "rank two failed")]
    fn a_panicking_rank_is_resumed_on_the_caller() {
        run_threaded(3, |universe| {
            if universe.world().rank() == 2 {
                panic!("rank two failed");
            }
        });
    }
}
