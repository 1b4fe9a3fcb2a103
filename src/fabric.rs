//! Transports and message matching
//!
//! A `Fabric` moves `Envelope`s between the processes of a world: it knows nothing about
//! communicators, tags or datatypes. Every process owns exactly one `Endpoint` wrapping its
//! fabric. The endpoint matches arriving envelopes against posted receives:
//!
//! - an arriving envelope completes the oldest posted receive whose pattern it matches, or is
//!   queued as unexpected,
//! - a newly posted receive first takes the oldest matching unexpected envelope.
//!
//! Because fabrics deliver envelopes between a pair of processes in the order they were posted,
//! messages on one `(communicator, source, tag)` channel are received in send order.
//!
//! Progress is made by whichever thread waits: blocking operations poll the fabric with a short
//! timeout so that an abort raised elsewhere in the world is noticed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{error, trace};

use crate::error::Result;
use crate::topology::Rank;
use crate::Tag;

mod local;
mod tcp;
mod wire;

pub use self::local::LocalFabric;
pub use self::tcp::TcpFabric;

/// A message in flight between two processes
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Communication context the message belongs to
    pub context: u64,
    /// Rank of the sender within the communicator identified by `context`
    pub source: Rank,
    /// Message tag
    pub tag: Tag,
    /// Packed message contents
    pub payload: Vec<u8>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("context", &self.context)
            .field("source", &self.source)
            .field("tag", &self.tag)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Byte transport between the processes of one world
///
/// Implementations must deliver envelopes posted by one process to another in posting order.
pub trait Fabric: Send + Sync {
    /// Index of this process in the world
    fn rank(&self) -> usize;

    /// Number of processes in the world
    fn size(&self) -> usize;

    /// Hands `envelope` to the transport for delivery to world rank `destination`.
    ///
    /// Returns once the envelope has been handed off; it may not have arrived yet.
    fn post(&self, destination: usize, envelope: Envelope) -> Result<()>;

    /// Takes the next envelope addressed to this process, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` on timeout and `Err(Error::Aborted { .. })` once any process of the
    /// world has aborted.
    fn receive_timeout(&self, timeout: Duration) -> Result<Option<Envelope>>;

    /// Takes the next envelope addressed to this process if one has already arrived.
    fn try_receive(&self) -> Result<Option<Envelope>>;

    /// Tells every other process that this process is aborting with `code`.
    fn signal_abort(&self, code: i32);

    /// Terminates the world with `code`.
    fn abort(&self, code: i32) -> !;

    /// Releases transport resources after the world has finalized.
    fn shutdown(&self) {}
}

/// What a posted receive or a probe accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pattern {
    pub context: u64,
    pub source: Option<Rank>,
    pub tag: Option<Tag>,
}

impl Pattern {
    fn matches(&self, envelope: &Envelope) -> bool {
        self.context == envelope.context
            && self.source.map_or(true, |s| s == envelope.source)
            && self.tag.map_or(true, |t| t == envelope.tag)
    }
}

/// A receive waiting for its message
#[derive(Debug)]
pub(crate) struct PostedReceive {
    pattern: Pattern,
    slot: Mutex<Option<Envelope>>,
}

impl PostedReceive {
    fn take(&self) -> Option<Envelope> {
        lock(&self.slot).take()
    }
}

#[derive(Debug, Default)]
struct MatchState {
    unexpected: VecDeque<Envelope>,
    posted: VecDeque<Arc<PostedReceive>>,
}

impl MatchState {
    fn deliver(&mut self, envelope: Envelope) {
        match self.posted.iter().position(|p| p.pattern.matches(&envelope)) {
            Some(index) => {
                trace!(?envelope, "matched posted receive");
                if let Some(posted) = self.posted.remove(index) {
                    *lock(&posted.slot) = Some(envelope);
                }
            }
            None => {
                trace!(?envelope, "queued unexpected message");
                self.unexpected.push_back(envelope);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking rank thread never leaves the queues half-updated.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One process's access point to its world: the fabric plus the matching engine
pub(crate) struct Endpoint {
    fabric: Box<dyn Fabric>,
    state: Mutex<MatchState>,
    next_context: AtomicU64,
    poll_interval: Duration,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("rank", &self.fabric.rank())
            .field("size", &self.fabric.size())
            .finish()
    }
}

impl Endpoint {
    /// Context id of the world communicator
    pub(crate) const WORLD_CONTEXT: u64 = 0;

    pub(crate) fn new(fabric: Box<dyn Fabric>, poll_interval: Duration) -> Endpoint {
        Endpoint {
            fabric,
            state: Mutex::new(MatchState::default()),
            next_context: AtomicU64::new(Endpoint::WORLD_CONTEXT + 1),
            poll_interval,
        }
    }

    pub(crate) fn world_rank(&self) -> usize {
        self.fabric.rank()
    }

    pub(crate) fn world_size(&self) -> usize {
        self.fabric.size()
    }

    pub(crate) fn post(&self, destination: usize, envelope: Envelope) -> Result<()> {
        trace!(destination, ?envelope, "posting message");
        self.fabric.post(destination, envelope)
    }

    pub(crate) fn post_receive(&self, pattern: Pattern) -> Arc<PostedReceive> {
        let posted = Arc::new(PostedReceive {
            pattern,
            slot: Mutex::new(None),
        });
        let mut state = lock(&self.state);
        match state.unexpected.iter().position(|e| pattern.matches(e)) {
            Some(index) => {
                *lock(&posted.slot) = state.unexpected.remove(index);
            }
            None => state.posted.push_back(posted.clone()),
        }
        posted
    }

    /// Moves arrived envelopes into the matching engine, waiting up to `timeout` for the first.
    fn progress(&self, timeout: Option<Duration>) -> Result<()> {
        let first = match timeout {
            Some(timeout) => self.fabric.receive_timeout(timeout)?,
            None => self.fabric.try_receive()?,
        };
        if let Some(envelope) = first {
            let mut state = lock(&self.state);
            state.deliver(envelope);
            while let Some(envelope) = self.fabric.try_receive()? {
                state.deliver(envelope);
            }
        }
        Ok(())
    }

    pub(crate) fn test(&self, posted: &PostedReceive) -> Result<Option<Envelope>> {
        if let Some(envelope) = posted.take() {
            return Ok(Some(envelope));
        }
        self.progress(None)?;
        Ok(posted.take())
    }

    pub(crate) fn wait(&self, posted: &PostedReceive) -> Result<Envelope> {
        loop {
            if let Some(envelope) = posted.take() {
                return Ok(envelope);
            }
            self.progress(Some(self.poll_interval))?;
        }
    }

    /// Blocks until some envelope arrives or the poll interval elapses.
    pub(crate) fn wait_for_progress(&self) -> Result<()> {
        self.progress(Some(self.poll_interval))
    }

    pub(crate) fn receive(&self, pattern: Pattern) -> Result<Envelope> {
        let posted = self.post_receive(pattern);
        self.wait(&posted).map_err(|e| {
            self.cancel(&posted);
            e
        })
    }

    /// Withdraws a posted receive nobody is going to complete.
    ///
    /// A message that already matched it goes back to the front of the unexpected queue.
    pub(crate) fn cancel(&self, posted: &Arc<PostedReceive>) {
        let mut state = lock(&self.state);
        state.posted.retain(|p| !Arc::ptr_eq(p, posted));
        if let Some(envelope) = posted.take() {
            trace!(?envelope, "requeued message of a cancelled receive");
            state.unexpected.push_front(envelope);
        }
    }

    #[cfg(test)]
    pub(crate) fn posted_receives(&self) -> usize {
        lock(&self.state).posted.len()
    }

    /// Finds the oldest unexpected envelope matching `pattern` and hands it to `f`, removing it
    /// from the queue if `f` says so.
    fn find_unexpected<R>(
        &self,
        pattern: Pattern,
        blocking: bool,
        f: impl Fn(&mut VecDeque<Envelope>, usize) -> R,
    ) -> Result<Option<R>> {
        loop {
            self.progress(None)?;
            {
                let mut state = lock(&self.state);
                if let Some(index) = state.unexpected.iter().position(|e| pattern.matches(e)) {
                    return Ok(Some(f(&mut state.unexpected, index)));
                }
            }
            if !blocking {
                return Ok(None);
            }
            self.progress(Some(self.poll_interval))?;
        }
    }

    /// Source, tag and payload length of the next message matching `pattern`.
    pub(crate) fn probe(
        &self,
        pattern: Pattern,
        blocking: bool,
    ) -> Result<Option<(Rank, Tag, usize)>> {
        self.find_unexpected(pattern, blocking, |queue, index| {
            let e = &queue[index];
            (e.source, e.tag, e.payload.len())
        })
    }

    /// Removes the next message matching `pattern` so that no other receive can match it.
    pub(crate) fn matched_probe(&self, pattern: Pattern, blocking: bool) -> Result<Option<Envelope>> {
        Ok(self
            .find_unexpected(pattern, blocking, |queue, index| queue.remove(index))?
            .flatten())
    }

    /// Proposes a context id for a new communicator.
    pub(crate) fn propose_context(&self) -> u64 {
        self.next_context.load(Ordering::SeqCst)
    }

    /// Records that `context` has been agreed on for a new communicator.
    pub(crate) fn claim_context(&self, context: u64) {
        self.next_context.fetch_max(context + 1, Ordering::SeqCst);
    }

    pub(crate) fn signal_abort(&self, code: i32) {
        self.fabric.signal_abort(code)
    }

    pub(crate) fn abort(&self, code: i32) -> ! {
        error!(rank = self.world_rank(), code, "aborting the process group");
        self.fabric.abort(code)
    }

    pub(crate) fn shutdown(&self) {
        self.fabric.shutdown()
    }
}
