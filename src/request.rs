//! Request objects for non-blocking operations
//!
//! Non-blocking operations such as `immediate_send()` return request objects that borrow any
//! buffers involved in the operation so as to ensure proper access restrictions. In order to
//! release the borrowed buffers from the request objects, a completion operation such as
//! [`wait()`](struct.Request.html#method.wait) or [`test()`](struct.Request.html#method.test) must
//! be used on the request object.
//!
//! **Note:** If the `Request` is dropped (as opposed to calling `wait` or `test` explicitly), the
//! program will panic.
//!
//! To enforce this rule, every request object must be registered to some pre-existing
//! [`Scope`](trait.Scope.html).  At the end of a `Scope`, all its remaining requests will be waited
//! for until completion.  Scopes can be created using either [`scope`](fn.scope.html) or
//! [`StaticScope`](struct.StaticScope.html).
//!
//! To handle request completion in an RAII style, a request can be wrapped in a
//! [`WaitGuard`](struct.WaitGuard.html), which waits for the operation when it is dropped.
//!
//! A request moves from pending to completed exactly once. Sends complete as soon as the payload
//! has been handed to the fabric; receives complete when a matching message has been unpacked
//! into the receive buffer. Blocking operations are an immediate operation followed by `wait`.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;
use std::thread;

use tracing::warn;

use crate::error::Result;
use crate::fabric::{Endpoint, Envelope, PostedReceive};
use crate::point_to_point::Status;

/// Request traits
pub mod traits {
    pub use super::CollectRequests;
}

type Sink<'a> = Box<dyn FnOnce(Envelope) -> Result<Status> + 'a>;

enum State<'a> {
    /// The outcome is known, e.g. an eager send.
    Complete(Result<Status>),
    /// Waiting for a matching message; `sink` unpacks it into the borrowed buffer.
    Receive {
        posted: Arc<PostedReceive>,
        sink: Sink<'a>,
    },
    Done,
}

/// A request object for a non-blocking operation registered with a `Scope` of lifetime `'a`
///
/// The `Scope` is needed to ensure that all buffers associated request will outlive the request
/// itself, even if the destructor of the request fails to run.
///
/// # Panics
///
/// Panics if the request object is dropped.  To prevent this, call `wait`, `wait_without_status`,
/// or `test`.  Alternatively, wrap the request inside a `WaitGuard`.
///
/// # Examples
///
/// See `demos/immediate.rs`
#[must_use]
pub struct Request<'a, S: Scope<'a> = StaticScope> {
    endpoint: Arc<Endpoint>,
    state: State<'a>,
    scope: S,
    phantom: PhantomData<Cell<&'a ()>>,
}

impl<'a, S: Scope<'a>> fmt::Debug for Request<'a, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Complete(_) => "complete",
            State::Receive { .. } => "receiving",
            State::Done => "done",
        };
        f.debug_struct("Request").field("state", &state).finish()
    }
}

impl<'a, S: Scope<'a>> Drop for Request<'a, S> {
    fn drop(&mut self) {
        if !matches!(self.state, State::Done) && !thread::panicking() {
            panic!("request was dropped without being completed");
        }
    }
}

impl<'a, S: Scope<'a>> Request<'a, S> {
    fn new(endpoint: Arc<Endpoint>, state: State<'a>, scope: S) -> Self {
        scope.register();
        Self {
            endpoint,
            state,
            scope,
            phantom: PhantomData,
        }
    }

    /// A request whose outcome is already known.
    pub(crate) fn completed(endpoint: Arc<Endpoint>, result: Result<Status>, scope: S) -> Self {
        Self::new(endpoint, State::Complete(result), scope)
    }

    /// A request waiting for the message matched by `posted`.
    pub(crate) fn receive(
        endpoint: Arc<Endpoint>,
        posted: Arc<PostedReceive>,
        sink: Sink<'a>,
        scope: S,
    ) -> Self {
        Self::new(endpoint, State::Receive { posted, sink }, scope)
    }

    /// Takes the state out and unregisters from the scope. The request is inert afterwards.
    fn disarm(&mut self) -> State<'a> {
        let state = mem::replace(&mut self.state, State::Done);
        if !matches!(state, State::Done) {
            unsafe { self.scope.unregister() };
        }
        state
    }

    /// Drives the request towards completion, blocking if `blocking` is set.
    ///
    /// Returns `None` while the operation is pending.
    fn progress(&mut self, blocking: bool) -> Option<Result<Status>> {
        let posted = match &self.state {
            State::Receive { posted, .. } => Some(posted.clone()),
            State::Complete(_) => None,
            State::Done => return None,
        };
        let envelope = match posted {
            Some(posted) => {
                let arrived = if blocking {
                    self.endpoint.wait(&posted).map(Some)
                } else {
                    self.endpoint.test(&posted)
                };
                match arrived {
                    Ok(Some(envelope)) => Some(envelope),
                    Ok(None) => return None,
                    Err(e) => {
                        self.endpoint.cancel(&posted);
                        self.disarm();
                        return Some(Err(e));
                    }
                }
            }
            None => None,
        };
        match (self.disarm(), envelope) {
            (State::Complete(result), _) => Some(result),
            (State::Receive { sink, .. }, Some(envelope)) => Some(sink(envelope)),
            _ => None,
        }
    }

    /// Wait for an operation to finish.
    ///
    /// Will block execution of the calling thread until the associated operation has finished.
    ///
    /// # Examples
    ///
    /// See `demos/immediate.rs`
    pub fn wait(mut self) -> Result<Status> {
        loop {
            if let Some(result) = self.progress(true) {
                return result;
            }
        }
    }

    /// Wait for an operation to finish, but don’t bother retrieving the `Status` information.
    ///
    /// Will block execution of the calling thread until the associated operation has finished.
    pub fn wait_without_status(self) -> Result<()> {
        self.wait().map(|_| ())
    }

    /// Test whether an operation has finished.
    ///
    /// If the operation has finished, its outcome is returned.  Otherwise returns the unfinished
    /// `Request`.
    ///
    /// # Examples
    ///
    /// See `demos/immediate.rs`
    pub fn test(mut self) -> std::result::Result<Result<Status>, Self> {
        match self.progress(false) {
            Some(result) => Ok(result),
            None => Err(self),
        }
    }

    /// Reduce the scope of a request.
    pub fn shrink_scope_to<'b, S2>(mut self, scope: S2) -> Request<'b, S2>
    where
        'a: 'b,
        S2: Scope<'b>,
    {
        let state = self.disarm();
        Request::new(self.endpoint.clone(), state, scope)
    }
}

/// Collects an iterator of `Request` objects into a `RequestCollection` object
pub trait CollectRequests<'a, S: Scope<'a>>: IntoIterator<Item = Request<'a, S>> {
    /// Consumes and converts an iterator of `Request` objects into a `RequestCollection` object.
    fn collect_requests<'b, S2: Scope<'b>>(self, scope: S2) -> RequestCollection<'b, S2>
    where
        'a: 'b;
}

impl<'a, S: Scope<'a>, T: IntoIterator<Item = Request<'a, S>>> CollectRequests<'a, S> for T {
    fn collect_requests<'b, S2: Scope<'b>>(self, scope: S2) -> RequestCollection<'b, S2>
    where
        'a: 'b,
    {
        let mut collection = RequestCollection::new(scope);
        for request in self {
            collection.push(request);
        }
        collection
    }
}

/// Result type for [`RequestCollection::test_any`].
#[derive(Clone, Copy, Debug)]
pub enum TestAny {
    /// Indicates that there are no active requests in the collection.
    NoneActive,
    /// Indicates that none of the active requests in the collection are complete.
    NoneComplete,
    /// Indicates that an active request in the collection has completed. Includes the index of
    /// the request and the status of the completed request.
    Completed(i32, Status),
}

/// A collection of request objects that can be completed together
///
/// Completed requests leave an empty slot behind, so indices stay stable.
///
/// # Panics
///
/// Panics if the collection is dropped while it still holds requests.
///
/// # Examples
///
/// See `tests/request.rs`
#[must_use]
pub struct RequestCollection<'a, S: Scope<'a> = StaticScope> {
    requests: Vec<Option<Request<'a, S>>>,
    scope: S,
}

impl<'a, S: Scope<'a>> fmt::Debug for RequestCollection<'a, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCollection")
            .field("len", &self.len())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl<'a, S: Scope<'a>> Drop for RequestCollection<'a, S> {
    fn drop(&mut self) {
        if self.outstanding() != 0 && !thread::panicking() {
            panic!("RequestCollection was dropped with outstanding requests not completed.");
        }
    }
}

impl<'a, S: Scope<'a>> RequestCollection<'a, S> {
    /// Creates an empty collection whose requests are registered with `scope`.
    pub fn new(scope: S) -> Self {
        Self::with_capacity(scope, 0)
    }

    /// Like `new`, with room for `capacity` requests.
    pub fn with_capacity(scope: S, capacity: usize) -> Self {
        Self {
            requests: Vec::with_capacity(capacity),
            scope,
        }
    }

    /// Adds a request to the collection.
    pub fn push<'b: 'a, S2: Scope<'b>>(&mut self, request: Request<'b, S2>) {
        let request = request.shrink_scope_to(self.scope.clone());
        self.requests.push(Some(request));
    }

    /// Number of slots, completed or not.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the collection has no slots.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Number of requests that have not completed yet.
    pub fn outstanding(&self) -> usize {
        self.requests.iter().filter(|r| r.is_some()).count()
    }

    fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.requests
            .iter()
            .flatten()
            .next()
            .map(|r| r.endpoint.clone())
    }

    /// Checks every outstanding request once, without blocking.
    fn test_slots(&mut self) -> Option<(usize, Result<Status>)> {
        for (index, slot) in self.requests.iter_mut().enumerate() {
            if let Some(request) = slot {
                if let Some(result) = request.progress(false) {
                    *slot = None;
                    return Some((index, result));
                }
            }
        }
        None
    }

    /// Waits for any request in the collection to complete.
    ///
    /// Returns `None` if there are no outstanding requests. Otherwise returns the index of the
    /// completed request and its status.
    pub fn wait_any(&mut self) -> Result<Option<(i32, Status)>> {
        loop {
            match self.test_any()? {
                TestAny::NoneActive => return Ok(None),
                TestAny::Completed(index, status) => return Ok(Some((index, status))),
                TestAny::NoneComplete => {
                    if let Some(endpoint) = self.endpoint() {
                        endpoint.wait_for_progress()?;
                    }
                }
            }
        }
    }

    /// Checks whether any request in the collection has completed, without blocking.
    pub fn test_any(&mut self) -> Result<TestAny> {
        if self.outstanding() == 0 {
            return Ok(TestAny::NoneActive);
        }
        match self.test_slots() {
            Some((index, result)) => Ok(TestAny::Completed(index as i32, result?)),
            None => Ok(TestAny::NoneComplete),
        }
    }

    /// Waits for every request in the collection to complete.
    ///
    /// Returns the statuses in slot order, skipping slots that had completed earlier. Every
    /// request is completed even if one of them fails; the first error is returned.
    pub fn wait_all(&mut self) -> Result<Vec<Status>> {
        let mut statuses = Vec::with_capacity(self.outstanding());
        let mut failure = None;
        for request in self.requests.iter_mut().filter_map(Option::take) {
            match request.wait() {
                Ok(status) => statuses.push(status),
                Err(e) => {
                    warn!(error = %e, "request in a collection failed");
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(statuses),
        }
    }

    /// Checks whether every request in the collection has completed, without blocking.
    ///
    /// Completed requests are removed as they are found; returns `true` once none is left.
    pub fn test_all(&mut self) -> Result<bool> {
        while let Some((_, result)) = self.test_slots() {
            result?;
        }
        Ok(self.outstanding() == 0)
    }
}

/// Guard object that waits for the completion of an operation when it is dropped
///
/// The guard can be constructed or deconstructed using the `From` and `Into` traits. An error
/// reported by the operation while dropping the guard is logged.
///
/// # Examples
///
/// See `demos/immediate.rs`
#[derive(Debug)]
pub struct WaitGuard<'a, S: Scope<'a> = StaticScope>(Option<Request<'a, S>>);

impl<'a, S: Scope<'a>> Drop for WaitGuard<'a, S> {
    fn drop(&mut self) {
        if let Some(request) = self.0.take() {
            if let Err(e) = request.wait() {
                warn!(error = %e, "guarded request failed");
            }
        }
    }
}

impl<'a, S: Scope<'a>> From<WaitGuard<'a, S>> for Request<'a, S> {
    fn from(mut guard: WaitGuard<'a, S>) -> Self {
        match guard.0.take() {
            Some(request) => request,
            None => unreachable!("a WaitGuard always holds its request until dropped"),
        }
    }
}

impl<'a, S: Scope<'a>> From<Request<'a, S>> for WaitGuard<'a, S> {
    fn from(req: Request<'a, S>) -> Self {
        WaitGuard(Some(req))
    }
}

/// A common interface for [`LocalScope`](struct.LocalScope.html) and
/// [`StaticScope`](struct.StaticScope.html) used internally by the `request` module.
///
/// This trait is an implementation detail.  You shouldn’t have to use or implement this trait.
///
/// # Safety
///
/// A scope must not end while requests registered with it are outstanding.
pub unsafe trait Scope<'a>: Clone {
    /// Registers a request with the scope.
    fn register(&self) {
        self.register_many(1)
    }

    /// Registers multiple requests with the scope.
    fn register_many(&self, count: usize);

    /// Unregisters a request from the scope.
    ///
    /// # Safety
    ///
    /// Only a request registered with this scope may unregister, once.
    unsafe fn unregister(&self) {
        self.unregister_many(1)
    }

    /// Unregisters multiple requests from the scope.
    ///
    /// # Safety
    ///
    /// See `unregister`.
    unsafe fn unregister_many(&self, count: usize);
}

/// The scope that lasts as long as the entire execution of the program
///
/// Unlike `LocalScope<'a>`, `StaticScope` does not require any bookkeeping on the requests as every
/// request associated with a `StaticScope` can live as long as they please.
///
/// A `StaticScope` can be created simply by calling the `StaticScope` constructor.
///
/// # Invariant
///
/// For any `Request` registered with a `StaticScope`, its associated buffers must be `'static`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StaticScope;

unsafe impl Scope<'static> for StaticScope {
    fn register_many(&self, _count: usize) {}
    unsafe fn unregister_many(&self, _count: usize) {}
}

/// A temporary scope that lasts no more than the lifetime `'a`
///
/// Use `LocalScope` for to perform requests with temporary buffers.
///
/// To obtain a `LocalScope`, use the [`scope`](fn.scope.html) function.
///
/// # Invariant
///
/// For any `Request` registered with a `LocalScope<'a>`, its associated buffers must outlive `'a`.
///
/// # Panics
///
/// When `LocalScope` is dropped, it will panic if there are any lingering `Requests` that have not
/// yet been completed.
#[derive(Debug)]
pub struct LocalScope<'a> {
    num_requests: Cell<usize>,
    phantom: PhantomData<Cell<&'a ()>>, // Cell needed to ensure 'a is invariant
}

impl<'a> Drop for LocalScope<'a> {
    fn drop(&mut self) {
        if self.num_requests.get() != 0 && !thread::panicking() {
            panic!("at least one request was dropped without being completed");
        }
    }
}

unsafe impl<'a, 'b> Scope<'a> for &'b LocalScope<'a> {
    fn register_many(&self, count: usize) {
        self.num_requests.set(self.num_requests.get() + count)
    }

    unsafe fn unregister_many(&self, count: usize) {
        self.num_requests.set(
            self.num_requests
                .get()
                .checked_sub(count)
                .expect("unregister has been called more times than register"),
        )
    }
}

/// Used to create a [`LocalScope`](struct.LocalScope.html)
///
/// The function creates a `LocalScope` and then passes it into the given
/// closure as an argument.
///
/// For safety reasons, all variables and buffers associated with a request
/// must exist *outside* the scope with which the request is registered.
///
/// It is typically used like this:
///
/// ```
/// /* declare variables and buffers here ... */
/// spmd::request::scope(|scope| {
///     /* perform sends and/or receives using 'scope' */
/// });
/// /* at end of scope, panic if there are requests that have not yet completed */
/// ```
///
/// # Examples
///
/// See `demos/immediate.rs`
pub fn scope<'a, F, R>(f: F) -> R
where
    F: FnOnce(&LocalScope<'a>) -> R,
{
    f(&LocalScope {
        num_requests: Default::default(),
        phantom: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::Error;
    use crate::fabric::{Fabric, LocalFabric, Pattern};

    #[test]
    fn failed_requests_withdraw_their_receive() {
        let fabric = LocalFabric::create(1).pop().expect("one fabric");
        fabric.signal_abort(2);
        let endpoint = Arc::new(Endpoint::new(Box::new(fabric), Duration::from_millis(1)));
        let posted = endpoint.post_receive(Pattern {
            context: 0,
            source: None,
            tag: None,
        });
        let request = Request::receive(
            endpoint.clone(),
            posted,
            Box::new(|_: Envelope| -> Result<Status> { unreachable!("nothing was sent") }),
            StaticScope,
        );
        match request.test() {
            Ok(Err(Error::Aborted { rank, code })) => assert_eq!((rank, code), (0, 2)),
            other => panic!("expected an abort, got {:?}", other.map(|_| ())),
        }
        assert_eq!(endpoint.posted_receives(), 0);
    }
}
