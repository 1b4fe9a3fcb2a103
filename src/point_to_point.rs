//! Point to point communication
//!
//! Endpoints of communication are mostly described by types that implement the `Source` and
//! `Destination` trait. Communication operations are implemented as default methods on those
//! traits.
//!
//! Sends are eager: the buffer is packed and handed to the fabric before the call returns, so the
//! buffer may be reused immediately. Receives match on `(source, tag)` within the communicator;
//! `any_process()` and `ANY_TAG` act as wildcards. Messages from one process to another with one
//! tag are received in the order they were sent.

use std::fmt;
use std::sync::Arc;

use conv::ConvUtil;
use tracing::warn;

use crate::datatype::traits::*;
use crate::datatype::{pack, pack_mut, unpack_into, zeroed, DatatypeRef, DynBufferMut};
use crate::error::Result;
use crate::fabric::{Endpoint, Envelope, Pattern};
use crate::raw::traits::*;
use crate::request::{scope, Request, Scope, StaticScope};
use crate::topology::traits::*;
use crate::topology::{AnyProcess, CommunicatorRelation, Process, Rank};
use crate::{Count, Tag};

/// Point to point communication traits
pub mod traits {
    pub use super::{Destination, MatchedReceiveVec, Source};
}

/// Matches messages with any tag when used as the tag of a receive or probe.
pub const ANY_TAG: Tag = -1;

fn assert_receive_tag(tag: Tag) {
    assert!(
        tag >= 0 || tag == ANY_TAG,
        "Receive tags must be non-negative or ANY_TAG, got {}.",
        tag
    );
}

fn endpoint_of<C: AsCommunicator + ?Sized>(c: &C) -> &Arc<Endpoint> {
    c.as_communicator().as_raw().endpoint()
}

fn pattern<S: Source + ?Sized>(source: &S, tag: Tag) -> Pattern {
    assert_receive_tag(tag);
    Pattern {
        context: source
            .as_communicator()
            .as_raw()
            .point_to_point_context(),
        source: source.source_rank(),
        tag: if tag == ANY_TAG { None } else { Some(tag) },
    }
}

/// Unpacks a matched message into `buf`.
fn deliver<B: BufferMut + ?Sized>(envelope: Envelope, buf: &mut B) -> Result<Status> {
    let status = Status::of(&envelope);
    match unpack_into(&envelope.payload, buf) {
        Ok(_) => Ok(status),
        Err(e) => {
            warn!(
                source = status.source_rank,
                tag = status.tag,
                error = %e,
                "could not receive message"
            );
            Err(e)
        }
    }
}

/// Something that can be used as the source in a point to point receive operation
///
/// # Examples
///
/// - A `Process` used as a source for a receive operation will receive data only from the
///   identified process.
/// - A communicator can also be used as a source via the `AnyProcess` identifier.
pub trait Source: AsCommunicator {
    /// `Rank` that identifies the source, `None` for any process
    fn source_rank(&self) -> Option<Rank>;

    /// Probe a source for incoming messages.
    ///
    /// Probe `Source` `&self` for incoming messages with a certain tag.
    ///
    /// An ordinary `probe()` returns a `Status` which allows inspection of the properties of the
    /// incoming message, but does not guarantee reception by a subsequent `receive()` (especially
    /// in a multi-threaded set-up). For a probe operation with stronger guarantees, see
    /// `matched_probe()`.
    fn probe_with_tag(&self, tag: Tag) -> Result<Status> {
        loop {
            if let Some(status) = self.immediate_probe_with_tag(tag)? {
                return Ok(status);
            }
            endpoint_of(self).wait_for_progress()?;
        }
    }

    /// Probe a source for incoming messages.
    ///
    /// Probe `Source` `&self` for incoming messages with any tag.
    fn probe(&self) -> Result<Status> {
        self.probe_with_tag(ANY_TAG)
    }

    /// Probe a source for incoming messages with guaranteed reception.
    ///
    /// Probe `Source` `&self` for incoming messages with a certain tag.
    ///
    /// A `matched_probe()` returns both a `Status` that describes the properties of a pending
    /// incoming message and a `Message` which can and *must* subsequently be used in a
    /// `matched_receive()` to receive the probed message.
    fn matched_probe_with_tag(&self, tag: Tag) -> Result<(Message, Status)> {
        loop {
            if let Some(matched) = self.immediate_matched_probe_with_tag(tag)? {
                return Ok(matched);
            }
            endpoint_of(self).wait_for_progress()?;
        }
    }

    /// Probe a source for incoming messages with guaranteed reception.
    ///
    /// Probe `Source` `&self` for incoming messages with any tag.
    fn matched_probe(&self) -> Result<(Message, Status)> {
        self.matched_probe_with_tag(ANY_TAG)
    }

    /// Receive a message containing a single instance of type `Msg`.
    ///
    /// Receive a message from `Source` `&self` tagged `tag` containing a single instance of type
    /// `Msg`.
    fn receive_with_tag<Msg>(&self, tag: Tag) -> Result<(Msg, Status)>
    where
        Msg: Equivalence,
    {
        let mut res: Msg = zeroed();
        let status = self.receive_into_with_tag(&mut res, tag)?;
        Ok((res, status))
    }

    /// Receive a message containing a single instance of type `Msg`.
    ///
    /// Receive a message from `Source` `&self` containing a single instance of type `Msg`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use spmd::traits::*;
    ///
    /// let universe = spmd::initialize().unwrap();
    /// let world = universe.world();
    ///
    /// let x = world.any_process().receive::<f64>().unwrap();
    /// ```
    fn receive<Msg>(&self) -> Result<(Msg, Status)>
    where
        Msg: Equivalence,
    {
        self.receive_with_tag(ANY_TAG)
    }

    /// Receive a message into a `Buffer`.
    ///
    /// Receive a message from `Source` `&self` tagged `tag` into `Buffer` `buf`.
    ///
    /// Fails with `Error::Truncated` and leaves `buf` untouched if the message is larger than
    /// `buf`.
    fn receive_into_with_tag<Buf: ?Sized>(&self, buf: &mut Buf, tag: Tag) -> Result<Status>
    where
        Buf: BufferMut,
    {
        scope(|scope| {
            self.immediate_receive_into_with_tag(scope, buf, tag)
                .wait()
        })
    }

    /// Receive a message into a `Buffer`.
    ///
    /// Receive a message from `Source` `&self` into `Buffer` `buf`.
    fn receive_into<Buf: ?Sized>(&self, buf: &mut Buf) -> Result<Status>
    where
        Buf: BufferMut,
    {
        self.receive_into_with_tag(buf, ANY_TAG)
    }

    /// Receive a message containing multiple instances of type `Msg` into a `Vec`.
    ///
    /// Receive a message from `Source` `&self` tagged `tag` containing multiple instances of type
    /// `Msg` into a `Vec`. The length is taken from the message.
    fn receive_vec_with_tag<Msg>(&self, tag: Tag) -> Result<(Vec<Msg>, Status)>
    where
        Msg: Equivalence,
    {
        self.matched_probe_with_tag(tag)?.matched_receive_vec()
    }

    /// Receive a message containing multiple instances of type `Msg` into a `Vec`.
    ///
    /// Receive a message from `Source` `&self` containing multiple instances of type `Msg` into a
    /// `Vec`.
    ///
    /// # Examples
    /// See `demos/blocking.rs`
    fn receive_vec<Msg>(&self) -> Result<(Vec<Msg>, Status)>
    where
        Msg: Equivalence,
    {
        self.receive_vec_with_tag(ANY_TAG)
    }

    /// Initiate an immediate (non-blocking) receive operation.
    ///
    /// Initiate receiving a message matching `tag` into `buf`.
    fn immediate_receive_into_with_tag<'a, Sc, Buf: ?Sized>(
        &self,
        scope: Sc,
        buf: &'a mut Buf,
        tag: Tag,
    ) -> Request<'a, Sc>
    where
        Buf: 'a + BufferMut,
        Sc: Scope<'a>,
    {
        let endpoint = endpoint_of(self).clone();
        let posted = endpoint.post_receive(pattern(self, tag));
        Request::receive(
            endpoint,
            posted,
            Box::new(move |envelope: Envelope| deliver(envelope, buf)),
            scope,
        )
    }

    /// Initiate an immediate (non-blocking) receive operation.
    ///
    /// Initiate receiving a message into `buf`.
    ///
    /// # Examples
    /// See `demos/immediate.rs`
    fn immediate_receive_into<'a, Sc, Buf: ?Sized>(
        &self,
        scope: Sc,
        buf: &'a mut Buf,
    ) -> Request<'a, Sc>
    where
        Buf: 'a + BufferMut,
        Sc: Scope<'a>,
    {
        self.immediate_receive_into_with_tag(scope, buf, ANY_TAG)
    }

    /// Initiate a non-blocking receive operation for messages matching tag `tag`.
    fn immediate_receive_with_tag<Msg>(&self, tag: Tag) -> ReceiveFuture<Msg>
    where
        Msg: Equivalence,
    {
        let mut val: Box<Msg> = Box::new(zeroed());
        let ptr = (&mut *val).pointer_mut();
        let datatype = DatatypeRef::from_raw(Msg::equivalent_datatype().as_raw().clone());
        let endpoint = endpoint_of(self).clone();
        let posted = endpoint.post_receive(pattern(self, tag));
        // The box is owned by the future next to the request, so the allocation outlives it.
        let sink = Box::new(move |envelope: Envelope| {
            let mut target = unsafe { DynBufferMut::from_raw(ptr, 1, datatype) };
            deliver(envelope, &mut target)
        });
        ReceiveFuture {
            val,
            req: Request::receive(endpoint, posted, sink, StaticScope),
        }
    }

    /// Initiate a non-blocking receive operation.
    ///
    /// # Examples
    /// See `demos/immediate.rs`
    fn immediate_receive<Msg>(&self) -> ReceiveFuture<Msg>
    where
        Msg: Equivalence,
    {
        self.immediate_receive_with_tag(ANY_TAG)
    }

    /// Asynchronously probe a source for incoming messages.
    ///
    /// Asynchronously probe `Source` `&self` for incoming messages with a certain tag.
    ///
    /// Like `Probe` but returns a `None` immediately if there is no incoming message to be probed.
    fn immediate_probe_with_tag(&self, tag: Tag) -> Result<Option<Status>> {
        Ok(endpoint_of(self)
            .probe(pattern(self, tag), false)?
            .map(|(source_rank, tag, size)| Status {
                source_rank,
                tag,
                size,
            }))
    }

    /// Asynchronously probe a source for incoming messages.
    ///
    /// Asynchronously probe `Source` `&self` for incoming messages with any tag.
    ///
    /// Like `Probe` but returns a `None` immediately if there is no incoming message to be probed.
    fn immediate_probe(&self) -> Result<Option<Status>> {
        self.immediate_probe_with_tag(ANY_TAG)
    }

    /// Asynchronously probe a source for incoming messages with guaranteed reception.
    ///
    /// Asynchronously probe `Source` `&self` for incoming messages with a certain tag.
    ///
    /// Like `MatchedProbe` but returns a `None` immediately if there is no incoming message to be
    /// probed.
    fn immediate_matched_probe_with_tag(&self, tag: Tag) -> Result<Option<(Message, Status)>> {
        let endpoint = endpoint_of(self);
        Ok(endpoint
            .matched_probe(pattern(self, tag), false)?
            .map(|envelope| {
                let status = Status::of(&envelope);
                (
                    Message {
                        envelope: Some(envelope),
                    },
                    status,
                )
            }))
    }

    /// Asynchronously probe a source for incoming messages with guaranteed reception.
    ///
    /// Asynchronously probe `Source` `&self` for incoming messages with any tag.
    ///
    /// Like `MatchedProbe` but returns a `None` immediately if there is no incoming message to be
    /// probed.
    fn immediate_matched_probe(&self) -> Result<Option<(Message, Status)>> {
        self.immediate_matched_probe_with_tag(ANY_TAG)
    }
}

impl<'a, C> Source for AnyProcess<'a, C>
where
    C: 'a + Communicator,
{
    fn source_rank(&self) -> Option<Rank> {
        None
    }
}

impl<'a, C> Source for Process<'a, C>
where
    C: 'a + Communicator,
{
    fn source_rank(&self) -> Option<Rank> {
        Some(self.rank())
    }
}

/// Something that can be used as the destination in a point to point send operation
///
/// # Examples
/// - Using a `Process` as the destination will send data to that specific process.
pub trait Destination: AsCommunicator {
    /// `Rank` that identifies the destination
    fn destination_rank(&self) -> Rank;

    /// Blocking standard mode send operation
    ///
    /// Send the contents of a `Buffer` to the `Destination` `&self` and tag it.
    ///
    /// # Panics
    ///
    /// If `tag` is negative.
    fn send_with_tag<Buf: ?Sized>(&self, buf: &Buf, tag: Tag) -> Result<()>
    where
        Buf: Buffer,
    {
        scope(|scope| {
            self.immediate_send_with_tag(scope, buf, tag)
                .wait_without_status()
        })
    }

    /// Blocking standard mode send operation
    ///
    /// Send the contents of a `Buffer` to the `Destination` `&self`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use spmd::traits::*;
    ///
    /// let universe = spmd::initialize().unwrap();
    /// let world = universe.world();
    ///
    /// let v = vec![ 1.0f64, 2.0, 3.0 ];
    /// world.process_at_rank(1).send(&v[..]).unwrap();
    /// ```
    ///
    /// See also `demos/blocking.rs`
    fn send<Buf: ?Sized>(&self, buf: &Buf) -> Result<()>
    where
        Buf: Buffer,
    {
        self.send_with_tag(buf, Tag::default())
    }

    /// Initiate an immediate (non-blocking) standard mode send operation.
    ///
    /// Initiate sending the data in `buf` in standard mode and tag it.
    ///
    /// # Panics
    ///
    /// If `tag` is negative.
    fn immediate_send_with_tag<'a, Sc, Buf: ?Sized>(
        &self,
        scope: Sc,
        buf: &'a Buf,
        tag: Tag,
    ) -> Request<'a, Sc>
    where
        Buf: 'a + Buffer,
        Sc: Scope<'a>,
    {
        assert!(tag >= 0, "Send tags must be non-negative, got {}.", tag);
        let comm = self.as_communicator().as_raw();
        let payload = pack(buf);
        let status = Status {
            source_rank: comm.rank(),
            tag,
            size: payload.len(),
        };
        let envelope = Envelope {
            context: comm.point_to_point_context(),
            source: comm.rank(),
            tag,
            payload,
        };
        let endpoint = comm.endpoint().clone();
        let result = endpoint
            .post(comm.world_rank_of(self.destination_rank()), envelope)
            .map(|_| status);
        Request::completed(endpoint, result, scope)
    }

    /// Initiate an immediate (non-blocking) standard mode send operation.
    ///
    /// Initiate sending the data in `buf` in standard mode.
    ///
    /// # Examples
    /// See `demos/immediate.rs`
    fn immediate_send<'a, Sc, Buf: ?Sized>(&self, scope: Sc, buf: &'a Buf) -> Request<'a, Sc>
    where
        Buf: 'a + Buffer,
        Sc: Scope<'a>,
    {
        self.immediate_send_with_tag(scope, buf, Tag::default())
    }
}

impl<'a, C> Destination for Process<'a, C>
where
    C: 'a + Communicator,
{
    fn destination_rank(&self) -> Rank {
        self.rank()
    }
}

/// Describes the result of a point to point receive operation.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Status {
    source_rank: Rank,
    tag: Tag,
    size: usize,
}

impl Status {
    fn of(envelope: &Envelope) -> Status {
        Status {
            source_rank: envelope.source,
            tag: envelope.tag,
            size: envelope.payload.len(),
        }
    }

    /// The rank of the message source
    pub fn source_rank(&self) -> Rank {
        self.source_rank
    }

    /// The message tag
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Size of the message on the wire in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of instances of the type contained in the message
    ///
    /// A trailing partial element counts as one more instance.
    pub fn count<D: Datatype>(&self, d: D) -> Count {
        let element = d.as_raw().size();
        if element == 0 {
            return 0;
        }
        ((self.size + element - 1) / element)
            .value_as()
            .expect("Message element count cannot be expressed as a Count.")
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Status {{ source_rank: {}, tag: {}, size: {} }}",
            self.source_rank(),
            self.tag(),
            self.size()
        )
    }
}

/// Describes a pending incoming message, probed by a `matched_probe()`.
///
/// The message has been taken out of the matching engine, so no other receive can match it.
///
/// # Panics
///
/// Panics if dropped without being received.
#[must_use]
#[derive(Debug)]
pub struct Message {
    envelope: Option<Envelope>,
}

impl Message {
    /// Receive a previously probed message containing a single instance of type `Msg`.
    ///
    /// Receives the message `&self` which contains a single instance of type `Msg`.
    pub fn matched_receive<Msg>(self) -> Result<(Msg, Status)>
    where
        Msg: Equivalence,
    {
        let mut res: Msg = zeroed();
        let status = self.matched_receive_into(&mut res)?;
        Ok((res, status))
    }

    /// Receive a previously probed message into a `Buffer`.
    ///
    /// Receive the message `&self` with contents matching `buf`.
    pub fn matched_receive_into<Buf: ?Sized>(mut self, buf: &mut Buf) -> Result<Status>
    where
        Buf: BufferMut,
    {
        match self.envelope.take() {
            Some(envelope) => deliver(envelope, buf),
            None => unreachable!("a matched message is received at most once"),
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if self.envelope.is_some() && !std::thread::panicking() {
            panic!("matched message dropped without receiving.");
        }
    }
}

/// Receive a previously probed message containing multiple instances of type `Msg` into a `Vec`.
pub trait MatchedReceiveVec {
    /// Receives the message `&self` which contains multiple instances of type `Msg` into a `Vec`.
    fn matched_receive_vec<Msg>(self) -> Result<(Vec<Msg>, Status)>
    where
        Msg: Equivalence;
}

impl MatchedReceiveVec for (Message, Status) {
    fn matched_receive_vec<Msg>(self) -> Result<(Vec<Msg>, Status)>
    where
        Msg: Equivalence,
    {
        let (message, status) = self;
        let count = status
            .count(Msg::equivalent_datatype())
            .value_as()
            .expect("Message element count cannot be expressed as a usize.");
        let mut res: Vec<Msg> = (0..count).map(|_| zeroed()).collect();
        let status = message.matched_receive_into(&mut res[..])?;
        Ok((res, status))
    }
}

/// Sends `msg` to `destination` tagging it `sendtag` and simultaneously receives an
/// instance of `R` tagged `receivetag` from `source`.
pub fn send_receive_with_tags<M, D, R, S>(
    msg: &M,
    destination: &D,
    sendtag: Tag,
    source: &S,
    receivetag: Tag,
) -> Result<(R, Status)>
where
    M: Equivalence,
    D: Destination,
    R: Equivalence,
    S: Source,
{
    let mut res: R = zeroed();
    let status = send_receive_into_with_tags(msg, destination, sendtag, &mut res, source, receivetag)?;
    Ok((res, status))
}

/// Sends `msg` to `destination` and simultaneously receives an instance of `R` from
/// `source`.
///
/// # Examples
/// See `demos/blocking.rs`
pub fn send_receive<R, M, D, S>(msg: &M, destination: &D, source: &S) -> Result<(R, Status)>
where
    M: Equivalence,
    D: Destination,
    R: Equivalence,
    S: Source,
{
    send_receive_with_tags(msg, destination, Tag::default(), source, ANY_TAG)
}

/// Sends the contents of `msg` to `destination` tagging it `sendtag` and
/// simultaneously receives a message tagged `receivetag` from `source` into
/// `buf`.
///
/// The receive is posted before the send, so a ring of processes exchanging this way cannot
/// deadlock.
pub fn send_receive_into_with_tags<M: ?Sized, D, B: ?Sized, S>(
    msg: &M,
    destination: &D,
    sendtag: Tag,
    buf: &mut B,
    source: &S,
    receivetag: Tag,
) -> Result<Status>
where
    M: Buffer,
    D: Destination,
    B: BufferMut,
    S: Source,
{
    assert_eq!(
        source
            .as_communicator()
            .compare(destination.as_communicator()),
        CommunicatorRelation::Identical
    );
    scope(|scope| {
        let receive = source.immediate_receive_into_with_tag(scope, buf, receivetag);
        let sent = destination
            .immediate_send_with_tag(scope, msg, sendtag)
            .wait_without_status();
        let received = receive.wait();
        sent.and(received)
    })
}

/// Sends the contents of `msg` to `destination` and
/// simultaneously receives a message from `source` into
/// `buf`.
pub fn send_receive_into<M: ?Sized, D, B: ?Sized, S>(
    msg: &M,
    destination: &D,
    buf: &mut B,
    source: &S,
) -> Result<Status>
where
    M: Buffer,
    D: Destination,
    B: BufferMut,
    S: Source,
{
    send_receive_into_with_tags(msg, destination, Tag::default(), buf, source, ANY_TAG)
}

/// Sends the contents of `buf` to `destination` tagging it `sendtag` and
/// simultaneously receives a message tagged `receivetag` from `source` and replaces the
/// contents of `buf` with it.
pub fn send_receive_replace_into_with_tags<B: ?Sized, D, S>(
    buf: &mut B,
    destination: &D,
    sendtag: Tag,
    source: &S,
    receivetag: Tag,
) -> Result<Status>
where
    B: BufferMut,
    D: Destination,
    S: Source,
{
    assert_eq!(
        source
            .as_communicator()
            .compare(destination.as_communicator()),
        CommunicatorRelation::Identical
    );
    assert!(sendtag >= 0, "Send tags must be non-negative, got {}.", sendtag);
    let comm = destination.as_communicator().as_raw();
    let envelope = Envelope {
        context: comm.point_to_point_context(),
        source: comm.rank(),
        tag: sendtag,
        payload: pack_mut(buf),
    };
    comm.endpoint()
        .post(comm.world_rank_of(destination.destination_rank()), envelope)?;
    source.receive_into_with_tag(buf, receivetag)
}

/// Sends the contents of `buf` to `destination` and
/// simultaneously receives a message from `source` and replaces the contents of
/// `buf` with it.
pub fn send_receive_replace_into<B: ?Sized, D, S>(
    buf: &mut B,
    destination: &D,
    source: &S,
) -> Result<Status>
where
    B: BufferMut,
    D: Destination,
    S: Source,
{
    send_receive_replace_into_with_tags(buf, destination, Tag::default(), source, ANY_TAG)
}

/// Will contain a value of type `T` received via a non-blocking receive operation.
#[must_use]
#[derive(Debug)]
pub struct ReceiveFuture<T> {
    val: Box<T>,
    req: Request<'static>,
}

impl<T> ReceiveFuture<T> {
    /// Wait for the receive operation to finish and return the received data.
    pub fn get(self) -> Result<(T, Status)> {
        let status = self.req.wait()?;
        Ok((*self.val, status))
    }

    /// Check whether the receive operation has finished.
    ///
    /// If the operation has finished, the data received is returned. Otherwise the future itself
    /// is returned.
    pub fn r#try(mut self) -> std::result::Result<Result<(T, Status)>, Self> {
        match self.req.test() {
            Ok(result) => Ok(result.map(|status| (*self.val, status))),
            Err(request) => {
                self.req = request;
                Err(self)
            }
        }
    }
}
