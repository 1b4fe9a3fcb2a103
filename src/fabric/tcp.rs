//! Provides a fabric based on TCP sockets.
//!
//! TCP is a connection-oriented protocol, which means that a connection must be established
//! between the sending and receiving ends of the socket in order to read from or write to a
//! stream. Every process listens on its own address from the peer list. Outgoing connections are
//! opened on the first message to a peer and cached; incoming connections are accepted by a
//! background thread, and each one is drained by a reader thread feeding a single inbox.

use std::collections::hash_map::{Entry, HashMap};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, warn};

use super::wire::{self, Frame};
use super::{lock, Envelope, Fabric};
use crate::error::{Error, Result};
use crate::topology::Rank;

const ACCEPT_INTERVAL: Duration = Duration::from_millis(5);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);
const ABORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// A fabric connecting the processes of a world over TCP
///
/// Communicating with a remote peer only opens a new connection on the first call; subsequent
/// communications with that peer reuse the cached connection, which keeps messages between a pair
/// of processes in order. Messages a process sends to itself bypass the network.
pub struct TcpFabric {
    rank: usize,
    peers: Vec<SocketAddr>,
    alive: Arc<AtomicBool>,
    inbox_sender: Sender<Envelope>,
    inbox: Receiver<Envelope>,
    outgoing: Mutex<HashMap<usize, TcpStream>>,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
    connect_timeout: Duration,
}

impl TcpFabric {
    /// Binds the address of `rank` in `peers` and starts accepting connections.
    pub fn bind(rank: usize, peers: Vec<SocketAddr>, connect_timeout: Duration) -> Result<Self> {
        let address = *peers.get(rank).ok_or_else(|| {
            Error::Config(format!(
                "rank {} is outside of the peer list of length {}",
                rank,
                peers.len()
            ))
        })?;
        let listener = TcpListener::bind(address)?;
        Self::from_listener(rank, listener, peers, connect_timeout)
    }

    /// Creates a `TcpFabric` from a bound `TcpListener`. The listener is placed in a non-blocking
    /// accept mode, so the pre-existing blocking mode is overwritten.
    pub fn from_listener(
        rank: usize,
        listener: TcpListener,
        peers: Vec<SocketAddr>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        if rank >= peers.len() {
            return Err(Error::Config(format!(
                "rank {} is outside of the peer list of length {}",
                rank,
                peers.len()
            )));
        }
        listener.set_nonblocking(true)?;
        let (inbox_sender, inbox) = unbounded();
        let alive = Arc::new(AtomicBool::new(true));

        let keep_accepting = alive.clone();
        let sender = inbox_sender.clone();
        let accept_thread = thread::Builder::new()
            .name(format!("spmd-accept-{}", rank))
            .spawn(move || accept_loop(listener, keep_accepting, sender))?;

        debug!(rank, size = peers.len(), "tcp fabric listening");
        Ok(Self {
            rank,
            peers,
            alive,
            inbox_sender,
            inbox,
            outgoing: Mutex::new(HashMap::new()),
            accept_thread: Mutex::new(Some(accept_thread)),
            connect_timeout,
        })
    }

    fn connect(&self, destination: usize) -> Result<TcpStream> {
        let address = self.peers[destination];
        let start = Instant::now();
        loop {
            match TcpStream::connect(address) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(rank = self.rank, destination, %address, "connected to peer");
                    return Ok(stream);
                }
                Err(e) if start.elapsed() < self.connect_timeout => {
                    debug!(destination, error = %e, "peer not reachable yet, retrying");
                    thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn accept_loop(listener: TcpListener, alive: Arc<AtomicBool>, inbox: Sender<Envelope>) {
    while alive.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, address)) => {
                debug!(%address, "accepted connection");
                let inbox = inbox.clone();
                let spawned = stream
                    .set_nonblocking(false)
                    .and_then(|_| thread::Builder::new().spawn(move || read_loop(stream, inbox)));
                if let Err(e) = spawned {
                    warn!(%address, error = %e, "could not serve connection");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_INTERVAL),
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

fn read_loop(mut stream: TcpStream, inbox: Sender<Envelope>) {
    loop {
        match wire::read_frame(&mut stream) {
            Ok(Some(Frame::Message(envelope))) => {
                if inbox.send(envelope).is_err() {
                    return;
                }
            }
            Ok(Some(Frame::Abort { rank, code })) => {
                error!(rank, code, "peer aborted the process group");
                process::exit(code);
            }
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "connection closed");
                return;
            }
        }
    }
}

impl Fabric for TcpFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn post(&self, destination: usize, envelope: Envelope) -> Result<()> {
        if destination == self.rank {
            return self
                .inbox_sender
                .send(envelope)
                .map_err(|_| Error::Disconnected {
                    peer: destination as Rank,
                });
        }
        let mut outgoing = lock(&self.outgoing);
        let stream = match outgoing.entry(destination) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.connect(destination)?),
        };
        if let Err(e) = wire::write_message(stream, &envelope) {
            outgoing.remove(&destination);
            return Err(e.into());
        }
        Ok(())
    }

    fn receive_timeout(&self, timeout: Duration) -> Result<Option<Envelope>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected {
                peer: self.rank as Rank,
            }),
        }
    }

    fn try_receive(&self) -> Result<Option<Envelope>> {
        match self.inbox.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Disconnected {
                peer: self.rank as Rank,
            }),
        }
    }

    fn signal_abort(&self, code: i32) {
        for (peer, address) in self.peers.iter().enumerate() {
            if peer == self.rank {
                continue;
            }
            let sent = TcpStream::connect_timeout(address, ABORT_CONNECT_TIMEOUT)
                .and_then(|mut stream| wire::write_abort(&mut stream, self.rank as Rank, code));
            if let Err(e) = sent {
                warn!(peer, error = %e, "could not deliver abort");
            }
        }
    }

    fn abort(&self, code: i32) -> ! {
        self.signal_abort(code);
        process::exit(code)
    }

    fn shutdown(&self) {
        self.alive.store(false, Ordering::Relaxed);
        if let Some(handle) = lock(&self.accept_thread).take() {
            if handle.join().is_err() {
                warn!("accept thread panicked");
            }
        }
        for (_, stream) in lock(&self.outgoing).drain() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        debug!(rank = self.rank, "tcp fabric shut down");
    }
}

impl Drop for TcpFabric {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
    }
}
