//! In-process fabric connecting ranks that run as threads

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use once_cell::sync::OnceCell;
use tracing::debug;

use super::{Envelope, Fabric};
use crate::error::{Error, Result};
use crate::topology::Rank;

#[derive(Debug)]
struct Shared {
    mailboxes: Vec<Sender<Envelope>>,
    aborted: OnceCell<(usize, i32)>,
}

/// Mailboxes shared by the threads of one world
///
/// Each rank owns the receiving end of its own mailbox and a handle to every other rank's
/// sending end. Aborting marks the whole world: every later fabric call on any rank fails with
/// `Error::Aborted`.
#[derive(Debug)]
pub struct LocalFabric {
    rank: usize,
    shared: Arc<Shared>,
    inbox: Receiver<Envelope>,
}

impl LocalFabric {
    /// Creates the fabrics of a world of `size` ranks, in rank order.
    pub fn create(size: usize) -> Vec<LocalFabric> {
        let (mailboxes, inboxes): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        let shared = Arc::new(Shared {
            mailboxes,
            aborted: OnceCell::new(),
        });
        debug!(size, "created local fabric");
        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalFabric {
                rank,
                shared: shared.clone(),
                inbox,
            })
            .collect()
    }

    fn check_aborted(&self) -> Result<()> {
        match self.shared.aborted.get() {
            Some(&(rank, code)) => Err(Error::Aborted {
                rank: rank as Rank,
                code,
            }),
            None => Ok(()),
        }
    }
}

impl Fabric for LocalFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.mailboxes.len()
    }

    fn post(&self, destination: usize, envelope: Envelope) -> Result<()> {
        self.check_aborted()?;
        self.shared.mailboxes[destination]
            .send(envelope)
            .map_err(|_| Error::Disconnected {
                peer: destination as Rank,
            })
    }

    fn receive_timeout(&self, timeout: Duration) -> Result<Option<Envelope>> {
        self.check_aborted()?;
        match self.inbox.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvTimeoutError::Timeout) => self.check_aborted().map(|_| None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected {
                peer: self.rank as Rank,
            }),
        }
    }

    fn try_receive(&self) -> Result<Option<Envelope>> {
        self.check_aborted()?;
        match self.inbox.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Disconnected {
                peer: self.rank as Rank,
            }),
        }
    }

    fn signal_abort(&self, code: i32) {
        let _ = self.shared.aborted.set((self.rank, code));
    }

    fn abort(&self, code: i32) -> ! {
        self.signal_abort(code);
        panic!("rank {} aborted the process group with code {}", self.rank, code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(tag: i32) -> Envelope {
        Envelope {
            context: 0,
            source: 0,
            tag,
            payload: Vec::new(),
        }
    }

    #[test]
    fn delivers_in_posting_order() {
        let fabrics = LocalFabric::create(2);
        for tag in 0..3 {
            fabrics[0].post(1, envelope(tag)).unwrap();
        }
        for tag in 0..3 {
            let received = fabrics[1].try_receive().unwrap().unwrap();
            assert_eq!(received.tag, tag);
        }
        assert!(fabrics[1].try_receive().unwrap().is_none());
    }

    #[test]
    fn abort_is_seen_by_every_rank() {
        let fabrics = LocalFabric::create(3);
        fabrics[2].signal_abort(9);
        for fabric in &fabrics {
            match fabric.receive_timeout(Duration::from_millis(1)) {
                Err(Error::Aborted { rank, code }) => {
                    assert_eq!(rank, 2);
                    assert_eq!(code, 9);
                }
                other => panic!("expected abort, got {:?}", other),
            }
        }
        assert!(fabrics[0].post(1, envelope(0)).is_err());
    }
}
