//! Byte-level algorithms behind the collective operations
//!
//! A `CollectiveAlgorithms` implementation moves packed bytes between the members of a
//! communicator using the collective channel of `RawCommunicator`. Every method is called by all
//! members of the communicator in the same order, so messages between a pair of members on one
//! tag are matched in the order they were sent.
//!
//! The default methods are root-centric fan-in and fan-out loops. `Linear` uses them all;
//! `BinomialTree` replaces barrier, broadcast and reduce with logarithmic-depth variants.

use std::fmt;

use tracing::trace;

use crate::error::Result;
use crate::topology::{RawCommunicator, Rank};
use crate::Tag;

const BARRIER_TAG: Tag = 1;
const BROADCAST_TAG: Tag = 2;
const GATHER_TAG: Tag = 3;
const SCATTER_TAG: Tag = 4;
const REDUCE_TAG: Tag = 5;
const ALL_TO_ALL_TAG: Tag = 6;
const SCAN_TAG: Tag = 7;
const EXCLUSIVE_SCAN_TAG: Tag = 8;

/// Combines two packed operands in place: `higher` becomes `lower ∘ higher`, where `lower`
/// holds the contribution of the lower ranks.
pub type Combine<'a> = dyn Fn(&[u8], &mut [u8]) -> Result<()> + 'a;

/// Strategies for the collective operations of a world
///
/// Implementations must be deterministic: every member of a communicator has to send and receive
/// the same sequence of messages for the same call.
pub trait CollectiveAlgorithms: fmt::Debug + Send + Sync {
    /// Returns once every member of `comm` has entered the barrier.
    fn barrier(&self, comm: &RawCommunicator) -> Result<()> {
        let mut token = Vec::new();
        self.gather(comm, 0, Vec::new())?;
        self.broadcast(comm, 0, &mut token)
    }

    /// Replaces `data` on every member with the contents of `data` on `root`.
    fn broadcast(&self, comm: &RawCommunicator, root: Rank, data: &mut Vec<u8>) -> Result<()> {
        if comm.rank() == root {
            for destination in (0..comm.size()).filter(|&r| r != root) {
                comm.collective_send(destination, BROADCAST_TAG, data.clone())?;
            }
        } else {
            *data = comm.collective_receive(root, BROADCAST_TAG)?;
        }
        Ok(())
    }

    /// Collects the `data` of every member on `root`, in rank order.
    ///
    /// Returns `None` on every member except `root`.
    fn gather(
        &self,
        comm: &RawCommunicator,
        root: Rank,
        data: Vec<u8>,
    ) -> Result<Option<Vec<Vec<u8>>>> {
        if comm.rank() != root {
            comm.collective_send(root, GATHER_TAG, data)?;
            return Ok(None);
        }
        let mut own = data;
        let mut blocks = Vec::with_capacity(comm.size() as usize);
        for source in 0..comm.size() {
            if source == root {
                blocks.push(std::mem::take(&mut own));
            } else {
                blocks.push(comm.collective_receive(source, GATHER_TAG)?);
            }
        }
        Ok(Some(blocks))
    }

    /// Hands block `i` of `blocks` on `root` to member `i`.
    ///
    /// `blocks` must be `Some` with one block per member on `root`; it is ignored elsewhere.
    fn scatter(
        &self,
        comm: &RawCommunicator,
        root: Rank,
        blocks: Option<Vec<Vec<u8>>>,
    ) -> Result<Vec<u8>> {
        if comm.rank() != root {
            return comm.collective_receive(root, SCATTER_TAG);
        }
        let blocks = blocks.unwrap_or_default();
        assert_eq!(
            blocks.len(),
            comm.size() as usize,
            "The root of a scatter must provide one block per process."
        );
        let mut own = Vec::new();
        for (destination, block) in blocks.into_iter().enumerate() {
            let destination = destination as Rank;
            if destination == root {
                own = block;
            } else {
                comm.collective_send(destination, SCATTER_TAG, block)?;
            }
        }
        Ok(own)
    }

    /// Combines the `data` of every member on `root` in rank order.
    ///
    /// Returns `None` on every member except `root`.
    fn reduce(
        &self,
        comm: &RawCommunicator,
        root: Rank,
        data: Vec<u8>,
        combine: &Combine<'_>,
    ) -> Result<Option<Vec<u8>>> {
        let blocks = match self.gather(comm, root, data)? {
            Some(blocks) => blocks,
            None => return Ok(None),
        };
        let mut blocks = blocks.into_iter();
        let mut acc = blocks.next().unwrap_or_default();
        for mut block in blocks {
            combine(&acc, &mut block)?;
            acc = block;
        }
        Ok(Some(acc))
    }

    /// Sends block `j` of `blocks` to member `j` and returns the blocks received, block `i`
    /// coming from member `i`.
    fn all_to_all(&self, comm: &RawCommunicator, blocks: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        assert_eq!(
            blocks.len(),
            comm.size() as usize,
            "An all-to-all exchange needs one block per process."
        );
        let rank = comm.rank();
        let mut own = Vec::new();
        for (destination, block) in blocks.into_iter().enumerate() {
            let destination = destination as Rank;
            if destination == rank {
                own = block;
            } else {
                comm.collective_send(destination, ALL_TO_ALL_TAG, block)?;
            }
        }
        let mut received = Vec::with_capacity(comm.size() as usize);
        for source in 0..comm.size() {
            if source == rank {
                received.push(std::mem::take(&mut own));
            } else {
                received.push(comm.collective_receive(source, ALL_TO_ALL_TAG)?);
            }
        }
        Ok(received)
    }

    /// Collects the `data` of every member on every member, in rank order.
    fn all_gather(&self, comm: &RawCommunicator, data: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let blocks = vec![data; comm.size() as usize];
        self.all_to_all(comm, blocks)
    }

    /// Combines the `data` of every member and hands the result to every member.
    fn all_reduce(
        &self,
        comm: &RawCommunicator,
        data: Vec<u8>,
        combine: &Combine<'_>,
    ) -> Result<Vec<u8>> {
        let mut result = self.reduce(comm, 0, data, combine)?.unwrap_or_default();
        self.broadcast(comm, 0, &mut result)?;
        Ok(result)
    }

    /// Inclusive prefix reduction: member `i` receives the combination of members `0..=i`.
    fn scan(&self, comm: &RawCommunicator, data: Vec<u8>, combine: &Combine<'_>) -> Result<Vec<u8>> {
        let rank = comm.rank();
        let mut data = data;
        if rank > 0 {
            let prefix = comm.collective_receive(rank - 1, SCAN_TAG)?;
            combine(&prefix, &mut data)?;
        }
        if rank + 1 < comm.size() {
            comm.collective_send(rank + 1, SCAN_TAG, data.clone())?;
        }
        Ok(data)
    }

    /// Exclusive prefix reduction: member `i` receives the combination of members `0..i`.
    ///
    /// Member 0 receives `None`.
    fn exclusive_scan(
        &self,
        comm: &RawCommunicator,
        data: Vec<u8>,
        combine: &Combine<'_>,
    ) -> Result<Option<Vec<u8>>> {
        let rank = comm.rank();
        let last = rank + 1 == comm.size();
        if rank == 0 {
            if !last {
                comm.collective_send(rank + 1, EXCLUSIVE_SCAN_TAG, data)?;
            }
            return Ok(None);
        }
        let prefix = comm.collective_receive(rank - 1, EXCLUSIVE_SCAN_TAG)?;
        if !last {
            let mut next = data;
            combine(&prefix, &mut next)?;
            comm.collective_send(rank + 1, EXCLUSIVE_SCAN_TAG, next)?;
        }
        Ok(Some(prefix))
    }
}

/// Root-centric algorithms: every rooted operation is a loop over all members on the root
#[derive(Debug, Clone, Copy, Default)]
pub struct Linear;

impl CollectiveAlgorithms for Linear {}

/// Logarithmic-depth algorithms: a dissemination barrier and binomial trees for broadcast and
/// reduce. The remaining operations use the root-centric defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinomialTree;

fn ceil_log2(x: Rank) -> u32 {
    let mut n = 0;
    while 1 << n < x {
        n += 1
    }
    n
}

/// Maps a rank to its position in a tree rooted at virtual rank 0, and back.
fn relative_rank(rank: Rank, root: Rank, size: Rank, forward: bool) -> Rank {
    if forward {
        (rank + size - root) % size
    } else {
        (rank + root) % size
    }
}

impl CollectiveAlgorithms for BinomialTree {
    fn barrier(&self, comm: &RawCommunicator) -> Result<()> {
        let (rank, size) = (comm.rank(), comm.size());
        let mut distance = 1;
        while distance < size {
            comm.collective_send((rank + distance) % size, BARRIER_TAG, Vec::new())?;
            comm.collective_receive((rank + size - distance) % size, BARRIER_TAG)?;
            distance <<= 1;
        }
        Ok(())
    }

    fn broadcast(&self, comm: &RawCommunicator, root: Rank, data: &mut Vec<u8>) -> Result<()> {
        let size = comm.size();
        let vrank = relative_rank(comm.rank(), root, size, true);
        if vrank != 0 {
            let parent = vrank & (vrank - 1);
            *data = comm.collective_receive(relative_rank(parent, root, size, false), BROADCAST_TAG)?;
        }
        for level in (0..ceil_log2(size)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);
            if vrank % two == 0 && vrank + one < size {
                let child = relative_rank(vrank + one, root, size, false);
                trace!(child, "binomial broadcast");
                comm.collective_send(child, BROADCAST_TAG, data.clone())?;
            }
        }
        Ok(())
    }

    fn reduce(
        &self,
        comm: &RawCommunicator,
        root: Rank,
        data: Vec<u8>,
        combine: &Combine<'_>,
    ) -> Result<Option<Vec<u8>>> {
        let size = comm.size();
        let vrank = relative_rank(comm.rank(), root, size, true);
        let mut acc = data;
        for level in 0..ceil_log2(size) {
            let one = 1 << level;
            let two = 1 << (level + 1);
            if vrank % two != 0 {
                let parent = relative_rank(vrank - one, root, size, false);
                comm.collective_send(parent, REDUCE_TAG, acc)?;
                return Ok(None);
            }
            if vrank + one < size {
                let child = relative_rank(vrank + one, root, size, false);
                let mut incoming = comm.collective_receive(child, REDUCE_TAG)?;
                combine(&acc, &mut incoming)?;
                acc = incoming;
            }
        }
        Ok(Some(acc))
    }
}
