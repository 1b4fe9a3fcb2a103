//! Organizing processes as groups and communicators
//!
//! Processes are organized in communicators. All parallel processes initially partaking in
//! the computation are organized in a context called the 'world communicator' which is available
//! as a property of the `Universe`. From the world communicator, other communicators can be
//! created. Processes can be addressed via their `Rank` within a specific communicator. This
//! information is encapsulated in a `Process`.
//!
//! Every communicator carries a context id. Messages sent on one communicator never match
//! receives posted on another, even when the same processes take part in both. New context ids
//! are agreed on collectively by the members of the parent communicator.
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::collective::CollectiveAlgorithms;
use crate::error::Result;
use crate::fabric::{Endpoint, Envelope, Pattern};
use crate::raw::traits::*;
use crate::{Count, Tag};

pub mod cartesian;

pub use self::cartesian::{dims_create, dims_create_into, CartesianCommunicator, CartesianLayout};

/// Topology traits
pub mod traits {
    pub use super::{AsCommunicator, Communicator, Group};
}

/// Something that has a communicator associated with it
pub trait AsCommunicator {
    /// The type of the associated communicator
    type Out: Communicator;
    /// Returns the associated communicator.
    fn as_communicator(&self) -> &Self::Out;
}

/// Identifies a certain process within a communicator.
pub type Rank = i32;

/// Engine-side state of a communicator: its members, the calling process's place among them, the
/// context id and the collective algorithms in use.
pub struct RawCommunicator {
    endpoint: Arc<Endpoint>,
    members: Arc<[usize]>,
    rank: Rank,
    context: u64,
    algorithms: Arc<dyn CollectiveAlgorithms>,
    name: Mutex<String>,
}

impl fmt::Debug for RawCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawCommunicator")
            .field("rank", &self.rank)
            .field("size", &self.members.len())
            .field("context", &self.context)
            .field("algorithms", &self.algorithms)
            .finish()
    }
}

impl RawCommunicator {
    pub(crate) fn world(
        endpoint: Arc<Endpoint>,
        algorithms: Arc<dyn CollectiveAlgorithms>,
    ) -> RawCommunicator {
        let members: Arc<[usize]> = (0..endpoint.world_size()).collect();
        let rank = endpoint.world_rank() as Rank;
        RawCommunicator {
            endpoint,
            members,
            rank,
            context: Endpoint::WORLD_CONTEXT,
            algorithms,
            name: Mutex::new(String::from("world")),
        }
    }

    fn derive(&self, members: Arc<[usize]>, rank: Rank, context: u64) -> RawCommunicator {
        debug!(
            context,
            rank,
            size = members.len(),
            "created communicator"
        );
        RawCommunicator {
            endpoint: self.endpoint.clone(),
            members,
            rank,
            context,
            algorithms: self.algorithms.clone(),
            name: Mutex::new(String::new()),
        }
    }

    /// Rank of the calling process
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of members
    pub fn size(&self) -> Rank {
        self.members.len() as Rank
    }

    pub(crate) fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub(crate) fn algorithms(&self) -> &dyn CollectiveAlgorithms {
        &*self.algorithms
    }

    pub(crate) fn world_rank_of(&self, rank: Rank) -> usize {
        assert!(
            0 <= rank && rank < self.size(),
            "Rank {} is outside of a communicator of size {}.",
            rank,
            self.size()
        );
        self.members[rank as usize]
    }

    pub(crate) fn point_to_point_context(&self) -> u64 {
        self.context << 1
    }

    pub(crate) fn collective_context(&self) -> u64 {
        self.context << 1 | 1
    }

    /// Sends `payload` to `destination` on the channel reserved for collective operations.
    pub fn collective_send(&self, destination: Rank, tag: Tag, payload: Vec<u8>) -> Result<()> {
        let envelope = Envelope {
            context: self.collective_context(),
            source: self.rank,
            tag,
            payload,
        };
        self.endpoint.post(self.world_rank_of(destination), envelope)
    }

    /// Receives the next message from `source` on the channel reserved for collective operations.
    pub fn collective_receive(&self, source: Rank, tag: Tag) -> Result<Vec<u8>> {
        let pattern = Pattern {
            context: self.collective_context(),
            source: Some(source),
            tag: Some(tag),
        };
        Ok(self.endpoint.receive(pattern)?.payload)
    }

    /// Agrees with all other members on a context id that none of them has used yet.
    fn agree_context(&self) -> Result<u64> {
        let proposal = self.endpoint.propose_context();
        let proposals = self.all_gather_bytes(proposal.to_le_bytes().to_vec())?;
        let context = proposals
            .iter()
            .map(|p| u64::from_le_bytes(decode_array(p)))
            .max()
            .unwrap_or(proposal);
        self.endpoint.claim_context(context);
        Ok(context)
    }

    fn split(&self, color: Color, key: Key) -> Result<Option<RawCommunicator>> {
        let proposal = self.endpoint.propose_context();
        let mut block = Vec::with_capacity(24);
        block.extend_from_slice(&color.0.unwrap_or(-1).to_le_bytes());
        block.extend_from_slice(&(color.0.is_some() as i32).to_le_bytes());
        block.extend_from_slice(&key.to_le_bytes());
        block.extend_from_slice(&proposal.to_le_bytes());
        let blocks = self.all_gather_bytes(block)?;

        let entries: Vec<(Option<i32>, Key, u64)> = blocks
            .iter()
            .map(|b| {
                let color = i32::from_le_bytes(decode_array(&b[0..]));
                let defined = i32::from_le_bytes(decode_array(&b[4..])) != 0;
                let key = i32::from_le_bytes(decode_array(&b[8..]));
                let proposal = u64::from_le_bytes(decode_array(&b[12..]));
                (if defined { Some(color) } else { None }, key, proposal)
            })
            .collect();
        let context = entries
            .iter()
            .map(|&(_, _, p)| p)
            .max()
            .unwrap_or(proposal);
        self.endpoint.claim_context(context);

        let color = match color.0 {
            Some(color) => color,
            None => return Ok(None),
        };
        let mut order: Vec<(Key, Rank)> = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.0 == Some(color))
            .map(|(parent, entry)| (entry.1, parent as Rank))
            .collect();
        order.sort_unstable();
        let members: Arc<[usize]> = order
            .iter()
            .map(|&(_, parent)| self.members[parent as usize])
            .collect();
        let rank = order
            .iter()
            .position(|&(_, parent)| parent == self.rank)
            .map(|r| r as Rank)
            .unwrap_or_else(|| unreachable!("the calling process is a member of its own color"));
        Ok(Some(self.derive(members, rank, context)))
    }

    fn group(&self) -> RawGroup {
        RawGroup {
            members: self.members.to_vec(),
            this: Some(self.endpoint.world_rank()),
        }
    }
}

fn decode_array<const SIZE: usize>(bytes: &[u8]) -> [u8; SIZE] {
    let mut array = [0; SIZE];
    array.copy_from_slice(&bytes[..SIZE]);
    array
}

/// The world communicator
///
/// Contains all processes initially partaking in the computation. Obtained from the `Universe`;
/// all copies refer to the same communicator.
#[derive(Clone, Debug)]
pub struct SystemCommunicator(Arc<RawCommunicator>);

impl SystemCommunicator {
    pub(crate) fn from_raw(raw: RawCommunicator) -> SystemCommunicator {
        SystemCommunicator(Arc::new(raw))
    }
}

unsafe impl AsRaw for SystemCommunicator {
    type Raw = RawCommunicator;
    fn as_raw(&self) -> &Self::Raw {
        &self.0
    }
}

impl Communicator for SystemCommunicator {}

impl AsCommunicator for SystemCommunicator {
    type Out = SystemCommunicator;
    fn as_communicator(&self) -> &Self::Out {
        self
    }
}

/// A user-defined communicator
///
/// Released when dropped.
#[derive(Debug)]
pub struct UserCommunicator(RawCommunicator);

impl AsCommunicator for UserCommunicator {
    type Out = UserCommunicator;
    fn as_communicator(&self) -> &Self::Out {
        self
    }
}

unsafe impl AsRaw for UserCommunicator {
    type Raw = RawCommunicator;
    fn as_raw(&self) -> &Self::Raw {
        &self.0
    }
}

impl Communicator for UserCommunicator {}

/// A color used in a communicator split
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Color(Option<i32>);

impl Color {
    /// Special color of undefined value
    pub fn undefined() -> Color {
        Color(None)
    }

    /// A color of a certain value
    ///
    /// Valid values are non-negative.
    pub fn with_value(value: i32) -> Color {
        assert!(value >= 0, "Color values must be non-negative, got {}.", value);
        Color(Some(value))
    }
}

/// A key used when determining the rank order of processes after a communicator split.
pub type Key = i32;

/// Communicators are contexts for communication
pub trait Communicator: AsRaw<Raw = RawCommunicator> {
    /// Number of processes in this communicator
    ///
    /// # Examples
    /// See `demos/hello.rs`
    fn size(&self) -> Rank {
        self.as_raw().size()
    }

    /// The `Rank` that identifies the calling process within this communicator
    ///
    /// # Examples
    /// See `demos/hello.rs`
    fn rank(&self) -> Rank {
        self.as_raw().rank()
    }

    /// Bundles a reference to this communicator with a specific `Rank` into a `Process`.
    ///
    /// # Panics
    ///
    /// If `r` is not a rank of this communicator.
    fn process_at_rank(&self, r: Rank) -> Process<'_, Self>
    where
        Self: Sized,
    {
        assert!(
            0 <= r && r < self.size(),
            "Rank {} is outside of a communicator of size {}.",
            r,
            self.size()
        );
        Process::by_rank_unchecked(self, r)
    }

    /// Returns an `AnyProcess` identifier that can be used, e.g. as a `Source` in point to point
    /// communication.
    fn any_process(&self) -> AnyProcess<'_, Self>
    where
        Self: Sized,
    {
        AnyProcess(self)
    }

    /// A `Process` for the calling process
    fn this_process(&self) -> Process<'_, Self>
    where
        Self: Sized,
    {
        let rank = self.rank();
        Process::by_rank_unchecked(self, rank)
    }

    /// Compare two communicators.
    ///
    /// See enum `CommunicatorRelation`.
    fn compare<C: ?Sized>(&self, other: &C) -> CommunicatorRelation
    where
        C: Communicator,
    {
        let (this, other) = (self.as_raw(), other.as_raw());
        if this.context == other.context && this.members == other.members {
            CommunicatorRelation::Identical
        } else if this.members == other.members {
            CommunicatorRelation::Congruent
        } else {
            match this.group().compare_members(&other.group()) {
                GroupRelation::Unequal => CommunicatorRelation::Unequal,
                _ => CommunicatorRelation::Similar,
            }
        }
    }

    /// Duplicate a communicator.
    ///
    /// The duplicate has the same members in the same order but its own context, so traffic on
    /// it never interferes with traffic on the original.
    ///
    /// This call is a collective operation.
    fn duplicate(&self) -> Result<UserCommunicator> {
        let raw = self.as_raw();
        let context = raw.agree_context()?;
        Ok(UserCommunicator(raw.derive(
            raw.members.clone(),
            raw.rank,
            context,
        )))
    }

    /// Split a communicator by color.
    ///
    /// Creates as many new communicators as distinct values of `color` are given. All processes
    /// with the same value of `color` join the same communicator. A process that passes the
    /// special undefined color will not join a new communicator and `None` is returned.
    ///
    /// # Examples
    ///
    /// See `demos/split.rs`
    fn split_by_color(&self, color: Color) -> Result<Option<UserCommunicator>> {
        self.split_by_color_with_key(color, Key::default())
    }

    /// Split a communicator by color.
    ///
    /// Like `split_by_color()` but orders processes according to the value of `key` in the new
    /// communicators. Ties are broken by the rank in this communicator.
    ///
    /// This call is a collective operation on the old communicator so all processes have to
    /// partake.
    fn split_by_color_with_key(&self, color: Color, key: Key) -> Result<Option<UserCommunicator>> {
        Ok(self.as_raw().split(color, key)?.map(UserCommunicator))
    }

    /// Split a communicator collectively by subgroup.
    ///
    /// Processes pass in a group that is a subgroup of the group associated with the old
    /// communicator. Different processes may pass in different groups, but if two groups are
    /// different, they have to be disjoint. One new communicator is created for each distinct
    /// group. The new communicator is returned if a process is a member of the group it passed in,
    /// otherwise `None`.
    ///
    /// This call is a collective operation on the old communicator so all processes have to
    /// partake.
    fn split_by_subgroup_collective<G: ?Sized>(&self, group: &G) -> Result<Option<UserCommunicator>>
    where
        G: Group,
    {
        let raw = self.as_raw();
        let context = raw.agree_context()?;
        let group = group.as_raw();
        Ok(group.rank().map(|rank| {
            UserCommunicator(raw.derive(group.members.iter().copied().collect(), rank, context))
        }))
    }

    /// The group associated with this communicator
    fn group(&self) -> UserGroup {
        UserGroup(self.as_raw().group())
    }

    /// Abort program execution
    ///
    /// Every process of the world terminates, with `errorcode` as its exit status where the
    /// transport allows it.
    fn abort(&self, errorcode: i32) -> ! {
        self.as_raw().endpoint.abort(errorcode)
    }

    /// Set the communicator name
    fn set_name(&self, name: &str) {
        *self
            .as_raw()
            .name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = name.to_owned();
    }

    /// Get the communicator name
    fn get_name(&self) -> String {
        self.as_raw()
            .name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Creates a communicator with ranks laid out in a multi-dimensional space, allowing for
    /// easy neighbor-to-neighbor communication, while providing the implementation with
    /// information it could use to optimize communication.
    ///
    /// `dims` gives the extent of each dimension and `periods` whether a dimension wraps around.
    /// Processes with a rank at or beyond the product of `dims` receive `None`. The reorder flag is
    /// ignored: ranks in the new communicator always equal ranks in this one.
    ///
    /// This call is a collective operation.
    ///
    /// # Examples
    ///
    /// See `demos/cartesian.rs`
    fn create_cartesian_communicator(
        &self,
        dims: &[Count],
        periods: &[bool],
        _reorder: bool,
    ) -> Result<Option<CartesianCommunicator>> {
        cartesian::create(self.as_raw(), dims, periods)
    }
}

/// The relation between two communicators.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CommunicatorRelation {
    /// Identical groups and same contexts
    Identical,
    /// Groups match in constituents and rank order, contexts differ
    Congruent,
    /// Group constituents match but rank order differs
    Similar,
    /// Otherwise
    Unequal,
}

/// Identifies a process by its `Rank` within a certain communicator.
#[derive(Debug)]
pub struct Process<'a, C>
where
    C: 'a + Communicator,
{
    comm: &'a C,
    rank: Rank,
}

impl<'a, C> Clone for Process<'a, C>
where
    C: 'a + Communicator,
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, C> Copy for Process<'a, C> where C: 'a + Communicator {}

impl<'a, C> Process<'a, C>
where
    C: 'a + Communicator,
{
    fn by_rank_unchecked(c: &'a C, r: Rank) -> Self {
        Self { comm: c, rank: r }
    }

    /// The process rank
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Whether this is the calling process
    pub fn is_self(&self) -> bool {
        self.rank == self.comm.rank()
    }
}

impl<'a, C> AsCommunicator for Process<'a, C>
where
    C: 'a + Communicator,
{
    type Out = C;
    fn as_communicator(&self) -> &Self::Out {
        self.comm
    }
}

/// Identifies an arbitrary process that is a member of a certain communicator, e.g. for use as a
/// `Source` in point to point communication.
#[derive(Debug)]
pub struct AnyProcess<'a, C>(&'a C)
where
    C: 'a + Communicator;

impl<'a, C> Clone for AnyProcess<'a, C>
where
    C: 'a + Communicator,
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, C> Copy for AnyProcess<'a, C> where C: 'a + Communicator {}

impl<'a, C> AsCommunicator for AnyProcess<'a, C>
where
    C: 'a + Communicator,
{
    type Out = C;
    fn as_communicator(&self) -> &Self::Out {
        self.0
    }
}

/// Engine-side state of a group: members as world ranks, in group order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawGroup {
    members: Vec<usize>,
    this: Option<usize>,
}

impl RawGroup {
    fn derive(&self, other: Option<&RawGroup>, members: Vec<usize>) -> RawGroup {
        RawGroup {
            members,
            this: self.this.or_else(|| other.and_then(|o| o.this)),
        }
    }

    fn contains(&self, member: usize) -> bool {
        self.members.contains(&member)
    }

    fn rank(&self) -> Option<Rank> {
        let this = self.this?;
        self.members
            .iter()
            .position(|&m| m == this)
            .map(|r| r as Rank)
    }

    fn compare_members(&self, other: &RawGroup) -> GroupRelation {
        if self.members == other.members {
            GroupRelation::Identical
        } else if self.members.len() == other.members.len()
            && self.members.iter().all(|&m| other.contains(m))
        {
            GroupRelation::Similar
        } else {
            GroupRelation::Unequal
        }
    }

    fn member_at(&self, rank: Rank) -> usize {
        assert!(
            0 <= rank && (rank as usize) < self.members.len(),
            "Rank {} is outside of a group of size {}.",
            rank,
            self.members.len()
        );
        self.members[rank as usize]
    }
}

/// A predefined group
#[derive(Clone, Debug)]
pub struct SystemGroup(RawGroup);

impl SystemGroup {
    /// An empty group
    pub fn empty() -> SystemGroup {
        SystemGroup(RawGroup {
            members: Vec::new(),
            this: None,
        })
    }
}

unsafe impl AsRaw for SystemGroup {
    type Raw = RawGroup;
    fn as_raw(&self) -> &Self::Raw {
        &self.0
    }
}

impl Group for SystemGroup {}

/// A user-defined group of processes
#[derive(Clone, Debug)]
pub struct UserGroup(RawGroup);

unsafe impl AsRaw for UserGroup {
    type Raw = RawGroup;
    fn as_raw(&self) -> &Self::Raw {
        &self.0
    }
}

impl Group for UserGroup {}

/// Groups are collections of parallel processes
pub trait Group: AsRaw<Raw = RawGroup> {
    /// Group union
    ///
    /// Constructs a new group that contains all members of the first group followed by all members
    /// of the second group that are not also members of the first group.
    fn union<G>(&self, other: &G) -> UserGroup
    where
        G: Group,
    {
        let (this, other) = (self.as_raw(), other.as_raw());
        let mut members = this.members.clone();
        members.extend(other.members.iter().filter(|&&m| !this.contains(m)));
        UserGroup(this.derive(Some(other), members))
    }

    /// Group intersection
    ///
    /// Constructs a new group that contains all processes that are members of both the first and
    /// second group in the order they have in the first group.
    fn intersection<G>(&self, other: &G) -> UserGroup
    where
        G: Group,
    {
        let (this, other) = (self.as_raw(), other.as_raw());
        let members = this
            .members
            .iter()
            .copied()
            .filter(|&m| other.contains(m))
            .collect();
        UserGroup(this.derive(Some(other), members))
    }

    /// Group difference
    ///
    /// Constructs a new group that contains all members of the first group that are not also
    /// members of the second group in the order they have in the first group.
    fn difference<G>(&self, other: &G) -> UserGroup
    where
        G: Group,
    {
        let (this, other) = (self.as_raw(), other.as_raw());
        let members = this
            .members
            .iter()
            .copied()
            .filter(|&m| !other.contains(m))
            .collect();
        UserGroup(this.derive(Some(other), members))
    }

    /// Subgroup including specified ranks
    ///
    /// Constructs a new group where the process with rank `ranks[i]` in the old group has rank `i`
    /// in the new group.
    fn include(&self, ranks: &[Rank]) -> UserGroup {
        let this = self.as_raw();
        let members = ranks.iter().map(|&r| this.member_at(r)).collect();
        UserGroup(this.derive(None, members))
    }

    /// Subgroup excluding specified ranks
    ///
    /// Constructs a new group containing those processes from the old group that are not mentioned
    /// in `ranks`.
    fn exclude(&self, ranks: &[Rank]) -> UserGroup {
        let this = self.as_raw();
        let excluded: Vec<usize> = ranks.iter().map(|&r| this.member_at(r)).collect();
        let members = this
            .members
            .iter()
            .copied()
            .filter(|m| !excluded.contains(m))
            .collect();
        UserGroup(this.derive(None, members))
    }

    /// Number of processes in the group.
    fn size(&self) -> Rank {
        self.as_raw().members.len() as Rank
    }

    /// Rank of this process within the group.
    fn rank(&self) -> Option<Rank> {
        self.as_raw().rank()
    }

    /// Find the rank in group `other` of the process that has rank `rank` in this group.
    ///
    /// If the process is not a member of the other group, returns `None`.
    fn translate_rank<G>(&self, rank: Rank, other: &G) -> Option<Rank>
    where
        G: Group,
    {
        let member = self.as_raw().member_at(rank);
        other
            .as_raw()
            .members
            .iter()
            .position(|&m| m == member)
            .map(|r| r as Rank)
    }

    /// Find the ranks in group `other` of the processes that have ranks `ranks` in this group.
    ///
    /// If a process is not a member of the other group, returns `None`.
    fn translate_ranks<G>(&self, ranks: &[Rank], other: &G) -> Vec<Option<Rank>>
    where
        G: Group,
    {
        ranks
            .iter()
            .map(|&r| self.translate_rank(r, other))
            .collect()
    }

    /// Compare two groups.
    fn compare<G>(&self, other: &G) -> GroupRelation
    where
        G: Group,
    {
        self.as_raw().compare_members(other.as_raw())
    }
}

/// The relation between two groups.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GroupRelation {
    /// Identical group members in identical order
    Identical,
    /// Identical group members in different order
    Similar,
    /// Otherwise
    Unequal,
}
