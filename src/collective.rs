//! Collective communication
//!
//! Collective operations are called by every member of a communicator together. Buffers are
//! packed into their wire representation, moved by the `CollectiveAlgorithms` of the world and
//! unpacked again, so any datatype that can be sent point to point can take part in a
//! collective.
//!
//! Reductions combine values element by element with an `Operation`. Operations must be
//! associative and commutative; the algorithms are free to combine contributions in any
//! grouping.

use std::fmt;

use conv::ConvUtil;

use crate::datatype::traits::*;
use crate::datatype::{
    pack, pack_mut, unpack_into, DatatypeRef, DynBuffer, DynBufferMut, MutView, Primitive,
    RawDatatype, View,
};
use crate::error::{Error, Result};
use crate::raw::traits::*;
use crate::topology::traits::*;
use crate::topology::{Process, RawCommunicator, Rank};
use crate::Count;

pub mod algorithms;

pub use self::algorithms::{BinomialTree, CollectiveAlgorithms, Linear};

/// Collective communication traits
pub mod traits {
    pub use super::{CommunicatorCollectives, Operation, Root};
}

impl RawCommunicator {
    /// Collects one block of bytes from every member on every member, in rank order.
    pub(crate) fn all_gather_bytes(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        self.algorithms().all_gather(self, data)
    }
}

/// Splits a packed buffer of `count` elements into `parts` blocks of equal size.
fn split_blocks(bytes: Vec<u8>, count: Count, parts: Rank) -> Vec<Vec<u8>> {
    assert!(
        parts > 0 && count % parts == 0,
        "A buffer of {} elements cannot be split evenly among {} processes.",
        count,
        parts
    );
    let block = bytes.len() / parts as usize;
    if block == 0 {
        return vec![Vec::new(); parts as usize];
    }
    bytes.chunks_exact(block).map(|b| b.to_vec()).collect()
}

/// Collective communication patterns defined on `Communicator`s
pub trait CommunicatorCollectives: Communicator {
    /// Barrier synchronization among all processes in a `Communicator`
    ///
    /// Partake in a barrier synchronization across all processes in the `Communicator` `&self`.
    ///
    /// Calling processes (or threads within the calling processes) will enter the barrier and block
    /// execution until all processes in the `Communicator` `&self` have entered the barrier.
    ///
    /// # Examples
    ///
    /// See `demos/time.rs`
    fn barrier(&self) -> Result<()> {
        let comm = self.as_raw();
        comm.algorithms().barrier(comm)
    }

    /// Gather contents of buffers on all participating processes.
    ///
    /// After the call completes, the contents of the send `Buffer`s on all processes will be
    /// concatenated into the receive `Buffer`s on all ranks.
    ///
    /// All send `Buffer`s must contain the same count of elements.
    fn all_gather_into<S: ?Sized, R: ?Sized>(&self, sendbuf: &S, recvbuf: &mut R) -> Result<()>
    where
        S: Buffer,
        R: BufferMut,
    {
        let blocks = self.as_raw().all_gather_bytes(pack(sendbuf))?;
        unpack_into(&blocks.concat(), recvbuf).map(|_| ())
    }

    /// Distribute the send `Buffer`s from all processes to the receive `Buffer`s on all
    /// processes.
    ///
    /// Each process sends and receives the same count of elements to and from each process: the
    /// `i`th block of the send buffer on process `j` ends up as the `j`th block of the receive
    /// buffer on process `i`.
    ///
    /// # Panics
    ///
    /// If the send buffer cannot be split evenly among the processes.
    fn all_to_all_into<S: ?Sized, R: ?Sized>(&self, sendbuf: &S, recvbuf: &mut R) -> Result<()>
    where
        S: Buffer,
        R: BufferMut,
    {
        let comm = self.as_raw();
        let blocks = split_blocks(pack(sendbuf), sendbuf.count(), comm.size());
        let received = comm.algorithms().all_to_all(comm, blocks)?;
        unpack_into(&received.concat(), recvbuf).map(|_| ())
    }

    /// Performs a global reduction under the operation `op` of the input data in `sendbuf` and
    /// stores the result in `recvbuf` on all processes.
    ///
    /// # Examples
    ///
    /// See `demos/collectives.rs`
    fn all_reduce_into<S: ?Sized, R: ?Sized, O>(&self, sendbuf: &S, recvbuf: &mut R, op: O) -> Result<()>
    where
        S: Buffer,
        R: BufferMut,
        O: Operation,
    {
        let comm = self.as_raw();
        let datatype = sendbuf.as_datatype().as_raw().clone();
        op.check(&datatype)?;
        let combine = |lower: &[u8], higher: &mut [u8]| op.apply(lower, higher, &datatype);
        let result = comm.algorithms().all_reduce(comm, pack(sendbuf), &combine)?;
        unpack_into(&result, recvbuf).map(|_| ())
    }

    /// Performs a global inclusive prefix reduction of the data in `sendbuf` into `recvbuf` under
    /// operation `op`.
    ///
    /// Process `i` receives the combination of the values of processes `0..=i`.
    fn scan_into<S: ?Sized, R: ?Sized, O>(&self, sendbuf: &S, recvbuf: &mut R, op: O) -> Result<()>
    where
        S: Buffer,
        R: BufferMut,
        O: Operation,
    {
        let comm = self.as_raw();
        let datatype = sendbuf.as_datatype().as_raw().clone();
        op.check(&datatype)?;
        let combine = |lower: &[u8], higher: &mut [u8]| op.apply(lower, higher, &datatype);
        let result = comm.algorithms().scan(comm, pack(sendbuf), &combine)?;
        unpack_into(&result, recvbuf).map(|_| ())
    }

    /// Performs a global exclusive prefix reduction of the data in `sendbuf` into `recvbuf` under
    /// operation `op`.
    ///
    /// Process `i` receives the combination of the values of processes `0..i`. The receive buffer
    /// of process 0 is left untouched.
    fn exclusive_scan_into<S: ?Sized, R: ?Sized, O>(
        &self,
        sendbuf: &S,
        recvbuf: &mut R,
        op: O,
    ) -> Result<()>
    where
        S: Buffer,
        R: BufferMut,
        O: Operation,
    {
        let comm = self.as_raw();
        let datatype = sendbuf.as_datatype().as_raw().clone();
        op.check(&datatype)?;
        let combine = |lower: &[u8], higher: &mut [u8]| op.apply(lower, higher, &datatype);
        match comm.algorithms().exclusive_scan(comm, pack(sendbuf), &combine)? {
            Some(result) => unpack_into(&result, recvbuf).map(|_| ()),
            None => Ok(()),
        }
    }
}

impl<C: Communicator> CommunicatorCollectives for C {}

/// Something that can take the role of 'root' in a collective operation.
///
/// Many collective operations define a 'root' process that takes a special role in the
/// communication. These collective operations are implemented as default methods of this trait.
pub trait Root: AsCommunicator {
    /// Rank of the root process
    fn root_rank(&self) -> Rank;

    /// Broadcast of the contents of a buffer
    ///
    /// After the call completes, the `Buffer` on all processes in the `Communicator` of the `Root`
    /// `&self` will contain what it contains on the `Root`.
    ///
    /// # Examples
    ///
    /// See `demos/collectives.rs`
    fn broadcast_into<Buf: ?Sized>(&self, buffer: &mut Buf) -> Result<()>
    where
        Buf: BufferMut,
    {
        let comm = self.as_communicator().as_raw();
        let root = self.root_rank();
        let mut data = if comm.rank() == root {
            pack_mut(buffer)
        } else {
            Vec::new()
        };
        comm.algorithms().broadcast(comm, root, &mut data)?;
        if comm.rank() != root {
            unpack_into(&data, buffer)?;
        }
        Ok(())
    }

    /// Gather contents of buffers on `Root`.
    ///
    /// After the call completes, the contents of the `Buffer`s on all ranks will be
    /// concatenated into the `Buffer` on `Root`.
    ///
    /// All send `Buffer`s must have the same count of elements.
    ///
    /// This function must be called on all non-root processes.
    fn gather_into<S: ?Sized>(&self, sendbuf: &S) -> Result<()>
    where
        S: Buffer,
    {
        let comm = self.as_communicator().as_raw();
        assert_ne!(comm.rank(), self.root_rank());
        comm.algorithms()
            .gather(comm, self.root_rank(), pack(sendbuf))
            .map(|_| ())
    }

    /// Gather contents of buffers on `Root`.
    ///
    /// After the call completes, the contents of the `Buffer`s on all ranks will be
    /// concatenated into the `Buffer` on `Root`.
    ///
    /// All send `Buffer`s must have the same count of elements.
    ///
    /// This function must be called on the root process.
    ///
    /// # Examples
    ///
    /// See `demos/collectives.rs`
    fn gather_into_root<S: ?Sized, R: ?Sized>(&self, sendbuf: &S, recvbuf: &mut R) -> Result<()>
    where
        S: Buffer,
        R: BufferMut,
    {
        let comm = self.as_communicator().as_raw();
        assert_eq!(comm.rank(), self.root_rank());
        let blocks = comm
            .algorithms()
            .gather(comm, self.root_rank(), pack(sendbuf))?
            .unwrap_or_default();
        unpack_into(&blocks.concat(), recvbuf).map(|_| ())
    }

    /// Scatter contents of a buffer on the root process to all processes.
    ///
    /// After the call completes each participating process will have received a part of the send
    /// `Buffer` on the root process.
    ///
    /// This function must be called on all non-root processes.
    fn scatter_into<R: ?Sized>(&self, recvbuf: &mut R) -> Result<()>
    where
        R: BufferMut,
    {
        let comm = self.as_communicator().as_raw();
        assert_ne!(comm.rank(), self.root_rank());
        let data = comm.algorithms().scatter(comm, self.root_rank(), None)?;
        unpack_into(&data, recvbuf).map(|_| ())
    }

    /// Scatter contents of a buffer on the root process to all processes.
    ///
    /// After the call completes each participating process will have received a part of the send
    /// `Buffer` on the root process. Process `i` receives the `i`th of `size` equal parts.
    ///
    /// This function must be called on the root process.
    ///
    /// # Panics
    ///
    /// If the send buffer cannot be split evenly among the processes.
    ///
    /// # Examples
    ///
    /// See `demos/collectives.rs`
    fn scatter_into_root<S: ?Sized, R: ?Sized>(&self, sendbuf: &S, recvbuf: &mut R) -> Result<()>
    where
        S: Buffer,
        R: BufferMut,
    {
        let comm = self.as_communicator().as_raw();
        assert_eq!(comm.rank(), self.root_rank());
        let blocks = split_blocks(pack(sendbuf), sendbuf.count(), comm.size());
        let data = comm
            .algorithms()
            .scatter(comm, self.root_rank(), Some(blocks))?;
        unpack_into(&data, recvbuf).map(|_| ())
    }

    /// Performs a global reduction under the operation `op` of the input data in `sendbuf` and
    /// stores the result on the `Root` process.
    ///
    /// This function must be called on all non-root processes.
    fn reduce_into<S: ?Sized, O>(&self, sendbuf: &S, op: O) -> Result<()>
    where
        S: Buffer,
        O: Operation,
    {
        let comm = self.as_communicator().as_raw();
        assert_ne!(comm.rank(), self.root_rank());
        let datatype = sendbuf.as_datatype().as_raw().clone();
        op.check(&datatype)?;
        let combine = |lower: &[u8], higher: &mut [u8]| op.apply(lower, higher, &datatype);
        comm.algorithms()
            .reduce(comm, self.root_rank(), pack(sendbuf), &combine)
            .map(|_| ())
    }

    /// Performs a global reduction under the operation `op` of the input data in `sendbuf` and
    /// stores the result on the `Root` process.
    ///
    /// This function must be called on the root process.
    ///
    /// # Examples
    ///
    /// See `demos/collectives.rs`
    fn reduce_into_root<S: ?Sized, R: ?Sized, O>(&self, sendbuf: &S, recvbuf: &mut R, op: O) -> Result<()>
    where
        S: Buffer,
        R: BufferMut,
        O: Operation,
    {
        let comm = self.as_communicator().as_raw();
        assert_eq!(comm.rank(), self.root_rank());
        let datatype = sendbuf.as_datatype().as_raw().clone();
        op.check(&datatype)?;
        let combine = |lower: &[u8], higher: &mut [u8]| op.apply(lower, higher, &datatype);
        match comm
            .algorithms()
            .reduce(comm, self.root_rank(), pack(sendbuf), &combine)?
        {
            Some(result) => unpack_into(&result, recvbuf).map(|_| ()),
            None => Ok(()),
        }
    }
}

impl<'a, C: 'a + Communicator> Root for Process<'a, C> {
    fn root_rank(&self) -> Rank {
        self.rank()
    }
}

/// An operation to be used in a reduction or scan type operation, e.g. a sum
pub trait Operation {
    /// Returns whether the operation is commutative.
    fn is_commutative(&self) -> bool;

    /// Fails if the operation is not defined for some primitive of `datatype`.
    ///
    /// Collectives call this on every member before moving any data.
    fn check(&self, _datatype: &RawDatatype) -> Result<()> {
        Ok(())
    }

    /// Combines two packed sequences of elements of `datatype` in place: `inout` becomes
    /// `input ∘ inout`, element by element.
    fn apply(&self, input: &[u8], inout: &mut [u8], datatype: &RawDatatype) -> Result<()>;
}

impl<'a, T: 'a + Operation> Operation for &'a T {
    fn is_commutative(&self) -> bool {
        (**self).is_commutative()
    }

    fn check(&self, datatype: &RawDatatype) -> Result<()> {
        (**self).check(datatype)
    }

    fn apply(&self, input: &[u8], inout: &mut [u8], datatype: &RawDatatype) -> Result<()> {
        (**self).apply(input, inout, datatype)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SystemOp {
    Max,
    Min,
    Sum,
    Product,
    LogicalAnd,
    LogicalOr,
    LogicalXor,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
}

impl SystemOp {
    fn name(self) -> &'static str {
        match self {
            SystemOp::Max => "max",
            SystemOp::Min => "min",
            SystemOp::Sum => "sum",
            SystemOp::Product => "product",
            SystemOp::LogicalAnd => "logical_and",
            SystemOp::LogicalOr => "logical_or",
            SystemOp::LogicalXor => "logical_xor",
            SystemOp::BitwiseAnd => "bitwise_and",
            SystemOp::BitwiseOr => "bitwise_or",
            SystemOp::BitwiseXor => "bitwise_xor",
        }
    }

    fn is_logical(self) -> bool {
        matches!(
            self,
            SystemOp::LogicalAnd | SystemOp::LogicalOr | SystemOp::LogicalXor
        )
    }

    fn is_bitwise(self) -> bool {
        matches!(
            self,
            SystemOp::BitwiseAnd | SystemOp::BitwiseOr | SystemOp::BitwiseXor
        )
    }

    fn supports(self, primitive: Primitive) -> bool {
        match primitive {
            Primitive::Bool => self.is_logical(),
            Primitive::Float | Primitive::Double => !(self.is_logical() || self.is_bitwise()),
            Primitive::ComplexFloat | Primitive::ComplexDouble => {
                matches!(self, SystemOp::Sum | SystemOp::Product)
            }
            _ => true,
        }
    }
}

/// A built-in operation like a sum
///
/// Built-in operations are applied to every primitive value of the datatype separately. Integer
/// arithmetic wraps around. Logical operations treat nonzero values as true and produce 0 or 1.
///
/// | operation | integers | floating point | complex | `bool` |
/// |---|---|---|---|---|
/// | `sum`, `product` | yes | yes | yes | no |
/// | `max`, `min` | yes | yes | no | no |
/// | `logical_*` | yes | no | no | yes |
/// | `bitwise_*` | yes | no | no | no |
///
/// Unsupported pairings are reported as `Error::InvalidOperation`.
///
/// # Examples
///
/// See `demos/collectives.rs`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SystemOperation(SystemOp);

macro_rules! system_operation_constructors {
    ($($ctor:ident => $val:path),*) => (
        $(pub fn $ctor() -> SystemOperation {
            //! A built-in operation
            SystemOperation($val)
        })*
    )
}

impl SystemOperation {
    system_operation_constructors! {
        max => SystemOp::Max,
        min => SystemOp::Min,
        sum => SystemOp::Sum,
        product => SystemOp::Product,
        logical_and => SystemOp::LogicalAnd,
        bitwise_and => SystemOp::BitwiseAnd,
        logical_or => SystemOp::LogicalOr,
        bitwise_or => SystemOp::BitwiseOr,
        logical_xor => SystemOp::LogicalXor,
        bitwise_xor => SystemOp::BitwiseXor
    }
}

impl Operation for SystemOperation {
    fn is_commutative(&self) -> bool {
        true
    }

    fn check(&self, datatype: &RawDatatype) -> Result<()> {
        match datatype
            .type_map()
            .blocks()
            .iter()
            .find(|b| !self.0.supports(b.primitive))
        {
            Some(block) => Err(Error::InvalidOperation {
                operation: self.0.name(),
                primitive: block.primitive,
            }),
            None => Ok(()),
        }
    }

    fn apply(&self, input: &[u8], inout: &mut [u8], datatype: &RawDatatype) -> Result<()> {
        assert_eq!(
            input.len(),
            inout.len(),
            "Reduction operands must have the same length."
        );
        self.check(datatype)?;
        let map = datatype.type_map();
        if map.size() == 0 {
            return Ok(());
        }
        let mut offset = 0;
        for (primitive, length) in map.runs(inout.len() / map.size()) {
            let end = offset + length * primitive.size();
            combine_run(self.0, primitive, &input[offset..end], &mut inout[offset..end]);
            offset = end;
        }
        Ok(())
    }
}

trait Element: Copy {
    fn load(bytes: &[u8]) -> Self;
    fn store(self, bytes: &mut [u8]);
}

macro_rules! element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            fn load(bytes: &[u8]) -> Self {
                let mut array = [0; std::mem::size_of::<$t>()];
                array.copy_from_slice(bytes);
                <$t>::from_ne_bytes(array)
            }

            fn store(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_ne_bytes())
            }
        }
    )*};
}

element!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

// Real part first, then imaginary part
impl<T: Element> Element for [T; 2] {
    fn load(bytes: &[u8]) -> Self {
        let (re, im) = bytes.split_at(bytes.len() / 2);
        [T::load(re), T::load(im)]
    }

    fn store(self, bytes: &mut [u8]) {
        let half = bytes.len() / 2;
        let (re, im) = bytes.split_at_mut(half);
        self[0].store(re);
        self[1].store(im);
    }
}

fn elementwise<T: Element>(input: &[u8], inout: &mut [u8], f: fn(T, T) -> T) {
    let size = std::mem::size_of::<T>();
    for (a, b) in input.chunks_exact(size).zip(inout.chunks_exact_mut(size)) {
        f(T::load(a), T::load(b)).store(b);
    }
}

macro_rules! integer_op {
    ($op:expr, $t:ty, $input:expr, $inout:expr) => {{
        let f: fn($t, $t) -> $t = match $op {
            SystemOp::Max => |a, b| a.max(b),
            SystemOp::Min => |a, b| a.min(b),
            SystemOp::Sum => |a, b| a.wrapping_add(b),
            SystemOp::Product => |a, b| a.wrapping_mul(b),
            SystemOp::LogicalAnd => |a, b| (a != 0 && b != 0) as $t,
            SystemOp::LogicalOr => |a, b| (a != 0 || b != 0) as $t,
            SystemOp::LogicalXor => |a, b| ((a != 0) != (b != 0)) as $t,
            SystemOp::BitwiseAnd => |a, b| a & b,
            SystemOp::BitwiseOr => |a, b| a | b,
            SystemOp::BitwiseXor => |a, b| a ^ b,
        };
        elementwise::<$t>($input, $inout, f)
    }};
}

macro_rules! float_op {
    ($op:expr, $t:ty, $input:expr, $inout:expr) => {{
        let f: fn($t, $t) -> $t = match $op {
            SystemOp::Max => |a, b| a.max(b),
            SystemOp::Min => |a, b| a.min(b),
            SystemOp::Sum => |a, b| a + b,
            SystemOp::Product => |a, b| a * b,
            _ => return,
        };
        elementwise::<$t>($input, $inout, f)
    }};
}

macro_rules! complex_op {
    ($op:expr, $t:ty, $input:expr, $inout:expr) => {{
        let f: fn([$t; 2], [$t; 2]) -> [$t; 2] = match $op {
            SystemOp::Sum => |a, b| [a[0] + b[0], a[1] + b[1]],
            SystemOp::Product => |a, b| [a[0] * b[0] - a[1] * b[1], a[0] * b[1] + a[1] * b[0]],
            _ => return,
        };
        elementwise::<[$t; 2]>($input, $inout, f)
    }};
}

/// Combines a run of primitives whose pairing with `op` has been checked.
fn combine_run(op: SystemOp, primitive: Primitive, input: &[u8], inout: &mut [u8]) {
    match primitive {
        // bools travel as single bytes holding 0 or 1
        Primitive::Bool | Primitive::UInt8 => integer_op!(op, u8, input, inout),
        Primitive::Int8 => integer_op!(op, i8, input, inout),
        Primitive::Int16 => integer_op!(op, i16, input, inout),
        Primitive::Int32 => integer_op!(op, i32, input, inout),
        Primitive::Int64 => integer_op!(op, i64, input, inout),
        Primitive::UInt16 => integer_op!(op, u16, input, inout),
        Primitive::UInt32 => integer_op!(op, u32, input, inout),
        Primitive::UInt64 => integer_op!(op, u64, input, inout),
        Primitive::Float => float_op!(op, f32, input, inout),
        Primitive::Double => float_op!(op, f64, input, inout),
        Primitive::ComplexFloat => complex_op!(op, f32, input, inout),
        Primitive::ComplexDouble => complex_op!(op, f64, input, inout),
    }
}

/// A user-defined operation.
///
/// The lifetime `'a` of the operation is limited by the lifetime of the underlying closure.
///
/// `UserOperation` is in of itself not considered an `Operation`, but a reference of it is.
///
/// # Examples
///
/// See `demos/collectives.rs`
pub struct UserOperation<'a> {
    commute: bool,
    function: Box<dyn Fn(DynBuffer, DynBufferMut) + Sync + 'a>,
}

impl<'a> fmt::Debug for UserOperation<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserOperation")
            .field("commutative", &self.commute)
            .finish()
    }
}

impl<'a, 'b> Operation for &'b UserOperation<'a> {
    fn is_commutative(&self) -> bool {
        self.commute
    }

    fn apply(&self, input: &[u8], inout: &mut [u8], datatype: &RawDatatype) -> Result<()> {
        let size = datatype.size();
        if size == 0 || inout.is_empty() {
            return Ok(());
        }
        let count: Count = (inout.len() / size)
            .value_as()
            .expect("Element count cannot be expressed as a Count.");
        let datatype = DatatypeRef::from_raw(datatype.clone());
        let extent = datatype.as_raw().extent() as usize;
        // u64 words keep every primitive aligned
        let words = (count as usize * extent + 7) / 8;
        let mut invec = vec![0u64; words];
        let mut inoutvec = vec![0u64; words];
        unsafe {
            unpack_into(
                input,
                &mut MutView::with_count_and_datatype(&mut invec[..], count, &datatype),
            )?;
            unpack_into(
                inout,
                &mut MutView::with_count_and_datatype(&mut inoutvec[..], count, &datatype),
            )?;
            (self.function)(
                DynBuffer::from_raw(invec.as_ptr(), count, datatype.clone()),
                DynBufferMut::from_raw(inoutvec.as_mut_ptr(), count, datatype.clone()),
            );
            let packed = pack(&View::with_count_and_datatype(
                &inoutvec[..],
                count,
                &datatype,
            ));
            inout.copy_from_slice(&packed);
        }
        Ok(())
    }
}

impl<'a> UserOperation<'a> {
    /// Define an operation using a closure.  The operation must be associative.
    ///
    /// This is a more readable shorthand for the `new` method.  Refer to [`new`](#method.new) for
    /// more information.
    pub fn associative<F>(function: F) -> Self
    where
        F: Fn(DynBuffer, DynBufferMut) + Sync + 'a,
    {
        Self::new(false, function)
    }

    /// Define an operation using a closure.  The operation must be both associative and
    /// commutative.
    ///
    /// This is a more readable shorthand for the `new` method.  Refer to [`new`](#method.new) for
    /// more information.
    pub fn commutative<F>(function: F) -> Self
    where
        F: Fn(DynBuffer, DynBufferMut) + Sync + 'a,
    {
        Self::new(true, function)
    }

    /// Creates an associative and possibly commutative operation using a closure.
    ///
    /// The closure receives two arguments `invec` and `inoutvec` as dynamically typed buffers.  It
    /// shall set `inoutvec` to the value of `f(invec, inoutvec)`, where `f` is a binary associative
    /// operation.
    ///
    /// Collectives in this crate combine contributions in any grouping, so operations passed to
    /// them must also be commutative.
    pub fn new<F>(commute: bool, function: F) -> Self
    where
        F: Fn(DynBuffer, DynBufferMut) + Sync + 'a,
    {
        UserOperation {
            commute,
            function: Box::new(function),
        }
    }
}

/// Perform a local reduction.
///
/// `inoutbuf` becomes `inbuf ∘ inoutbuf`, element by element.
///
/// # Panics
///
/// If the buffers do not hold the same number of bytes on the wire.
///
/// # Examples
///
/// See `demos/collectives.rs`
pub fn reduce_local_into<S: ?Sized, R: ?Sized, O>(inbuf: &S, inoutbuf: &mut R, op: O) -> Result<()>
where
    S: Buffer,
    R: BufferMut,
    O: Operation,
{
    let input = pack(inbuf);
    let mut inout = pack_mut(inoutbuf);
    let datatype = inbuf.as_datatype().as_raw().clone();
    op.apply(&input, &mut inout, &datatype)?;
    unpack_into(&inout, inoutbuf).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_operations_on_integers() {
        let mut acc = [5i32, -3, 0, 12];
        reduce_local_into(&[2i32, 7, 0, 4][..], &mut acc[..], SystemOperation::sum()).unwrap();
        assert_eq!(acc, [7, 4, 0, 16]);

        let mut acc = [5i32, -3, 0, 12];
        reduce_local_into(&[2i32, 7, 0, 4][..], &mut acc[..], SystemOperation::max()).unwrap();
        assert_eq!(acc, [5, 7, 0, 12]);

        let mut acc = [1u8, 0, 1, 0];
        reduce_local_into(&[1u8, 1, 0, 0][..], &mut acc[..], SystemOperation::logical_xor())
            .unwrap();
        assert_eq!(acc, [0, 1, 1, 0]);

        let mut acc = [0b1100u16];
        reduce_local_into(&[0b1010u16][..], &mut acc[..], SystemOperation::bitwise_and()).unwrap();
        assert_eq!(acc, [0b1000]);
    }

    #[test]
    fn system_operations_on_floats_and_bools() {
        let mut acc = [1.5f64, 2.0];
        reduce_local_into(&[2.0f64, 0.25][..], &mut acc[..], SystemOperation::product()).unwrap();
        assert_eq!(acc, [3.0, 0.5]);

        let mut acc = [true, false, true];
        reduce_local_into(&[true, true, false][..], &mut acc[..], SystemOperation::logical_and())
            .unwrap();
        assert_eq!(acc, [true, false, false]);
    }

    #[test]
    fn invalid_pairings_are_rejected() {
        let mut acc = [1.0f32];
        match reduce_local_into(&[2.0f32][..], &mut acc[..], SystemOperation::bitwise_or()) {
            Err(Error::InvalidOperation {
                operation,
                primitive,
            }) => {
                assert_eq!(operation, "bitwise_or");
                assert_eq!(primitive, Primitive::Float);
            }
            other => panic!("expected an invalid operation, got {:?}", other),
        }
        assert_eq!(acc, [1.0]);

        let mut flags = [true];
        assert!(reduce_local_into(&[false][..], &mut flags[..], SystemOperation::sum()).is_err());
    }

    #[test]
    fn user_operations_see_typed_buffers() {
        let op = UserOperation::commutative(|x, y| {
            let x: &[i64] = x.downcast().unwrap();
            let y: &mut [i64] = y.downcast().unwrap();
            for (x_i, y_i) in x.iter().zip(y) {
                *y_i = 10 * *x_i + *y_i;
            }
        });
        assert!((&op).is_commutative());
        let mut acc = [1i64, 2, 3];
        reduce_local_into(&[4i64, 5, 6][..], &mut acc[..], &op).unwrap();
        assert_eq!(acc, [41, 52, 63]);
    }

    #[test]
    fn blocks_split_evenly() {
        let blocks = split_blocks((0u8..12).collect(), 6, 3);
        assert_eq!(blocks, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9, 10, 11]]);
        assert_eq!(split_blocks(Vec::new(), 0, 2), vec![Vec::<u8>::new(); 2]);
    }

    #[test]
    #[should_panic]
    fn uneven_blocks_are_a_usage_error() {
        split_blocks(vec![0; 5], 5, 2);
    }
}
