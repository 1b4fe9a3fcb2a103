//! Describing data
//!
//! The core function of this crate is getting data from rank A to rank B. It offers facilities to
//! describe that data (layout in memory, behavior under reduction operators) that go beyond a
//! start address and a number of bytes.
//!
//! A datatype describes a memory layout. There are predefined `SystemDatatype`s which directly
//! correspond to Rust primitive types, such as `f64`. A direct relationship between a Rust type
//! and a datatype is covered by the `Equivalence` trait. Starting from the `SystemDatatype`s, the
//! user can build various `UserDatatype`s, e.g. to describe the layout of a struct (which should
//! then implement `Equivalence`) or to intrusively describe parts of an object in memory like
//! every other element of an array.
//!
//! Every datatype flattens into a `TypeMap`: an ordered list of blocks, each a byte offset, a
//! repeat count and a primitive kind, plus an extent. Sending packs the blocks in declared order
//! into a contiguous wire representation, receiving unpacks them again. Adjacent blocks of the
//! same primitive kind are merged, so a datatype describing a plain array packs with a single
//! copy.
//!
//! A `Buffer` describes a specific piece of data in memory that should be operated on. In
//! addition to specifying the datatype of the data, it knows the address in memory where the
//! data begins and how many instances of the datatype are contained in the data. The `Buffer`
//! trait is implemented for values and slices of types implementing `Equivalence`.
//!
//! In order to use arbitrary datatypes to describe the contents of a slice, the `View` type is
//! provided. However, since it can be used to instruct the engine to rummage around arbitrary
//! parts of memory, its constructors are marked unsafe.

use std::borrow::Cow;
use std::marker::PhantomData;
use std::sync::Arc;
use std::{fmt, mem, ptr, slice};

use conv::ConvUtil;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::raw::traits::*;
use crate::{Address, Count};

/// Datatype traits
pub mod traits {
    pub use super::{
        AsDatatype, Buffer, BufferMut, Collection, Datatype, Equivalence, Pointer, PointerMut,
        UncommittedDatatype,
    };
}

/// Kinds of primitive values a datatype is ultimately built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// `bool`
    Bool,
    /// `i8`
    Int8,
    /// `i16`
    Int16,
    /// `i32`
    Int32,
    /// `i64`
    Int64,
    /// `u8`
    UInt8,
    /// `u16`
    UInt16,
    /// `u32`
    UInt32,
    /// `u64`
    UInt64,
    /// `f32`
    Float,
    /// `f64`
    Double,
    /// A complex number made of two `f32`, real part first
    ComplexFloat,
    /// A complex number made of two `f64`, real part first
    ComplexDouble,
}

impl Primitive {
    /// Size of one value in bytes
    pub fn size(self) -> usize {
        match self {
            Primitive::Bool | Primitive::Int8 | Primitive::UInt8 => 1,
            Primitive::Int16 | Primitive::UInt16 => 2,
            Primitive::Int32 | Primitive::UInt32 | Primitive::Float => 4,
            Primitive::Int64 | Primitive::UInt64 | Primitive::Double | Primitive::ComplexFloat => 8,
            Primitive::ComplexDouble => 16,
        }
    }

    /// Alignment of one value in bytes. Complex numbers align like their parts.
    pub fn alignment(self) -> usize {
        match self {
            Primitive::ComplexFloat => 4,
            Primitive::ComplexDouble => 8,
            _ => self.size(),
        }
    }
}

/// A run of `length` consecutive primitives starting `offset` bytes into an element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Byte offset from the start of the element
    pub offset: usize,
    /// Number of consecutive primitives
    pub length: usize,
    /// Kind of the primitives
    pub primitive: Primitive,
}

impl Block {
    fn bytes(&self) -> usize {
        self.length * self.primitive.size()
    }
}

/// Flattened memory layout of a datatype
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMap {
    blocks: SmallVec<[Block; 4]>,
    size: usize,
    extent: usize,
    alignment: usize,
}

impl TypeMap {
    fn primitive(primitive: Primitive) -> TypeMap {
        let mut map = TypeMap::empty();
        map.push(0, 1, primitive);
        map.extent = primitive.size();
        map
    }

    fn empty() -> TypeMap {
        TypeMap {
            blocks: SmallVec::new(),
            size: 0,
            extent: 0,
            alignment: 1,
        }
    }

    fn push(&mut self, offset: usize, length: usize, primitive: Primitive) {
        if length == 0 {
            return;
        }
        self.size += length * primitive.size();
        self.alignment = self.alignment.max(primitive.alignment());
        if let Some(last) = self.blocks.last_mut() {
            if last.primitive == primitive && last.offset + last.bytes() == offset {
                last.length += length;
                return;
            }
        }
        self.blocks.push(Block {
            offset,
            length,
            primitive,
        });
    }

    fn append(&mut self, other: &TypeMap, displacement: usize) {
        for block in &other.blocks {
            self.push(displacement + block.offset, block.length, block.primitive);
        }
    }

    fn contiguous(count: usize, oldtype: &TypeMap) -> TypeMap {
        let mut map = TypeMap::empty();
        for i in 0..count {
            map.append(oldtype, i * oldtype.extent);
        }
        map.extent = count * oldtype.extent;
        map
    }

    fn vector(count: usize, blocklength: usize, stride: usize, oldtype: &TypeMap) -> TypeMap {
        TypeMap::heterogeneous_vector(count, blocklength, stride * oldtype.extent, oldtype)
    }

    fn heterogeneous_vector(
        count: usize,
        blocklength: usize,
        stride: usize,
        oldtype: &TypeMap,
    ) -> TypeMap {
        let mut map = TypeMap::empty();
        for i in 0..count {
            for j in 0..blocklength {
                map.append(oldtype, i * stride + j * oldtype.extent);
            }
        }
        if count > 0 {
            map.extent = (count - 1) * stride + blocklength * oldtype.extent;
        }
        map
    }

    fn heterogeneous_indexed(
        blocklengths: &[usize],
        displacements: &[usize],
        oldtypes: &[&TypeMap],
    ) -> TypeMap {
        let mut map = TypeMap::empty();
        let mut end = 0;
        for ((&blocklength, &displacement), oldtype) in
            blocklengths.iter().zip(displacements).zip(oldtypes)
        {
            for j in 0..blocklength {
                map.append(oldtype, displacement + j * oldtype.extent);
            }
            end = end.max(displacement + blocklength * oldtype.extent);
        }
        map.extent = end;
        map
    }

    fn structured(blocklengths: &[usize], displacements: &[usize], types: &[&TypeMap]) -> TypeMap {
        let mut map = TypeMap::heterogeneous_indexed(blocklengths, displacements, types);
        map.extent = round_up(map.extent, map.alignment);
        map
    }

    /// The flattened blocks in packing order
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Number of bytes one element occupies on the wire
    pub fn size(&self) -> usize {
        self.size
    }

    /// Distance in bytes from the start of one element to the start of the next
    pub fn extent(&self) -> Address {
        self.extent as Address
    }

    /// Iterates over the primitive runs of `count` packed elements in wire order.
    pub fn runs(&self, count: usize) -> impl Iterator<Item = (Primitive, usize)> + '_ {
        (0..count).flat_map(move |_| self.blocks.iter().map(|b| (b.primitive, b.length)))
    }

    fn is_dense(&self, stride: usize) -> bool {
        self.blocks.len() == 1 && self.blocks[0].offset == 0 && self.size == stride
    }

    /// Appends `count` elements spaced `stride` bytes apart, starting at `base`, to `out`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads of every block of `count` elements.
    unsafe fn pack(&self, base: *const u8, count: usize, stride: usize, out: &mut Vec<u8>) {
        if self.is_dense(stride) {
            out.extend_from_slice(slice::from_raw_parts(base, count * stride));
            return;
        }
        for i in 0..count {
            let element = base.add(i * stride);
            for block in &self.blocks {
                out.extend_from_slice(slice::from_raw_parts(
                    element.add(block.offset),
                    block.bytes(),
                ));
            }
        }
    }

    /// Scatters `bytes`, a whole number of packed elements, into memory starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for writes of every block of the unpacked elements.
    unsafe fn unpack(&self, bytes: &[u8], base: *mut u8, stride: usize) {
        if self.size == 0 {
            return;
        }
        let count = bytes.len() / self.size;
        if self.is_dense(stride) {
            ptr::copy_nonoverlapping(bytes.as_ptr(), base, count * stride);
            return;
        }
        let mut source = bytes.as_ptr();
        for i in 0..count {
            let element = base.add(i * stride);
            for block in &self.blocks {
                ptr::copy_nonoverlapping(source, element.add(block.offset), block.bytes());
                source = source.add(block.bytes());
            }
        }
    }
}

fn round_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

pub(crate) fn count_to_usize(count: Count, what: &str) -> usize {
    count
        .value_as::<usize>()
        .unwrap_or_else(|_| panic!("{} must not be negative, got {}.", what, count))
}

fn address_to_usize(address: Address, what: &str) -> usize {
    address
        .value_as::<usize>()
        .unwrap_or_else(|_| panic!("{} must not be negative, got {}.", what, address))
}

/// Engine-side datatype handle: either a primitive or a committed composite layout
#[derive(Clone, PartialEq, Eq)]
pub enum RawDatatype {
    /// One of the predefined primitive datatypes
    Primitive(Primitive),
    /// A committed user datatype, shared by every handle and every operation that uses it
    Composite(Arc<TypeMap>),
}

impl RawDatatype {
    /// The flattened layout
    pub fn type_map(&self) -> Cow<'_, TypeMap> {
        match self {
            RawDatatype::Primitive(p) => Cow::Owned(TypeMap::primitive(*p)),
            RawDatatype::Composite(map) => Cow::Borrowed(map),
        }
    }

    /// Number of bytes one element occupies on the wire
    pub fn size(&self) -> usize {
        match self {
            RawDatatype::Primitive(p) => p.size(),
            RawDatatype::Composite(map) => map.size(),
        }
    }

    /// Distance in bytes between consecutive elements
    pub fn extent(&self) -> Address {
        match self {
            RawDatatype::Primitive(p) => p.size() as Address,
            RawDatatype::Composite(map) => map.extent(),
        }
    }
}

impl fmt::Debug for RawDatatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawDatatype::Primitive(p) => write!(f, "{:?}", p),
            RawDatatype::Composite(map) => f
                .debug_struct("Composite")
                .field("blocks", &map.blocks())
                .field("extent", &map.extent)
                .finish(),
        }
    }
}

/// A reference to a datatype.
///
/// Guaranteed to describe a committed layout for `'a`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatatypeRef<'a> {
    datatype: RawDatatype,
    phantom: PhantomData<&'a ()>,
}

unsafe impl<'a> AsRaw for DatatypeRef<'a> {
    type Raw = RawDatatype;
    fn as_raw(&self) -> &Self::Raw {
        &self.datatype
    }
}

impl<'a> Datatype for DatatypeRef<'a> {}

impl<'a> UncommittedDatatype for DatatypeRef<'a> {
    fn layout(&self) -> Cow<'_, TypeMap> {
        self.datatype.type_map()
    }
}

impl<'a> DatatypeRef<'a> {
    /// Wrap an engine-side handle.
    pub fn from_raw(datatype: RawDatatype) -> Self {
        Self {
            datatype,
            phantom: PhantomData,
        }
    }

    /// The predefined datatype of a primitive kind
    pub fn primitive(primitive: Primitive) -> Self {
        Self::from_raw(RawDatatype::Primitive(primitive))
    }
}

/// A system datatype, e.g. the one describing `f32`
pub type SystemDatatype = DatatypeRef<'static>;

/// A direct equivalence exists between the implementing type and a datatype
///
/// # Safety
///
/// The datatype must describe every byte the engine may read or write within a value of the
/// implementing type, and any bit pattern the datatype can produce (including all zeros) must be
/// a valid value of the type.
pub unsafe trait Equivalence {
    /// The type of the equivalent datatype (e.g. `SystemDatatype` or `UserDatatype`)
    type Out: Datatype;
    /// The datatype that is equivalent to this Rust type
    fn equivalent_datatype() -> Self::Out;
}

macro_rules! equivalent_system_datatype {
    ($rstype:path, $primitive:expr) => {
        unsafe impl Equivalence for $rstype {
            type Out = SystemDatatype;
            fn equivalent_datatype() -> Self::Out {
                DatatypeRef::primitive($primitive)
            }
        }
    };
}

equivalent_system_datatype!(bool, Primitive::Bool);

equivalent_system_datatype!(f32, Primitive::Float);
equivalent_system_datatype!(f64, Primitive::Double);

equivalent_system_datatype!(i8, Primitive::Int8);
equivalent_system_datatype!(i16, Primitive::Int16);
equivalent_system_datatype!(i32, Primitive::Int32);
equivalent_system_datatype!(i64, Primitive::Int64);

equivalent_system_datatype!(u8, Primitive::UInt8);
equivalent_system_datatype!(u16, Primitive::UInt16);
equivalent_system_datatype!(u32, Primitive::UInt32);
equivalent_system_datatype!(u64, Primitive::UInt64);

#[cfg(target_pointer_width = "32")]
equivalent_system_datatype!(usize, Primitive::UInt32);
#[cfg(target_pointer_width = "32")]
equivalent_system_datatype!(isize, Primitive::Int32);

#[cfg(target_pointer_width = "64")]
equivalent_system_datatype!(usize, Primitive::UInt64);
#[cfg(target_pointer_width = "64")]
equivalent_system_datatype!(isize, Primitive::Int64);

#[cfg(feature = "complex")]
/// Implement direct equivalence for complex types
pub mod complex_datatype {
    use super::{Equivalence, Primitive, TypeMap, UserDatatype};
    use num_complex::{Complex32, Complex64};

    unsafe impl Equivalence for Complex32 {
        type Out = UserDatatype;
        fn equivalent_datatype() -> Self::Out {
            UserDatatype::from_map(TypeMap::primitive(Primitive::ComplexFloat))
        }
    }

    unsafe impl Equivalence for Complex64 {
        type Out = UserDatatype;
        fn equivalent_datatype() -> Self::Out {
            UserDatatype::from_map(TypeMap::primitive(Primitive::ComplexDouble))
        }
    }
}

unsafe impl<T, const N: usize> Equivalence for [T; N]
where
    T: Equivalence,
{
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        let element = T::equivalent_datatype();
        let element = element.as_raw().type_map();
        let mut map = TypeMap::heterogeneous_vector(N, 1, mem::size_of::<T>(), &element);
        map.extent = mem::size_of::<[T; N]>();
        UserDatatype::from_map(map)
    }
}

/// A committed user defined datatype
///
/// The layout is shared with every `DatatypeRef` handed out and every operation in flight, so
/// dropping (freeing) the datatype never invalidates them.
#[derive(Clone, Debug)]
pub struct UserDatatype(RawDatatype);

impl UserDatatype {
    fn from_map(map: TypeMap) -> UserDatatype {
        UserDatatype(RawDatatype::Composite(Arc::new(map)))
    }

    /// Constructs a new datatype by concatenating `count` repetitions of `oldtype`
    ///
    /// # Examples
    /// See `tests/datatype.rs`
    pub fn contiguous<D>(count: Count, oldtype: &D) -> UserDatatype
    where
        D: UncommittedDatatype,
    {
        UncommittedUserDatatype::contiguous(count, oldtype).commit()
    }

    /// Construct a new datatype out of `count` blocks of `blocklength` elements of `oldtype`
    /// concatenated with the start of consecutive blocks placed `stride` elements apart.
    pub fn vector<D>(count: Count, blocklength: Count, stride: Count, oldtype: &D) -> UserDatatype
    where
        D: UncommittedDatatype,
    {
        UncommittedUserDatatype::vector(count, blocklength, stride, oldtype).commit()
    }

    /// Like `vector()` but `stride` is given in bytes rather than elements of `oldtype`.
    pub fn heterogeneous_vector<D>(
        count: Count,
        blocklength: Count,
        stride: Address,
        oldtype: &D,
    ) -> UserDatatype
    where
        D: UncommittedDatatype,
    {
        UncommittedUserDatatype::heterogeneous_vector(count, blocklength, stride, oldtype).commit()
    }

    /// Constructs a new type out of multiple blocks of individual length and displacement.
    /// Block `i` will be `blocklengths[i]` items of datatype `oldtype` long and displaced by
    /// `displacements[i]` items of the `oldtype`.
    pub fn indexed<D>(blocklengths: &[Count], displacements: &[Count], oldtype: &D) -> UserDatatype
    where
        D: UncommittedDatatype,
    {
        UncommittedUserDatatype::indexed(blocklengths, displacements, oldtype).commit()
    }

    /// Constructs a new type out of multiple blocks of individual length and displacement.
    /// Block `i` will be `blocklengths[i]` items of datatype `oldtype` long and displaced by
    /// `displacements[i]` bytes.
    pub fn heterogeneous_indexed<D>(
        blocklengths: &[Count],
        displacements: &[Address],
        oldtype: &D,
    ) -> UserDatatype
    where
        D: UncommittedDatatype,
    {
        UncommittedUserDatatype::heterogeneous_indexed(blocklengths, displacements, oldtype)
            .commit()
    }

    /// Constructs a new datatype out of blocks of different length, displacement and datatypes
    ///
    /// # Examples
    /// See `demos/struct.rs`
    pub fn structured<D>(
        blocklengths: &[Count],
        displacements: &[Address],
        types: &[D],
    ) -> UserDatatype
    where
        D: UncommittedDatatype,
    {
        UncommittedUserDatatype::structured(blocklengths, displacements, types).commit()
    }

    /// Creates a `DatatypeRef` from this datatype object.
    pub fn as_ref(&self) -> DatatypeRef<'_> {
        DatatypeRef::from_raw(self.0.clone())
    }
}

unsafe impl AsRaw for UserDatatype {
    type Raw = RawDatatype;
    fn as_raw(&self) -> &Self::Raw {
        &self.0
    }
}

impl Datatype for UserDatatype {}

impl UncommittedDatatype for UserDatatype {
    fn layout(&self) -> Cow<'_, TypeMap> {
        self.0.type_map()
    }
}

/// A datatype that has been constructed but cannot yet be used for communication
///
/// It may serve as a building block of further datatypes. `commit()` turns it into a
/// `UserDatatype`.
#[derive(Clone, Debug)]
pub struct UncommittedUserDatatype(TypeMap);

impl UncommittedUserDatatype {
    /// Constructs a new datatype by concatenating `count` repetitions of `oldtype`
    pub fn contiguous<D>(count: Count, oldtype: &D) -> Self
    where
        D: UncommittedDatatype,
    {
        let count = count_to_usize(count, "count");
        UncommittedUserDatatype(TypeMap::contiguous(count, &oldtype.layout()))
    }

    /// Construct a new datatype out of `count` blocks of `blocklength` elements of `oldtype`
    /// concatenated with the start of consecutive blocks placed `stride` elements apart.
    pub fn vector<D>(count: Count, blocklength: Count, stride: Count, oldtype: &D) -> Self
    where
        D: UncommittedDatatype,
    {
        UncommittedUserDatatype(TypeMap::vector(
            count_to_usize(count, "count"),
            count_to_usize(blocklength, "blocklength"),
            count_to_usize(stride, "stride"),
            &oldtype.layout(),
        ))
    }

    /// Like `vector()` but `stride` is given in bytes rather than elements of `oldtype`.
    pub fn heterogeneous_vector<D>(
        count: Count,
        blocklength: Count,
        stride: Address,
        oldtype: &D,
    ) -> Self
    where
        D: UncommittedDatatype,
    {
        UncommittedUserDatatype(TypeMap::heterogeneous_vector(
            count_to_usize(count, "count"),
            count_to_usize(blocklength, "blocklength"),
            address_to_usize(stride, "stride"),
            &oldtype.layout(),
        ))
    }

    /// Constructs a new type out of multiple blocks of individual length and displacement.
    /// Displacements are given in elements of `oldtype`.
    pub fn indexed<D>(blocklengths: &[Count], displacements: &[Count], oldtype: &D) -> Self
    where
        D: UncommittedDatatype,
    {
        assert_eq!(
            blocklengths.len(),
            displacements.len(),
            "blocklengths and displacements must have the same length."
        );
        let oldtype = oldtype.layout();
        let displacements: Vec<_> = displacements
            .iter()
            .map(|&d| count_to_usize(d, "displacement") * oldtype.extent)
            .collect();
        let blocklengths: Vec<_> = blocklengths
            .iter()
            .map(|&b| count_to_usize(b, "blocklength"))
            .collect();
        let oldtypes = vec![&*oldtype; blocklengths.len()];
        UncommittedUserDatatype(TypeMap::heterogeneous_indexed(
            &blocklengths,
            &displacements,
            &oldtypes,
        ))
    }

    /// Constructs a new type out of multiple blocks of individual length and displacement.
    /// Displacements are given in bytes.
    pub fn heterogeneous_indexed<D>(
        blocklengths: &[Count],
        displacements: &[Address],
        oldtype: &D,
    ) -> Self
    where
        D: UncommittedDatatype,
    {
        assert_eq!(
            blocklengths.len(),
            displacements.len(),
            "blocklengths and displacements must have the same length."
        );
        let oldtype = oldtype.layout();
        let displacements: Vec<_> = displacements
            .iter()
            .map(|&d| address_to_usize(d, "displacement"))
            .collect();
        let blocklengths: Vec<_> = blocklengths
            .iter()
            .map(|&b| count_to_usize(b, "blocklength"))
            .collect();
        let oldtypes = vec![&*oldtype; blocklengths.len()];
        UncommittedUserDatatype(TypeMap::heterogeneous_indexed(
            &blocklengths,
            &displacements,
            &oldtypes,
        ))
    }

    /// Constructs a new datatype out of blocks of different length, displacement and datatypes.
    ///
    /// Block `i` holds `blocklengths[i]` consecutive values of `types[i]` starting
    /// `displacements[i]` bytes into the record. Overlapping blocks are not rejected. The extent
    /// is the end of the furthest block rounded up to the largest primitive alignment.
    pub fn structured<D>(blocklengths: &[Count], displacements: &[Address], types: &[D]) -> Self
    where
        D: UncommittedDatatype,
    {
        assert_eq!(
            blocklengths.len(),
            displacements.len(),
            "blocklengths and displacements must have the same length."
        );
        assert_eq!(
            blocklengths.len(),
            types.len(),
            "blocklengths and types must have the same length."
        );
        let layouts: Vec<_> = types.iter().map(|t| t.layout()).collect();
        let layouts: Vec<&TypeMap> = layouts.iter().map(|l| &**l).collect();
        let displacements: Vec<_> = displacements
            .iter()
            .map(|&d| address_to_usize(d, "displacement"))
            .collect();
        let blocklengths: Vec<_> = blocklengths
            .iter()
            .map(|&b| count_to_usize(b, "blocklength"))
            .collect();
        UncommittedUserDatatype(TypeMap::structured(&blocklengths, &displacements, &layouts))
    }

    /// Commits the datatype, allowing it to be used in communication.
    pub fn commit(self) -> UserDatatype {
        UserDatatype::from_map(self.0)
    }

    /// Creates an `UncommittedDatatypeRef` from this datatype object.
    pub fn as_ref(&self) -> UncommittedDatatypeRef<'_> {
        UncommittedDatatypeRef(Cow::Borrowed(&self.0))
    }
}

impl UncommittedDatatype for UncommittedUserDatatype {
    fn layout(&self) -> Cow<'_, TypeMap> {
        Cow::Borrowed(&self.0)
    }
}

/// A reference to a committed or uncommitted datatype, usable only as a building block
#[derive(Clone, Debug)]
pub struct UncommittedDatatypeRef<'a>(Cow<'a, TypeMap>);

impl<'a> UncommittedDatatype for UncommittedDatatypeRef<'a> {
    fn layout(&self) -> Cow<'_, TypeMap> {
        Cow::Borrowed(&self.0)
    }
}

impl<'a> From<DatatypeRef<'a>> for UncommittedDatatypeRef<'a> {
    fn from(datatype: DatatypeRef<'a>) -> Self {
        UncommittedDatatypeRef(Cow::Owned(datatype.datatype.type_map().into_owned()))
    }
}

impl<'a> From<UserDatatype> for UncommittedDatatypeRef<'a> {
    fn from(datatype: UserDatatype) -> Self {
        UncommittedDatatypeRef(Cow::Owned(datatype.0.type_map().into_owned()))
    }
}

impl<'a> From<&'a UserDatatype> for UncommittedDatatypeRef<'a> {
    fn from(datatype: &'a UserDatatype) -> Self {
        UncommittedDatatypeRef(datatype.0.type_map())
    }
}

impl<'a> From<&'a UncommittedUserDatatype> for UncommittedDatatypeRef<'a> {
    fn from(datatype: &'a UncommittedUserDatatype) -> Self {
        datatype.as_ref()
    }
}

/// A Datatype describes the layout of messages in memory.
pub trait Datatype: AsRaw<Raw = RawDatatype> {}
impl<'a, D> Datatype for &'a D where D: 'a + Datatype {}

/// Anything that can serve as a building block of new datatypes
pub trait UncommittedDatatype {
    /// The flattened layout of the building block
    fn layout(&self) -> Cow<'_, TypeMap>;
}

impl<'a, D> UncommittedDatatype for &'a D
where
    D: 'a + UncommittedDatatype + ?Sized,
{
    fn layout(&self) -> Cow<'_, TypeMap> {
        (**self).layout()
    }
}

/// Something that has an associated datatype
pub unsafe trait AsDatatype {
    /// The type of the associated datatype (e.g. `SystemDatatype` or `UserDatatype`)
    type Out: Datatype;
    /// The associated datatype
    fn as_datatype(&self) -> Self::Out;
}

unsafe impl<T> AsDatatype for T
where
    T: Equivalence,
{
    type Out = <T as Equivalence>::Out;
    fn as_datatype(&self) -> Self::Out {
        <T as Equivalence>::equivalent_datatype()
    }
}

unsafe impl<T> AsDatatype for [T]
where
    T: Equivalence,
{
    type Out = <T as Equivalence>::Out;
    fn as_datatype(&self) -> Self::Out {
        <T as Equivalence>::equivalent_datatype()
    }
}

/// A countable collection of things.
pub unsafe trait Collection {
    /// How many things are in this collection.
    fn count(&self) -> Count;

    /// Distance in bytes from the start of one thing to the start of the next.
    fn stride(&self) -> usize;
}

unsafe impl<T> Collection for T
where
    T: Equivalence,
{
    fn count(&self) -> Count {
        1
    }

    fn stride(&self) -> usize {
        mem::size_of::<T>()
    }
}

unsafe impl<T> Collection for [T]
where
    T: Equivalence,
{
    fn count(&self) -> Count {
        self.len()
            .value_as()
            .expect("Length of slice cannot be expressed as a Count.")
    }

    fn stride(&self) -> usize {
        mem::size_of::<T>()
    }
}

/// Provides a pointer to the starting address in memory.
pub unsafe trait Pointer {
    /// A pointer to the starting address in memory
    fn pointer(&self) -> *const u8;
}

unsafe impl<T> Pointer for T
where
    T: Equivalence,
{
    fn pointer(&self) -> *const u8 {
        let p: *const T = self;
        p as *const u8
    }
}

unsafe impl<T> Pointer for [T]
where
    T: Equivalence,
{
    fn pointer(&self) -> *const u8 {
        self.as_ptr() as *const u8
    }
}

/// Provides a mutable pointer to the starting address in memory.
pub unsafe trait PointerMut {
    /// A mutable pointer to the starting address in memory
    fn pointer_mut(&mut self) -> *mut u8;
}

unsafe impl<T> PointerMut for T
where
    T: Equivalence,
{
    fn pointer_mut(&mut self) -> *mut u8 {
        let p: *mut T = self;
        p as *mut u8
    }
}

unsafe impl<T> PointerMut for [T]
where
    T: Equivalence,
{
    fn pointer_mut(&mut self) -> *mut u8 {
        self.as_mut_ptr() as *mut u8
    }
}

/// A buffer is a region in memory that starts at `pointer()` and contains `count()` copies of
/// `as_datatype()`, placed `stride()` bytes apart.
pub unsafe trait Buffer: Pointer + Collection + AsDatatype {}
unsafe impl<T> Buffer for T where T: Equivalence {}
unsafe impl<T> Buffer for [T] where T: Equivalence {}

/// A mutable buffer is a region in memory that starts at `pointer_mut()` and contains `count()`
/// copies of `as_datatype()`, placed `stride()` bytes apart.
pub unsafe trait BufferMut: PointerMut + Collection + AsDatatype {}
unsafe impl<T> BufferMut for T where T: Equivalence {}
unsafe impl<T> BufferMut for [T] where T: Equivalence {}

/// An immutable dynamically-typed buffer.
///
/// The buffer has a definite length and datatype, but it is not yet known which Rust type it
/// corresponds to. This is the analogue of `&Any`. Reduction operations written as closures
/// receive their operands this way.
#[derive(Clone, Debug)]
pub struct DynBuffer<'a> {
    ptr: *const u8,
    len: Count,
    stride: usize,
    datatype: DatatypeRef<'a>,
}

unsafe impl<'a> Send for DynBuffer<'a> {}

unsafe impl<'a> Sync for DynBuffer<'a> {}

unsafe impl<'a> Collection for DynBuffer<'a> {
    fn count(&self) -> Count {
        self.len
    }

    fn stride(&self) -> usize {
        self.stride
    }
}

unsafe impl<'a> Pointer for DynBuffer<'a> {
    fn pointer(&self) -> *const u8 {
        self.ptr
    }
}

unsafe impl<'a> AsDatatype for DynBuffer<'a> {
    type Out = DatatypeRef<'a>;
    fn as_datatype(&self) -> Self::Out {
        self.datatype.clone()
    }
}

unsafe impl<'a> Buffer for DynBuffer<'a> {}

impl<'a> DynBuffer<'a> {
    /// Creates a buffer from a slice whose type has an equivalent datatype.
    pub fn new<T: Equivalence>(buf: &'a [T]) -> Self {
        let datatype = DatatypeRef::from_raw(T::equivalent_datatype().as_raw().clone());
        DynBuffer {
            ptr: buf.as_ptr() as *const u8,
            len: buf.count(),
            stride: mem::size_of::<T>(),
            datatype,
        }
    }

    /// Tests whether the buffer type matches `T`.
    pub fn is<T: Equivalence>(&self) -> bool {
        self.datatype.as_raw() == T::equivalent_datatype().as_raw()
            && self.stride == mem::size_of::<T>()
    }

    /// Returns some slice if the type matches `T`, or `None` if it doesn't.
    pub fn downcast<T: Equivalence>(self) -> Option<&'a [T]> {
        if self.is::<T>() {
            unsafe { Some(slice::from_raw_parts(self.ptr as *const T, self.len())) }
        } else {
            None
        }
    }

    /// Creates a buffer from its raw components. Consecutive elements are placed one datatype
    /// extent apart.
    ///
    /// # Safety
    ///
    /// The buffer must be valid for reads of `len` elements of `datatype` for `'a`.
    pub unsafe fn from_raw<T>(ptr: *const T, len: Count, datatype: DatatypeRef<'a>) -> Self {
        let stride = address_to_usize(datatype.as_raw().extent(), "extent");
        DynBuffer {
            ptr: ptr as *const u8,
            len,
            stride,
            datatype,
        }
    }

    /// Returns the number of elements in the buffer.
    pub fn len(&self) -> usize {
        count_to_usize(self.len, "length")
    }

    /// Returns `true` if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the underlying raw pointer.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }
}

/// A mutable dynamically-typed buffer.
///
/// The buffer has a definite length and datatype, but it is not yet known which Rust type it
/// corresponds to. This is the analogue of `&mut Any`.
#[derive(Debug)]
pub struct DynBufferMut<'a> {
    ptr: *mut u8,
    len: Count,
    stride: usize,
    datatype: DatatypeRef<'a>,
}

unsafe impl<'a> Send for DynBufferMut<'a> {}

unsafe impl<'a> Sync for DynBufferMut<'a> {}

unsafe impl<'a> Collection for DynBufferMut<'a> {
    fn count(&self) -> Count {
        self.len
    }

    fn stride(&self) -> usize {
        self.stride
    }
}

unsafe impl<'a> Pointer for DynBufferMut<'a> {
    fn pointer(&self) -> *const u8 {
        self.ptr
    }
}

unsafe impl<'a> PointerMut for DynBufferMut<'a> {
    fn pointer_mut(&mut self) -> *mut u8 {
        self.ptr
    }
}

unsafe impl<'a> AsDatatype for DynBufferMut<'a> {
    type Out = DatatypeRef<'a>;
    fn as_datatype(&self) -> Self::Out {
        self.datatype.clone()
    }
}

unsafe impl<'a> Buffer for DynBufferMut<'a> {}

unsafe impl<'a> BufferMut for DynBufferMut<'a> {}

impl<'a> DynBufferMut<'a> {
    /// Creates a mutable buffer from a mutable slice whose type has an equivalent datatype.
    pub fn new<T: Equivalence>(buf: &'a mut [T]) -> Self {
        let datatype = DatatypeRef::from_raw(T::equivalent_datatype().as_raw().clone());
        DynBufferMut {
            len: buf.count(),
            ptr: buf.as_mut_ptr() as *mut u8,
            stride: mem::size_of::<T>(),
            datatype,
        }
    }

    /// Tests whether the buffer type matches `T`.
    pub fn is<T: Equivalence>(&self) -> bool {
        self.datatype.as_raw() == T::equivalent_datatype().as_raw()
            && self.stride == mem::size_of::<T>()
    }

    /// Returns some mutable slice if the type matches `T`, or `None` if it doesn't.
    pub fn downcast<T: Equivalence>(self) -> Option<&'a mut [T]> {
        if self.is::<T>() {
            unsafe { Some(slice::from_raw_parts_mut(self.ptr as *mut T, self.len())) }
        } else {
            None
        }
    }

    /// Creates a mutable buffer from its raw components. Consecutive elements are placed one
    /// datatype extent apart.
    ///
    /// # Safety
    ///
    /// The buffer must be valid for reads and writes of `len` elements of `datatype` for `'a`.
    pub unsafe fn from_raw<T>(ptr: *mut T, len: Count, datatype: DatatypeRef<'a>) -> Self {
        let stride = address_to_usize(datatype.as_raw().extent(), "extent");
        DynBufferMut {
            ptr: ptr as *mut u8,
            len,
            stride,
            datatype,
        }
    }

    /// Returns the number of elements in the buffer.
    pub fn len(&self) -> usize {
        count_to_usize(self.len, "length")
    }

    /// Returns `true` if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the underlying raw pointer.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    /// Reborrows the buffer with a shorter lifetime.
    pub fn reborrow_mut(&mut self) -> DynBufferMut<'_> {
        DynBufferMut {
            ptr: self.ptr,
            len: self.len,
            stride: self.stride,
            datatype: DatatypeRef::from_raw(self.datatype.as_raw().clone()),
        }
    }
}

/// A buffer with a user specified count and datatype
///
/// # Safety
///
/// Views can be used to instruct the underlying engine to rummage around arbitrary parts of
/// memory. This might be fine for types that implement `Equivalence` but it can easily read
/// padding bytes or pointers when used with other types.
pub struct View<'d, 'b, D, B: ?Sized>
where
    D: 'd + Datatype,
    B: 'b + Pointer,
{
    datatype: &'d D,
    count: Count,
    buffer: &'b B,
}

impl<'d, 'b, D, B: ?Sized> View<'d, 'b, D, B>
where
    D: 'd + Datatype,
    B: 'b + Pointer,
{
    /// Return a view of `buffer` containing `count` instances of datatype `datatype`.
    ///
    /// # Safety
    ///
    /// - `datatype` must map an element of `buffer` without exposing any padding bytes or
    ///   exceeding the bounds of the object.
    pub unsafe fn with_count_and_datatype(
        buffer: &'b B,
        count: Count,
        datatype: &'d D,
    ) -> View<'d, 'b, D, B> {
        View {
            datatype,
            count,
            buffer,
        }
    }
}

unsafe impl<'d, 'b, D, B: ?Sized> AsDatatype for View<'d, 'b, D, B>
where
    D: 'd + Datatype,
    B: 'b + Pointer,
{
    type Out = &'d D;
    fn as_datatype(&self) -> Self::Out {
        self.datatype
    }
}

unsafe impl<'d, 'b, D, B: ?Sized> Collection for View<'d, 'b, D, B>
where
    D: 'd + Datatype,
    B: 'b + Pointer,
{
    fn count(&self) -> Count {
        self.count
    }

    fn stride(&self) -> usize {
        address_to_usize(self.datatype.as_raw().extent(), "extent")
    }
}

unsafe impl<'d, 'b, D, B: ?Sized> Pointer for View<'d, 'b, D, B>
where
    D: 'd + Datatype,
    B: 'b + Pointer,
{
    fn pointer(&self) -> *const u8 {
        self.buffer.pointer()
    }
}

unsafe impl<'d, 'b, D, B: ?Sized> Buffer for View<'d, 'b, D, B>
where
    D: 'd + Datatype,
    B: 'b + Pointer,
{
}

/// A buffer with a user specified count and datatype
///
/// # Safety
///
/// Views can be used to instruct the underlying engine to rummage around arbitrary parts of
/// memory. This might be fine for types that implement `Equivalence` but it can easily write
/// over padding bytes or pointers when used with other types.
pub struct MutView<'d, 'b, D, B: ?Sized>
where
    D: 'd + Datatype,
    B: 'b + PointerMut,
{
    datatype: &'d D,
    count: Count,
    buffer: &'b mut B,
}

impl<'d, 'b, D, B: ?Sized> MutView<'d, 'b, D, B>
where
    D: 'd + Datatype,
    B: 'b + PointerMut,
{
    /// Return a view of `buffer` containing `count` instances of datatype `datatype`.
    ///
    /// # Safety
    ///
    /// - `datatype` must map an element of `buffer` without exposing any padding bytes or
    ///   exceeding the bounds of the object.
    pub unsafe fn with_count_and_datatype(
        buffer: &'b mut B,
        count: Count,
        datatype: &'d D,
    ) -> MutView<'d, 'b, D, B> {
        MutView {
            datatype,
            count,
            buffer,
        }
    }
}

unsafe impl<'d, 'b, D, B: ?Sized> AsDatatype for MutView<'d, 'b, D, B>
where
    D: 'd + Datatype,
    B: 'b + PointerMut,
{
    type Out = &'d D;
    fn as_datatype(&self) -> Self::Out {
        self.datatype
    }
}

unsafe impl<'d, 'b, D, B: ?Sized> Collection for MutView<'d, 'b, D, B>
where
    D: 'd + Datatype,
    B: 'b + PointerMut,
{
    fn count(&self) -> Count {
        self.count
    }

    fn stride(&self) -> usize {
        address_to_usize(self.datatype.as_raw().extent(), "extent")
    }
}

unsafe impl<'d, 'b, D, B: ?Sized> PointerMut for MutView<'d, 'b, D, B>
where
    D: 'd + Datatype,
    B: 'b + PointerMut,
{
    fn pointer_mut(&mut self) -> *mut u8 {
        self.buffer.pointer_mut()
    }
}

unsafe impl<'d, 'b, D, B: ?Sized> BufferMut for MutView<'d, 'b, D, B>
where
    D: 'd + Datatype,
    B: 'b + PointerMut,
{
}

/// Number of bytes `buffer` occupies on the wire
pub fn packed_size<B: Collection + AsDatatype + ?Sized>(buffer: &B) -> usize {
    buffer.as_datatype().as_raw().size() * count_to_usize(buffer.count(), "count")
}

/// Packs the contents of `buffer` into their contiguous wire representation.
pub fn pack<B: Buffer + ?Sized>(buffer: &B) -> Vec<u8> {
    let datatype = buffer.as_datatype();
    let map = datatype.as_raw().type_map();
    let count = count_to_usize(buffer.count(), "count");
    let mut out = Vec::with_capacity(map.size() * count);
    unsafe { map.pack(buffer.pointer(), count, buffer.stride(), &mut out) };
    out
}

/// Packs the contents of a mutable buffer, e.g. the send side of an in-place broadcast.
pub(crate) fn pack_mut<B: BufferMut + ?Sized>(buffer: &mut B) -> Vec<u8> {
    let datatype = buffer.as_datatype();
    let map = datatype.as_raw().type_map();
    let count = count_to_usize(buffer.count(), "count");
    let mut out = Vec::with_capacity(map.size() * count);
    let stride = buffer.stride();
    unsafe { map.pack(buffer.pointer_mut(), count, stride, &mut out) };
    out
}

/// Unpacks a wire representation into `buffer` and returns the number of elements written.
///
/// Fails with `Error::Truncated` if `bytes` holds more than `buffer` can take and with
/// `Error::TypeMismatch` if `bytes` is not a whole number of elements. Nothing is written in
/// either case.
pub fn unpack_into<B: BufferMut + ?Sized>(bytes: &[u8], buffer: &mut B) -> Result<Count> {
    let datatype = buffer.as_datatype();
    let map = datatype.as_raw().type_map();
    let capacity = map.size() * count_to_usize(buffer.count(), "count");
    if bytes.len() > capacity {
        return Err(Error::Truncated {
            received: bytes.len(),
            capacity,
        });
    }
    if map.size() == 0 {
        return Ok(0);
    }
    if bytes.len() % map.size() != 0 {
        return Err(Error::TypeMismatch {
            received: bytes.len(),
            element_size: map.size(),
        });
    }
    let stride = buffer.stride();
    unsafe { map.unpack(bytes, buffer.pointer_mut(), stride) };
    Ok((bytes.len() / map.size())
        .value_as()
        .expect("Element count cannot be expressed as a Count."))
}

/// Creates a value of an `Equivalence` type with every byte zeroed, ready to be unpacked into.
pub(crate) fn zeroed<T: Equivalence>() -> T {
    // `Equivalence` requires the all-zero bit pattern to be valid.
    unsafe { mem::MaybeUninit::zeroed().assume_init() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct Record {
        id: i32,
        value: f64,
        data: [i32; 3],
    }

    unsafe impl Equivalence for Record {
        type Out = UserDatatype;
        fn equivalent_datatype() -> Self::Out {
            UserDatatype::structured(
                &[1, 1, 3],
                &[0, 8, 16],
                &[
                    i32::equivalent_datatype(),
                    f64::equivalent_datatype(),
                    i32::equivalent_datatype(),
                ],
            )
        }
    }

    #[test]
    fn primitive_layouts() {
        let map = i32::equivalent_datatype().as_raw().type_map().into_owned();
        assert_eq!(map.size(), 4);
        assert_eq!(map.extent(), 4);
        assert_eq!(u8::equivalent_datatype().as_raw().size(), 1);
        assert_eq!(f64::equivalent_datatype().as_raw().extent(), 8);
    }

    #[test]
    fn struct_extent_is_rounded_to_alignment() {
        let datatype = Record::equivalent_datatype();
        let map = datatype.as_raw().type_map();
        assert_eq!(map.size(), 4 + 8 + 12);
        assert_eq!(map.extent() as usize, mem::size_of::<Record>());
        assert_eq!(map.blocks().len(), 3);
    }

    #[test]
    fn adjacent_blocks_merge() {
        let datatype = UserDatatype::contiguous(4, &i32::equivalent_datatype());
        let map = datatype.as_raw().type_map();
        assert_eq!(
            map.blocks(),
            &[Block {
                offset: 0,
                length: 4,
                primitive: Primitive::Int32
            }]
        );
    }

    #[test]
    fn pack_skips_padding() {
        let record = Record {
            id: 7,
            value: 2.5,
            data: [1, 2, 3],
        };
        let bytes = pack(&record);
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[0..4], &7i32.to_ne_bytes());
        assert_eq!(&bytes[4..12], &2.5f64.to_ne_bytes());

        let mut received = Record::default();
        assert_eq!(unpack_into(&bytes, &mut received).unwrap(), 1);
        assert_eq!(received, record);
    }

    #[test]
    fn vector_picks_every_other_element() {
        let datatype = UserDatatype::vector(3, 1, 2, &i32::equivalent_datatype());
        let values = [0, 1, 2, 3, 4];
        let view = unsafe { View::with_count_and_datatype(&values[..], 1, &datatype) };
        let bytes = pack(&view);
        let mut unpacked = [0i32; 3];
        unpack_into(&bytes, &mut unpacked[..]).unwrap();
        assert_eq!(unpacked, [0, 2, 4]);
    }

    #[test]
    fn indexed_scatters_blocks() {
        let datatype = UserDatatype::indexed(&[2, 1], &[0, 4], &u16::equivalent_datatype());
        assert_eq!(datatype.as_raw().size(), 6);
        assert_eq!(datatype.as_raw().extent(), 10);

        let bytes = pack(&[1u16, 2, 3][..]);
        let mut target = [0u16; 5];
        let mut view = unsafe { MutView::with_count_and_datatype(&mut target[..], 1, &datatype) };
        unpack_into(&bytes, &mut view).unwrap();
        assert_eq!(target, [1, 2, 0, 0, 3]);
    }

    #[test]
    fn unpack_reports_truncation() {
        let bytes = pack(&[1i32, 2, 3][..]);
        let mut small = [0i32; 2];
        match unpack_into(&bytes, &mut small[..]) {
            Err(Error::Truncated { received, capacity }) => {
                assert_eq!(received, 12);
                assert_eq!(capacity, 8);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
        assert_eq!(small, [0, 0]);
    }

    #[test]
    fn unpack_reports_partial_elements() {
        let mut values = [0i32; 4];
        assert!(matches!(
            unpack_into(&[0u8; 6], &mut values[..]),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn arrays_are_contiguous() {
        let datatype = <[f32; 3]>::equivalent_datatype();
        assert_eq!(datatype.as_raw().size(), 12);
        assert_eq!(datatype.as_raw().extent(), 12);
    }

    #[test]
    fn dyn_buffer_downcasts_to_its_own_type() {
        let values = [1.0f64, 2.0];
        let buffer = DynBuffer::new(&values[..]);
        assert!(buffer.is::<f64>());
        assert!(!buffer.is::<i64>());
        assert_eq!(buffer.downcast::<f64>(), Some(&values[..]));
    }
}
