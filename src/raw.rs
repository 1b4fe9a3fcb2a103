//! Bridge between public handles and their engine-side representation

/// Engine bridge traits
pub mod traits {
    pub use super::AsRaw;
}

/// A rust type that can identify as a value understood by the messaging engine.
///
/// # Safety
///
/// The returned value must describe `self` faithfully: a communicator must hand out the context
/// and membership it communicates on, a datatype the layout of the buffers it is paired with.
pub unsafe trait AsRaw {
    /// The engine-side type
    type Raw: ?Sized;
    /// The engine-side value
    fn as_raw(&self) -> &Self::Raw;
}

unsafe impl<'a, T> AsRaw for &'a T
where
    T: 'a + AsRaw + ?Sized,
{
    type Raw = <T as AsRaw>::Raw;
    fn as_raw(&self) -> &Self::Raw {
        (*self).as_raw()
    }
}
