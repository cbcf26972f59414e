//! Segment backends: the four primitives the allocator builds on.

use std::fmt;
use std::ptr::NonNull;

use crate::errors::OsError;

#[cfg(any(test, feature = "testing"))]
pub mod recording;
pub mod shared;

/// Opaque handle a backend hands out from `create`.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentIndex(pub u32);

impl fmt::Display for SegmentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named shared memory segments that can be created, mapped into this
/// process, unmapped and destroyed.
///
/// `destroy` is called at most once per index by the allocator. Backends are
/// not required to accept a second call.
pub trait SegmentBackend {
    fn create(&self, name: &str, size: usize) -> Result<SegmentIndex, OsError>;

    fn attach(&self, index: SegmentIndex) -> Result<NonNull<u8>, OsError>;

    /// Unmaps `attached_at`.
    ///
    /// # Safety
    ///
    /// Nothing may read or write the mapping afterwards. In particular no
    /// [`SharedMemoryBox`](crate::SharedMemoryBox) may still live in it.
    unsafe fn detach(&self, index: SegmentIndex, attached_at: NonNull<u8>) -> Result<(), OsError>;

    fn destroy(&self, index: SegmentIndex) -> Result<(), OsError>;
}

impl<B: SegmentBackend + ?Sized> SegmentBackend for &B {
    fn create(&self, name: &str, size: usize) -> Result<SegmentIndex, OsError> {
        (**self).create(name, size)
    }

    fn attach(&self, index: SegmentIndex) -> Result<NonNull<u8>, OsError> {
        (**self).attach(index)
    }

    unsafe fn detach(&self, index: SegmentIndex, attached_at: NonNull<u8>) -> Result<(), OsError> {
        (**self).detach(index, attached_at)
    }

    fn destroy(&self, index: SegmentIndex) -> Result<(), OsError> {
        (**self).destroy(index)
    }
}
