use std::fmt;
use std::mem::{self, ManuallyDrop};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use tracing::debug;

use crate::allocator::{check_fits, SegmentAllocator, SegmentIdentity, SegmentInfo};
use crate::backend::{SegmentBackend, SegmentIndex};
use crate::errors::{AllocationError, PinError, TeardownError};
use crate::pinning::MemoryPinner;
use crate::sink::{ErrorSink, LogSink};

/// A `T` living at the start of its own shared memory segment.
///
/// The box owns the token of that segment. Dropping it drops the value and
/// then detaches and destroys the segment; [`SharedMemoryBox::close`] does
/// the same and returns the teardown status.
pub struct SharedMemoryBox<'a, T, B: SegmentBackend, S: ErrorSink = LogSink> {
    allocator: &'a SegmentAllocator<B, S>,
    identity: ManuallyDrop<SegmentIdentity>,
    value: NonNull<T>,
}

// Releases the segment even when dropping the value unwinds.
struct ReleaseGuard<'g, B: SegmentBackend, S: ErrorSink> {
    allocator: &'g SegmentAllocator<B, S>,
    identity: Option<SegmentIdentity>,
}

impl<'g, B: SegmentBackend, S: ErrorSink> ReleaseGuard<'g, B, S> {
    fn release(mut self) -> Result<(), TeardownError> {
        match self.identity.take() {
            Some(identity) => self.allocator.release(identity),
            None => Ok(()),
        }
    }
}

impl<'g, B: SegmentBackend, S: ErrorSink> Drop for ReleaseGuard<'g, B, S> {
    fn drop(&mut self) {
        if let Some(identity) = self.identity.take() {
            // Already reported by the allocator.
            let _ = self.allocator.release(identity);
        }
    }
}

impl<'a, T, B: SegmentBackend, S: ErrorSink> SharedMemoryBox<'a, T, B, S> {
    /// Moves `value` into the segment owned by `identity`.
    ///
    /// A token from another allocator is handed back in
    /// [`AllocationError::ForeignSegment`] without touching its memory. If
    /// the segment cannot hold a `T` it is released here and the error is
    /// returned.
    pub fn construct(
        allocator: &'a SegmentAllocator<B, S>,
        identity: SegmentIdentity,
        value: T,
    ) -> Result<SharedMemoryBox<'a, T, B, S>, AllocationError> {
        if !allocator.owns(&identity) {
            allocator.sink().report(&format!("cannot construct in foreign segment {}", identity), None);
            return Err(AllocationError::ForeignSegment(identity));
        }
        if let Err(e) = check_fits::<T>(identity.attached_at(), identity.size()) {
            allocator.sink().report(&format!("cannot construct in segment {}: {}", identity, e), None);
            // Already reported by the allocator.
            let _ = allocator.release(identity);
            return Err(e);
        }
        let typed = identity.attached_at().cast::<T>();
        unsafe { ptr::write(typed.as_ptr(), value) };
        debug!("shm object constructed {}", identity);
        Ok(SharedMemoryBox { allocator, identity: ManuallyDrop::new(identity), value: typed })
    }

    /// Read-only description of the segment. It cannot be used to release it.
    pub fn identity(&self) -> SegmentInfo {
        self.identity.info()
    }

    pub fn index(&self) -> SegmentIndex {
        self.identity.index()
    }

    pub fn size(&self) -> usize {
        self.identity.size()
    }

    pub fn as_ptr(&self) -> *const T {
        self.value.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.value.as_ptr()
    }

    /// Keeps the whole segment resident in RAM.
    pub fn lock_memory(&self) -> Result<(), PinError> {
        MemoryPinner::with_sink(self.allocator.sink()).pin(self.identity.attached_at(), self.identity.size())
    }

    pub fn unlock_memory(&self) -> Result<(), PinError> {
        MemoryPinner::with_sink(self.allocator.sink()).unpin(self.identity.attached_at(), self.identity.size())
    }

    /// Drops the value and releases the segment, returning every teardown
    /// failure instead of only logging it.
    pub fn close(self) -> Result<(), TeardownError> {
        let mut this = ManuallyDrop::new(self);
        unsafe { this.teardown() }
    }

    // Must run once per box; the token is moved out of `self.identity`.
    unsafe fn teardown(&mut self) -> Result<(), TeardownError> {
        let guard = ReleaseGuard {
            allocator: self.allocator,
            identity: Some(ManuallyDrop::take(&mut self.identity)),
        };
        if mem::needs_drop::<T>() {
            ptr::drop_in_place(self.value.as_ptr());
        }
        guard.release()
    }
}

impl<'a, T, B: SegmentBackend, S: ErrorSink> Drop for SharedMemoryBox<'a, T, B, S> {
    fn drop(&mut self) {
        // Failures were reported to the allocator's sink.
        let _ = unsafe { self.teardown() };
    }
}

impl<'a, T, B: SegmentBackend, S: ErrorSink> Deref for SharedMemoryBox<'a, T, B, S> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.value.as_ref() }
    }
}

impl<'a, T, B: SegmentBackend, S: ErrorSink> DerefMut for SharedMemoryBox<'a, T, B, S> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.value.as_mut() }
    }
}

impl<'a, T: fmt::Debug, B: SegmentBackend, S: ErrorSink> fmt::Debug for SharedMemoryBox<'a, T, B, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryBox")
            .field("identity", &self.identity())
            .field("value", &**self)
            .finish()
    }
}
