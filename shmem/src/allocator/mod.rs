use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::shared::ShmemBackend;
use crate::backend::{SegmentBackend, SegmentIndex};
use crate::errors::{AllocationError, OsError, TeardownError, TeardownFailure, TeardownStep};
use crate::pinning::MemoryPinner;
use crate::shm_box::SharedMemoryBox;
use crate::sink::{ErrorSink, LogSink};

pub static DEFAULT_NAME_PREFIX: &'static str = "/shmbox_shared";

// Room for the terminating NUL of a 64 byte C name buffer.
pub const MAX_SEGMENT_NAME_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub name_prefix: String,
    // Pin every new segment into RAM right after it is attached.
    pub lock_segments: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            lock_segments: false,
        }
    }
}

/// Ownership of one live segment, handed out by [`SegmentAllocator::allocate`].
///
/// The token can only be moved, never copied, so a segment has exactly one
/// owner and is released exactly once. It is tagged with the allocator that
/// created it.
///
/// ```compile_fail
/// use shmem::{global, SharedMemoryBox};
///
/// let identity = global().allocate(8).unwrap();
/// let first = SharedMemoryBox::construct(global(), identity, 1u64).unwrap();
/// // `identity` was moved into the first box.
/// let second = SharedMemoryBox::construct(global(), identity, 2u64).unwrap();
/// ```
///
/// A box only hands out a read-only [`SegmentInfo`], which cannot release
/// the segment under it:
///
/// ```compile_fail
/// use shmem::global;
///
/// let boxed = global().new_box(5u64).unwrap();
/// global().release(boxed.identity()).unwrap();
/// ```
///
/// Unmapping a segment behind the allocator's back needs `unsafe`:
///
/// ```compile_fail
/// use shmem::{global, SegmentBackend};
///
/// let boxed = global().new_box(5u64).unwrap();
/// let info = boxed.identity();
/// global().backend().detach(info.index, info.attached_at).unwrap();
/// ```
#[derive(Debug, PartialEq, Eq)]
pub struct SegmentIdentity {
    allocator_id: u64,
    index: SegmentIndex,
    attached_at: NonNull<u8>,
    size: usize,
}

// The token owns its segment; access to the memory behind it is mediated by
// SharedMemoryBox.
unsafe impl Send for SegmentIdentity {}
unsafe impl Sync for SegmentIdentity {}

impl SegmentIdentity {
    pub fn index(&self) -> SegmentIndex {
        self.index
    }

    pub fn attached_at(&self) -> NonNull<u8> {
        self.attached_at
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn info(&self) -> SegmentInfo {
        SegmentInfo { index: self.index, attached_at: self.attached_at, size: self.size }
    }
}

impl fmt::Display for SegmentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.info())
    }
}

/// Read-only description of a segment. Holding one grants nothing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SegmentInfo {
    pub index: SegmentIndex,
    pub attached_at: NonNull<u8>,
    pub size: usize,
}

unsafe impl Send for SegmentInfo {}
unsafe impl Sync for SegmentInfo {}

impl fmt::Display for SegmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "index = {} attached = {:p} size = {}", self.index, self.attached_at, self.size)
    }
}

/// Name of the `counter`th segment for `prefix`. Processes that want to open
/// a segment by name must derive it the same way.
///
/// Names are bounded to [`MAX_SEGMENT_NAME_LEN`] bytes. A long prefix is cut
/// so the counter always survives and names stay unique.
pub fn segment_name(prefix: &str, counter: u32) -> String {
    let counter = counter.to_string();
    let mut end = prefix.len().min(MAX_SEGMENT_NAME_LEN - counter.len());
    while !prefix.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &prefix[..end], counter)
}

/// Writes `value` into caller supplied storage and hands the storage back
/// typed. No segment is created and no allocator state is touched.
///
/// # Safety
///
/// `storage` must be valid for writes of `size` bytes and must not hold a
/// live value that still needs dropping.
pub unsafe fn construct_in_place<T>(
    storage: NonNull<u8>,
    size: usize,
    value: T,
) -> Result<NonNull<T>, AllocationError> {
    debug!("placement new size = {}", size);
    check_fits::<T>(storage, size)?;
    let typed = storage.cast::<T>();
    ptr::write(typed.as_ptr(), value);
    Ok(typed)
}

#[inline]
pub(crate) fn check_fits<T>(storage: NonNull<u8>, size: usize) -> Result<(), AllocationError> {
    let required = mem::size_of::<T>();
    let align = mem::align_of::<T>();
    if required > size || (storage.as_ptr() as usize) % align != 0 {
        return Err(AllocationError::TooSmall { required, available: size, align });
    }
    Ok(())
}

/// Creates one named shared memory segment per allocation and tears it down
/// again on release.
pub struct SegmentAllocator<B: SegmentBackend, S: ErrorSink = LogSink> {
    backend: B,
    sink: S,
    config: AllocatorConfig,
    segment_num: AtomicU32,
    id: u64,
}

// Tags identities so one allocator never tears down another's segments.
static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

impl<B: SegmentBackend> SegmentAllocator<B, LogSink> {
    pub fn new(backend: B, config: AllocatorConfig) -> SegmentAllocator<B, LogSink> {
        SegmentAllocator::with_sink(backend, config, LogSink)
    }
}

impl<B: SegmentBackend, S: ErrorSink> SegmentAllocator<B, S> {
    pub fn with_sink(backend: B, config: AllocatorConfig, sink: S) -> SegmentAllocator<B, S> {
        SegmentAllocator {
            backend,
            sink,
            config,
            segment_num: AtomicU32::new(0),
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub(crate) fn sink(&self) -> &S {
        &self.sink
    }

    /// Whether `identity` was handed out by this allocator.
    pub fn owns(&self, identity: &SegmentIdentity) -> bool {
        identity.allocator_id == self.id
    }

    /// Value the naming counter will use for the next allocation.
    pub fn next_segment_num(&self) -> u32 {
        self.segment_num.load(Ordering::SeqCst)
    }

    /// Creates and attaches a segment of exactly `size` bytes.
    ///
    /// The returned token is the only record of the segment. Hand it to
    /// [`SharedMemoryBox::construct`] or back to [`SegmentAllocator::release`];
    /// dropping it leaks the segment.
    pub fn allocate(&self, size: usize) -> Result<SegmentIdentity, AllocationError> {
        if size == 0 {
            self.sink.report("cannot create shared memory segment of size = 0", None);
            return Err(AllocationError::InvalidSize);
        }
        let num = self.segment_num.fetch_add(1, Ordering::SeqCst);
        let name = segment_name(&self.config.name_prefix, num);

        let index = match self.backend.create(&name, size) {
            Ok(v) => v,
            Err(e) => {
                self.sink.report(
                    &format!("cannot create shared memory segment name = {} size = {} err = {}", name, size, e),
                    e.code,
                );
                return Err(AllocationError::CreateFailed { name, size, source: e });
            }
        };

        let attached_at = match self.backend.attach(index) {
            Ok(v) => v,
            Err(e) => {
                self.sink.report(
                    &format!("cannot attach shared memory segment name = {} err = {}", name, e),
                    e.code,
                );
                if let Err(rollback) = self.backend.destroy(index) {
                    self.sink.report(
                        &format!("cannot destroy unattached segment name = {} err = {}", name, rollback),
                        rollback.code,
                    );
                }
                return Err(AllocationError::AttachFailed { name, size, source: e });
            }
        };

        let identity = SegmentIdentity { allocator_id: self.id, index, attached_at, size };
        debug!("shm new name = {} {}", name, identity);
        if self.config.lock_segments {
            // Failure is already reported by the pinner.
            let _ = MemoryPinner::with_sink(&self.sink).pin(attached_at, size);
        }
        Ok(identity)
    }

    /// Detaches and destroys the segment. Both steps always run; failures are
    /// reported and returned together.
    ///
    /// A token from another allocator is refused and its segment is left
    /// alone.
    pub fn release(&self, identity: SegmentIdentity) -> Result<(), TeardownError> {
        debug!("shm delete {}", identity);
        if !self.owns(&identity) {
            let error = OsError::new(None, "segment belongs to another allocator");
            self.sink.report(&format!("cannot release segment {}: {}", identity, error), None);
            return Err(TeardownError {
                failures: vec![TeardownFailure { step: TeardownStep::Ownership, index: identity.index, error }],
            });
        }
        let mut failures = Vec::new();
        // The token is consumed here, so no box can still live in the mapping.
        if let Err(e) = unsafe { self.backend.detach(identity.index, identity.attached_at) } {
            self.sink.report(
                &format!("cannot detach shared memory segment index = {} err = {}", identity.index, e),
                e.code,
            );
            failures.push(TeardownFailure { step: TeardownStep::Detach, index: identity.index, error: e });
        }
        if let Err(e) = self.backend.destroy(identity.index) {
            self.sink.report(
                &format!("cannot destroy shared memory segment index = {} err = {}", identity.index, e),
                e.code,
            );
            failures.push(TeardownFailure { step: TeardownStep::Destroy, index: identity.index, error: e });
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }

    /// Places `value` in a fresh segment sized for `T`.
    pub fn new_box<T>(&self, value: T) -> Result<SharedMemoryBox<'_, T, B, S>, AllocationError> {
        let identity = self.allocate(mem::size_of::<T>())?;
        SharedMemoryBox::construct(self, identity, value)
    }

    /// A zero filled byte array of `N` bytes in a fresh segment.
    pub fn new_zeroed_bytes<const N: usize>(
        &self,
    ) -> Result<SharedMemoryBox<'_, [u8; N], B, S>, AllocationError> {
        self.new_box([0u8; N])
    }
}

static GLOBAL: Lazy<SegmentAllocator<ShmemBackend>> =
    Lazy::new(|| SegmentAllocator::new(ShmemBackend::new(), AllocatorConfig::default()));

/// Process wide allocator over POSIX shared memory with the default config.
/// Its naming counter is shared by everything in the process that uses it.
pub fn global() -> &'static SegmentAllocator<ShmemBackend> {
    &GLOBAL
}
