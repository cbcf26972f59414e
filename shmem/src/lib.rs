//! Objects placed in their own POSIX shared memory segments, plus page
//! locking for the memory behind them.

pub mod allocator;
pub mod backend;
mod errors;
pub mod pinning;
pub mod shm_box;
pub mod sink;

#[cfg(test)]
mod tests;

pub use allocator::{
    construct_in_place, global, segment_name, AllocatorConfig, SegmentAllocator, SegmentIdentity,
    SegmentInfo,
};
pub use backend::{SegmentBackend, SegmentIndex};
pub use backend::shared::ShmemBackend;
pub use errors::{AllocationError, OsError, PinError, TeardownError, TeardownFailure, TeardownStep};
pub use shm_box::SharedMemoryBox;
pub use sink::{ErrorSink, LogSink};
#[cfg(any(test, feature = "testing"))]
pub use sink::RecordingSink;
