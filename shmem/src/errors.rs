use std::{fmt, io};
use shared_memory::ShmemError;

use crate::allocator::SegmentIdentity;
use crate::backend::SegmentIndex;

/// Failure reported by a segment backend or by the OS memory-locking calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsError {
    pub code: Option<i32>,
    pub message: String,
}

impl OsError {
    pub fn new<M: Into<String>>(code: Option<i32>, message: M) -> OsError {
        OsError { code, message: message.into() }
    }

    pub fn last_os_error() -> OsError {
        OsError::from(io::Error::last_os_error())
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (os error {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for OsError {}

impl From<io::Error> for OsError {
    fn from(err: io::Error) -> Self {
        OsError::new(err.raw_os_error(), err.to_string())
    }
}

impl From<ShmemError> for OsError {
    fn from(err: ShmemError) -> Self {
        OsError::new(None, err.to_string())
    }
}

// The registry mutex only guards bookkeeping, so a poisoned lock is surfaced
// as a backend failure instead of a panic.
impl<T> From<std::sync::PoisonError<T>> for OsError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        OsError::new(None, "segment registry mutex was poisoned")
    }
}

#[derive(Debug)]
pub enum AllocationError {
    InvalidSize,
    CreateFailed { name: String, size: usize, source: OsError },
    AttachFailed { name: String, size: usize, source: OsError },
    // The segment was mapped but cannot hold the value being constructed.
    TooSmall { required: usize, available: usize, align: usize },
    // The token came from another allocator. It is handed back untouched so
    // the caller can release it where it belongs.
    ForeignSegment(SegmentIdentity),
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::InvalidSize => write!(f, "Segment size must be positive"),
            AllocationError::CreateFailed { name, size, source } => write!(
                f, "Cannot create shared memory segment {} of size = {}: {}", name, size, source
            ),
            AllocationError::AttachFailed { name, size, source } => write!(
                f, "Cannot attach shared memory segment {} of size = {}: {}", name, size, source
            ),
            AllocationError::TooSmall { required, available, align } => write!(
                f,
                "Storage of {} bytes cannot hold {} bytes aligned to {}",
                available, required, align
            ),
            AllocationError::ForeignSegment(identity) => write!(
                f, "Segment {} belongs to another allocator", identity
            ),
        }
    }
}

impl std::error::Error for AllocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocationError::CreateFailed { source, .. } => Some(source),
            AllocationError::AttachFailed { source, .. } => Some(source),
            AllocationError::InvalidSize => None,
            AllocationError::TooSmall { .. } => None,
            AllocationError::ForeignSegment(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    // The token was handed out by a different allocator.
    Ownership,
    Detach,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub step: TeardownStep,
    pub index: SegmentIndex,
    pub error: OsError,
}

/// Every step that failed while releasing a segment. Release always runs all
/// of its steps, so more than one failure can be collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownError {
    pub failures: Vec<TeardownFailure>,
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment teardown failed:")?;
        for failure in self.failures.iter() {
            let step = match failure.step {
                TeardownStep::Ownership => "ownership",
                TeardownStep::Detach => "detach",
                TeardownStep::Destroy => "destroy",
            };
            write!(f, " [{} index = {}: {}]", step, failure.index, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinError {
    PinFailed(OsError),
    UnpinFailed(OsError),
}

impl fmt::Display for PinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinError::PinFailed(e) => write!(f, "Cannot lock down memory: {}", e),
            PinError::UnpinFailed(e) => write!(f, "Cannot unlock memory: {}", e),
        }
    }
}

impl std::error::Error for PinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PinError::PinFailed(e) => Some(e),
            PinError::UnpinFailed(e) => Some(e),
        }
    }
}
