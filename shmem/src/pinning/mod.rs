//! Page locking for latency sensitive memory.
//!
//! Pinning is an optimization: every failure is reported to the sink and
//! returned, and callers are free to carry on without it.

use std::ptr::NonNull;

use tracing::debug;

use crate::errors::{OsError, PinError};
use crate::sink::{ErrorSink, LogSink};

#[derive(Default, Debug, Clone, Copy)]
pub struct MemoryPinner<S: ErrorSink = LogSink> {
    sink: S,
}

impl MemoryPinner<LogSink> {
    pub fn new() -> MemoryPinner<LogSink> {
        MemoryPinner { sink: LogSink }
    }
}

impl<S: ErrorSink> MemoryPinner<S> {
    pub fn with_sink(sink: S) -> MemoryPinner<S> {
        MemoryPinner { sink }
    }

    /// Locks `len` bytes starting at `addr` into RAM.
    #[must_use]
    pub fn pin(&self, addr: NonNull<u8>, len: usize) -> Result<(), PinError> {
        if len == 0 {
            return Ok(());
        }
        if unsafe { libc::mlock(addr.as_ptr() as *const libc::c_void, len) } == 0 {
            debug!("Succeeded in locking {} byte memory area", len);
            Ok(())
        } else {
            let err = OsError::last_os_error();
            self.sink.report(&format!("Cannot lock down memory area ({})", err.message), err.code);
            Err(PinError::PinFailed(err))
        }
    }

    #[must_use]
    pub fn unpin(&self, addr: NonNull<u8>, len: usize) -> Result<(), PinError> {
        if len == 0 {
            return Ok(());
        }
        if unsafe { libc::munlock(addr.as_ptr() as *const libc::c_void, len) } == 0 {
            debug!("Succeeded in unlocking {} byte memory area", len);
            Ok(())
        } else {
            let err = OsError::last_os_error();
            self.sink.report(&format!("Cannot unlock down memory area ({})", err.message), err.code);
            Err(PinError::UnpinFailed(err))
        }
    }

    /// Locks every current and future page of the process.
    #[must_use]
    pub fn pin_all(&self) -> Result<(), PinError> {
        if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } == 0 {
            debug!("Succeeded in locking all memory");
            Ok(())
        } else {
            let err = OsError::last_os_error();
            self.sink.report(&format!("Cannot lock all memory ({})", err.message), err.code);
            Err(PinError::PinFailed(err))
        }
    }

    #[must_use]
    pub fn unpin_all(&self) -> Result<(), PinError> {
        if unsafe { libc::munlockall() } == 0 {
            debug!("Succeeded in unlocking all memory");
            Ok(())
        } else {
            let err = OsError::last_os_error();
            self.sink.report(&format!("Cannot unlock all memory ({})", err.message), err.code);
            Err(PinError::UnpinFailed(err))
        }
    }
}

#[inline]
pub fn pin(addr: NonNull<u8>, len: usize) -> Result<(), PinError> {
    MemoryPinner::new().pin(addr, len)
}

#[inline]
pub fn unpin(addr: NonNull<u8>, len: usize) -> Result<(), PinError> {
    MemoryPinner::new().unpin(addr, len)
}

#[inline]
pub fn pin_all() -> Result<(), PinError> {
    MemoryPinner::new().pin_all()
}

#[inline]
pub fn unpin_all() -> Result<(), PinError> {
    MemoryPinner::new().unpin_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;

    fn buffer_ptr(buff: &mut [u8]) -> NonNull<u8> {
        NonNull::new(buff.as_mut_ptr()).expect("non-null buffer")
    }

    #[test]
    fn unpin_never_pinned_range() {
        let sink = RecordingSink::new();
        let pinner = MemoryPinner::with_sink(&sink);
        let mut buff = vec![1u8; 8192];
        assert_eq!(pinner.unpin(buffer_ptr(&mut buff), buff.len()), Ok(()));
        assert!(sink.is_empty());
    }

    #[test]
    fn pin_twice_is_consistent() {
        let sink = RecordingSink::new();
        let pinner = MemoryPinner::with_sink(&sink);
        let mut buff = vec![0u8; 4096];
        let addr = buffer_ptr(&mut buff);
        let first = pinner.pin(addr, buff.len());
        let second = pinner.pin(addr, buff.len());
        // Without CAP_IPC_LOCK or a memlock rlimit both calls fail the same way.
        assert_eq!(first.is_ok(), second.is_ok());
        match first {
            Ok(()) => {
                assert!(sink.is_empty());
                assert_eq!(pinner.unpin(addr, buff.len()), Ok(()));
            }
            Err(PinError::PinFailed(e)) => {
                assert!(e.code.is_some());
                assert_eq!(sink.len(), 2);
            }
            Err(e) => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn zero_length_is_a_no_op() {
        let sink = RecordingSink::new();
        let pinner = MemoryPinner::with_sink(&sink);
        let addr = NonNull::<u8>::dangling();
        assert_eq!(pinner.pin(addr, 0), Ok(()));
        assert_eq!(pinner.unpin(addr, 0), Ok(()));
        assert!(sink.is_empty());
    }

    #[test]
    fn unpin_all_without_pin_all() {
        assert_eq!(unpin_all(), Ok(()));
    }
}
