//! In-process backend that records every call. Storage comes from the heap,
//! page aligned like a real mapping.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

use super::{SegmentBackend, SegmentIndex};
use crate::errors::OsError;

const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Create { name: String, size: usize },
    Attach { index: SegmentIndex },
    // Address is kept as an integer so calls can be compared and sent around.
    Detach { index: SegmentIndex, attached_at: usize },
    Destroy { index: SegmentIndex },
}

#[derive(Debug)]
struct Segment {
    name: String,
    size: usize,
    attached_at: Option<usize>,
}

#[derive(Default, Debug)]
struct State {
    next_index: u32,
    segments: HashMap<u32, Segment>,
    calls: Vec<BackendCall>,
}

#[derive(Default, Debug)]
pub struct RecordingBackend {
    state: Mutex<State>,
    fail_create: Option<OsError>,
    fail_attach: Option<OsError>,
    fail_detach: Option<OsError>,
    fail_destroy: Option<OsError>,
}

impl RecordingBackend {
    pub fn new() -> RecordingBackend {
        Default::default()
    }

    pub fn fail_create(mut self, err: OsError) -> Self {
        self.fail_create = Some(err);
        self
    }

    pub fn fail_attach(mut self, err: OsError) -> Self {
        self.fail_attach = Some(err);
        self
    }

    pub fn fail_detach(mut self, err: OsError) -> Self {
        self.fail_detach = Some(err);
        self
    }

    pub fn fail_destroy(mut self, err: OsError) -> Self {
        self.fail_destroy = Some(err);
        self
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.with_state(|s| s.calls.clone())
    }

    /// Names of segments that were created and not destroyed.
    pub fn live_segments(&self) -> Vec<String> {
        self.with_state(|s| {
            let mut names: Vec<String> = s.segments.values().map(|v| v.name.clone()).collect();
            names.sort();
            names
        })
    }

    pub fn segment_size(&self, index: SegmentIndex) -> Option<usize> {
        self.with_state(|s| s.segments.get(&index.0).map(|v| v.size))
    }

    pub fn segment_name(&self, index: SegmentIndex) -> Option<String> {
        self.with_state(|s| s.segments.get(&index.0).map(|v| v.name.clone()))
    }

    /// Address handed out by the last successful attach of a live segment.
    pub fn attached_at(&self, index: SegmentIndex) -> Option<usize> {
        self.with_state(|s| s.segments.get(&index.0).and_then(|v| v.attached_at))
    }

    fn with_state<R, F>(&self, f: F) -> R
        where F: FnOnce(&mut State) -> R,
    {
        let mut state = match self.state.lock() {
            Ok(v) => v,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    #[inline]
    fn layout(size: usize) -> Result<Layout, OsError> {
        Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| OsError::new(None, e.to_string()))
    }
}

impl SegmentBackend for RecordingBackend {
    fn create(&self, name: &str, size: usize) -> Result<SegmentIndex, OsError> {
        self.with_state(|s| {
            s.calls.push(BackendCall::Create { name: name.to_string(), size });
            if let Some(err) = &self.fail_create {
                return Err(err.clone());
            }
            let index = s.next_index;
            s.next_index += 1;
            s.segments.insert(index, Segment { name: name.to_string(), size, attached_at: None });
            Ok(SegmentIndex(index))
        })
    }

    fn attach(&self, index: SegmentIndex) -> Result<NonNull<u8>, OsError> {
        self.with_state(|s| {
            s.calls.push(BackendCall::Attach { index });
            if let Some(err) = &self.fail_attach {
                return Err(err.clone());
            }
            let segment = s.segments.get_mut(&index.0)
                .ok_or_else(|| OsError::new(Some(libc::EINVAL), "unknown segment"))?;
            if segment.attached_at.is_some() {
                return Err(OsError::new(Some(libc::EBUSY), "segment already attached"));
            }
            let layout = RecordingBackend::layout(segment.size)?;
            let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
                .ok_or_else(|| OsError::new(Some(libc::ENOMEM), "out of memory"))?;
            segment.attached_at = Some(ptr.as_ptr() as usize);
            Ok(ptr)
        })
    }

    unsafe fn detach(&self, index: SegmentIndex, attached_at: NonNull<u8>) -> Result<(), OsError> {
        self.with_state(|s| {
            let address = attached_at.as_ptr() as usize;
            s.calls.push(BackendCall::Detach { index, attached_at: address });
            if let Some(err) = &self.fail_detach {
                return Err(err.clone());
            }
            let segment = s.segments.get_mut(&index.0)
                .ok_or_else(|| OsError::new(Some(libc::EINVAL), "unknown segment"))?;
            if segment.attached_at != Some(address) {
                return Err(OsError::new(Some(libc::EINVAL), "segment not attached at address"));
            }
            let layout = RecordingBackend::layout(segment.size)?;
            unsafe { alloc::dealloc(attached_at.as_ptr(), layout) };
            segment.attached_at = None;
            Ok(())
        })
    }

    fn destroy(&self, index: SegmentIndex) -> Result<(), OsError> {
        self.with_state(|s| {
            s.calls.push(BackendCall::Destroy { index });
            if let Some(err) = &self.fail_destroy {
                return Err(err.clone());
            }
            let segment = s.segments.remove(&index.0)
                .ok_or_else(|| OsError::new(Some(libc::ENOENT), "unknown segment"))?;
            // A failed detach leaves the storage behind; reclaim it here.
            if let Some(address) = segment.attached_at {
                let layout = RecordingBackend::layout(segment.size)?;
                unsafe { alloc::dealloc(address as *mut u8, layout) };
            }
            Ok(())
        })
    }
}

impl Drop for RecordingBackend {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(v) => v,
            Err(poisoned) => poisoned.into_inner(),
        };
        for segment in state.segments.values() {
            if let (Some(address), Ok(layout)) = (segment.attached_at, RecordingBackend::layout(segment.size)) {
                unsafe { alloc::dealloc(address as *mut u8, layout) };
            }
        }
    }
}
