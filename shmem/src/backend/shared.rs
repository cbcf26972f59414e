use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

use ::shared_memory::{Shmem, ShmemConf};
use tracing::debug;

use super::{SegmentBackend, SegmentIndex};
use crate::errors::OsError;

// Shmem keeps its base address as a raw pointer and is therefore !Send. The
// registry is the only owner of each mapping and never dereferences it.
struct Mapping(Shmem);

unsafe impl Send for Mapping {}

impl Mapping {
    #[inline]
    fn base(&self) -> *mut u8 {
        self.0.as_ptr()
    }
}

struct Segment {
    os_id: String,
    size: usize,
    // Dropping the owner mapping unlinks the OS object.
    owner: Option<Mapping>,
    attached: Vec<Mapping>,
}

#[derive(Default)]
struct Registry {
    next_index: u32,
    segments: HashMap<u32, Segment>,
}

/// POSIX shared memory (`shm_open` + `mmap`) through the `shared_memory`
/// crate.
///
/// `create` makes the OS object and keeps the creating mapping as its owner.
/// `attach` opens the object again by its OS id, so the returned address is
/// the same kind of mapping another process would get.
#[derive(Default)]
pub struct ShmemBackend {
    registry: Mutex<Registry>,
}

impl ShmemBackend {
    pub fn new() -> ShmemBackend {
        Default::default()
    }

    /// OS id a cooperating process can open, if the segment is still alive.
    pub fn os_id(&self, index: SegmentIndex) -> Option<String> {
        let registry = self.registry.lock().ok()?;
        registry.segments.get(&index.0)
            .filter(|s| s.owner.is_some())
            .map(|s| s.os_id.clone())
    }

    /// Number of segments created and not yet fully torn down.
    pub fn segment_count(&self) -> usize {
        match self.registry.lock() {
            Ok(v) => v.segments.len(),
            Err(poisoned) => poisoned.into_inner().segments.len(),
        }
    }
}

impl SegmentBackend for ShmemBackend {
    fn create(&self, name: &str, size: usize) -> Result<SegmentIndex, OsError> {
        let shmem = ShmemConf::new().size(size).os_id(name).create()?;
        let mut registry = self.registry.lock()?;
        let index = registry.next_index;
        registry.next_index = registry.next_index.wrapping_add(1);
        registry.segments.insert(index, Segment {
            os_id: name.to_string(),
            size,
            owner: Some(Mapping(shmem)),
            attached: Vec::with_capacity(1),
        });
        debug!("shm create name = {} index = {} size = {}", name, index, size);
        Ok(SegmentIndex(index))
    }

    fn attach(&self, index: SegmentIndex) -> Result<NonNull<u8>, OsError> {
        let mut registry = self.registry.lock()?;
        let segment = match registry.segments.get_mut(&index.0) {
            Some(s) if s.owner.is_some() => s,
            _ => return Err(OsError::new(None, format!("no live segment with index = {}", index))),
        };
        let shmem = ShmemConf::new().os_id(&segment.os_id).open()?;
        if shmem.len() < segment.size {
            return Err(OsError::new(None, format!(
                "segment {} mapped {} bytes, expected {}", segment.os_id, shmem.len(), segment.size
            )));
        }
        let mapping = Mapping(shmem);
        let base = NonNull::new(mapping.base())
            .ok_or_else(|| OsError::new(None, "mapping returned a null address"))?;
        segment.attached.push(mapping);
        Ok(base)
    }

    unsafe fn detach(&self, index: SegmentIndex, attached_at: NonNull<u8>) -> Result<(), OsError> {
        let mut registry = self.registry.lock()?;
        let segment = registry.segments.get_mut(&index.0)
            .ok_or_else(|| OsError::new(None, format!("unknown segment index = {}", index)))?;
        let position = segment.attached.iter()
            .position(|m| m.base() == attached_at.as_ptr())
            .ok_or_else(|| OsError::new(None, format!(
                "segment index = {} is not attached at {:p}", index, attached_at
            )))?;
        // Unmaps on drop.
        segment.attached.swap_remove(position);
        if segment.owner.is_none() && segment.attached.is_empty() {
            registry.segments.remove(&index.0);
        }
        Ok(())
    }

    fn destroy(&self, index: SegmentIndex) -> Result<(), OsError> {
        let mut registry = self.registry.lock()?;
        let segment = match registry.segments.get_mut(&index.0) {
            Some(s) if s.owner.is_some() => s,
            _ => return Err(OsError::new(None, format!("no live segment with index = {}", index))),
        };
        segment.owner = None;
        // Mappings still attached stay valid until they are detached.
        if segment.attached.is_empty() {
            registry.segments.remove(&index.0);
        }
        debug!("shm destroy index = {}", index);
        Ok(())
    }
}
