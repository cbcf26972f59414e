use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use shared_memory::ShmemConf;

use crate::{AllocatorConfig, SegmentAllocator, SegmentBackend, ShmemBackend, RecordingSink};

// Unique per test so parallel tests and concurrent test binaries never collide.
fn unique_prefix() -> String {
    static SHMEM_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "/shmbox_test_{}_{}_",
        std::process::id(),
        SHMEM_ID_COUNTER.fetch_add(1, AtomicOrdering::SeqCst)
    )
}

fn shmem_allocator() -> SegmentAllocator<ShmemBackend, RecordingSink> {
    let config = AllocatorConfig { name_prefix: unique_prefix(), lock_segments: false };
    SegmentAllocator::with_sink(ShmemBackend::new(), config, RecordingSink::new())
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct Transport {
    frame: u64,
    sample_rate: u32,
    rolling: u32,
}

#[test]
fn second_mapping_observes_object() -> Result<(), Box<dyn Error>> {
    let allocator = shmem_allocator();
    let mut transport = allocator.new_box(Transport { frame: 0, sample_rate: 48_000, rolling: 0 })?;
    let os_id = allocator.backend().os_id(transport.index()).ok_or("segment has no os id")?;

    // Stands in for a cooperating process mapping the segment by name.
    let observer = ShmemConf::new().os_id(&os_id).open()?;
    assert_eq!(observer.len(), std::mem::size_of::<Transport>());

    transport.frame = 1024;
    transport.rolling = 1;
    let seen = unsafe { *(observer.as_ptr() as *const Transport) };
    assert_eq!(seen, *transport);

    drop(observer);
    transport.close()?;
    assert!(ShmemConf::new().os_id(&os_id).open().is_err());
    assert_eq!(allocator.backend().segment_count(), 0);
    assert!(allocator.sink().is_empty());
    Ok(())
}

#[test]
fn segment_names_follow_counter() -> Result<(), Box<dyn Error>> {
    let allocator = shmem_allocator();
    let prefix = allocator.config().name_prefix.clone();

    let first = allocator.allocate(100)?;
    let second = allocator.allocate(200)?;
    assert_eq!(allocator.backend().os_id(first.index()), Some(format!("{}0", prefix)));
    assert_eq!(allocator.backend().os_id(second.index()), Some(format!("{}1", prefix)));
    assert_eq!(first.size(), 100);
    assert_eq!(second.size(), 200);

    allocator.release(first)?;
    allocator.release(second)?;
    assert_eq!(allocator.backend().segment_count(), 0);
    Ok(())
}

#[test]
fn name_collision_fails_create() -> Result<(), Box<dyn Error>> {
    let allocator = shmem_allocator();
    let taken = format!("{}0", allocator.config().name_prefix);
    let _squatter = ShmemConf::new().size(64).os_id(&taken).create()?;

    assert!(matches!(allocator.allocate(64), Err(crate::AllocationError::CreateFailed { .. })));
    assert_eq!(allocator.backend().segment_count(), 0);
    assert_eq!(allocator.sink().len(), 1);

    // The counter moved on, so the next name is free.
    let identity = allocator.allocate(64)?;
    allocator.release(identity)?;
    Ok(())
}

#[test]
fn destroy_twice_is_an_error_not_a_crash() -> Result<(), Box<dyn Error>> {
    let backend = ShmemBackend::new();
    let name = format!("{}x", unique_prefix());
    let index = backend.create(&name, 128)?;
    let attached_at = backend.attach(index)?;
    unsafe { backend.detach(index, attached_at)? };
    backend.destroy(index)?;
    assert!(backend.destroy(index).is_err());
    assert!(backend.os_id(index).is_none());
    Ok(())
}

#[test]
fn destroy_before_detach_keeps_mapping_valid() -> Result<(), Box<dyn Error>> {
    let backend = ShmemBackend::new();
    let name = format!("{}y", unique_prefix());
    let index = backend.create(&name, 16)?;
    let attached_at = backend.attach(index)?;
    backend.destroy(index)?;
    assert!(ShmemConf::new().os_id(&name).open().is_err());

    unsafe { attached_at.as_ptr().write(0xAB) };
    assert_eq!(unsafe { attached_at.as_ptr().read() }, 0xAB);
    unsafe { backend.detach(index, attached_at)? };
    assert_eq!(backend.segment_count(), 0);
    Ok(())
}
