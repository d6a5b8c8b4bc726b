use std::sync::Arc;

use cmdgraph::memory::{MemoryError, Placement, UsmAllocator};
use cmdgraph::DeviceBackend;
use cmdgraph_backend_ref_cpu::CpuDevice;

fn allocator() -> (Arc<CpuDevice>, UsmAllocator) {
    let device = Arc::new(CpuDevice::new());
    let backend: Arc<dyn DeviceBackend> = device.clone();
    (device, UsmAllocator::new(backend))
}

#[test]
fn zero_sized_allocations_are_rejected() {
    let (_, usm) = allocator();
    assert!(matches!(
        usm.allocate(0, Placement::Device),
        Err(MemoryError::ZeroSized)
    ));
}

#[test]
fn allocation_ids_are_unique_and_tracked() {
    let (device, usm) = allocator();
    let a = usm.malloc_device::<f32>(4).unwrap();
    let b = usm.malloc_shared::<f32>(4).unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(a.byte_len(), 16);
    assert_eq!(device.allocation_count(), 2);

    let live = usm.live_allocations();
    assert_eq!(live.len(), 2);
    assert_eq!(live[1].1.placement, Placement::Shared);

    usm.free(a).unwrap();
    assert!(matches!(usm.free(a), Err(MemoryError::UnknownAllocation(_))));
    assert_eq!(usm.live_allocations().len(), 1);
    assert_eq!(device.placement_of(b.id()), Some(Placement::Shared));
}

#[test]
fn device_memory_is_not_host_accessible() {
    let (_, usm) = allocator();
    let device_ptr = usm.malloc_device::<u32>(2).unwrap();
    assert!(matches!(
        usm.read_host::<u32>(&device_ptr),
        Err(MemoryError::NotHostAccessible { .. })
    ));

    let shared = usm.malloc_shared::<u32>(2).unwrap();
    usm.write_host(&shared, &[7u32, 9]).unwrap();
    assert_eq!(usm.read_host::<u32>(&shared).unwrap(), vec![7, 9]);

    let host = usm.malloc_host::<u32>(1).unwrap();
    usm.write_host(&host, &[11u32]).unwrap();
    assert_eq!(usm.read_host::<u32>(&host).unwrap(), vec![11]);
}

#[test]
fn windows_stay_inside_their_allocation() {
    let (_, usm) = allocator();
    let ptr = usm.malloc_host::<u32>(4).unwrap();
    let tail = ptr.elements::<u32>(2, 2).unwrap();
    assert_eq!(tail.offset(), 8);
    assert_eq!(tail.element_count::<u32>(), 2);
    assert!(ptr.elements::<u32>(3, 2).is_err());
    assert!(tail.slice(4, 8).is_err());

    usm.write_host(&tail, &[1u32, 2]).unwrap();
    assert_eq!(usm.read_host::<u32>(&ptr).unwrap(), vec![0, 0, 1, 2]);
}

#[test]
fn freed_allocations_fail_checks() {
    let (_, usm) = allocator();
    let ptr = usm.malloc_shared::<u8>(8).unwrap();
    usm.free(ptr).unwrap();
    assert!(matches!(
        usm.check(&ptr),
        Err(MemoryError::UnknownAllocation(_))
    ));
}

#[test]
fn oversized_requests_fail_instead_of_wrapping() {
    let (device, usm) = allocator();
    assert!(matches!(
        usm.malloc_device::<u64>(usize::MAX),
        Err(MemoryError::SizeOverflow { element: 8, .. })
    ));
    assert!(matches!(
        usm.malloc_shared::<u32>(usize::MAX / 2),
        Err(MemoryError::SizeOverflow { .. })
    ));
    assert_eq!(device.allocation_count(), 0);

    let ptr = usm.malloc_host::<u32>(4).unwrap();
    assert!(matches!(
        ptr.elements::<u32>(usize::MAX, 1),
        Err(MemoryError::SizeOverflow { .. })
    ));
}
