//! Tests for the GPU caching allocator.

use super::*;
use crate::device::{EmulatedDevice, EmulatedDeviceConfig};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

fn setup(config: AllocatorConfig) -> (Arc<EmulatedDevice>, GpuCachingAllocator) {
    setup_with(EmulatedDeviceConfig::default(), config)
}

fn setup_with(
    device_config: EmulatedDeviceConfig,
    config: AllocatorConfig,
) -> (Arc<EmulatedDevice>, GpuCachingAllocator) {
    let device = Arc::new(EmulatedDevice::new(device_config));
    let alloc = GpuCachingAllocator::new(device.clone(), DeviceId(0), config).unwrap();
    (device, alloc)
}

fn with_trim_threshold(trim_threshold: usize) -> AllocatorConfig {
    AllocatorConfig { trim_threshold, ..Default::default() }
}

#[test]
fn test_release_then_allocate_reuses_address() {
    let (device, alloc) = setup(AllocatorConfig::default());

    let p = alloc.allocate(64).unwrap();
    alloc.release(p);
    let q = alloc.allocate(64).unwrap();

    assert_eq!(p, q);
    assert_eq!(device.stats().acquire_calls, 1);
    let stats = alloc.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hit_rate(), 0.5);
}

#[test]
fn test_small_blocks_round_to_granularity() {
    let (device, alloc) = setup(AllocatorConfig::default());

    let p = alloc.allocate(64).unwrap();
    assert_eq!(device.reserved_bytes(DeviceId(0)), 512);
    alloc.release(p);

    // A different small size that still fits the rounded block is a hit.
    let q = alloc.allocate(300).unwrap();
    assert_eq!(p, q);
    assert_eq!(device.stats().acquire_calls, 1);
}

#[test]
fn test_big_blocks_are_not_rounded() {
    let (device, alloc) = setup(AllocatorConfig::default());
    alloc.allocate(MIB + 3).unwrap();
    assert_eq!(device.reserved_bytes(DeviceId(0)), MIB + 3);
    assert_eq!(alloc.size_class(MIB + 3), SizeClass::Big);
    assert_eq!(alloc.size_class(MIB - 1), SizeClass::Small);
}

#[test]
fn test_busy_buffers_are_never_shared() {
    let (_device, alloc) = setup(AllocatorConfig::default());
    let a = alloc.allocate(4 * KIB).unwrap();
    let b = alloc.allocate(4 * KIB).unwrap();
    assert_ne!(a, b);
    assert_eq!(alloc.stats().busy_buffers, 2);
}

#[test]
fn test_best_fit_prefers_smallest_block() {
    let (_device, alloc) = setup(AllocatorConfig::default());
    let large = alloc.allocate(4096).unwrap();
    let small = alloc.allocate(1024).unwrap();
    alloc.release(large);
    alloc.release(small);

    assert_eq!(alloc.allocate(1000).unwrap(), small);
    assert_eq!(alloc.allocate(1000).unwrap(), large);
}

#[test]
fn test_equal_sizes_pick_lowest_address() {
    let (_device, alloc) = setup(AllocatorConfig::default());
    let a = alloc.allocate(2048).unwrap();
    let b = alloc.allocate(2048).unwrap();
    alloc.release(b);
    alloc.release(a);

    assert_eq!(alloc.allocate(2048).unwrap(), a.min(b));
}

#[test]
fn test_size_classes_do_not_share_buffers() {
    let (device, alloc) = setup(AllocatorConfig::default());

    let big = alloc.allocate(2 * MIB).unwrap();
    alloc.release(big);
    let small = alloc.allocate(4 * KIB).unwrap();
    assert_ne!(small, big);
    assert_eq!(alloc.stats().idle_buffers, 1);

    alloc.release(small);
    alloc.release(alloc.allocate(2 * MIB).unwrap());
    let small_only = {
        let s = alloc.allocate(4 * KIB).unwrap();
        alloc.release(s);
        s
    };
    assert_eq!(small_only, small);
    assert_eq!(device.stats().acquire_calls, 2);

    // Only the small block is idle now; a big request must miss.
    let held_big = alloc.allocate(2 * MIB).unwrap();
    assert_eq!(held_big, big);
    let another_big = alloc.allocate(2 * MIB).unwrap();
    assert_ne!(another_big, small);
    assert_eq!(device.stats().acquire_calls, 3);
}

#[test]
fn test_big_reuse_respects_slack() {
    let (device, alloc) = setup(AllocatorConfig::default());

    let b = alloc.allocate(8 * MIB).unwrap();
    alloc.release(b);

    let two = alloc.allocate(2 * MIB).unwrap();
    assert_ne!(two, b);
    assert_eq!(device.stats().acquire_calls, 2);

    let near = alloc.allocate(7 * MIB + 512 * KIB).unwrap();
    assert_eq!(near, b);
    assert_eq!(device.stats().acquire_calls, 2);
}

#[test]
fn test_exact_big_fit_reused_with_zero_slack() {
    let config = AllocatorConfig { big_reuse_slack: 0, ..Default::default() };
    assert!(config.validate().is_ok());
    let (device, alloc) = setup(config);

    let p = alloc.allocate(2 * MIB).unwrap();
    alloc.release(p);
    let q = alloc.allocate(2 * MIB).unwrap();
    assert_eq!(p, q);
    assert_eq!(device.stats().acquire_calls, 1);

    // Any waste at all is too much.
    alloc.release(q);
    let smaller = alloc.allocate(2 * MIB - 1).unwrap();
    assert_ne!(smaller, p);
    assert_eq!(device.stats().acquire_calls, 2);
}

#[test]
fn test_trim_keeps_idle_count_bounded() {
    let (device, alloc) = setup(with_trim_threshold(2));
    let ptrs: Vec<DevicePtr> = (0..6).map(|_| alloc.allocate(KIB).unwrap()).collect();

    for p in ptrs {
        alloc.release(p);
        assert!(alloc.stats().idle_buffers <= 2);
    }

    let stats = alloc.stats();
    assert_eq!(stats.reclaimed_buffers, 4);
    assert_eq!(stats.trims, 2);
    assert_eq!(device.stats().live_blocks, stats.idle_buffers);
    assert_eq!(device.reserved_bytes(DeviceId(0)), stats.reserved_bytes);
}

#[test]
fn test_trim_never_frees_busy_buffers() {
    let (device, alloc) = setup(with_trim_threshold(1));
    let held: Vec<DevicePtr> = (0..4).map(|_| alloc.allocate(KIB).unwrap()).collect();
    let a = alloc.allocate(KIB).unwrap();
    let b = alloc.allocate(KIB).unwrap();
    alloc.release(a);
    alloc.release(b);

    for p in &held {
        assert!(alloc.owns(*p));
        assert!(device.is_live(*p));
    }
    assert_eq!(alloc.stats().busy_buffers, 4);
}

#[test]
fn test_trim_evicts_big_pool_first() {
    let (_device, alloc) = setup(with_trim_threshold(2));
    let s1 = alloc.allocate(KIB).unwrap();
    let b1 = alloc.allocate(2 * MIB).unwrap();
    let s2 = alloc.allocate(KIB).unwrap();

    alloc.release(s1);
    alloc.release(b1);
    alloc.release(s2);

    assert!(!alloc.owns(b1));
    assert!(!alloc.owns(s1));
    assert!(alloc.owns(s2));
}

#[test]
fn test_trim_evicts_least_recently_released() {
    let (_device, alloc) = setup(with_trim_threshold(2));
    let s1 = alloc.allocate(KIB).unwrap();
    let s2 = alloc.allocate(KIB).unwrap();
    let s3 = alloc.allocate(KIB).unwrap();

    alloc.release(s2);
    alloc.release(s3);
    alloc.release(s1);

    assert!(!alloc.owns(s2));
    assert!(!alloc.owns(s3));
    assert!(alloc.owns(s1));
}

#[test]
fn test_no_caching_returns_blocks_immediately() {
    let (device, alloc) = setup(AllocatorConfig::no_caching());
    let p = alloc.allocate(KIB).unwrap();
    alloc.release(p);
    assert_eq!(device.stats().live_blocks, 0);
    assert_eq!(alloc.stats().reserved_bytes, 0);
}

#[test]
fn test_explicit_trim_and_empty_cache() {
    let (device, alloc) = setup(with_trim_threshold(8));
    let ptrs: Vec<DevicePtr> = (0..5).map(|_| alloc.allocate(KIB).unwrap()).collect();
    let kept = alloc.allocate(KIB).unwrap();
    for p in ptrs {
        alloc.release(p);
    }

    assert_eq!(alloc.trim(), 0);
    assert_eq!(alloc.empty_cache(), 5 * KIB);
    assert_eq!(alloc.stats().idle_buffers, 0);
    assert_eq!(device.stats().live_blocks, 1);
    assert!(alloc.owns(kept));
}

#[test]
fn test_peak_reserved_tracks_high_water_mark() {
    let (_device, alloc) = setup(AllocatorConfig::no_caching());
    let a = alloc.allocate(2 * MIB).unwrap();
    let b = alloc.allocate(2 * MIB).unwrap();
    alloc.release(a);
    alloc.release(b);

    let stats = alloc.stats();
    assert_eq!(stats.reserved_bytes, 0);
    assert_eq!(stats.peak_reserved_bytes, 4 * MIB);
}

#[test]
fn test_report_policy_retries_after_emptying_cache() {
    let (device, alloc) =
        setup_with(EmulatedDeviceConfig::with_capacity(8192), AllocatorConfig::graceful_oom());

    let p = alloc.allocate(4096).unwrap();
    alloc.release(p);

    // 6144-byte block does not fit next to the idle 4096-byte one.
    let q = alloc.allocate(6000).unwrap();
    assert!(alloc.owns(q));
    assert!(!alloc.owns(p));
    assert_eq!(alloc.stats().reclaimed_buffers, 1);
    assert_eq!(device.reserved_bytes(DeviceId(0)), 6144);

    let err = alloc.allocate(8192).unwrap_err();
    assert!(matches!(
        err,
        AllocError::OutOfMemory { requested: 8192, source: DeviceError::OutOfMemory { .. }, .. }
    ));
}

#[test]
#[should_panic(expected = "Out of memory on device 0")]
fn test_fatal_policy_faults_on_exhaustion() {
    let (_device, alloc) =
        setup_with(EmulatedDeviceConfig::with_capacity(4096), AllocatorConfig::default());
    let _ = alloc.allocate(2 * MIB);
}

#[test]
#[should_panic(expected = "Double release")]
fn test_double_release_faults() {
    let (_device, alloc) = setup(AllocatorConfig::default());
    let p = alloc.allocate(64).unwrap();
    alloc.release(p);
    alloc.release(p);
}

#[test]
#[should_panic(expected = "is not owned by the allocator")]
fn test_unknown_pointer_faults() {
    let (_device, alloc) = setup(AllocatorConfig::default());
    alloc.release(DevicePtr::new(0xdead_0000));
}

#[test]
#[should_panic(expected = "is not owned by the allocator")]
fn test_release_of_reclaimed_buffer_faults() {
    let (_device, alloc) = setup(AllocatorConfig::no_caching());
    let p = alloc.allocate(64).unwrap();
    alloc.release(p);
    alloc.release(p);
}

#[test]
#[should_panic(expected = "Allocation size must be > 0")]
fn test_zero_size_faults() {
    let (_device, alloc) = setup(AllocatorConfig::default());
    let _ = alloc.allocate(0);
}

#[test]
#[should_panic(expected = "Null pointer")]
fn test_null_release_faults() {
    let (_device, alloc) = setup(AllocatorConfig::default());
    alloc.release(DevicePtr::null());
}

#[test]
fn test_pool_survives_fault_in_other_thread() {
    let (_device, alloc) = setup(AllocatorConfig::default());
    let alloc = Arc::new(alloc);
    let p = alloc.allocate(64).unwrap();
    alloc.release(p);

    let worker = alloc.clone();
    let joined = std::thread::spawn(move || worker.release(p)).join();
    assert!(joined.is_err());

    assert_eq!(alloc.allocate(64).unwrap(), p);
}

#[test]
fn test_invalid_device_and_config_rejected() {
    let device: Arc<dyn DeviceRuntime> = Arc::new(EmulatedDevice::default());
    let err = GpuCachingAllocator::new(device.clone(), DeviceId(1), AllocatorConfig::default())
        .err()
        .unwrap();
    assert!(matches!(err, AllocError::InvalidDevice { count: 1, .. }));

    let bad = AllocatorConfig { small_granularity: 0, ..Default::default() };
    let err = GpuCachingAllocator::new(device, DeviceId(0), bad).err().unwrap();
    assert!(matches!(err, AllocError::Config(_)));
}

#[test]
fn test_drop_frees_idle_and_keeps_busy() {
    let device = Arc::new(EmulatedDevice::default());
    let busy = {
        let alloc =
            GpuCachingAllocator::new(device.clone(), DeviceId(0), AllocatorConfig::default())
                .unwrap();
        let busy = alloc.allocate(KIB).unwrap();
        let idle = alloc.allocate(KIB).unwrap();
        alloc.release(idle);
        busy
    };
    assert_eq!(device.stats().live_blocks, 1);
    assert!(device.is_live(busy));
}

#[test]
fn test_stats_serialize() {
    let (_device, alloc) = setup(AllocatorConfig::default());
    alloc.allocate(64).unwrap();
    let json = serde_json::to_value(alloc.stats()).unwrap();
    assert_eq!(json["device"], 0);
    assert_eq!(json["busy_buffers"], 1);
    assert_eq!(json["reserved_bytes"], 512);
}
