// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Host heap allocator. No pooling: every call goes straight to the C heap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::allocator::DeviceAllocator;
use crate::device::{DeviceId, DeviceKind, DevicePtr, DeviceRuntime};
use crate::error::{fault, AllocError, DeviceError};

/// Device id reported for host-heap exhaustion.
const HOST_DEVICE: DeviceId = DeviceId(-1);

/// Pass-through allocator for host memory.
///
/// Optionally carries a device runtime so host buffers can be copied to and
/// from the device through the shared `memcpy` entry point.
pub struct HostAllocator {
    runtime: Option<Arc<dyn DeviceRuntime>>,
    live: AtomicU64,
    total: AtomicU64,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self { runtime: None, live: AtomicU64::new(0), total: AtomicU64::new(0) }
    }

    pub fn with_runtime(runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self { runtime: Some(runtime), ..Self::new() }
    }

    /// Allocations not yet released.
    pub fn live_allocations(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    pub fn total_allocations(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAllocator for HostAllocator {
    fn device_type(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn allocate(&self, byte_size: usize) -> Result<DevicePtr, AllocError> {
        if byte_size == 0 {
            fault(AllocError::ZeroSize);
        }
        // SAFETY: plain C heap allocation of a non-zero size.
        let raw = unsafe { libc::malloc(byte_size) };
        if raw.is_null() {
            fault(AllocError::OutOfMemory {
                device: HOST_DEVICE,
                requested: byte_size,
                source: DeviceError::OutOfMemory { required: byte_size, available: 0 },
            });
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        let ptr = DevicePtr::from_host(raw);
        tracing::trace!(bytes = byte_size, addr = %ptr, "host allocate");
        Ok(ptr)
    }

    fn release(&self, ptr: DevicePtr) {
        if ptr.is_null() {
            fault(AllocError::NullPointer("release"));
        }
        // SAFETY: the contract requires `ptr` to come from `allocate` above.
        unsafe { libc::free(ptr.as_host_ptr::<libc::c_void>()) };
        if self.live.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_err() {
            tracing::warn!(addr = %ptr, "host release with no live allocations (foreign or double release)");
        } else {
            tracing::trace!(addr = %ptr, "host release");
        }
    }

    fn runtime(&self) -> Option<&dyn DeviceRuntime> {
        self.runtime.as_deref()
    }
}
