// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! The device allocation primitive consumed by the allocators.

use super::{DeviceId, DevicePtr, MemcpyKind, StreamHandle};
use crate::error::DeviceError;

/// Raw device operations: acquire/release blocks, copy, zero, synchronize.
///
/// Implementations are expected to be expensive on `acquire`/`release` (they
/// may synchronize the device); the caching allocator exists to call them
/// rarely. Only `acquire` is expected to fail in normal operation; a failure
/// from any other method is treated as fatal by the allocators.
pub trait DeviceRuntime: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Number of devices addressable through this runtime.
    fn device_count(&self) -> usize;

    /// Acquire `byte_size` bytes on `device`.
    fn acquire(&self, device: DeviceId, byte_size: usize) -> Result<DevicePtr, DeviceError>;

    /// Return a block to the device.
    ///
    /// # Safety
    /// `ptr` must come from [`acquire`](Self::acquire) on the same `device`,
    /// must not have been released already, and no outstanding device work
    /// may still reference it.
    unsafe fn release(&self, device: DeviceId, ptr: DevicePtr) -> Result<(), DeviceError>;

    /// Copy `byte_size` bytes from `src` to `dest`.
    ///
    /// With a stream the copy is enqueued and may still be in flight on return.
    ///
    /// # Safety
    /// Both regions must be valid for `byte_size` bytes on the sides named by
    /// `kind`, and must not overlap.
    unsafe fn copy(
        &self,
        src: DevicePtr,
        dest: DevicePtr,
        byte_size: usize,
        kind: MemcpyKind,
        stream: Option<StreamHandle>,
    ) -> Result<(), DeviceError>;

    /// Fill `byte_size` bytes at `ptr` with zero.
    ///
    /// # Safety
    /// `ptr` must be a device region valid for `byte_size` bytes.
    unsafe fn zero(
        &self,
        ptr: DevicePtr,
        byte_size: usize,
        stream: Option<StreamHandle>,
    ) -> Result<(), DeviceError>;

    /// Block until all previously issued device work has completed.
    fn synchronize(&self) -> Result<(), DeviceError>;
}
