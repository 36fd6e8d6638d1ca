// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! The device allocator contract shared by the host and GPU allocators.

use crate::device::{DeviceKind, DevicePtr, DeviceRuntime, MemcpyKind, StreamHandle};
use crate::error::{fault, AllocError};

/// Allocate, release, zero and copy memory on one kind of device.
///
/// `memcpy` and `memset_zero` are provided: host-side work runs on the CPU,
/// device-side work goes through [`runtime`](Self::runtime). Neither touches
/// pool bookkeeping.
pub trait DeviceAllocator: Send + Sync {
    fn device_type(&self) -> DeviceKind;

    /// Allocate `byte_size` bytes. Zero is a precondition fault.
    fn allocate(&self, byte_size: usize) -> Result<DevicePtr, AllocError>;

    /// Give back a pointer returned by [`allocate`](Self::allocate).
    ///
    /// Releasing a null, unknown or already released pointer faults.
    fn release(&self, ptr: DevicePtr);

    /// Runtime used for device-side copies and fills, if any.
    fn runtime(&self) -> Option<&dyn DeviceRuntime>;

    /// Copy `byte_size` bytes from `src` to `dest`.
    ///
    /// Without a stream the copy is synchronous; with one it is enqueued on
    /// that stream. `need_sync` waits for the whole device afterwards.
    ///
    /// # Safety
    /// `src` and `dest` must be valid, non-overlapping regions of at least
    /// `byte_size` bytes on the sides named by `kind`.
    unsafe fn memcpy(
        &self,
        src: DevicePtr,
        dest: DevicePtr,
        byte_size: usize,
        kind: MemcpyKind,
        stream: Option<StreamHandle>,
        need_sync: bool,
    ) {
        if src.is_null() {
            fault(AllocError::NullPointer("memcpy source"));
        }
        if dest.is_null() {
            fault(AllocError::NullPointer("memcpy destination"));
        }
        if byte_size == 0 {
            return;
        }

        let runtime = self.runtime();
        match (kind, runtime) {
            (MemcpyKind::HostToHost, _) => {
                std::ptr::copy_nonoverlapping(src.as_host_ptr::<u8>(), dest.as_host_ptr::<u8>(), byte_size);
            }
            (_, Some(rt)) => {
                if let Err(e) = rt.copy(src, dest, byte_size, kind, stream) {
                    fault(e.into());
                }
            }
            (_, None) => fault(AllocError::NoRuntime(kind)),
        }

        if need_sync {
            if let Some(rt) = runtime {
                synchronize(rt);
            }
        }
    }

    /// [`memcpy`](Self::memcpy) with the direction given as its integer code.
    ///
    /// An out-of-range code faults before any byte is copied.
    ///
    /// # Safety
    /// Same as [`memcpy`](Self::memcpy).
    unsafe fn memcpy_raw_kind(
        &self,
        src: DevicePtr,
        dest: DevicePtr,
        byte_size: usize,
        raw_kind: i32,
        stream: Option<StreamHandle>,
        need_sync: bool,
    ) {
        let kind = MemcpyKind::try_from(raw_kind).unwrap_or_else(|e| fault(e));
        self.memcpy(src, dest, byte_size, kind, stream, need_sync);
    }

    /// Fill `byte_size` bytes at `ptr` with zero.
    ///
    /// # Safety
    /// `ptr` must be a region of at least `byte_size` bytes owned by this
    /// allocator's device.
    unsafe fn memset_zero(
        &self,
        ptr: DevicePtr,
        byte_size: usize,
        stream: Option<StreamHandle>,
        need_sync: bool,
    ) {
        if ptr.is_null() {
            fault(AllocError::NullPointer("memset_zero target"));
        }
        if byte_size == 0 {
            return;
        }

        match self.device_type() {
            DeviceKind::Unknown => fault(AllocError::UnsupportedDevice(DeviceKind::Unknown)),
            DeviceKind::Cpu => std::ptr::write_bytes(ptr.as_host_ptr::<u8>(), 0, byte_size),
            DeviceKind::Cuda => {
                let Some(rt) = self.runtime() else {
                    fault(AllocError::NoRuntime(MemcpyKind::HostToDevice));
                };
                if let Err(e) = rt.zero(ptr, byte_size, stream) {
                    fault(e.into());
                }
                if need_sync {
                    synchronize(rt);
                }
            }
        }
    }

    /// Allocate and zero-fill.
    fn allocate_zeroed(
        &self,
        byte_size: usize,
        stream: Option<StreamHandle>,
    ) -> Result<DevicePtr, AllocError> {
        let ptr = self.allocate(byte_size)?;
        // SAFETY: `ptr` was just allocated with `byte_size` bytes on this device.
        unsafe { self.memset_zero(ptr, byte_size, stream, false) };
        Ok(ptr)
    }
}

fn synchronize(rt: &dyn DeviceRuntime) {
    if let Err(e) = rt.synchronize() {
        fault(e.into());
    }
}
