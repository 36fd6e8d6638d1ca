// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! CUDA driver backend for [`DeviceRuntime`] via cudarc.

use std::collections::BTreeMap;
use std::sync::Arc;

use cudarc::driver::{result, sys, CudaDevice, DriverError};
use parking_lot::Mutex;

use super::runtime::DeviceRuntime;
use super::{DeviceId, DevicePtr, MemcpyKind, StreamHandle};
use crate::error::DeviceError;

impl From<DriverError> for DeviceError {
    fn from(e: DriverError) -> Self {
        DeviceError::Driver(e.to_string())
    }
}

/// Live blocks by start address, with owning device and size.
#[derive(Debug, Default)]
struct BlockOwners {
    blocks: BTreeMap<u64, (DeviceId, usize)>,
}

impl BlockOwners {
    fn insert(&mut self, ptr: DevicePtr, device: DeviceId, byte_size: usize) {
        self.blocks.insert(ptr.addr(), (device, byte_size));
    }

    fn remove(&mut self, ptr: DevicePtr) {
        self.blocks.remove(&ptr.addr());
    }

    /// Device owning the block that contains `[ptr, ptr + len)`.
    fn owner(&self, ptr: DevicePtr, len: usize) -> Option<DeviceId> {
        let (start, (device, size)) = self.blocks.range(..=ptr.addr()).next_back()?;
        let end = ptr.offset(len)?;
        (end.addr() <= start + *size as u64).then_some(*device)
    }
}

/// CUDA devices visible to this process.
///
/// Every call binds the context of the device it touches to the calling
/// thread first, so any thread may copy into a block another thread acquired.
pub struct CudaRuntime {
    devices: Vec<Arc<CudaDevice>>,
    owners: Mutex<BlockOwners>,
}

impl CudaRuntime {
    /// Open every visible CUDA device.
    pub fn new() -> Result<Self, DeviceError> {
        let count = CudaDevice::count()?;
        let mut devices = Vec::with_capacity(count.max(0) as usize);
        for ordinal in 0..count.max(0) as usize {
            devices.push(CudaDevice::new(ordinal)?);
        }
        if devices.is_empty() {
            return Err(DeviceError::DeviceNotFound(0));
        }
        tracing::info!(devices = devices.len(), "CUDA runtime initialized");
        Ok(Self { devices, owners: Mutex::new(BlockOwners::default()) })
    }

    /// Whether a CUDA driver and at least one device are present.
    pub fn is_available() -> bool {
        matches!(CudaDevice::count(), Ok(n) if n > 0)
    }

    fn bind(&self, device: DeviceId) -> Result<(), DeviceError> {
        let dev = usize::try_from(device.0)
            .ok()
            .and_then(|i| self.devices.get(i))
            .ok_or(DeviceError::DeviceNotFound(device.0))?;
        dev.bind_to_thread()?;
        Ok(())
    }

    /// Bind the device owning the device-side range of a copy or fill.
    fn bind_owner(&self, ptr: DevicePtr, len: usize) -> Result<(), DeviceError> {
        let device = self.owners.lock().owner(ptr, len).ok_or(DeviceError::InvalidAddress(ptr))?;
        self.bind(device)
    }

    fn to_stream(stream: StreamHandle) -> sys::CUstream {
        stream.0 as sys::CUstream
    }
}

impl DeviceRuntime for CudaRuntime {
    fn name(&self) -> &str {
        "cuda"
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn acquire(&self, device: DeviceId, byte_size: usize) -> Result<DevicePtr, DeviceError> {
        self.bind(device)?;
        // SAFETY: a context for `device` is bound to this thread.
        match unsafe { result::malloc_sync(byte_size) } {
            Ok(dptr) => {
                let ptr = DevicePtr::new(dptr);
                self.owners.lock().insert(ptr, device, byte_size);
                Ok(ptr)
            }
            Err(DriverError(sys::CUresult::CUDA_ERROR_OUT_OF_MEMORY)) => {
                let available = result::mem_get_info().map(|(free, _)| free).unwrap_or(0);
                Err(DeviceError::OutOfMemory { required: byte_size, available })
            }
            Err(e) => Err(e.into()),
        }
    }

    unsafe fn release(&self, device: DeviceId, ptr: DevicePtr) -> Result<(), DeviceError> {
        self.bind(device)?;
        result::free_sync(ptr.addr())?;
        self.owners.lock().remove(ptr);
        Ok(())
    }

    unsafe fn copy(
        &self,
        src: DevicePtr,
        dest: DevicePtr,
        byte_size: usize,
        kind: MemcpyKind,
        stream: Option<StreamHandle>,
    ) -> Result<(), DeviceError> {
        match kind {
            MemcpyKind::HostToHost => {}
            MemcpyKind::HostToDevice => self.bind_owner(dest, byte_size)?,
            MemcpyKind::DeviceToHost | MemcpyKind::DeviceToDevice => {
                self.bind_owner(src, byte_size)?
            }
        }
        match (kind, stream) {
            (MemcpyKind::HostToHost, _) => {
                std::ptr::copy_nonoverlapping(
                    src.as_host_ptr::<u8>(),
                    dest.as_host_ptr::<u8>(),
                    byte_size,
                );
            }
            (MemcpyKind::HostToDevice, None) => {
                let host = std::slice::from_raw_parts(src.as_host_ptr::<u8>(), byte_size);
                result::memcpy_htod_sync(dest.addr(), host)?;
            }
            (MemcpyKind::HostToDevice, Some(s)) => {
                let host = std::slice::from_raw_parts(src.as_host_ptr::<u8>(), byte_size);
                result::memcpy_htod_async(dest.addr(), host, Self::to_stream(s))?;
            }
            (MemcpyKind::DeviceToHost, None) => {
                let host = std::slice::from_raw_parts_mut(dest.as_host_ptr::<u8>(), byte_size);
                result::memcpy_dtoh_sync(host, src.addr())?;
            }
            (MemcpyKind::DeviceToHost, Some(s)) => {
                let host = std::slice::from_raw_parts_mut(dest.as_host_ptr::<u8>(), byte_size);
                result::memcpy_dtoh_async(host, src.addr(), Self::to_stream(s))?;
            }
            (MemcpyKind::DeviceToDevice, None) => {
                result::memcpy_dtod_sync(dest.addr(), src.addr(), byte_size)?;
            }
            (MemcpyKind::DeviceToDevice, Some(s)) => {
                result::memcpy_dtod_async(dest.addr(), src.addr(), byte_size, Self::to_stream(s))?;
            }
        }
        Ok(())
    }

    unsafe fn zero(
        &self,
        ptr: DevicePtr,
        byte_size: usize,
        stream: Option<StreamHandle>,
    ) -> Result<(), DeviceError> {
        self.bind_owner(ptr, byte_size)?;
        match stream {
            Some(s) => result::memset_d8_async(ptr.addr(), 0, byte_size, Self::to_stream(s))?,
            None => result::memset_d8_sync(ptr.addr(), 0, byte_size)?,
        }
        Ok(())
    }

    /// Waits on every device; the caller does not say which one it used.
    fn synchronize(&self) -> Result<(), DeviceError> {
        for dev in &self.devices {
            dev.bind_to_thread()?;
            result::ctx::synchronize()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuda_acquire_roundtrip() {
        if !CudaRuntime::is_available() {
            return;
        }
        let rt = CudaRuntime::new().unwrap();
        let d0 = DeviceId(0);
        let block = rt.acquire(d0, 1024).unwrap();

        let src: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        let mut dst = vec![0u8; 1024];
        unsafe {
            rt.copy(DevicePtr::from_host(src.as_ptr()), block, 1024, MemcpyKind::HostToDevice, None)
                .unwrap();
            rt.copy(block, DevicePtr::from_host(dst.as_mut_ptr()), 1024, MemcpyKind::DeviceToHost, None)
                .unwrap();
            rt.release(d0, block).unwrap();
        }
        assert_eq!(src, dst);
    }

    #[test]
    fn test_block_owner_lookup() {
        let mut owners = BlockOwners::default();
        owners.insert(DevicePtr::new(0x1000), DeviceId(1), 256);
        owners.insert(DevicePtr::new(0x2000), DeviceId(0), 64);

        assert_eq!(owners.owner(DevicePtr::new(0x1000), 256), Some(DeviceId(1)));
        assert_eq!(owners.owner(DevicePtr::new(0x1080), 16), Some(DeviceId(1)));
        assert_eq!(owners.owner(DevicePtr::new(0x1080), 256), None);
        assert_eq!(owners.owner(DevicePtr::new(0x0800), 8), None);
        assert_eq!(owners.owner(DevicePtr::new(0x2000), usize::MAX), None);

        owners.remove(DevicePtr::new(0x2000));
        assert_eq!(owners.owner(DevicePtr::new(0x2000), 8), None);
    }

    #[test]
    fn test_copy_from_thread_without_bound_context() {
        if !CudaRuntime::is_available() {
            return;
        }
        let rt = Arc::new(CudaRuntime::new().unwrap());
        let block = rt.acquire(DeviceId(0), 4096).unwrap();

        let worker = {
            let rt = rt.clone();
            std::thread::spawn(move || {
                let src = vec![0x3Cu8; 4096];
                let mut dst = vec![0u8; 4096];
                unsafe {
                    rt.copy(DevicePtr::from_host(src.as_ptr()), block, 4096, MemcpyKind::HostToDevice, None)
                        .unwrap();
                    rt.zero(block, 16, None).unwrap();
                    rt.synchronize().unwrap();
                    rt.copy(block, DevicePtr::from_host(dst.as_mut_ptr()), 4096, MemcpyKind::DeviceToHost, None)
                        .unwrap();
                }
                dst
            })
        };
        let dst = worker.join().unwrap();
        assert!(dst[..16].iter().all(|&b| b == 0));
        assert!(dst[16..].iter().all(|&b| b == 0x3C));
        unsafe { rt.release(DeviceId(0), block).unwrap() };
    }
}
