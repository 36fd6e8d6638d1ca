// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Host-memory-backed device.
//!
//! Device blocks are ordinary host allocations, so copies in every direction
//! are plain memory copies and stream work completes at issue time (which
//! trivially satisfies per-stream FIFO ordering). Every primitive call is
//! counted, and device-side addresses are checked against live blocks so a
//! use-after-release surfaces as [`DeviceError::InvalidAddress`].

use std::alloc::{self, Layout};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::runtime::DeviceRuntime;
use super::{DeviceId, DevicePtr, MemcpyKind, StreamHandle};
use crate::error::DeviceError;

/// Configuration for an [`EmulatedDevice`].
#[derive(Debug, Clone)]
pub struct EmulatedDeviceConfig {
    /// Number of devices exposed.
    pub device_count: usize,
    /// Bytes each device can hand out before reporting out-of-memory.
    pub capacity_bytes: usize,
    /// Alignment of every block (CUDA guarantees 256).
    pub alignment: usize,
}

impl Default for EmulatedDeviceConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            capacity_bytes: 1024 * 1024 * 1024, // 1 GB
            alignment: 256,
        }
    }
}

impl EmulatedDeviceConfig {
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self { capacity_bytes, ..Default::default() }
    }

    pub fn multi_device(device_count: usize) -> Self {
        Self { device_count, ..Default::default() }
    }
}

/// Counters describing how the primitive has been used.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EmulatedDeviceStats {
    pub acquire_calls: u64,
    pub release_calls: u64,
    pub copies: u64,
    pub zero_fills: u64,
    pub async_ops: u64,
    pub synchronizations: u64,
    pub live_blocks: usize,
    pub reserved_bytes: usize,
}

#[derive(Debug)]
struct Block {
    device: DeviceId,
    layout: Layout,
}

#[derive(Debug, Default)]
struct BlockTable {
    blocks: BTreeMap<u64, Block>,
    reserved: HashMap<DeviceId, usize>,
}

impl BlockTable {
    /// Whether `[ptr, ptr + len)` lies inside one live block.
    fn contains(&self, ptr: DevicePtr, len: usize) -> bool {
        match self.blocks.range(..=ptr.addr()).next_back() {
            Some((start, block)) => ptr
                .offset(len)
                .is_some_and(|end| end.addr() <= start + block.layout.size() as u64),
            None => false,
        }
    }
}

/// A device whose memory lives on the host heap.
pub struct EmulatedDevice {
    config: EmulatedDeviceConfig,
    table: Mutex<BlockTable>,
    acquire_calls: AtomicU64,
    release_calls: AtomicU64,
    copies: AtomicU64,
    zero_fills: AtomicU64,
    async_ops: AtomicU64,
    synchronizations: AtomicU64,
}

impl EmulatedDevice {
    pub fn new(config: EmulatedDeviceConfig) -> Self {
        Self {
            config,
            table: Mutex::new(BlockTable::default()),
            acquire_calls: AtomicU64::new(0),
            release_calls: AtomicU64::new(0),
            copies: AtomicU64::new(0),
            zero_fills: AtomicU64::new(0),
            async_ops: AtomicU64::new(0),
            synchronizations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EmulatedDeviceConfig {
        &self.config
    }

    pub fn stats(&self) -> EmulatedDeviceStats {
        let table = self.table.lock();
        EmulatedDeviceStats {
            acquire_calls: self.acquire_calls.load(Ordering::SeqCst),
            release_calls: self.release_calls.load(Ordering::SeqCst),
            copies: self.copies.load(Ordering::SeqCst),
            zero_fills: self.zero_fills.load(Ordering::SeqCst),
            async_ops: self.async_ops.load(Ordering::SeqCst),
            synchronizations: self.synchronizations.load(Ordering::SeqCst),
            live_blocks: table.blocks.len(),
            reserved_bytes: table.reserved.values().sum(),
        }
    }

    /// Bytes currently acquired on `device`.
    pub fn reserved_bytes(&self, device: DeviceId) -> usize {
        self.table.lock().reserved.get(&device).copied().unwrap_or(0)
    }

    /// Whether `ptr` is the start of a live block.
    pub fn is_live(&self, ptr: DevicePtr) -> bool {
        self.table.lock().blocks.contains_key(&ptr.addr())
    }

    fn check_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        if device.0 < 0 || device.0 as usize >= self.config.device_count {
            return Err(DeviceError::DeviceNotFound(device.0));
        }
        Ok(())
    }

    fn check_device_range(&self, ptr: DevicePtr, len: usize) -> Result<(), DeviceError> {
        if self.table.lock().contains(ptr, len) {
            Ok(())
        } else {
            Err(DeviceError::InvalidAddress(ptr))
        }
    }

    fn note_stream(&self, stream: Option<StreamHandle>) {
        if stream.is_some() {
            self.async_ops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new(EmulatedDeviceConfig::default())
    }
}

impl DeviceRuntime for EmulatedDevice {
    fn name(&self) -> &str {
        "emulated"
    }

    fn device_count(&self) -> usize {
        self.config.device_count
    }

    fn acquire(&self, device: DeviceId, byte_size: usize) -> Result<DevicePtr, DeviceError> {
        self.check_device(device)?;
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if byte_size == 0 {
            return Err(DeviceError::Driver("zero-sized acquire".into()));
        }

        let mut table = self.table.lock();
        let reserved = table.reserved.get(&device).copied().unwrap_or(0);
        let available = self.config.capacity_bytes.saturating_sub(reserved);
        if byte_size > available {
            return Err(DeviceError::OutOfMemory { required: byte_size, available });
        }

        let layout = Layout::from_size_align(byte_size, self.config.alignment)
            .map_err(|e| DeviceError::Driver(e.to_string()))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        if raw.is_null() {
            return Err(DeviceError::OutOfMemory { required: byte_size, available: 0 });
        }

        let ptr = DevicePtr::from_host(raw);
        table.blocks.insert(ptr.addr(), Block { device, layout });
        *table.reserved.entry(device).or_insert(0) += byte_size;
        Ok(ptr)
    }

    unsafe fn release(&self, device: DeviceId, ptr: DevicePtr) -> Result<(), DeviceError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        let mut table = self.table.lock();
        let block = match table.blocks.get(&ptr.addr()) {
            Some(b) if b.device == device => table.blocks.remove(&ptr.addr()),
            _ => None,
        };
        let block = block.ok_or(DeviceError::InvalidAddress(ptr))?;
        if let Some(r) = table.reserved.get_mut(&device) {
            *r -= block.layout.size();
        }
        alloc::dealloc(ptr.as_host_ptr::<u8>(), block.layout);
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
            MemcpyKind::HostToDevice => self.check_device_range(dest, byte_size)?,
            MemcpyKind::DeviceToHost => self.check_device_range(src, byte_size)?,
            MemcpyKind::DeviceToDevice => {
                self.check_device_range(src, byte_size)?;
                self.check_device_range(dest, byte_size)?;
            }
        }
        self.copies.fetch_add(1, Ordering::SeqCst);
        self.note_stream(stream);
        std::ptr::copy_nonoverlapping(src.as_host_ptr::<u8>(), dest.as_host_ptr::<u8>(), byte_size);
        Ok(())
    }

    unsafe fn zero(
        &self,
        ptr: DevicePtr,
        byte_size: usize,
        stream: Option<StreamHandle>,
    ) -> Result<(), DeviceError> {
        self.check_device_range(ptr, byte_size)?;
        self.zero_fills.fetch_add(1, Ordering::SeqCst);
        self.note_stream(stream);
        std::ptr::write_bytes(ptr.as_host_ptr::<u8>(), 0, byte_size);
        Ok(())
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        self.synchronizations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for EmulatedDevice {
    fn drop(&mut self) {
        let table = self.table.get_mut();
        if !table.blocks.is_empty() {
            tracing::debug!(blocks = table.blocks.len(), "emulated device dropped with live blocks");
        }
        for (addr, block) in std::mem::take(&mut table.blocks) {
            // SAFETY: every entry was produced by `alloc::alloc` with this layout.
            unsafe { alloc::dealloc(DevicePtr::new(addr).as_host_ptr::<u8>(), block.layout) };
        }
    }
}

#[cfg(test)]
#[path = "emulated_tests.rs"]
mod tests;
