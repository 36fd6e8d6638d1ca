// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! GPU caching allocator.
//!
//! Serves `allocate`/`release` from a per-device pool of previously acquired
//! blocks and only calls the device primitive on a pool miss. Requests are
//! split into a small and a big size class; released blocks stay in the pool
//! until the idle count crosses the trim threshold.

use std::sync::{Arc, Mutex};

use super::allocator::DeviceAllocator;
use super::caching_types::{lock_or_recover, DevicePool, MemoryBuffer, SizeClass};
use crate::config::{AllocatorConfig, OomPolicy};
use crate::device::{DeviceId, DeviceKind, DevicePtr, DeviceRuntime};
use crate::error::{fault, AllocError, DeviceError};

pub use super::caching_types::PoolStats;

/// Pooling allocator for one device.
pub struct GpuCachingAllocator {
    device: DeviceId,
    runtime: Arc<dyn DeviceRuntime>,
    config: AllocatorConfig,
    pool: Mutex<DevicePool>,
}

impl GpuCachingAllocator {
    pub fn new(
        runtime: Arc<dyn DeviceRuntime>,
        device: DeviceId,
        config: AllocatorConfig,
    ) -> Result<Self, AllocError> {
        let count = runtime.device_count();
        if device.0 < 0 || device.0 as usize >= count {
            return Err(AllocError::InvalidDevice { device, count });
        }
        config.validate()?;
        tracing::debug!(
            device = device.0,
            runtime = runtime.name(),
            small_threshold = config.small_threshold,
            trim_threshold = config.trim_threshold,
            "caching allocator created"
        );
        Ok(Self { device, runtime, config, pool: Mutex::new(DevicePool::new(device)) })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        lock_or_recover(&self.pool).stats()
    }

    /// Whether `ptr` is a live (busy or idle) block of this pool.
    pub fn owns(&self, ptr: DevicePtr) -> bool {
        lock_or_recover(&self.pool).contains(ptr)
    }

    pub fn size_class(&self, byte_size: usize) -> SizeClass {
        if byte_size < self.config.small_threshold {
            SizeClass::Small
        } else {
            SizeClass::Big
        }
    }

    /// Run a trim pass now. Returns the bytes given back to the device.
    pub fn trim(&self) -> usize {
        let victims = lock_or_recover(&self.pool).take_trim_victims(self.config.trim_threshold);
        self.free_blocks(victims)
    }

    /// Give every idle block back to the device. Returns the bytes released.
    pub fn empty_cache(&self) -> usize {
        let victims = lock_or_recover(&self.pool).take_all_idle();
        self.free_blocks(victims)
    }

    fn free_blocks(&self, victims: Vec<MemoryBuffer>) -> usize {
        if victims.is_empty() {
            return 0;
        }
        let mut freed = 0;
        for buffer in &victims {
            // SAFETY: victims were idle and have been removed from the pool, so
            // no caller holds them and no other thread can hand them out.
            if let Err(e) = unsafe { self.runtime.release(self.device, buffer.ptr) } {
                fault(e.into());
            }
            freed += buffer.byte_size;
        }
        tracing::debug!(device = self.device.0, buffers = victims.len(), bytes = freed, "pool trimmed");
        metrics::counter!("gg_devmem_pool_reclaimed_total", "device" => self.device.to_string())
            .increment(victims.len() as u64);
        self.publish_reserved();
        freed
    }

    fn publish_reserved(&self) {
        let reserved = lock_or_recover(&self.pool).reserved_bytes();
        metrics::gauge!("gg_devmem_pool_reserved_bytes", "device" => self.device.to_string())
            .set(reserved as f64);
    }

    /// Ask the device for a new block, applying the out-of-memory policy.
    fn acquire_block(&self, byte_size: usize) -> Result<DevicePtr, AllocError> {
        let first = self.runtime.acquire(self.device, byte_size);
        let result = match first {
            Err(DeviceError::OutOfMemory { .. }) if self.config.oom_policy == OomPolicy::Report => {
                let released = self.empty_cache();
                tracing::warn!(
                    device = self.device.0,
                    bytes = byte_size,
                    released,
                    "device out of memory, retrying after emptying cache"
                );
                self.runtime.acquire(self.device, byte_size)
            }
            other => other,
        };

        result.map_err(|source| {
            let err = match source {
                DeviceError::OutOfMemory { .. } => {
                    AllocError::OutOfMemory { device: self.device, requested: byte_size, source }
                }
                other => AllocError::Device(other),
            };
            match self.config.oom_policy {
                OomPolicy::Fatal => fault(err),
                OomPolicy::Report => err,
            }
        })
    }
}

impl DeviceAllocator for GpuCachingAllocator {
    fn device_type(&self) -> DeviceKind {
        DeviceKind::Cuda
    }

    fn allocate(&self, byte_size: usize) -> Result<DevicePtr, AllocError> {
        if byte_size == 0 {
            fault(AllocError::ZeroSize);
        }
        let class = self.size_class(byte_size);
        let slack = match class {
            SizeClass::Small => None,
            SizeClass::Big => Some(self.config.big_reuse_slack),
        };

        let hit = lock_or_recover(&self.pool).take_best_fit(class, byte_size, slack);
        if let Some(ptr) = hit {
            tracing::trace!(device = self.device.0, bytes = byte_size, addr = %ptr, "pool hit");
            metrics::counter!("gg_devmem_pool_hits_total", "device" => self.device.to_string())
                .increment(1);
            return Ok(ptr);
        }

        let block_size = match class {
            SizeClass::Small => self.config.round_small(byte_size),
            SizeClass::Big => byte_size,
        };
        let ptr = self.acquire_block(block_size)?;
        lock_or_recover(&self.pool).insert_busy(class, ptr, block_size);

        tracing::debug!(
            device = self.device.0,
            bytes = byte_size,
            block = block_size,
            class = ?class,
            addr = %ptr,
            "pool miss, acquired new block"
        );
        metrics::counter!("gg_devmem_pool_misses_total", "device" => self.device.to_string())
            .increment(1);
        self.publish_reserved();
        Ok(ptr)
    }

    fn release(&self, ptr: DevicePtr) {
        if ptr.is_null() {
            fault(AllocError::NullPointer("release"));
        }
        let outcome = {
            let mut pool = lock_or_recover(&self.pool);
            pool.mark_free(ptr).map(|()| {
                if pool.idle_count() > self.config.trim_threshold {
                    pool.take_trim_victims(self.config.trim_threshold)
                } else {
                    Vec::new()
                }
            })
        };
        match outcome {
            Ok(victims) => {
                tracing::trace!(device = self.device.0, addr = %ptr, "pool release");
                self.free_blocks(victims);
            }
            Err(err) => fault(err),
        }
    }

    fn runtime(&self) -> Option<&dyn DeviceRuntime> {
        Some(self.runtime.as_ref())
    }
}

impl Drop for GpuCachingAllocator {
    fn drop(&mut self) {
        let pool = self.pool.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        let leaked: Vec<(DevicePtr, usize)> =
            pool.busy_buffers().map(|b| (b.ptr, b.byte_size)).collect();
        let idle = pool.take_all_idle();

        for (ptr, bytes) in &leaked {
            tracing::warn!(device = self.device.0, addr = %ptr, bytes, "busy buffer leaked at allocator drop");
        }
        for buffer in idle {
            // SAFETY: idle blocks are not referenced by any caller.
            if let Err(e) = unsafe { self.runtime.release(self.device, buffer.ptr) } {
                tracing::error!(device = self.device.0, error = %e, "failed to free block at drop");
            }
        }
    }
}

#[cfg(test)]
#[path = "caching_tests.rs"]
mod tests;
