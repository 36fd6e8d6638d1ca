// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Shared allocator instances per device kind and device id.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use super::allocator::DeviceAllocator;
use super::caching::{GpuCachingAllocator, PoolStats};
use super::host::HostAllocator;
use crate::config::AllocatorConfig;
use crate::device::{DeviceId, DeviceKind, DeviceRuntime};
use crate::error::AllocError;

/// Hands out one shared allocator per device.
///
/// Instances are created on first use. The factory is passed to consumers
/// explicitly; there is no process-wide instance.
pub struct AllocatorFactory {
    runtime: Arc<dyn DeviceRuntime>,
    config: AllocatorConfig,
    host: OnceLock<Arc<HostAllocator>>,
    gpus: DashMap<DeviceId, Arc<GpuCachingAllocator>>,
}

impl AllocatorFactory {
    pub fn new(runtime: Arc<dyn DeviceRuntime>, config: AllocatorConfig) -> Result<Self, AllocError> {
        config.validate()?;
        Ok(Self { runtime, config, host: OnceLock::new(), gpus: DashMap::new() })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn device_count(&self) -> usize {
        self.runtime.device_count()
    }

    /// The shared host allocator. It carries the factory's runtime.
    pub fn host(&self) -> Arc<HostAllocator> {
        self.host
            .get_or_init(|| Arc::new(HostAllocator::with_runtime(self.runtime.clone())))
            .clone()
    }

    /// The shared caching allocator for `device`.
    pub fn gpu(&self, device: DeviceId) -> Result<Arc<GpuCachingAllocator>, AllocError> {
        if let Some(existing) = self.gpus.get(&device) {
            return Ok(existing.value().clone());
        }
        let entry = self.gpus.entry(device).or_try_insert_with(|| {
            GpuCachingAllocator::new(self.runtime.clone(), device, self.config.clone()).map(Arc::new)
        })?;
        tracing::info!(device = device.0, runtime = self.runtime.name(), "GPU allocator ready");
        Ok(entry.value().clone())
    }

    /// Allocator for `kind`; `device` is ignored for the host.
    pub fn for_kind(
        &self,
        kind: DeviceKind,
        device: DeviceId,
    ) -> Result<Arc<dyn DeviceAllocator>, AllocError> {
        match kind {
            DeviceKind::Cpu => Ok(self.host()),
            DeviceKind::Cuda => Ok(self.gpu(device)?),
            DeviceKind::Unknown => Err(AllocError::UnsupportedDevice(kind)),
        }
    }

    /// Stats of every GPU allocator created so far, ordered by device.
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.gpus.iter().map(|e| e.value().stats()).collect();
        stats.sort_by_key(|s| s.device);
        stats
    }

    /// Empty every GPU pool. Returns the total bytes released.
    pub fn empty_cache(&self) -> usize {
        let allocators: Vec<Arc<GpuCachingAllocator>> =
            self.gpus.iter().map(|e| e.value().clone()).collect();
        allocators.iter().map(|a| a.empty_cache()).sum()
    }
}
