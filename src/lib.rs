// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! GG-CORE device memory management.
//!
//! Two allocators behind one [`DeviceAllocator`] contract:
//! - [`HostAllocator`] passes straight through to the C heap
//! - [`GpuCachingAllocator`] pools device blocks per device and only calls
//!   the device primitive on a pool miss
//!
//! The device primitive itself is the [`DeviceRuntime`] trait. The crate ships
//! an in-process [`EmulatedDevice`] and, with the `cuda` feature, a cudarc
//! backed `CudaRuntime`.
//!
//! Recoverable failures come back as [`AllocError`]; contract violations
//! (zero-size requests, double release, unknown copy kinds) panic.

pub mod config;
pub mod device;
pub mod error;
pub mod memory;
pub mod status;
pub mod telemetry;

pub use config::{AllocatorConfig, ConfigError, OomPolicy};
pub use device::{
    DeviceId, DeviceKind, DevicePtr, DeviceRuntime, EmulatedDevice, EmulatedDeviceConfig,
    MemcpyKind, StreamHandle,
};
pub use error::{AllocError, DeviceError};
pub use memory::{
    AllocatorFactory, DeviceAllocator, GpuCachingAllocator, HostAllocator, PoolStats, SizeClass,
};
pub use status::{Status, StatusCode};

#[cfg(feature = "cuda")]
pub use device::CudaRuntime;
