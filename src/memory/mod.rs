// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Device memory allocators.
//!
//! Split into submodules:
//! - `allocator` - the `DeviceAllocator` contract with memcpy/memset dispatch
//! - `host` - non-pooling host heap allocator
//! - `caching` / `caching_types` - pooled GPU allocator and its pool state
//! - `factory` - shared instances per device

pub mod allocator;
pub mod caching;
mod caching_types;
pub mod factory;
pub mod host;

pub use allocator::DeviceAllocator;
pub use caching::{GpuCachingAllocator, PoolStats};
pub use caching_types::{MemoryBuffer, SizeClass};
pub use factory::AllocatorFactory;
pub use host::HostAllocator;

#[cfg(test)]
#[path = "allocator_tests.rs"]
mod tests;
