// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Device identity, address and stream types shared by every allocator.
//!
//! The underlying allocation primitive lives behind [`DeviceRuntime`]:
//! - `emulated` - host-memory-backed device for tests and CPU-only hosts
//! - `cuda` - CUDA driver API via `cudarc` (feature `cuda`)

pub mod emulated;
pub mod runtime;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use emulated::{EmulatedDevice, EmulatedDeviceConfig, EmulatedDeviceStats};
pub use runtime::DeviceRuntime;

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;

use std::fmt;

use crate::error::AllocError;

/// Kind of device an allocator serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Unknown = 0,
    Cpu = 1,
    Cuda = 2,
}

impl DeviceKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Unknown => write!(f, "Unknown"),
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Cuda => write!(f, "CUDA"),
        }
    }
}

/// Device ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct DeviceId(pub i32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque address on a device (or on the host for the CPU allocator).
///
/// Ordered by address so pool tie-breaks are deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn null() -> Self {
        Self(0)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn addr(self) -> u64 {
        self.0
    }

    /// Address `bytes` past this one, or `None` if it would wrap.
    pub fn offset(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes as u64).map(Self)
    }

    pub fn from_host<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    /// Reinterpret as a host pointer. Only meaningful for host-visible memory.
    pub fn as_host_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque stream handle. `None` at call sites selects the synchronous path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub usize);

/// Direction of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MemcpyKind {
    HostToHost = 0,
    HostToDevice = 1,
    DeviceToHost = 2,
    DeviceToDevice = 3,
}

impl MemcpyKind {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether either side of the copy lives on the device.
    pub fn touches_device(self) -> bool {
        !matches!(self, MemcpyKind::HostToHost)
    }
}

impl TryFrom<i32> for MemcpyKind {
    type Error = AllocError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MemcpyKind::HostToHost),
            1 => Ok(MemcpyKind::HostToDevice),
            2 => Ok(MemcpyKind::DeviceToHost),
            3 => Ok(MemcpyKind::DeviceToDevice),
            other => Err(AllocError::UnknownMemcpyKind(other)),
        }
    }
}

impl fmt::Display for MemcpyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemcpyKind::HostToHost => "host->host",
            MemcpyKind::HostToDevice => "host->device",
            MemcpyKind::DeviceToHost => "device->host",
            MemcpyKind::DeviceToDevice => "device->device",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
#[path = "device_tests.rs"]
mod tests;
