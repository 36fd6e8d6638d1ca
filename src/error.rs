// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Error types for the allocators and the device primitive.
//!
//! Recoverable conditions are returned as [`AllocError`]. Invariant
//! violations go through [`fault`], which logs and panics.

use thiserror::Error;

use crate::device::{DeviceId, DeviceKind, DevicePtr};

/// Errors reported by a [`DeviceRuntime`](crate::device::DeviceRuntime).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device out of memory: required {required} bytes, available {available} bytes")]
    OutOfMemory { required: usize, available: usize },

    #[error("Device not found: {0}")]
    DeviceNotFound(i32),

    #[error("Device address {0} is not a live block")]
    InvalidAddress(DevicePtr),

    #[error("Driver error: {0}")]
    Driver(String),
}

/// Errors reported by the allocators.
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("Allocation size must be > 0")]
    ZeroSize,

    #[error("Null pointer passed as {0}")]
    NullPointer(&'static str),

    #[error("Unknown memcpy kind: {0}")]
    UnknownMemcpyKind(i32),

    #[error("Out of memory on device {device}: requested {requested} bytes")]
    OutOfMemory {
        device: DeviceId,
        requested: usize,
        #[source]
        source: DeviceError,
    },

    #[error("Pointer {ptr} is not owned by the allocator for device {device}")]
    UnknownPointer { device: DeviceId, ptr: DevicePtr },

    #[error("Double release of pointer {ptr} on device {device}")]
    DoubleRelease { device: DeviceId, ptr: DevicePtr },

    #[error("Invalid device id {device}: runtime has {count} device(s)")]
    InvalidDevice { device: DeviceId, count: usize },

    #[error("Unsupported device kind: {0}")]
    UnsupportedDevice(DeviceKind),

    #[error("No device runtime attached for {0} copy")]
    NoRuntime(crate::device::MemcpyKind),

    #[error("Device operation failed: {0}")]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Abort the current operation on an invariant violation.
///
/// Continuing after one of these would mean operating on corrupted or
/// undefined memory state, so the error is logged and the thread panics.
#[track_caller]
pub fn fault(err: AllocError) -> ! {
    tracing::error!(error = %err, "device memory fault");
    panic!("{}", err)
}
