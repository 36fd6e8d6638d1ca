// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Buffer records, per-device pool state and statistics for the caching allocator.

use std::cmp::Reverse;
use std::sync::{Mutex, MutexGuard};

use crate::device::{DeviceId, DevicePtr};
use crate::error::AllocError;

/// Acquire a mutex lock, recovering from poison if a thread panicked.
#[inline]
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Device pool mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Size class of a request. Classes never serve each other's requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Big,
}

/// One physical block acquired from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBuffer {
    pub ptr: DevicePtr,
    pub byte_size: usize,
    pub busy: bool,
    /// Pool tick of the last hit, creation or release.
    pub last_used: u64,
}

/// Snapshot of one device pool.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub device: i32,
    pub hits: u64,
    pub misses: u64,
    pub trims: u64,
    pub reclaimed_buffers: u64,
    pub reserved_bytes: usize,
    pub peak_reserved_bytes: usize,
    pub busy_bytes: usize,
    pub busy_buffers: usize,
    pub idle_buffers: usize,
    pub small_buffers: usize,
    pub big_buffers: usize,
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Pool state for one device. Every method runs under the device lock.
#[derive(Debug)]
pub(super) struct DevicePool {
    device: DeviceId,
    small: Vec<MemoryBuffer>,
    big: Vec<MemoryBuffer>,
    /// Ledger of not-busy buffers across both classes.
    idle_count: usize,
    tick: u64,
    reserved_bytes: usize,
    peak_reserved_bytes: usize,
    hits: u64,
    misses: u64,
    trims: u64,
    reclaimed: u64,
}

impl DevicePool {
    pub(super) fn new(device: DeviceId) -> Self {
        Self {
            device,
            small: Vec::new(),
            big: Vec::new(),
            idle_count: 0,
            tick: 0,
            reserved_bytes: 0,
            peak_reserved_bytes: 0,
            hits: 0,
            misses: 0,
            trims: 0,
            reclaimed: 0,
        }
    }

    pub(super) fn idle_count(&self) -> usize {
        self.idle_count
    }

    pub(super) fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn buffers_mut(&mut self, class: SizeClass) -> &mut Vec<MemoryBuffer> {
        match class {
            SizeClass::Small => &mut self.small,
            SizeClass::Big => &mut self.big,
        }
    }

    /// Claim the smallest idle buffer of `class` that fits `byte_size`.
    ///
    /// Ties on capacity go to the lowest address. With `max_slack`, a buffer
    /// is eligible only if it fits exactly or wastes strictly less than that
    /// many bytes.
    pub(super) fn take_best_fit(
        &mut self,
        class: SizeClass,
        byte_size: usize,
        max_slack: Option<usize>,
    ) -> Option<DevicePtr> {
        let tick = self.next_tick();
        let buffers = self.buffers_mut(class);
        let index = buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.busy && b.byte_size >= byte_size)
            .filter(|(_, b)| {
                let waste = b.byte_size - byte_size;
                waste == 0 || max_slack.map_or(true, |slack| waste < slack)
            })
            .min_by_key(|(_, b)| (b.byte_size, b.ptr))
            .map(|(i, _)| i)?;

        let buffer = &mut buffers[index];
        debug_assert!(!buffer.busy);
        buffer.busy = true;
        buffer.last_used = tick;
        let ptr = buffer.ptr;

        self.idle_count -= 1;
        self.hits += 1;
        Some(ptr)
    }

    /// Record a freshly acquired block as busy.
    pub(super) fn insert_busy(&mut self, class: SizeClass, ptr: DevicePtr, byte_size: usize) {
        let tick = self.next_tick();
        self.buffers_mut(class).push(MemoryBuffer { ptr, byte_size, busy: true, last_used: tick });
        self.reserved_bytes += byte_size;
        self.peak_reserved_bytes = self.peak_reserved_bytes.max(self.reserved_bytes);
        self.misses += 1;
    }

    /// Flip the buffer at `ptr` back to idle.
    ///
    /// Nothing is modified when the address is unknown or already idle.
    pub(super) fn mark_free(&mut self, ptr: DevicePtr) -> Result<(), AllocError> {
        let device = self.device;
        let tick = self.tick + 1;
        let buffer = self
            .small
            .iter_mut()
            .chain(self.big.iter_mut())
            .find(|b| b.ptr == ptr)
            .ok_or(AllocError::UnknownPointer { device, ptr })?;
        if !buffer.busy {
            return Err(AllocError::DoubleRelease { device, ptr });
        }
        buffer.busy = false;
        buffer.last_used = tick;
        self.tick = tick;
        self.idle_count += 1;
        Ok(())
    }

    pub(super) fn contains(&self, ptr: DevicePtr) -> bool {
        self.small.iter().chain(self.big.iter()).any(|b| b.ptr == ptr)
    }

    /// Remove idle buffers until fewer than `threshold` remain idle.
    ///
    /// Victims come from the big pool first, least recently used first, larger
    /// first on equal recency. Busy buffers are never selected.
    pub(super) fn take_trim_victims(&mut self, threshold: usize) -> Vec<MemoryBuffer> {
        let keep = threshold.saturating_sub(1);
        let excess = self.idle_count.saturating_sub(keep);
        if excess == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(u8, u64, Reverse<usize>, DevicePtr)> = self
            .big
            .iter()
            .map(|b| (0u8, b))
            .chain(self.small.iter().map(|b| (1u8, b)))
            .filter(|(_, b)| !b.busy)
            .map(|(rank, b)| (rank, b.last_used, Reverse(b.byte_size), b.ptr))
            .collect();
        candidates.sort_unstable();
        candidates.truncate(excess);

        let chosen: Vec<DevicePtr> = candidates.into_iter().map(|(_, _, _, ptr)| ptr).collect();
        self.trims += 1;
        self.remove_idle(|b| chosen.contains(&b.ptr))
    }

    /// Remove every idle buffer.
    pub(super) fn take_all_idle(&mut self) -> Vec<MemoryBuffer> {
        self.remove_idle(|_| true)
    }

    /// Busy buffers left in the pool, for leak reporting.
    pub(super) fn busy_buffers(&self) -> impl Iterator<Item = &MemoryBuffer> {
        self.small.iter().chain(self.big.iter()).filter(|b| b.busy)
    }

    fn remove_idle<F>(&mut self, pick: F) -> Vec<MemoryBuffer>
    where
        F: Fn(&MemoryBuffer) -> bool,
    {
        let mut removed = Vec::new();
        for class in [SizeClass::Big, SizeClass::Small] {
            let buffers = self.buffers_mut(class);
            let mut i = 0;
            while i < buffers.len() {
                if !buffers[i].busy && pick(&buffers[i]) {
                    removed.push(buffers.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for buffer in &removed {
            self.reserved_bytes -= buffer.byte_size;
        }
        self.idle_count -= removed.len();
        self.reclaimed += removed.len() as u64;
        removed
    }

    pub(super) fn stats(&self) -> PoolStats {
        let all = || self.small.iter().chain(self.big.iter());
        PoolStats {
            device: self.device.0,
            hits: self.hits,
            misses: self.misses,
            trims: self.trims,
            reclaimed_buffers: self.reclaimed,
            reserved_bytes: self.reserved_bytes,
            peak_reserved_bytes: self.peak_reserved_bytes,
            busy_bytes: all().filter(|b| b.busy).map(|b| b.byte_size).sum(),
            busy_buffers: all().filter(|b| b.busy).count(),
            idle_buffers: self.idle_count,
            small_buffers: self.small.len(),
            big_buffers: self.big.len(),
        }
    }
}
