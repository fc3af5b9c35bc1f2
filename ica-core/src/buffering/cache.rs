//! Circular training-data cache, one per subprocessor.
//!
//! # Locking
//!
//! The sample storage sits behind a `parking_lot::Mutex` and is only reachable
//! through a [`CacheHandle`]:
//!
//! - [`SampleCache::lock`] blocks until the mutex is held. Used by the
//!   training thread and by UI-triggered resets.
//! - [`SampleCache::try_lock`] never blocks. Used by the real-time thread;
//!   if the mutex is contended the handle is empty and every operation on it
//!   is a no-op.
//!
//! Fullness and capacity are mirrored into atomics on every mutation, so the
//! training thread can poll [`SampleCache::is_full`] and
//! [`SampleCache::capacity`] without touching the mutex at all.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::buffering::chunk::MultiChannelBuffer;
use crate::error::{IcaError, Result};

/// Ring storage. `data` is channel-major: `data[ch * capacity + slot]`.
#[derive(Debug)]
struct CacheState {
    data: Vec<f32>,
    num_channels: usize,
    capacity: usize,
    write_pos: usize,
    count: usize,
}

impl CacheState {
    fn new(num_channels: usize, capacity: usize) -> Self {
        Self {
            data: vec![0.0; num_channels * capacity],
            num_channels,
            capacity,
            write_pos: 0,
            count: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.capacity > 0 && self.count == self.capacity
    }

    /// Slot of the oldest valid sample.
    fn start_slot(&self) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        (self.write_pos + self.capacity - self.count) % self.capacity
    }

    #[inline]
    fn slot_of(&self, logical: usize) -> usize {
        (self.start_slot() + logical) % self.capacity
    }

    fn write_sample(
        &mut self,
        source: &MultiChannelBuffer,
        channel_map: &[usize],
        sample_index: usize,
    ) -> bool {
        if self.capacity == 0 || channel_map.len() != self.num_channels {
            return false;
        }
        let pos = self.write_pos;
        for (ch, &src) in channel_map.iter().enumerate() {
            self.data[ch * self.capacity + pos] = source.sample(src, sample_index);
        }
        self.write_pos = (pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
        true
    }

    fn resize_keeping_data(&mut self, new_capacity: usize) {
        if new_capacity == self.capacity {
            return;
        }
        let keep = self.count.min(new_capacity);
        let dropped = self.count - keep;
        let mut data = vec![0.0; self.num_channels * new_capacity];
        for ch in 0..self.num_channels {
            for i in 0..keep {
                let slot = self.slot_of(dropped + i);
                data[ch * new_capacity + i] = self.data[ch * self.capacity + slot];
            }
        }
        self.data = data;
        self.capacity = new_capacity;
        self.count = keep;
        self.write_pos = if new_capacity == 0 {
            0
        } else {
            keep % new_capacity
        };
    }

    fn channel_in_order(&self, ch: usize) -> Vec<f32> {
        (0..self.count)
            .map(|i| self.data[ch * self.capacity + self.slot_of(i)])
            .collect()
    }
}

/// Lock-protected ring of downsampled training samples.
#[derive(Debug)]
pub struct SampleCache {
    state: Mutex<CacheState>,
    full: AtomicBool,
    capacity: AtomicUsize,
}

impl SampleCache {
    pub fn new(num_channels: usize, capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::new(num_channels, capacity)),
            full: AtomicBool::new(false),
            capacity: AtomicUsize::new(capacity),
        }
    }

    /// Lock-free fullness probe. Monotonic until the next reset or resize.
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    /// Lock-free capacity probe, current as of the last resize.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Block until the cache mutex is held.
    pub fn lock(&self) -> CacheHandle<'_> {
        CacheHandle {
            state: Some(self.state.lock()),
            full: &self.full,
            capacity: &self.capacity,
        }
    }

    /// Attempt to take the cache mutex without blocking.
    ///
    /// Check [`CacheHandle::is_locked`]; an unlocked handle ignores writes.
    pub fn try_lock(&self) -> CacheHandle<'_> {
        CacheHandle {
            state: self.state.try_lock(),
            full: &self.full,
            capacity: &self.capacity,
        }
    }
}

/// Scoped access to a [`SampleCache`]. Releases the mutex on drop.
pub struct CacheHandle<'a> {
    state: Option<MutexGuard<'a, CacheState>>,
    full: &'a AtomicBool,
    capacity: &'a AtomicUsize,
}

impl CacheHandle<'_> {
    pub fn is_locked(&self) -> bool {
        self.state.is_some()
    }

    /// Number of valid samples, 0 when not locked.
    pub fn len(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.capacity)
    }

    pub fn num_channels(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.num_channels)
    }

    pub fn is_full(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.is_full())
    }

    /// Forget all samples without reallocating.
    pub fn reset(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.write_pos = 0;
            state.count = 0;
        }
        self.sync_full();
    }

    /// Reallocate storage for a new shape, discarding data.
    pub fn reset_with_size(&mut self, num_channels: usize, capacity: usize) {
        if let Some(state) = self.state.as_mut() {
            **state = CacheState::new(num_channels, capacity);
        }
        self.sync_full();
    }

    /// Copy sample `sample_index` of the channels named by `channel_map`
    /// into the next ring slot, overwriting the oldest sample when full.
    ///
    /// Returns `false` if the handle is unlocked, the cache has no capacity,
    /// or `channel_map` does not match the cache's channel count.
    pub fn write_sample(
        &mut self,
        source: &MultiChannelBuffer,
        channel_map: &[usize],
        sample_index: usize,
    ) -> bool {
        let written = self
            .state
            .as_mut()
            .is_some_and(|s| s.write_sample(source, channel_map, sample_index));
        if written {
            self.sync_full();
        }
        written
    }

    /// Change capacity, keeping the newest samples that fit.
    pub fn resize_keeping_data(&mut self, new_capacity: usize) {
        if let Some(state) = self.state.as_mut() {
            state.resize_keeping_data(new_capacity);
        }
        self.sync_full();
    }

    /// Samples of one channel, oldest first.
    pub fn channel_in_order(&self, channel: usize) -> Option<Vec<f32>> {
        let state = self.state.as_ref()?;
        (channel < state.num_channels).then(|| state.channel_in_order(channel))
    }

    /// Write the given channels to `path` as interleaved little-endian f32
    /// frames, oldest to newest. Returns the number of frames written.
    ///
    /// # Errors
    /// - `LockContended` if the handle is unlocked.
    /// - `CacheNotFull` if the ring has not filled yet.
    /// - `InvalidChannel` for an out-of-range channel.
    /// - `Io` on open/write failure.
    pub fn export_channels_to_file(&self, path: &Path, channels: &[usize]) -> Result<usize> {
        let state = self.state.as_ref().ok_or(IcaError::LockContended)?;
        if !state.is_full() {
            return Err(IcaError::CacheNotFull);
        }
        if let Some(&bad) = channels.iter().find(|&&c| c >= state.num_channels) {
            return Err(IcaError::InvalidChannel {
                index: bad,
                available: state.num_channels,
            });
        }

        let file = File::create(path).map_err(|e| IcaError::io(path, e))?;
        let mut out = BufWriter::new(file);
        for i in 0..state.count {
            let slot = state.slot_of(i);
            for &ch in channels {
                let v = state.data[ch * state.capacity + slot];
                out.write_all(&v.to_le_bytes())
                    .map_err(|e| IcaError::io(path, e))?;
            }
        }
        out.flush().map_err(|e| IcaError::io(path, e))?;
        Ok(state.count)
    }

    fn sync_full(&self) {
        if let Some(state) = self.state.as_ref() {
            self.capacity.store(state.capacity, Ordering::Release);
            self.full.store(state.is_full(), Ordering::Release);
        }
    }
}
