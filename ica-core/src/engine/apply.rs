//! Real-time path: cache training samples and remove rejected components.
//!
//! ## Per buffer, per subprocessor
//!
//! ```text
//! buffer ──► try_lock(cache) ──► every stride-th sample into the ring
//!        │        (contended: skip caching, phase still advances)
//!        └─► try_read(operation) ──► remix enabled channels in place
//!                 (contended or no-op: buffer passes through)
//! ```
//!
//! Nothing here blocks, logs or allocates once the scratch buffers have been
//! sized by [`RealtimeApplier::prepare`] or the first buffer of a given size.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffering::MultiChannelBuffer;
use crate::engine::registry::{Subprocessor, SubprocessorRegistry};
use crate::operation::IcaOperation;

/// Counters updated by the real-time thread. Read them with
/// [`ApplyDiagnostics::snapshot`].
#[derive(Debug, Default)]
pub struct ApplyDiagnostics {
    pub buffers_processed: AtomicUsize,
    pub samples_cached: AtomicUsize,
    /// Buffers whose samples were not cached because the cache was busy.
    pub cache_contended: AtomicUsize,
    /// Buffers that passed through because the operation was being replaced.
    pub operation_contended: AtomicUsize,
    /// Buffers that passed through because the registry was being rebuilt.
    pub registry_contended: AtomicUsize,
    pub operations_applied: AtomicUsize,
}

impl ApplyDiagnostics {
    pub fn reset(&self) {
        self.buffers_processed.store(0, Ordering::Relaxed);
        self.samples_cached.store(0, Ordering::Relaxed);
        self.cache_contended.store(0, Ordering::Relaxed);
        self.operation_contended.store(0, Ordering::Relaxed);
        self.registry_contended.store(0, Ordering::Relaxed);
        self.operations_applied.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ApplySnapshot {
        ApplySnapshot {
            buffers_processed: self.buffers_processed.load(Ordering::Relaxed),
            samples_cached: self.samples_cached.load(Ordering::Relaxed),
            cache_contended: self.cache_contended.load(Ordering::Relaxed),
            operation_contended: self.operation_contended.load(Ordering::Relaxed),
            registry_contended: self.registry_contended.load(Ordering::Relaxed),
            operations_applied: self.operations_applied.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplySnapshot {
    pub buffers_processed: usize,
    pub samples_cached: usize,
    pub cache_contended: usize,
    pub operation_contended: usize,
    pub registry_contended: usize,
    pub operations_applied: usize,
}

/// How the cleaned signal is reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemixMode {
    /// `x − Σ_{k rejected} M[:,k]·u_k`
    Subtractive,
    /// `Σ_{k kept} M[:,k]·u_k`
    Additive,
}

impl RemixMode {
    /// Whichever mode touches fewer components.
    pub fn for_selection(rejected: usize, components: usize) -> Self {
        if 2 * rejected > components {
            RemixMode::Additive
        } else {
            RemixMode::Subtractive
        }
    }
}

/// Owned by the host's processing thread; one per node.
pub struct RealtimeApplier {
    registry: Arc<RwLock<SubprocessorRegistry>>,
    diagnostics: Arc<ApplyDiagnostics>,
    /// One row per component, reused across buffers.
    components: Vec<Vec<f32>>,
}

impl RealtimeApplier {
    pub(crate) fn new(
        registry: Arc<RwLock<SubprocessorRegistry>>,
        diagnostics: Arc<ApplyDiagnostics>,
    ) -> Self {
        Self {
            registry,
            diagnostics,
            components: Vec::new(),
        }
    }

    /// Pre-size scratch storage so the first buffers do not allocate.
    pub fn prepare(&mut self, max_components: usize, max_block: usize) {
        ensure_scratch(&mut self.components, max_components, max_block);
    }

    /// Cache and clean one buffer holding every channel of the node.
    pub fn process(&mut self, buffer: &mut MultiChannelBuffer) {
        self.diagnostics
            .buffers_processed
            .fetch_add(1, Ordering::Relaxed);

        let Some(registry) = self.registry.try_read() else {
            self.diagnostics
                .registry_contended
                .fetch_add(1, Ordering::Relaxed);
            return;
        };

        for sub in registry.iter() {
            if sub.channels.iter().any(|&c| c >= buffer.num_channels()) {
                continue;
            }
            cache_samples(sub, buffer, &self.diagnostics);

            let Some(state) = sub.operation.try_read() else {
                self.diagnostics
                    .operation_contended
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let op = &state.operation;
            if op.is_noop() || op.required_channels() > sub.channels.len() {
                continue;
            }
            let mode = RemixMode::for_selection(op.rejected_components().len(), op.num_components());
            remix(&mut self.components, op, &sub.channels, buffer, mode);
            self.diagnostics
                .operations_applied
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Push every `stride`-th sample into the subprocessor's cache, continuing
/// the decimation phase from the previous buffer.
fn cache_samples(sub: &Subprocessor, buffer: &MultiChannelBuffer, diagnostics: &ApplyDiagnostics) {
    let n = buffer.num_samples();
    let stride = sub.downsample_stride.max(1);
    let start = sub.phase();

    // first index at or past the end of this buffer
    let end = if start < n {
        start + ((n - 1 - start) / stride + 1) * stride
    } else {
        start
    };

    let mut cache = sub.cache.try_lock();
    if cache.is_locked() {
        let mut written = 0;
        let mut t = start;
        while t < n {
            if cache.write_sample(buffer, &sub.channels, t) {
                written += 1;
            }
            t += stride;
        }
        diagnostics
            .samples_cached
            .fetch_add(written, Ordering::Relaxed);
    } else {
        diagnostics.cache_contended.fetch_add(1, Ordering::Relaxed);
    }
    sub.set_phase(end - n);
}

fn ensure_scratch(scratch: &mut Vec<Vec<f32>>, components: usize, samples: usize) {
    if scratch.len() < components {
        scratch.resize_with(components, Vec::new);
    }
    for row in scratch.iter_mut().take(components) {
        if row.len() < samples {
            row.resize(samples, 0.0);
        }
    }
}

/// Remove `op`'s rejected components from the enabled channels of `buffer`.
///
/// `channels` maps subprocessor-local indices to buffer channels. Both modes
/// give the same result up to rounding.
pub fn remix(
    scratch: &mut Vec<Vec<f32>>,
    op: &IcaOperation,
    channels: &[usize],
    buffer: &mut MultiChannelBuffer,
    mode: RemixMode,
) {
    let rejected: &BTreeSet<usize> = op.rejected_components();
    if rejected.is_empty() {
        return;
    }
    let n = buffer.num_samples();
    let n_comp = op.num_components();
    ensure_scratch(scratch, n_comp, n);

    let enabled = op.enabled_channels();
    let unmixing = op.unmixing();
    let mixing = op.mixing();
    let additive = mode == RemixMode::Additive;
    // additive works on kept components, subtractive on rejected ones
    let selected = |k: &usize| rejected.contains(k) != additive;

    for k in (0..n_comp).filter(selected) {
        let comp = &mut scratch[k][..n];
        comp.fill(0.0);
        for (j, &local) in enabled.iter().enumerate() {
            let w = unmixing[(k, j)];
            if w == 0.0 {
                continue;
            }
            let x = buffer.channel(channels[local]);
            for (c, &v) in comp.iter_mut().zip(x) {
                *c += w * v;
            }
        }
    }

    if additive {
        for &local in enabled {
            buffer.channel_mut(channels[local]).fill(0.0);
        }
    }
    let sign = if additive { 1.0 } else { -1.0 };

    for k in (0..n_comp).filter(selected) {
        let comp = &scratch[k][..n];
        for (i, &local) in enabled.iter().enumerate() {
            let m = sign * mixing[(i, k)];
            if m == 0.0 {
                continue;
            }
            let y = buffer.channel_mut(channels[local]);
            for (out, &c) in y.iter_mut().zip(comp) {
                *out += m * c;
            }
        }
    }
}
