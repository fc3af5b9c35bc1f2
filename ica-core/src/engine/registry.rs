//! Subprocessor bookkeeping, rebuilt whenever the upstream channel layout
//! changes.
//!
//! Cache and operation slots are `Arc`-shared so that a subprocessor id which
//! survives a rebuild keeps its collected data, its current operation and any
//! training run that already holds a reference to them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::buffering::SampleCache;
use crate::config::IcaConfig;
use crate::operation::SynchronizedOperation;

/// `(source id, sub index)` of an upstream data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubprocessorId {
    pub source_id: u16,
    pub sub_index: u16,
}

impl SubprocessorId {
    pub fn new(source_id: u16, sub_index: u16) -> Self {
        Self {
            source_id,
            sub_index,
        }
    }

    /// Both halves packed into one integer, source id in the high bits.
    pub fn full_id(self) -> u32 {
        (u32::from(self.source_id) << 16) | u32::from(self.sub_index)
    }

    pub fn from_full_id(full_id: u32) -> Self {
        Self::new((full_id >> 16) as u16, (full_id & 0xffff) as u16)
    }
}

impl fmt::Display for SubprocessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_id, self.sub_index)
    }
}

/// What the host reports about one input channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub source_id: u16,
    pub sub_index: u16,
    pub source_name: String,
    pub sample_rate: f32,
}

impl ChannelInfo {
    pub fn subprocessor_id(&self) -> SubprocessorId {
        SubprocessorId::new(self.source_id, self.sub_index)
    }
}

#[derive(Debug)]
pub struct Subprocessor {
    pub id: SubprocessorId,
    pub source_name: String,
    pub sample_rate: f32,
    /// Indices into the node's full channel set, in input order.
    pub channels: Vec<usize>,
    pub downsample_stride: usize,
    pub cache: Arc<SampleCache>,
    pub operation: Arc<SynchronizedOperation>,
    /// Offset of the next sample to cache within the next buffer.
    /// Only the real-time thread writes it.
    phase: Arc<AtomicUsize>,
}

impl Subprocessor {
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Reshape the cache for the current channel count and training
    /// duration, and drop an operation that addresses channels no longer
    /// present. Blocks on the cache and operation locks.
    pub fn reconcile(&self, config: &IcaConfig) {
        let capacity = config.training_samples(self.sample_rate);
        {
            let mut cache = self.cache.lock();
            if cache.num_channels() != self.channels.len() {
                cache.reset_with_size(self.channels.len(), capacity);
            } else if cache.capacity() != capacity {
                cache.resize_keeping_data(capacity);
            }
        }
        if self.operation.discard_if_needs_more_than(self.channels.len()) {
            warn!(
                subprocessor = %self.id,
                channels = self.channels.len(),
                "ICA operation needs more channels than remain; reset to no-op"
            );
        }
    }

    pub(crate) fn phase(&self) -> usize {
        self.phase.load(Ordering::Relaxed)
    }

    pub(crate) fn set_phase(&self, phase: usize) {
        self.phase.store(phase, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct SubprocessorRegistry {
    subprocessors: BTreeMap<SubprocessorId, Arc<Subprocessor>>,
}

impl SubprocessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Regroup `channels` and bring every cache and operation in line, in
    /// place. [`IcaNode`](crate::IcaNode) uses [`regroup`](Self::regroup) and
    /// [`Subprocessor::reconcile`] separately so the swap is all that happens
    /// under its registry lock.
    pub fn rebuild(&mut self, channels: &[ChannelInfo], config: &IcaConfig) {
        let next = self.regroup(channels, config);
        for sub in next.iter() {
            sub.reconcile(config);
        }
        *self = next;
    }

    /// A new registry for `channels`. Ids that persist share cache, operation
    /// and decimation phase with `self`; ids that vanished are dropped.
    ///
    /// Takes no cache or operation lock. Persisting subprocessors may come out
    /// with a cache of the wrong shape until [`Subprocessor::reconcile`] runs.
    pub fn regroup(&self, channels: &[ChannelInfo], config: &IcaConfig) -> Self {
        let mut groups: BTreeMap<SubprocessorId, (&ChannelInfo, Vec<usize>)> = BTreeMap::new();
        for (index, info) in channels.iter().enumerate() {
            groups
                .entry(info.subprocessor_id())
                .or_insert_with(|| (info, Vec::new()))
                .1
                .push(index);
        }

        let mut next = BTreeMap::new();
        for (id, (info, chans)) in groups {
            let stride = config.downsample_stride(info.sample_rate);
            let sub = match self.subprocessors.get(&id) {
                Some(old) => Subprocessor {
                    id,
                    source_name: info.source_name.clone(),
                    sample_rate: info.sample_rate,
                    channels: chans,
                    downsample_stride: stride,
                    cache: Arc::clone(&old.cache),
                    operation: Arc::clone(&old.operation),
                    phase: Arc::clone(&old.phase),
                },
                None => {
                    let capacity = config.training_samples(info.sample_rate);
                    debug!(subprocessor = %id, channels = chans.len(), capacity, "new subprocessor");
                    Subprocessor {
                        id,
                        source_name: info.source_name.clone(),
                        sample_rate: info.sample_rate,
                        cache: Arc::new(SampleCache::new(chans.len(), capacity)),
                        channels: chans,
                        downsample_stride: stride,
                        operation: Arc::new(SynchronizedOperation::new()),
                        phase: Arc::new(AtomicUsize::new(0)),
                    }
                }
            };
            next.insert(id, Arc::new(sub));
        }

        for id in self.subprocessors.keys().filter(|id| !next.contains_key(*id)) {
            debug!(subprocessor = %id, "subprocessor removed");
        }
        info!(subprocessors = next.len(), "subprocessor registry rebuilt");
        Self {
            subprocessors: next,
        }
    }

    pub fn get(&self, id: SubprocessorId) -> Option<&Arc<Subprocessor>> {
        self.subprocessors.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Subprocessor>> {
        self.subprocessors.values()
    }

    pub fn ids(&self) -> Vec<SubprocessorId> {
        self.subprocessors.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.subprocessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subprocessors.is_empty()
    }
}
