//! Multichannel sample block handed to the node once per processing cycle.

/// Channel-major block of f32 samples, one `Vec` per channel.
///
/// Every channel holds the same number of samples. The host owns the block
/// and passes it by `&mut` to [`RealtimeApplier::process`], which rewrites
/// the enabled channels in place.
///
/// [`RealtimeApplier::process`]: crate::engine::apply::RealtimeApplier::process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiChannelBuffer {
    channels: Vec<Vec<f32>>,
}

impl MultiChannelBuffer {
    /// Zero-filled block of `num_channels × num_samples`.
    pub fn new(num_channels: usize, num_samples: usize) -> Self {
        Self {
            channels: vec![vec![0.0; num_samples]; num_channels],
        }
    }

    /// Build from per-channel vectors. Channels are truncated to the
    /// shortest one so the block stays rectangular.
    pub fn from_channels(mut channels: Vec<Vec<f32>>) -> Self {
        let len = channels.iter().map(Vec::len).min().unwrap_or(0);
        for ch in &mut channels {
            ch.truncate(len);
        }
        Self { channels }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_samples(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.channels[index]
    }

    #[inline]
    pub fn sample(&self, channel: usize, index: usize) -> f32 {
        self.channels[channel][index]
    }

    pub fn into_channels(self) -> Vec<Vec<f32>> {
        self.channels
    }
}
