//! Sample buffering: the per-cycle block type and the training-data cache.
//!
//! The real-time thread writes into [`SampleCache`] with `try_lock` only;
//! the training thread blocks on `lock` and exports once the cache is full.

pub mod cache;
pub mod chunk;

pub use cache::{CacheHandle, SampleCache};
pub use chunk::MultiChannelBuffer;
