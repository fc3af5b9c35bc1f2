//! # ica-core
//!
//! Real-time ICA artifact rejection for multichannel electrophysiology
//! streams.
//!
//! ## Architecture
//!
//! ```text
//! host buffer ──► RealtimeApplier::process (audio thread, never blocks)
//!                   │ every stride-th sample          │ remix enabled channels
//!                   ▼                                  ▼
//!             SampleCache (ring)            SynchronizedOperation (mixing, unmixing)
//!                   │ full                             ▲ atomic swap
//!                   ▼                                  │
//!       training thread: export ─► solver (process/thread) ─► ingest ─► install
//!                   │
//!                   └─► broadcast::Sender<TrainingStatusEvent>
//! ```
//!
//! One `SampleCache` and one `SynchronizedOperation` exist per subprocessor,
//! so training on one stream never stalls processing of another.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod compute;
pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod operation;
pub mod persist;

// Convenience re-exports for downstream crates
pub use buffering::{MultiChannelBuffer, SampleCache};
pub use compute::{ChildProcessLauncher, LauncherHandle, SolverLauncher, ThreadLauncher};
pub use config::IcaConfig;
pub use engine::{
    ChannelInfo, IcaNode, RealtimeApplier, SubprocessorId, TrainingOutcome, TrainingRequest,
};
pub use error::{IcaError, Result};
pub use ipc::events::{TrainingStatus, TrainingStatusEvent};
pub use operation::{IcaOperation, Matrix, SynchronizedOperation};
pub use persist::NodeState;
