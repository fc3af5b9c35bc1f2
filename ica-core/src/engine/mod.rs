//! `IcaNode`: the node-level context shared by the host's UI, processing
//! and training threads.
//!
//! ## Threads
//!
//! ```text
//! UI / control ──► IcaNode ──┬─► registry (RwLock)  ◄── try_read ── RealtimeApplier (audio)
//!                            │      └─ per subprocessor: cache, operation
//!                            └─► training worker (std::thread, single flight)
//!                                   └─► status broadcast ──► subscribers
//! ```
//!
//! `IcaNode` is `Send + Sync`; wrap it in an `Arc` to share it. The audio
//! thread never calls into `IcaNode` directly: it owns a [`RealtimeApplier`]
//! obtained from [`IcaNode::realtime_applier`], which only uses non-blocking
//! lock attempts.

pub mod apply;
pub mod cancel;
pub mod registry;
mod status;
pub mod training;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::compute::{LauncherHandle, SolverConfig};
use crate::config::IcaConfig;
use crate::error::{IcaError, Result};
use crate::ipc::events::{TrainingStatus, TrainingStatusEvent};
use crate::operation::OperationState;
use crate::persist::{self, NodeState, PersistedOperation};

pub use apply::{ApplyDiagnostics, ApplySnapshot, RealtimeApplier, RemixMode};
pub use cancel::CancelToken;
pub use registry::{ChannelInfo, Subprocessor, SubprocessorId, SubprocessorRegistry};
pub use training::{StageError, TrainingOutcome, TrainingRequest, TrainingRunInfo};

use status::StatusReporter;
use training::TrainingContext;

/// The running (or finished, not yet joined) run. Stays in the node's slot
/// until joined so that it keeps blocking new runs and stays cancellable.
struct TrainingWorker {
    run: u64,
    subprocessor: SubprocessorId,
    cancel: CancelToken,
    /// Disconnects when the training thread drops its sender on exit.
    done: Receiver<()>,
    handle: JoinHandle<TrainingOutcome>,
}

impl TrainingWorker {
    fn join(self) -> TrainingOutcome {
        self.handle
            .join()
            .unwrap_or_else(|_| TrainingOutcome::Failed("training thread panicked".into()))
    }
}

/// Result of [`IcaNode::restore_state`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RestoreReport {
    pub restored: Vec<SubprocessorId>,
    pub failed: Vec<(SubprocessorId, String)>,
}

pub struct IcaNode {
    config: RwLock<IcaConfig>,
    registry: Arc<RwLock<SubprocessorRegistry>>,
    launcher: LauncherHandle,
    status: StatusReporter,
    training: Mutex<Option<TrainingWorker>>,
    runs: AtomicU64,
    /// Serializes topology updates; never taken by the audio path.
    topology: Mutex<()>,
    diagnostics: Arc<ApplyDiagnostics>,
}

impl IcaNode {
    pub fn new(mut config: IcaConfig, launcher: LauncherHandle) -> Self {
        config.normalize();
        Self {
            config: RwLock::new(config),
            registry: Arc::new(RwLock::new(SubprocessorRegistry::new())),
            launcher,
            status: StatusReporter::new(),
            training: Mutex::new(None),
            runs: AtomicU64::new(0),
            topology: Mutex::new(()),
            diagnostics: Arc::new(ApplyDiagnostics::default()),
        }
    }

    pub fn config(&self) -> IcaConfig {
        self.config.read().clone()
    }

    /// Rebuild subprocessors for a new channel layout. Call from the
    /// host's (non-real-time) update path.
    ///
    /// The registry write lock covers only the map swap. Caches and
    /// operations are reshaped afterwards, so a cache held by a training
    /// export delays this call but not the audio thread.
    pub fn update_topology(&self, channels: &[ChannelInfo]) {
        let _topology = self.topology.lock();
        let config = self.config.read().clone();
        let next = self.registry.read().regroup(channels, &config);
        let subs: Vec<Arc<Subprocessor>> = next.iter().cloned().collect();
        *self.registry.write() = next;
        for sub in &subs {
            sub.reconcile(&config);
        }
    }

    /// The processing-thread half of the node.
    pub fn realtime_applier(&self) -> RealtimeApplier {
        RealtimeApplier::new(Arc::clone(&self.registry), Arc::clone(&self.diagnostics))
    }

    pub fn subprocessor_ids(&self) -> Vec<SubprocessorId> {
        self.registry.read().ids()
    }

    pub fn subprocessor(&self, id: SubprocessorId) -> Option<Arc<Subprocessor>> {
        self.registry.read().get(id).cloned()
    }

    /// Current subprocessors, without holding the registry lock afterwards.
    fn subprocessor_list(&self) -> Vec<Arc<Subprocessor>> {
        self.registry.read().iter().cloned().collect()
    }

    fn require(&self, id: SubprocessorId) -> Result<Arc<Subprocessor>> {
        self.subprocessor(id)
            .ok_or_else(|| IcaError::UnknownSubprocessor(id.to_string()))
    }

    // ── Training ─────────────────────────────────────────────────────────────

    /// Start a background training run.
    ///
    /// # Errors
    /// - `AlreadyTraining` while another run is in progress.
    /// - `NoSubprocessor` / `UnknownSubprocessor` / `TooFewChannels` /
    ///   `InvalidChannel` for a bad request. No run is started.
    pub fn start_training(&self, request: TrainingRequest) -> Result<()> {
        let mut slot = self.training.lock();
        if slot.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Err(IcaError::AlreadyTraining);
        }
        if let Some(finished) = slot.take() {
            let _ = finished.join();
        }

        let subprocessor = match training::validate_request(&self.registry.read(), &request) {
            Ok(sub) => sub,
            Err(e) => {
                self.status.report(
                    Some(request.subprocessor),
                    TrainingStatus::Failed,
                    Some(e.to_string()),
                );
                return Err(e);
            }
        };

        let cancel = CancelToken::new();
        let ctx = TrainingContext {
            config: self.config.read().clone(),
            launcher: self.launcher.clone(),
            cancel: cancel.clone(),
            status: self.status.clone(),
            subprocessor,
        };
        let id = request.subprocessor;
        let (done_tx, done) = crossbeam_channel::bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("ica-training".into())
            .spawn(move || {
                let _done = done_tx;
                training::run(ctx, request)
            })
            .map_err(|e| IcaError::Other(anyhow::anyhow!("spawn training thread: {e}")))?;

        let run = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        info!(subprocessor = %id, run, "training started");
        *slot = Some(TrainingWorker {
            run,
            subprocessor: id,
            cancel,
            done,
            handle,
        });
        Ok(())
    }

    /// Ask the running training to stop at its next check point.
    ///
    /// # Errors
    /// `NotTraining` if nothing is running.
    pub fn cancel_training(&self) -> Result<()> {
        let slot = self.training.lock();
        match slot.as_ref() {
            Some(worker) if !worker.handle.is_finished() => {
                info!(subprocessor = %worker.subprocessor, "training cancel requested");
                worker.cancel.cancel();
                Ok(())
            }
            _ => Err(IcaError::NotTraining),
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Block until the current (or last) run ends and return how it ended.
    /// `None` if no run was started since the last call.
    ///
    /// The run stays in the node while this waits: it still counts as
    /// training and can still be cancelled from another thread.
    pub fn wait_for_training(&self) -> Option<TrainingOutcome> {
        let mut waited_on = None;
        loop {
            let done = {
                let mut slot = self.training.lock();
                let worker = slot.as_ref()?;
                if worker.handle.is_finished() || waited_on == Some(worker.run) {
                    let worker = slot.take()?;
                    drop(slot);
                    return Some(worker.join());
                }
                waited_on = Some(worker.run);
                worker.done.clone()
            };
            // returns once the training thread has dropped its sender
            let _ = done.recv();
        }
    }

    /// Cancel any running training and wait for it. Used when the node is
    /// disabled.
    pub fn shutdown(&self) {
        if let Some(worker) = self.training.lock().as_ref() {
            worker.cancel.cancel();
        }
        self.wait_for_training();
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<TrainingStatusEvent> {
        self.status.subscribe()
    }

    pub fn last_status(&self) -> TrainingStatusEvent {
        self.status.last()
    }

    pub fn diagnostics(&self) -> ApplySnapshot {
        self.diagnostics.snapshot()
    }

    // ── Operations ───────────────────────────────────────────────────────────

    /// Back to no-op, waiting for the audio thread to release the operation.
    pub fn reset_operation(&self, id: SubprocessorId) -> Result<()> {
        self.require(id)?.operation.reset();
        info!(subprocessor = %id, "ICA operation reset");
        Ok(())
    }

    /// Back to no-op only if the operation lock is free right now.
    pub fn try_reset_operation(&self, id: SubprocessorId) -> Result<bool> {
        Ok(self.require(id)?.operation.try_reset())
    }

    pub fn set_component_rejected(
        &self,
        id: SubprocessorId,
        component: usize,
        rejected: bool,
    ) -> Result<()> {
        self.require(id)?
            .operation
            .set_component_rejected(component, rejected)
    }

    pub fn operation(&self, id: SubprocessorId) -> Option<OperationState> {
        self.subprocessor(id).map(|sub| sub.operation.snapshot())
    }

    pub fn current_operation_path(&self, id: SubprocessorId) -> Option<PathBuf> {
        self.subprocessor(id)?.operation.config_path()
    }

    /// Reload a previous run's operation onto `id`.
    ///
    /// Out-of-range `rejected` indices fall back to rejecting component 0.
    pub fn load_operation(
        &self,
        id: SubprocessorId,
        config_path: &Path,
        rejected: &[usize],
    ) -> Result<()> {
        let sub = self.require(id)?;
        let solver = SolverConfig::read_from(config_path)?;
        if let Some(&bad) = solver
            .enabled_channels
            .iter()
            .find(|&&c| c >= sub.num_channels())
        {
            return Err(IcaError::InvalidChannel {
                index: bad,
                available: sub.num_channels(),
            });
        }

        let files = self.config.read().files.clone();
        let mut op = persist::load_operation(config_path, &files)?;
        op.set_rejected_components(rejected.iter().copied());
        sub.operation
            .install(OperationState::new(op, Some(config_path.to_path_buf())));
        info!(subprocessor = %id, config = %config_path.display(), "ICA operation loaded");
        Ok(())
    }

    // ── Cache ────────────────────────────────────────────────────────────────

    /// Change the training duration and resize every cache, keeping data.
    pub fn set_training_duration(&self, secs: f32) {
        let config = {
            let mut config = self.config.write();
            config.training_duration_secs = secs;
            config.normalize();
            config.clone()
        };
        for sub in self.subprocessor_list() {
            sub.reconcile(&config);
        }
    }

    /// Forget collected samples on every subprocessor.
    pub fn stop_acquisition(&self) {
        for sub in self.subprocessor_list() {
            sub.cache.lock().reset();
        }
    }

    pub fn reset_cache(&self, id: SubprocessorId) -> Result<()> {
        self.require(id)?.cache.lock().reset();
        Ok(())
    }

    /// `(collected, capacity)` samples.
    pub fn cache_progress(&self, id: SubprocessorId) -> Option<(usize, usize)> {
        let sub = self.subprocessor(id)?;
        let cache = sub.cache.lock();
        Some((cache.len(), cache.capacity()))
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    pub fn save_state(&self) -> NodeState {
        let subprocessors = self
            .subprocessor_list()
            .iter()
            .filter_map(|sub| {
                let state = sub.operation.read();
                let config_path = state.config_path.clone()?;
                if state.operation.is_noop() {
                    return None;
                }
                Some(PersistedOperation {
                    subprocessor: sub.id,
                    config_path,
                    rejected_components: state
                        .operation
                        .rejected_components()
                        .iter()
                        .copied()
                        .collect(),
                })
            })
            .collect();
        NodeState {
            training_duration_secs: Some(self.config.read().training_duration_secs),
            subprocessors,
        }
    }

    /// Apply saved parameters. Each operation is reloaded independently; a
    /// failure leaves that subprocessor as a no-op.
    pub fn restore_state(&self, state: &NodeState) -> RestoreReport {
        if let Some(secs) = state.training_duration_secs {
            self.set_training_duration(secs);
        }
        let mut report = RestoreReport::default();
        for saved in &state.subprocessors {
            match self.load_operation(
                saved.subprocessor,
                &saved.config_path,
                &saved.rejected_components,
            ) {
                Ok(()) => report.restored.push(saved.subprocessor),
                Err(e) => {
                    warn!(
                        subprocessor = %saved.subprocessor,
                        config = %saved.config_path.display(),
                        error = %e,
                        "could not restore ICA operation"
                    );
                    if let Some(sub) = self.subprocessor(saved.subprocessor) {
                        sub.operation.reset();
                    }
                    report.failed.push((saved.subprocessor, e.to_string()));
                }
            }
        }
        report
    }
}

impl Drop for IcaNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for IcaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IcaNode")
            .field("subprocessors", &self.registry.read().len())
            .field("training", &self.is_training())
            .finish_non_exhaustive()
    }
}
