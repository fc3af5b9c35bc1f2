//! Background training run.
//!
//! ## Stages
//!
//! ```text
//! prepare ──► acquire data ──► invoke solver ──► ingest results ──► install
//!   run dir     wait for full     write .sc,        weights/sphere     carry selection,
//!               cache, export     launch, poll      → mixing pair      try_write swap
//! ```
//!
//! Every stage returns `Result<_, StageError>`; cancellation is checked at
//! stage boundaries and at every wait inside a stage. Only `install` touches
//! the live operation, so a cancelled or failed run leaves the previous
//! operation and its component selection exactly as they were.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tracing::{debug, error, info, info_span, warn};

use crate::compute::{LauncherHandle, SolverConfig};
use crate::config::IcaConfig;
use crate::engine::cancel::CancelToken;
use crate::engine::registry::{Subprocessor, SubprocessorId, SubprocessorRegistry};
use crate::engine::status::StatusReporter;
use crate::error::{IcaError, Result};
use crate::ipc::events::TrainingStatus;
use crate::operation::{IcaOperation, OperationState};
use crate::persist;

/// Fewest channels a decomposition is run on.
pub const MIN_CHANNELS: usize = 2;

/// Attempts at finding an unused run directory name.
const MAX_DIR_ATTEMPTS: usize = 100;

/// What to train: a subprocessor and the subset of its channels to
/// decompose, as indices into its channel list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingRequest {
    pub subprocessor: SubprocessorId,
    pub channels: Vec<usize>,
}

impl TrainingRequest {
    /// Channels are sorted and deduplicated.
    pub fn new(subprocessor: SubprocessorId, channels: impl IntoIterator<Item = usize>) -> Self {
        let mut channels: Vec<usize> = channels.into_iter().collect();
        channels.sort_unstable();
        channels.dedup();
        Self {
            subprocessor,
            channels,
        }
    }

    /// Every channel of a subprocessor with `num_channels` channels.
    pub fn all_channels(subprocessor: SubprocessorId, num_channels: usize) -> Self {
        Self::new(subprocessor, 0..num_channels)
    }
}

#[derive(Debug)]
pub enum StageError {
    Cancelled,
    Failed(IcaError),
}

impl From<IcaError> for StageError {
    fn from(e: IcaError) -> Self {
        StageError::Failed(e)
    }
}

type StageResult<T> = std::result::Result<T, StageError>;

/// How a training run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingOutcome {
    Installed {
        subprocessor: SubprocessorId,
        config_path: PathBuf,
    },
    Cancelled,
    Failed(String),
}

/// Per-run record, discarded when the run ends.
#[derive(Debug)]
pub struct TrainingRunInfo {
    pub subprocessor: SubprocessorId,
    pub enabled_channels: Vec<usize>,
    pub working_dir: PathBuf,
    pub config_path: PathBuf,
    /// Frames exported to the solver.
    pub num_samples: usize,
    pub operation: IcaOperation,
}

/// Everything a run needs, moved onto the training thread.
pub(crate) struct TrainingContext {
    pub config: IcaConfig,
    pub launcher: LauncherHandle,
    pub cancel: CancelToken,
    pub status: StatusReporter,
    pub subprocessor: Arc<Subprocessor>,
}

/// Configuration checks done before a run is spawned.
pub(crate) fn validate_request(
    registry: &SubprocessorRegistry,
    request: &TrainingRequest,
) -> Result<Arc<Subprocessor>> {
    if registry.is_empty() {
        return Err(IcaError::NoSubprocessor);
    }
    let sub = registry
        .get(request.subprocessor)
        .ok_or_else(|| IcaError::UnknownSubprocessor(request.subprocessor.to_string()))?;
    if request.channels.len() < MIN_CHANNELS {
        return Err(IcaError::TooFewChannels {
            required: MIN_CHANNELS,
            got: request.channels.len(),
        });
    }
    if let Some(&bad) = request
        .channels
        .iter()
        .find(|&&c| c >= sub.num_channels())
    {
        return Err(IcaError::InvalidChannel {
            index: bad,
            available: sub.num_channels(),
        });
    }
    Ok(Arc::clone(sub))
}

/// Run every stage and report the result. Called on the training thread.
pub(crate) fn run(ctx: TrainingContext, request: TrainingRequest) -> TrainingOutcome {
    let id = request.subprocessor;
    let span = info_span!("training_run", subprocessor = %id);
    let _enter = span.enter();

    match run_stages(&ctx, request) {
        Ok(run) => {
            info!(config = %run.config_path.display(), "ICA operation installed");
            ctx.status.report(
                Some(id),
                TrainingStatus::Completed,
                Some(run.config_path.display().to_string()),
            );
            TrainingOutcome::Installed {
                subprocessor: id,
                config_path: run.config_path,
            }
        }
        Err(StageError::Cancelled) => {
            info!("training cancelled");
            ctx.status.report(Some(id), TrainingStatus::Cancelled, None);
            TrainingOutcome::Cancelled
        }
        Err(StageError::Failed(e)) => {
            let message = e.to_string();
            error!(error = %message, "training failed");
            ctx.status
                .report(Some(id), TrainingStatus::Failed, Some(message.clone()));
            TrainingOutcome::Failed(message)
        }
    }
}

fn run_stages(ctx: &TrainingContext, request: TrainingRequest) -> StageResult<TrainingRunInfo> {
    let mut run = prepare(ctx, request)?;
    checkpoint(&ctx.cancel)?;
    acquire_data(ctx, &mut run)?;
    checkpoint(&ctx.cancel)?;
    invoke_solver(ctx, &run)?;
    checkpoint(&ctx.cancel)?;
    ingest_results(ctx, &mut run)?;
    checkpoint(&ctx.cancel)?;
    install(ctx, &mut run)?;
    Ok(run)
}

fn checkpoint(cancel: &CancelToken) -> StageResult<()> {
    if cancel.is_cancelled() {
        Err(StageError::Cancelled)
    } else {
        Ok(())
    }
}

fn prepare(ctx: &TrainingContext, request: TrainingRequest) -> StageResult<TrainingRunInfo> {
    ctx.status
        .report(Some(request.subprocessor), TrainingStatus::Preparing, None);

    if request.channels.len() < MIN_CHANNELS {
        return Err(IcaError::TooFewChannels {
            required: MIN_CHANNELS,
            got: request.channels.len(),
        }
        .into());
    }

    let working_dir = create_run_dir(&ctx.config.output_root, &ctx.config.dir_suffix)?;
    let config_path = working_dir.join(&ctx.config.files.config);
    info!(
        dir = %working_dir.display(),
        channels = request.channels.len(),
        "training run prepared"
    );

    Ok(TrainingRunInfo {
        subprocessor: request.subprocessor,
        enabled_channels: request.channels,
        working_dir,
        config_path,
        num_samples: 0,
        operation: IcaOperation::noop(),
    })
}

/// Create `<root>/<timestamp>[_<n>][_<suffix>]`, never reusing an existing
/// directory.
pub fn create_run_dir(root: &Path, suffix: &str) -> Result<PathBuf> {
    fs::create_dir_all(root).map_err(|e| IcaError::io(root, e))?;
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

    for attempt in 0..MAX_DIR_ATTEMPTS {
        let mut name = stamp.clone();
        if attempt > 0 {
            name.push_str(&format!("_{attempt}"));
        }
        if !suffix.is_empty() {
            name.push('_');
            name.push_str(suffix);
        }
        let dir = root.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(IcaError::io(dir, e)),
        }
    }
    Err(IcaError::RunDirectory(root.to_path_buf()))
}

fn acquire_data(ctx: &TrainingContext, run: &mut TrainingRunInfo) -> StageResult<()> {
    let sub = &ctx.subprocessor;
    let poll = ctx.config.poll_interval();
    let id = run.subprocessor;
    let report_progress = |capacity: usize| {
        let collected = sub.cache.lock().len();
        ctx.status.report(
            Some(id),
            TrainingStatus::WaitingForData,
            Some(format!("{collected}/{capacity} samples")),
        );
    };

    let mut capacity = sub.cache.capacity();
    if capacity == 0 {
        return Err(IcaError::CacheEmpty.into());
    }
    report_progress(capacity);

    loop {
        while !sub.cache.is_full() {
            // a duration or topology change may resize the cache under us
            let now = sub.cache.capacity();
            if now == 0 {
                return Err(IcaError::CacheEmpty.into());
            }
            if now != capacity {
                debug!(from = capacity, to = now, "cache resized while waiting");
                capacity = now;
                report_progress(capacity);
            }
            if ctx.cancel.wait(poll) {
                return Err(StageError::Cancelled);
            }
        }

        let cache = sub.cache.lock();
        if !cache.is_full() {
            // resized or reset between the probe and the lock
            debug!("cache no longer full; waiting again");
            continue;
        }
        let data_path = run.working_dir.join(&ctx.config.files.data);
        run.num_samples = cache.export_channels_to_file(&data_path, &run.enabled_channels)?;
        info!(samples = run.num_samples, file = %data_path.display(), "training data exported");
        return Ok(());
    }
}

fn invoke_solver(ctx: &TrainingContext, run: &TrainingRunInfo) -> StageResult<()> {
    ctx.status
        .report(Some(run.subprocessor), TrainingStatus::Computing, None);

    let files = &ctx.config.files;
    let solver_config = SolverConfig {
        enabled_channels: run.enabled_channels.clone(),
        num_frames: run.num_samples,
        data_file: files.data.clone(),
        weights_file: files.weights.clone(),
        sphere_file: files.sphere.clone(),
        params: ctx.config.solver.clone(),
    };
    solver_config.write_to(&run.config_path)?;

    let mut solver = ctx.launcher.launch(&run.config_path, &run.working_dir)?;
    let poll = ctx.config.poll_interval();
    loop {
        match solver.try_wait()? {
            Some(0) => {
                debug!("solver finished");
                return Ok(());
            }
            Some(code) => {
                warn!(exit_code = code, "solver failed");
                return Err(IcaError::SolverExit { code }.into());
            }
            None => {}
        }
        if ctx.cancel.wait(poll) {
            solver.terminate();
            let _ = solver.try_wait();
            return Err(StageError::Cancelled);
        }
    }
}

fn ingest_results(ctx: &TrainingContext, run: &mut TrainingRunInfo) -> StageResult<()> {
    ctx.status
        .report(Some(run.subprocessor), TrainingStatus::Installing, None);
    let solver_config = SolverConfig::read_from(&run.config_path)?;
    run.operation =
        persist::operation_from_solver_output(&run.working_dir, &solver_config, &ctx.config.files)?;
    Ok(())
}

/// Keep the user's selection when the new run decomposes the same channels.
fn carry_forward_selection(previous: &IcaOperation, next: &mut IcaOperation) {
    if previous.is_noop() || previous.enabled_channels() != next.enabled_channels() {
        return;
    }
    next.set_rejected_components(previous.rejected_components().iter().copied());
}

fn install(ctx: &TrainingContext, run: &mut TrainingRunInfo) -> StageResult<()> {
    let poll = ctx.config.poll_interval();
    loop {
        if let Some(mut current) = ctx.subprocessor.operation.try_write() {
            // under the write lock, so a toggle made while the solver ran is kept
            carry_forward_selection(&current.operation, &mut run.operation);
            *current = OperationState::new(
                std::mem::take(&mut run.operation),
                Some(run.config_path.clone()),
            );
            return Ok(());
        }
        debug!("operation busy; retrying install");
        if ctx.cancel.wait(poll) {
            return Err(StageError::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IcaConfig;
    use crate::engine::registry::ChannelInfo;
    use crate::operation::Matrix;
    use std::collections::BTreeSet;

    fn registry(n: usize) -> SubprocessorRegistry {
        let mut reg = SubprocessorRegistry::new();
        let layout = vec![
            ChannelInfo {
                source_id: 5,
                sub_index: 0,
                source_name: "Probe".into(),
                sample_rate: 500.0,
            };
            n
        ];
        reg.rebuild(&layout, &IcaConfig::default());
        reg
    }

    #[test]
    fn request_channels_are_sorted_and_unique() {
        let req = TrainingRequest::new(SubprocessorId::new(1, 0), [3, 1, 3, 0]);
        assert_eq!(req.channels, vec![0, 1, 3]);
        let all = TrainingRequest::all_channels(SubprocessorId::new(1, 0), 4);
        assert_eq!(all.channels, vec![0, 1, 2, 3]);
    }

    #[test]
    fn validation_rejects_config_errors() {
        let id = SubprocessorId::new(5, 0);
        assert!(matches!(
            validate_request(&SubprocessorRegistry::new(), &TrainingRequest::new(id, [0, 1])),
            Err(IcaError::NoSubprocessor)
        ));

        let reg = registry(4);
        assert!(matches!(
            validate_request(&reg, &TrainingRequest::new(SubprocessorId::new(9, 9), [0, 1])),
            Err(IcaError::UnknownSubprocessor(_))
        ));
        assert!(matches!(
            validate_request(&reg, &TrainingRequest::new(id, [2, 2])),
            Err(IcaError::TooFewChannels {
                required: 2,
                got: 1
            })
        ));
        assert!(matches!(
            validate_request(&reg, &TrainingRequest::new(id, [0, 4])),
            Err(IcaError::InvalidChannel {
                index: 4,
                available: 4
            })
        ));
        let sub = validate_request(&reg, &TrainingRequest::new(id, [0, 3])).unwrap();
        assert_eq!(sub.id, id);
    }

    #[test]
    fn run_dirs_are_unique_and_suffixed() {
        let root = tempfile::tempdir().unwrap();
        let a = create_run_dir(root.path(), "rig2").unwrap();
        let b = create_run_dir(root.path(), "rig2").unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());
        for dir in [&a, &b] {
            let name = dir.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.ends_with("_rig2"), "{name}");
        }
    }

    #[test]
    fn run_dir_root_is_created() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        let dir = create_run_dir(&nested, "").unwrap();
        assert_eq!(dir.parent(), Some(nested.as_path()));
    }

    #[test]
    fn selection_carried_only_for_same_channels() {
        let mut previous = IcaOperation::from_unmixing(vec![0, 1, 2], Matrix::identity(3, 3)).unwrap();
        previous.set_rejected_components([1, 2]);

        let mut same = IcaOperation::from_unmixing(vec![0, 1, 2], Matrix::identity(3, 3)).unwrap();
        carry_forward_selection(&previous, &mut same);
        assert_eq!(same.rejected_components(), &BTreeSet::from([1, 2]));

        let mut other = IcaOperation::from_unmixing(vec![0, 1, 3], Matrix::identity(3, 3)).unwrap();
        carry_forward_selection(&previous, &mut other);
        assert_eq!(other.rejected_components(), &BTreeSet::from([0]));

        let mut fresh = IcaOperation::from_unmixing(vec![0, 1], Matrix::identity(2, 2)).unwrap();
        carry_forward_selection(&IcaOperation::noop(), &mut fresh);
        assert_eq!(fresh.rejected_components(), &BTreeSet::from([0]));
    }
}
