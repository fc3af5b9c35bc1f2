//! External ICA solver abstraction.
//!
//! The training pipeline only needs "launch with this config file as input
//! and this working directory, poll until it exits, read the exit code".
//! [`SolverLauncher`] is that seam; backends:
//!
//! - [`ChildProcessLauncher`]: an OS process (default `binica`) with the
//!   config file on stdin.
//! - [`ThreadLauncher`]: an in-process solver function on a worker thread.

pub mod process;
pub mod solver_config;
pub mod thread;

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

pub use process::ChildProcessLauncher;
pub use solver_config::SolverConfig;
pub use thread::ThreadLauncher;

/// Starts one solver run.
pub trait SolverLauncher: Send + Sync + 'static {
    /// Launch the solver reading `config_path`, with relative file names
    /// resolved against `working_dir`.
    ///
    /// # Errors
    /// `SolverLaunch` if the solver could not be started.
    fn launch(&self, config_path: &Path, working_dir: &Path) -> Result<Box<dyn SolverProcess>>;
}

/// A running (or finished) solver.
pub trait SolverProcess: Send {
    /// `Ok(None)` while running, `Ok(Some(code))` once exited.
    fn try_wait(&mut self) -> Result<Option<i32>>;

    /// Ask the solver to stop. Must not block for long; the caller reaps the
    /// process at its next check point.
    fn terminate(&mut self);
}

/// Shared handle to any launcher.
#[derive(Clone)]
pub struct LauncherHandle(pub Arc<dyn SolverLauncher>);

impl LauncherHandle {
    pub fn new<L: SolverLauncher>(launcher: L) -> Self {
        Self(Arc::new(launcher))
    }

    pub fn launch(&self, config_path: &Path, working_dir: &Path) -> Result<Box<dyn SolverProcess>> {
        self.0.launch(config_path, working_dir)
    }
}

impl std::fmt::Debug for LauncherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LauncherHandle").finish_non_exhaustive()
    }
}
