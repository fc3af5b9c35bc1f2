//! Solver as a function running on a worker thread.
//!
//! Same launch/poll/exit-code contract as the child-process backend. A
//! thread cannot be killed, so `terminate` detaches it and lets it finish.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::warn;

use crate::compute::{SolverLauncher, SolverProcess};
use crate::error::{IcaError, Result};

/// `(config_path, working_dir) -> exit code`.
pub type SolverFn = dyn Fn(&Path, &Path) -> i32 + Send + Sync;

#[derive(Clone)]
pub struct ThreadLauncher {
    solver: Arc<SolverFn>,
}

impl ThreadLauncher {
    pub fn new<F>(solver: F) -> Self
    where
        F: Fn(&Path, &Path) -> i32 + Send + Sync + 'static,
    {
        Self {
            solver: Arc::new(solver),
        }
    }
}

impl std::fmt::Debug for ThreadLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLauncher").finish_non_exhaustive()
    }
}

impl SolverLauncher for ThreadLauncher {
    fn launch(&self, config_path: &Path, working_dir: &Path) -> Result<Box<dyn SolverProcess>> {
        let solver = Arc::clone(&self.solver);
        let config_path: PathBuf = config_path.to_path_buf();
        let working_dir: PathBuf = working_dir.to_path_buf();
        let handle = std::thread::Builder::new()
            .name("ica-solver".into())
            .spawn(move || solver(&config_path, &working_dir))
            .map_err(|e| IcaError::SolverLaunch(format!("spawn solver thread: {e}")))?;
        Ok(Box::new(ThreadSolver {
            handle: Some(handle),
            exit_code: None,
        }))
    }
}

struct ThreadSolver {
    handle: Option<JoinHandle<i32>>,
    exit_code: Option<i32>,
}

impl SolverProcess for ThreadSolver {
    fn try_wait(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        match &self.handle {
            Some(h) if !h.is_finished() => return Ok(None),
            Some(_) => {}
            // detached by terminate()
            None => return Ok(Some(-1)),
        }
        let Some(handle) = self.handle.take() else {
            return Ok(Some(-1));
        };
        let code = handle
            .join()
            .map_err(|_| IcaError::SolverLaunch("solver thread panicked".into()))?;
        self.exit_code = Some(code);
        Ok(Some(code))
    }

    fn terminate(&mut self) {
        if self.handle.take().is_some() {
            warn!("detaching in-process solver thread; it will run to completion");
        }
    }
}
