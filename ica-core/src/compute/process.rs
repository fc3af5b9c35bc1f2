//! Solver as an OS child process.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::{debug, warn};

use crate::compute::{SolverLauncher, SolverProcess};
use crate::error::{IcaError, Result};

/// Runs `executable < config` inside the run directory.
#[derive(Debug, Clone)]
pub struct ChildProcessLauncher {
    executable: PathBuf,
    /// Captures stdout and stderr inside the run directory when set.
    log_file: Option<String>,
}

impl ChildProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            log_file: None,
        }
    }

    pub fn with_log_file(mut self, name: impl Into<String>) -> Self {
        self.log_file = Some(name.into());
        self
    }

    /// `binica` next to the running executable.
    pub fn default_executable() -> PathBuf {
        let name = if cfg!(windows) { "binica.exe" } else { "binica" };
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.join(name)))
            .unwrap_or_else(|| PathBuf::from(name))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn resolved_executable(&self) -> PathBuf {
        // the child runs in the run directory, so a relative path must be
        // pinned down before the working directory changes
        if self.executable.is_relative() && self.executable.exists() {
            if let Ok(abs) = std::fs::canonicalize(&self.executable) {
                return abs;
            }
        }
        self.executable.clone()
    }

    fn output_stdio(&self, working_dir: &Path) -> Result<(Stdio, Stdio)> {
        let Some(name) = &self.log_file else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        let path = working_dir.join(name);
        let log = File::create(&path).map_err(|e| IcaError::io(&path, e))?;
        let err = log.try_clone().map_err(|e| IcaError::io(&path, e))?;
        Ok((Stdio::from(log), Stdio::from(err)))
    }
}

impl Default for ChildProcessLauncher {
    fn default() -> Self {
        Self::new(Self::default_executable())
    }
}

impl SolverLauncher for ChildProcessLauncher {
    fn launch(&self, config_path: &Path, working_dir: &Path) -> Result<Box<dyn SolverProcess>> {
        let stdin = File::open(config_path).map_err(|e| IcaError::io(config_path, e))?;
        let (stdout, stderr) = self.output_stdio(working_dir)?;
        let exe = self.resolved_executable();

        let child = Command::new(&exe)
            .current_dir(working_dir)
            .stdin(Stdio::from(stdin))
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| IcaError::SolverLaunch(format!("{}: {e}", exe.display())))?;

        debug!(pid = child.id(), exe = %exe.display(), "solver process started");
        Ok(Box::new(ChildSolver {
            child,
            exit_code: None,
        }))
    }
}

struct ChildSolver {
    child: Child,
    exit_code: Option<i32>,
}

impl SolverProcess for ChildSolver {
    fn try_wait(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                // killed by a signal: no exit code
                let code = status.code().unwrap_or(-1);
                self.exit_code = Some(code);
                Ok(Some(code))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(IcaError::SolverLaunch(format!("wait failed: {e}"))),
        }
    }

    fn terminate(&mut self) {
        if self.exit_code.is_some() {
            return;
        }
        if let Err(e) = self.child.kill() {
            warn!("failed to kill solver process: {e}");
        }
    }
}

impl Drop for ChildSolver {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
