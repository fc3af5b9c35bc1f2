//! Reloading finished runs and the node's saved parameters.
//!
//! A run directory holds everything needed to rebuild its operation:
//!
//! ```text
//! <run>/binica.sc      solver config (+ "# ICA channels:" hint)
//! <run>/binica.wts     weights, n×n f32
//! <run>/binica.sph     sphere,  n×n f32
//! <run>/mixing.bin     derived, written after ingest
//! <run>/unmixing.bin   derived, written after ingest
//! ```
//!
//! The derived pair is preferred on reload; it is recomputed from
//! weights/sphere when missing, unreadable or older than the solver output.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::compute::SolverConfig;
use crate::config::SolverFileNames;
use crate::engine::registry::SubprocessorId;
use crate::error::{IcaError, Result};
use crate::operation::matrix::{read_square_matrix, unmixing_from_solver, write_matrix};
use crate::operation::IcaOperation;

/// Saved operation for one subprocessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedOperation {
    pub subprocessor: SubprocessorId,
    /// Solver config file of the run to reload.
    pub config_path: PathBuf,
    #[serde(default)]
    pub rejected_components: Vec<usize>,
}

/// Parameters saved with the host's project/session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct NodeState {
    pub training_duration_secs: Option<f32>,
    pub subprocessors: Vec<PersistedOperation>,
}

impl NodeState {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| IcaError::Persist(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| IcaError::Persist(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| IcaError::io(path, e))?;
        Self::from_json(&raw)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| IcaError::io(parent, e))?;
        }
        fs::write(path, self.to_json()?).map_err(|e| IcaError::io(path, e))
    }
}

/// Turn the solver's weights/sphere in `dir` into an operation and persist
/// the derived mixing/unmixing pair next to them.
pub fn operation_from_solver_output(
    dir: &Path,
    solver: &SolverConfig,
    files: &SolverFileNames,
) -> Result<IcaOperation> {
    let n = solver.num_channels();
    let weights = read_square_matrix(&dir.join(&solver.weights_file), n)?;
    let sphere = read_square_matrix(&dir.join(&solver.sphere_file), n)?;
    let unmixing = unmixing_from_solver(&weights, &sphere)?;
    let op = IcaOperation::from_unmixing(solver.enabled_channels.clone(), unmixing)?;

    write_matrix(&dir.join(&files.mixing), op.mixing())?;
    write_matrix(&dir.join(&files.unmixing), op.unmixing())?;
    debug!(dir = %dir.display(), components = n, "derived matrices written");
    Ok(op)
}

/// Rebuild the operation of a finished run from its solver config file.
pub fn load_operation(config_path: &Path, files: &SolverFileNames) -> Result<IcaOperation> {
    let solver = SolverConfig::read_from(config_path)?;
    if solver.num_channels() < 2 {
        return Err(IcaError::TooFewChannels {
            required: 2,
            got: solver.num_channels(),
        });
    }
    let dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    match read_derived(dir, &solver, files) {
        Ok(op) => {
            info!(config = %config_path.display(), "loaded ICA operation");
            Ok(op)
        }
        Err(reason) => {
            debug!(%reason, "derived matrices unusable; recomputing from solver output");
            operation_from_solver_output(dir, &solver, files)
        }
    }
}

fn read_derived(dir: &Path, solver: &SolverConfig, files: &SolverFileNames) -> Result<IcaOperation> {
    let mixing_path = dir.join(&files.mixing);
    let unmixing_path = dir.join(&files.unmixing);
    let sources = [dir.join(&solver.weights_file), dir.join(&solver.sphere_file)];
    if is_stale(&[mixing_path.clone(), unmixing_path.clone()], &sources) {
        return Err(IcaError::SolverConfig(
            "derived matrices are missing or older than the solver output".into(),
        ));
    }
    let n = solver.num_channels();
    let mixing = read_square_matrix(&mixing_path, n)?;
    let unmixing = read_square_matrix(&unmixing_path, n)?;
    IcaOperation::from_matrices(solver.enabled_channels.clone(), mixing, unmixing)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// `true` if any derived file is missing or older than any existing source.
fn is_stale(derived: &[PathBuf], sources: &[PathBuf]) -> bool {
    let Some(oldest) = derived
        .iter()
        .map(|p| modified(p))
        .collect::<Option<Vec<_>>>()
        .and_then(|times| times.into_iter().min())
    else {
        return true;
    };
    sources
        .iter()
        .filter_map(|p| modified(p))
        .any(|source| source > oldest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolverParams;
    use crate::operation::Matrix;
    use approx::assert_abs_diff_eq;

    fn solver_config(channels: Vec<usize>) -> SolverConfig {
        SolverConfig {
            enabled_channels: channels,
            num_frames: 100,
            data_file: "input.fdt".into(),
            weights_file: "binica.wts".into(),
            sphere_file: "binica.sph".into(),
            params: SolverParams::default(),
        }
    }

    /// Run dir with a 2×2 solver result whose unmixing is `[[2,1],[0,1]]`.
    fn run_dir() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = solver_config(vec![1, 3]);
        let config_path = dir.path().join("binica.sc");
        cfg.write_to(&config_path).unwrap();
        let weights = Matrix::from_row_slice(2, 2, &[2.0, 1.0, 0.0, 1.0]);
        write_matrix(&dir.path().join("binica.wts"), &weights).unwrap();
        write_matrix(&dir.path().join("binica.sph"), &Matrix::identity(2, 2)).unwrap();
        (dir, config_path)
    }

    #[test]
    fn node_state_json_shape() {
        let state = NodeState {
            training_duration_secs: Some(60.0),
            subprocessors: vec![PersistedOperation {
                subprocessor: SubprocessorId::new(100, 1),
                config_path: PathBuf::from("/runs/a/binica.sc"),
                rejected_components: vec![0, 2],
            }],
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["trainingDurationSecs"], 60.0);
        assert_eq!(json["subprocessors"][0]["subprocessor"]["sourceId"], 100);
        assert_eq!(json["subprocessors"][0]["subprocessor"]["subIndex"], 1);
        assert_eq!(json["subprocessors"][0]["configPath"], "/runs/a/binica.sc");
        assert_eq!(
            json["subprocessors"][0]["rejectedComponents"],
            serde_json::json!([0, 2])
        );
    }

    #[test]
    fn node_state_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ica-state.json");
        let state = NodeState {
            training_duration_secs: None,
            subprocessors: vec![PersistedOperation {
                subprocessor: SubprocessorId::new(7, 0),
                config_path: PathBuf::from("run/binica.sc"),
                rejected_components: vec![1],
            }],
        };
        state.save(&path).unwrap();
        assert_eq!(NodeState::load(&path).unwrap(), state);
    }

    #[test]
    fn corrupt_state_is_persist_error() {
        assert!(matches!(
            NodeState::from_json("{ not json"),
            Err(IcaError::Persist(_))
        ));
        // missing fields take defaults
        assert_eq!(NodeState::from_json("{}").unwrap(), NodeState::default());
    }

    #[test]
    fn ingest_writes_derived_pair() {
        let (dir, _) = run_dir();
        let files = SolverFileNames::default();
        let op = operation_from_solver_output(dir.path(), &solver_config(vec![1, 3]), &files)
            .unwrap();
        assert_eq!(op.enabled_channels(), &[1, 3]);
        // sphere is identity with norm 1: unmixing == weights
        assert_abs_diff_eq!(op.unmixing()[(0, 0)], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(op.mixing()[(0, 1)], -0.5, epsilon = 1e-6);

        let mixing = read_square_matrix(&dir.path().join("mixing.bin"), 2).unwrap();
        assert_eq!(&mixing, op.mixing());
    }

    #[test]
    fn load_uses_derived_pair_when_fresh() {
        let (dir, config_path) = run_dir();
        let files = SolverFileNames::default();
        let first = load_operation(&config_path, &files).unwrap();
        assert!(dir.path().join("unmixing.bin").exists());

        let second = load_operation(&config_path, &files).unwrap();
        assert_eq!(first.enabled_channels(), second.enabled_channels());
        assert_eq!(first.unmixing(), second.unmixing());
        assert_eq!(first.mixing(), second.mixing());
    }

    #[test]
    fn load_recomputes_when_derived_file_is_corrupt() {
        let (dir, config_path) = run_dir();
        let files = SolverFileNames::default();
        load_operation(&config_path, &files).unwrap();
        fs::write(dir.path().join("mixing.bin"), [0u8; 3]).unwrap();

        let op = load_operation(&config_path, &files).unwrap();
        assert_abs_diff_eq!(op.mixing()[(0, 0)], 0.5, epsilon = 1e-6);
        assert_eq!(
            fs::metadata(dir.path().join("mixing.bin")).unwrap().len(),
            16
        );
    }

    #[test]
    fn wrong_weights_size_names_the_file() {
        let (dir, config_path) = run_dir();
        fs::write(dir.path().join("binica.wts"), [0u8; 12]).unwrap();
        let err = load_operation(&config_path, &SolverFileNames::default()).unwrap_err();
        match err {
            IcaError::MatrixFileSize {
                path,
                expected,
                actual,
            } => {
                assert!(path.ends_with("binica.wts"));
                assert_eq!(expected, 16);
                assert_eq!(actual, 12);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_config_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_operation(&dir.path().join("nope.sc"), &SolverFileNames::default())
            .unwrap_err();
        assert!(matches!(err, IcaError::Io { .. }));
    }
}
