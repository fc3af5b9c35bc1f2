//! Node configuration, persisted as JSON next to the host's settings.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// File names used inside every run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SolverFileNames {
    pub config: String,
    pub data: String,
    pub weights: String,
    pub sphere: String,
    pub mixing: String,
    pub unmixing: String,
    pub log: String,
}

impl Default for SolverFileNames {
    fn default() -> Self {
        Self {
            config: "binica.sc".into(),
            data: "input.fdt".into(),
            weights: "binica.wts".into(),
            sphere: "binica.sph".into(),
            mixing: "mixing.bin".into(),
            unmixing: "unmixing.bin".into(),
            log: "binica.log".into(),
        }
    }
}

impl SolverFileNames {
    fn normalize(&mut self) {
        let defaults = Self::default();
        for (field, fallback) in [
            (&mut self.config, defaults.config),
            (&mut self.data, defaults.data),
            (&mut self.weights, defaults.weights),
            (&mut self.sphere, defaults.sphere),
            (&mut self.mixing, defaults.mixing),
            (&mut self.unmixing, defaults.unmixing),
            (&mut self.log, defaults.log),
        ] {
            let trimmed = field.trim();
            *field = if trimmed.is_empty() {
                fallback
            } else {
                trimmed.to_string()
            };
        }
    }
}

/// Fixed numerical hyperparameters passed to the solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SolverParams {
    pub max_steps: u32,
    pub anneal_rate: f32,
    pub position_activation: bool,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            max_steps: 512,
            anneal_rate: 0.98,
            position_activation: false,
        }
    }
}

/// Configuration for [`IcaNode`](crate::engine::IcaNode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct IcaConfig {
    /// Seconds of (downsampled) data collected before training. Default: 120.
    pub training_duration_secs: f32,
    /// Target rate for training data; each subprocessor keeps every
    /// `round(sample_rate / training_rate_hz)`-th sample. Default: 500.
    pub training_rate_hz: f32,
    /// Directory under which one run directory per training is created.
    pub output_root: PathBuf,
    /// Appended to the timestamped run directory name.
    pub dir_suffix: String,
    pub solver: SolverParams,
    pub files: SolverFileNames,
    /// Training-thread wait granularity (ms). Default: 50.
    pub poll_interval_ms: u64,
}

impl Default for IcaConfig {
    fn default() -> Self {
        Self {
            training_duration_secs: 120.0,
            training_rate_hz: 500.0,
            output_root: PathBuf::from("ica"),
            dir_suffix: String::new(),
            solver: SolverParams::default(),
            files: SolverFileNames::default(),
            poll_interval_ms: 50,
        }
    }
}

impl IcaConfig {
    pub fn normalize(&mut self) {
        if !self.training_duration_secs.is_finite() {
            self.training_duration_secs = 0.0;
        }
        self.training_duration_secs = self.training_duration_secs.clamp(0.0, 3_600.0);
        if !self.training_rate_hz.is_finite() || self.training_rate_hz <= 0.0 {
            self.training_rate_hz = 500.0;
        }
        self.dir_suffix = sanitize_dir_suffix(&self.dir_suffix);
        self.solver.max_steps = self.solver.max_steps.max(1);
        self.solver.anneal_rate = self.solver.anneal_rate.clamp(0.0, 1.0);
        self.files.normalize();
        self.poll_interval_ms = self.poll_interval_ms.clamp(1, 5_000);
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Decimation stride for a subprocessor running at `sample_rate`.
    pub fn downsample_stride(&self, sample_rate: f32) -> usize {
        if !sample_rate.is_finite() || sample_rate <= self.training_rate_hz {
            return 1;
        }
        ((sample_rate / self.training_rate_hz).round() as usize).max(1)
    }

    /// Cache capacity (in kept samples) for a subprocessor.
    pub fn training_samples(&self, sample_rate: f32) -> usize {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return 0;
        }
        let kept_rate = sample_rate / self.downsample_stride(sample_rate) as f32;
        (self.training_duration_secs * kept_rate).round() as usize
    }

    /// Load from JSON, falling back to defaults on a missing or corrupt file.
    pub fn load(path: &Path) -> Self {
        let mut config = fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<IcaConfig>(&raw).ok())
            .unwrap_or_default();
        config.normalize();
        config
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, json)
    }
}

/// Keep only characters that are safe in a directory name.
pub fn sanitize_dir_suffix(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}
