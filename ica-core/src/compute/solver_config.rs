//! The solver's text config (`binica.sc`-style, one directive per line).
//!
//! ```text
//! # ICA solver config written by ica-core
//! # ICA channels: 0 1 3
//! DataFile        input.fdt
//! chans           3
//! frames          60000
//! WeightsOutFile  binica.wts
//! SphereFile      binica.sph
//! maxsteps        512
//! annealstep      0.98
//! posact          off
//! ```
//!
//! The `# ICA channels:` line is ignored by the solver; it records which
//! subprocessor channels were decomposed so a run can be reloaded later.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::config::SolverParams;
use crate::error::{IcaError, Result};

pub const CHANNEL_HINT_PREFIX: &str = "# ICA channels:";

#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    /// Subprocessor-local indices of the decomposed channels.
    pub enabled_channels: Vec<usize>,
    pub num_frames: usize,
    pub data_file: String,
    pub weights_file: String,
    pub sphere_file: String,
    pub params: SolverParams,
}

impl SolverConfig {
    pub fn num_channels(&self) -> usize {
        self.enabled_channels.len()
    }

    pub fn render(&self) -> String {
        let channels = self
            .enabled_channels
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(" ");

        let mut out = String::new();
        // writing into a String cannot fail
        let _ = writeln!(out, "# ICA solver config written by ica-core");
        let _ = writeln!(out, "{CHANNEL_HINT_PREFIX} {channels}");
        let _ = writeln!(out, "DataFile        {}", self.data_file);
        let _ = writeln!(out, "chans           {}", self.num_channels());
        let _ = writeln!(out, "frames          {}", self.num_frames);
        let _ = writeln!(out, "WeightsOutFile  {}", self.weights_file);
        let _ = writeln!(out, "SphereFile      {}", self.sphere_file);
        let _ = writeln!(out, "maxsteps        {}", self.params.max_steps);
        let _ = writeln!(out, "annealstep      {}", self.params.anneal_rate);
        let _ = writeln!(
            out,
            "posact          {}",
            if self.params.position_activation {
                "on"
            } else {
                "off"
            }
        );
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render()).map_err(|e| IcaError::io(path, e))
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| IcaError::io(path, e))?;
        Self::parse(&text)
    }

    /// Parse a config. Unknown directives are ignored. Without a channel
    /// hint, channels `0..chans` are assumed.
    pub fn parse(text: &str) -> Result<Self> {
        let mut hint: Option<Vec<usize>> = None;
        let mut chans: Option<usize> = None;
        let mut frames: usize = 0;
        let mut data_file = None;
        let mut weights_file = None;
        let mut sphere_file = None;
        let mut params = SolverParams::default();

        for line in text.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix(CHANNEL_HINT_PREFIX) {
                let parsed = rest
                    .split_whitespace()
                    .map(|t| t.parse::<usize>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| IcaError::SolverConfig(format!("bad channel hint: {e}")))?;
                hint = Some(parsed);
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "datafile" => data_file = Some(value.to_string()),
                "chans" => chans = Some(parse_num(key, value)?),
                "frames" => frames = parse_num(key, value)?,
                "weightsoutfile" => weights_file = Some(value.to_string()),
                "spherefile" => sphere_file = Some(value.to_string()),
                "maxsteps" => params.max_steps = parse_num(key, value)?,
                "annealstep" => params.anneal_rate = parse_num(key, value)?,
                "posact" => params.position_activation = value.eq_ignore_ascii_case("on"),
                _ => {}
            }
        }

        let chans = chans.ok_or_else(|| IcaError::SolverConfig("missing 'chans'".into()))?;
        let enabled_channels = match hint {
            Some(h) if h.len() != chans => {
                return Err(IcaError::SolverConfig(format!(
                    "channel hint lists {} channels but chans is {chans}",
                    h.len()
                )))
            }
            Some(h) => h,
            None => (0..chans).collect(),
        };

        Ok(Self {
            enabled_channels,
            num_frames: frames,
            data_file: data_file
                .ok_or_else(|| IcaError::SolverConfig("missing 'DataFile'".into()))?,
            weights_file: weights_file
                .ok_or_else(|| IcaError::SolverConfig("missing 'WeightsOutFile'".into()))?,
            sphere_file: sphere_file
                .ok_or_else(|| IcaError::SolverConfig("missing 'SphereFile'".into()))?,
            params,
        })
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| IcaError::SolverConfig(format!("invalid value for '{key}': {value}")))
}
