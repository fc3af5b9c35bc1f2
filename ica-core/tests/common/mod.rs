#![allow(dead_code)]

use std::f32::consts::PI;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use ica_core::compute::SolverConfig;
use ica_core::operation::matrix::write_matrix;
use ica_core::{ChannelInfo, IcaConfig, Matrix, MultiChannelBuffer, RealtimeApplier};
use nalgebra::{Matrix2, Vector2};

pub const RATE: f32 = 500.0;
pub const NUM_CHANNELS: usize = 4;
/// Channels 1 and 3 carry the mixture; 0 and 2 are unrelated tones.
pub const ENABLED: [usize; 2] = [1, 3];
/// Column k is the spatial pattern of source k.
pub const TRUE_MIXING: [[f32; 2]; 2] = [[1.0, 0.6], [0.4, 1.0]];

/// Square wave and sawtooth, both strongly sub-Gaussian.
pub fn sources(t: usize) -> (f32, f32) {
    let time = t as f32 / RATE;
    let square = if (2.0 * PI * 7.0 * time).sin() >= 0.0 {
        1.0
    } else {
        -1.0
    };
    let saw = 2.0 * (3.1 * time).fract() - 1.0;
    (square, saw)
}

pub fn frame(t: usize) -> [f32; NUM_CHANNELS] {
    let (s1, s2) = sources(t);
    let time = t as f32 / RATE;
    [
        0.5 * (2.0 * PI * 11.0 * time).sin(),
        TRUE_MIXING[0][0] * s1 + TRUE_MIXING[0][1] * s2,
        0.3 * (2.0 * PI * 5.0 * time).cos(),
        TRUE_MIXING[1][0] * s1 + TRUE_MIXING[1][1] * s2,
    ]
}

pub fn block(start: usize, len: usize) -> MultiChannelBuffer {
    let mut channels = vec![Vec::with_capacity(len); NUM_CHANNELS];
    for t in start..start + len {
        for (ch, v) in channels.iter_mut().zip(frame(t)) {
            ch.push(v);
        }
    }
    MultiChannelBuffer::from_channels(channels)
}

/// Push `total` samples starting at `start` through the applier. Returns
/// the next sample index.
pub fn feed(applier: &mut RealtimeApplier, start: usize, total: usize, block_len: usize) -> usize {
    let end = start + total;
    let mut t = start;
    while t < end {
        let len = block_len.min(end - t);
        applier.process(&mut block(t, len));
        t += len;
    }
    end
}

pub fn layout(source_id: u16, n: usize) -> Vec<ChannelInfo> {
    vec![
        ChannelInfo {
            source_id,
            sub_index: 0,
            source_name: "Probe".into(),
            sample_rate: RATE,
        };
        n
    ]
}

/// 4 s at 500 Hz: 2000 training samples.
pub fn config(root: &Path) -> IcaConfig {
    IcaConfig {
        training_duration_secs: 4.0,
        training_rate_hz: RATE,
        output_root: root.join("runs"),
        poll_interval_ms: 5,
        ..IcaConfig::default()
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// `|cos|` between column `k` of `m` and `target`.
pub fn column_cosine(m: &Matrix, k: usize, target: [f32; 2]) -> f32 {
    let (a, b) = (m[(0, k)], m[(1, k)]);
    let dot = a * target[0] + b * target[1];
    (dot / (a.hypot(b) * target[0].hypot(target[1]))).abs()
}

/// Component whose mixing column best matches source `source`.
pub fn component_for_source(mixing: &Matrix, source: usize) -> usize {
    let target = [TRUE_MIXING[0][source], TRUE_MIXING[1][source]];
    if column_cosine(mixing, 0, target) >= column_cosine(mixing, 1, target) {
        0
    } else {
        1
    }
}

/// In-process stand-in for the external solver: whitening followed by a
/// rotation search maximising |excess kurtosis|. Two channels only.
pub fn kurtosis_solver(config_path: &Path, working_dir: &Path) -> i32 {
    match solve(config_path, working_dir) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("test solver: {e}");
            1
        }
    }
}

fn excess_kurtosis(y: &[f64]) -> f64 {
    let n = y.len() as f64;
    let mean = y.iter().sum::<f64>() / n;
    let (m2, m4) = y.iter().fold((0.0, 0.0), |(m2, m4), v| {
        let d = (v - mean) * (v - mean);
        (m2 + d / n, m4 + d * d / n)
    });
    m4 / (m2 * m2) - 3.0
}

fn solve(config_path: &Path, working_dir: &Path) -> Result<(), String> {
    let cfg = SolverConfig::read_from(config_path).map_err(|e| e.to_string())?;
    if cfg.num_channels() != 2 {
        return Err(format!("expected 2 channels, got {}", cfg.num_channels()));
    }
    let raw = std::fs::read(working_dir.join(&cfg.data_file)).map_err(|e| e.to_string())?;
    let values: Vec<f64> = raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
        .collect();
    if values.len() != cfg.num_frames * 2 {
        return Err(format!(
            "data has {} values, expected {}",
            values.len(),
            cfg.num_frames * 2
        ));
    }

    let n = cfg.num_frames as f64;
    let mean = [0usize, 1].map(|c| values.iter().skip(c).step_by(2).sum::<f64>() / n);
    let mut cov = Matrix2::<f64>::zeros();
    for f in values.chunks_exact(2) {
        let d = [f[0] - mean[0], f[1] - mean[1]];
        for i in 0..2 {
            for j in 0..2 {
                cov[(i, j)] += d[i] * d[j] / n;
            }
        }
    }
    let eig = cov.symmetric_eigen();
    let inv_sqrt = Matrix2::from_diagonal(&eig.eigenvalues.map(|l| 1.0 / l.sqrt()));
    let sphere = eig.eigenvectors * inv_sqrt * eig.eigenvectors.transpose();

    let white: Vec<Vector2<f64>> = values
        .chunks_exact(2)
        .map(|f| sphere * Vector2::new(f[0] - mean[0], f[1] - mean[1]))
        .collect();

    let steps = 900;
    let mut best = (0.0_f64, f64::MIN);
    for step in 0..steps {
        let theta = step as f64 * std::f64::consts::FRAC_PI_2 / steps as f64;
        let (s, c) = theta.sin_cos();
        let y0: Vec<f64> = white.iter().map(|z| c * z[0] + s * z[1]).collect();
        let y1: Vec<f64> = white.iter().map(|z| -s * z[0] + c * z[1]).collect();
        let score = excess_kurtosis(&y0).abs() + excess_kurtosis(&y1).abs();
        if score > best.1 {
            best = (theta, score);
        }
    }

    let (s, c) = best.0.sin_cos();
    let weights = Matrix::from_row_slice(2, 2, &[c as f32, s as f32, -s as f32, c as f32]);
    let sphere = Matrix::from_fn(2, 2, |i, j| sphere[(i, j)] as f32);
    write_matrix(&working_dir.join(&cfg.weights_file), &weights).map_err(|e| e.to_string())?;
    write_matrix(&working_dir.join(&cfg.sphere_file), &sphere).map_err(|e| e.to_string())?;
    Ok(())
}
