//! Offline replay: train on a recording, then write a cleaned copy.
//!
//! ```text
//! ica-replay --input rec.wav --output clean.wav [--solver ./binica]
//!            [--channels 0,1,2] [--reject 0] [--duration <secs>]
//!            [--block <samples>] [--out-dir <dir>]
//! ```
//!
//! The whole file is one subprocessor. It is streamed block by block through
//! an `IcaNode` exactly as a host would; once the cache is full the solver
//! runs, and the file is streamed again with the learned operation applied.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ica_core::{
    ChannelInfo, ChildProcessLauncher, IcaConfig, IcaNode, LauncherHandle, MultiChannelBuffer,
    SubprocessorId, TrainingOutcome, TrainingRequest,
};

const DEFAULT_BLOCK: usize = 1024;

#[derive(Debug)]
struct Args {
    input: PathBuf,
    output: PathBuf,
    solver: PathBuf,
    channels: Option<Vec<usize>>,
    reject: Vec<usize>,
    duration_secs: Option<f32>,
    block: usize,
    out_dir: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ica=info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("ica-replay failed: {e:#}");
        std::process::exit(1);
    }
}

fn parse_list(flag: &str, raw: &str) -> anyhow::Result<Vec<usize>> {
    raw.split(',')
        .filter(|t| !t.trim().is_empty())
        .map(|t| {
            t.trim()
                .parse::<usize>()
                .map_err(|_| anyhow!("invalid value for {flag}: {t}"))
        })
        .collect()
}

fn parse_args() -> anyhow::Result<Args> {
    let mut input = None;
    let mut output = None;
    let mut solver = None;
    let mut channels = None;
    let mut reject = vec![0];
    let mut duration_secs = None;
    let mut block = DEFAULT_BLOCK;
    let mut out_dir = PathBuf::from("ica");

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = || {
            it.next()
                .ok_or_else(|| anyhow!("missing value for {arg}"))
        };
        match arg.as_str() {
            "--input" => input = Some(PathBuf::from(value()?)),
            "--output" => output = Some(PathBuf::from(value()?)),
            "--solver" => solver = Some(PathBuf::from(value()?)),
            "--channels" => channels = Some(parse_list("--channels", &value()?)?),
            "--reject" => reject = parse_list("--reject", &value()?)?,
            "--duration" => {
                let secs: f32 = value()?
                    .parse()
                    .map_err(|_| anyhow!("invalid value for --duration"))?;
                duration_secs = Some(secs);
            }
            "--block" => {
                block = value()?
                    .parse::<usize>()
                    .map_err(|_| anyhow!("invalid value for --block"))?
                    .clamp(1, 1 << 16);
            }
            "--out-dir" => out_dir = PathBuf::from(value()?),
            "--help" | "-h" => {
                println!(
                    "Usage: ica-replay --input <in.wav> --output <out.wav> [--solver <binica>] \\
  [--channels 0,1,..] [--reject 0,..] [--duration <secs>] [--block <samples>] [--out-dir <dir>]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    Ok(Args {
        input: input.ok_or_else(|| anyhow!("--input is required"))?,
        output: output.ok_or_else(|| anyhow!("--output is required"))?,
        solver: solver.unwrap_or_else(ChildProcessLauncher::default_executable),
        channels,
        reject,
        duration_secs,
        block,
        out_dir,
    })
}

/// Deinterleave a WAV into one `Vec<f32>` per channel, ints scaled to ±1.
fn read_wav(path: &Path) -> anyhow::Result<(WavSpec, Vec<Vec<f32>>)> {
    let mut reader =
        WavReader::open(path).with_context(|| format!("open {}", path.display()))?;
    let spec = reader.spec();
    let n_channels = usize::from(spec.channels);

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .context("read float samples")?,
        SampleFormat::Int => {
            let scale = 1.0 / (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .context("read integer samples")?
        }
    };

    let mut channels = vec![Vec::with_capacity(interleaved.len() / n_channels.max(1)); n_channels];
    for frame in interleaved.chunks_exact(n_channels.max(1)) {
        for (ch, &v) in channels.iter_mut().zip(frame) {
            ch.push(v);
        }
    }
    Ok((spec, channels))
}

fn write_wav(path: &Path, spec: WavSpec, channels: &[Vec<f32>]) -> anyhow::Result<()> {
    let out_spec = WavSpec {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer =
        WavWriter::create(path, out_spec).with_context(|| format!("create {}", path.display()))?;
    let frames = channels.first().map_or(0, Vec::len);
    for t in 0..frames {
        for ch in channels {
            writer.write_sample(ch[t])?;
        }
    }
    writer.finalize()?;
    Ok(())
}

/// Stream `channels` through the node's applier in blocks of `block`.
fn stream(node: &IcaNode, channels: &[Vec<f32>], block: usize) -> Vec<Vec<f32>> {
    let mut applier = node.realtime_applier();
    let frames = channels.first().map_or(0, Vec::len);
    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); channels.len()];

    let mut start = 0;
    while start < frames {
        let end = (start + block).min(frames);
        let mut buf = MultiChannelBuffer::from_channels(
            channels.iter().map(|c| c[start..end].to_vec()).collect(),
        );
        applier.process(&mut buf);
        for (dst, src) in out.iter_mut().zip(buf.into_channels()) {
            dst.extend(src);
        }
        start = end;
    }
    out
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;
    let (spec, channels) = read_wav(&args.input)?;
    let frames = channels.first().map_or(0, Vec::len);
    let sample_rate = spec.sample_rate as f32;
    if frames == 0 {
        bail!("{} contains no samples", args.input.display());
    }

    let file_secs = frames as f32 / sample_rate;
    let duration = args.duration_secs.unwrap_or(file_secs).min(file_secs);
    let config = IcaConfig {
        training_duration_secs: duration,
        output_root: args.out_dir.clone(),
        ..IcaConfig::default()
    };
    let launcher = ChildProcessLauncher::new(&args.solver).with_log_file(config.files.log.clone());
    let node = IcaNode::new(config, LauncherHandle::new(launcher));

    let source_name = args
        .input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "replay".into());
    let layout: Vec<ChannelInfo> = (0..channels.len())
        .map(|_| ChannelInfo {
            source_id: 0,
            sub_index: 0,
            source_name: source_name.clone(),
            sample_rate,
        })
        .collect();
    node.update_topology(&layout);

    let id = SubprocessorId::new(0, 0);
    let request = match &args.channels {
        Some(list) => TrainingRequest::new(id, list.iter().copied()),
        None => TrainingRequest::all_channels(id, channels.len()),
    };
    info!(
        input = %args.input.display(),
        channels = request.channels.len(),
        duration_secs = duration,
        "training on recording"
    );
    node.start_training(request)?;

    stream(&node, &channels, args.block);
    let (collected, capacity) = node.cache_progress(id).unwrap_or((0, 0));
    if collected < capacity {
        let _ = node.cancel_training();
        node.wait_for_training();
        bail!("recording too short: collected {collected} of {capacity} training samples");
    }

    match node.wait_for_training() {
        Some(TrainingOutcome::Installed { config_path, .. }) => {
            info!(config = %config_path.display(), "training finished");
        }
        Some(TrainingOutcome::Failed(message)) => bail!("training failed: {message}"),
        Some(TrainingOutcome::Cancelled) | None => bail!("training did not complete"),
    }

    let components = node
        .operation(id)
        .map(|s| s.operation.num_components())
        .unwrap_or(0);
    for k in 0..components {
        node.set_component_rejected(id, k, args.reject.contains(&k))?;
    }

    let cleaned = stream(&node, &channels, args.block);
    write_wav(&args.output, spec, &cleaned)?;
    info!(output = %args.output.display(), "cleaned recording written");
    Ok(())
}
