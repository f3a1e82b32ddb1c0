//! facevision CLI - run classifiers and the UltraFace detector over frame streams.

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use ndarray::ArrayD;
use ndarray_npy::read_npy;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use facevision::analysis::Detections;
use facevision::config::{Config, ModelPreset};
use facevision::face_detection::model_ultraface::{generate_priors, NmsMode};
use facevision::face_detection::{face_detect, init_face_detector_with, unflatten_faces};
use facevision::inference::OrtLoader;
use facevision::overlay::{render_overlay, save_overlay, OverlayStyle};
use facevision::pipeline::{Pipeline, PipelineEvent};
use facevision::utils::ResultPresenter;
use facevision::webcam::{FrameSource, ImageDirSource, RawYuvSource};

#[derive(Debug, Parser)]
#[command(name = "facevision", version, about)]
struct Cli {
    /// Configuration file (defaults to ./facevision.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Analyze image files or directories of frames
    Run(RunArgs),
    /// Decode raw detector outputs stored as .npy files
    Decode(DecodeArgs),
    /// Print the anchor count for a detector input size
    Priors(PriorsArgs),
}

#[derive(Debug, Args)]
struct DetectorArgs {
    #[arg(long, value_parser = parse_unit)]
    score_threshold: Option<f32>,

    #[arg(long, value_parser = parse_unit)]
    iou_threshold: Option<f32>,

    #[arg(long, value_parser = parse_nms)]
    nms: Option<NmsMode>,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Image files or directories (raw I420 dumps with --raw-size)
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Read inputs as raw I420 frame dumps of this size, e.g. 640x480
    #[arg(long, value_parser = parse_size)]
    raw_size: Option<(u32, u32)>,

    /// resnet18, mobilenet-quantized or ultranet
    #[arg(long)]
    preset: Option<ModelPreset>,

    #[arg(long)]
    model: Option<PathBuf>,

    #[arg(long)]
    labels: Option<PathBuf>,

    #[arg(long)]
    top_k: Option<usize>,

    /// Clockwise frame rotation in degrees (0, 90, 180, 270)
    #[arg(long, allow_hyphen_values = true)]
    rotation: Option<i32>,

    /// Write face overlays as PNG files into this directory
    #[arg(long)]
    overlay_dir: Option<PathBuf>,

    /// Drop frames that arrive while an analysis is still running
    #[arg(long)]
    realtime: bool,

    #[command(flatten)]
    detector: DetectorArgs,
}

#[derive(Debug, Args)]
struct DecodeArgs {
    #[arg(long)]
    scores: PathBuf,

    #[arg(long)]
    boxes: PathBuf,

    #[arg(long, default_value_t = 320)]
    width: u32,

    #[arg(long, default_value_t = 240)]
    height: u32,

    #[command(flatten)]
    detector: DetectorArgs,
}

#[derive(Debug, Args)]
struct PriorsArgs {
    #[arg(long, default_value_t = 320)]
    width: u32,

    #[arg(long, default_value_t = 240)]
    height: u32,
}

fn parse_unit(s: &str) -> Result<f32, String> {
    let value: f32 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{value} is not in 0.0..=1.0"))
    }
}

fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
    let width: u32 = w.parse().map_err(|e| format!("bad width '{w}': {e}"))?;
    let height: u32 = h.parse().map_err(|e| format!("bad height '{h}': {e}"))?;
    Ok((width, height))
}

fn parse_nms(s: &str) -> Result<NmsMode, String> {
    match s {
        "hard" => Ok(NmsMode::Hard),
        "blending" => Ok(NmsMode::Blending),
        other => Err(format!("unknown nms mode '{other}'")),
    }
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let outcome = Config::load_or_default(cli.config.as_deref())
        .context("failed to load configuration")
        .and_then(|config| match cli.command {
            Commands::Run(args) => run(config, args),
            Commands::Decode(args) => decode(config, args),
            Commands::Priors(args) => {
                println!("{}", generate_priors(args.width, args.height).len());
                Ok(())
            }
        });

    match outcome {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn apply_detector_args(config: &mut Config, args: &DetectorArgs) {
    if let Some(v) = args.score_threshold {
        config.detector.score_threshold = v;
    }
    if let Some(v) = args.iou_threshold {
        config.detector.iou_threshold = v;
    }
    if let Some(v) = args.nms {
        config.detector.nms = v;
    }
}

fn decode(mut config: Config, args: DecodeArgs) -> anyhow::Result<()> {
    apply_detector_args(&mut config, &args.detector);

    let scores: ArrayD<f32> = read_npy(&args.scores)
        .with_context(|| format!("failed to read {}", args.scores.display()))?;
    let boxes: ArrayD<f32> = read_npy(&args.boxes)
        .with_context(|| format!("failed to read {}", args.boxes.display()))?;

    let handle = init_face_detector_with(args.width, args.height, 3, config.detector)?;
    let scores: Vec<f32> = scores.iter().copied().collect();
    let boxes: Vec<f32> = boxes.iter().copied().collect();
    let flat = face_detect(&handle, &scores, &boxes)?;
    handle.release();

    let faces = unflatten_faces(&flat);
    println!("{} faces", faces.len());
    for face in faces {
        println!(
            "{:.1} {:.1} {:.1} {:.1} {:.3}",
            face.x1, face.y1, face.x2, face.y2, face.score
        );
    }
    Ok(())
}

fn run(mut config: Config, args: RunArgs) -> anyhow::Result<()> {
    if let Some(preset) = args.preset {
        config.model.preset = preset;
    }
    if let Some(model) = args.model.clone() {
        config.model.path = Some(model);
    }
    if let Some(labels) = args.labels.clone() {
        config.model.labels = Some(labels);
    }
    if let Some(top_k) = args.top_k {
        config.classifier.top_k = top_k;
    }
    if let Some(rotation) = args.rotation {
        config.camera.rotation = rotation;
    }
    apply_detector_args(&mut config, &args.detector);
    config.validate()?;

    let mut style = OverlayStyle::default();
    if let Some(font) = &config.display.font {
        style = style.with_font_file(font)?;
    }
    if let Some(dir) = &args.overlay_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let source: Box<dyn FrameSource + Send> = match args.raw_size {
        Some((width, height)) => {
            let source = RawYuvSource::open(args.inputs.as_slice(), width, height)?;
            if source.is_empty() {
                bail!("no whole {width}x{height} frames found in the given inputs");
            }
            info!(frames = source.len(), "replaying raw I420 frames");
            Box::new(source)
        }
        None => {
            let source = ImageDirSource::open(args.inputs.as_slice())?;
            if source.is_empty() {
                bail!("no image files found in the given inputs");
            }
            info!(frames = source.len(), "replaying image files");
            Box::new(source)
        }
    };
    info!(preset = ?config.model.preset, realtime = args.realtime, "starting analysis");

    let loader = OrtLoader {
        threads: config.model.threads,
    };
    let pipeline = Pipeline::start(source, config.clone(), Box::new(loader), args.realtime);

    let presented = present(&config, &style, args.overlay_dir.as_deref(), pipeline.events());
    // both threads are joined before any presentation error is reported
    let finished = pipeline.finish();

    let failed = presented?;
    finished?;
    if failed {
        bail!("analysis stopped after an error; remaining frames were skipped");
    }
    Ok(())
}

/// Consumes analysis results on the calling thread. Returns whether the analyzer failed.
fn present(
    config: &Config,
    style: &OverlayStyle,
    overlay_dir: Option<&Path>,
    events: &Receiver<PipelineEvent>,
) -> anyhow::Result<bool> {
    let mut presenter = ResultPresenter::new(config.display.moving_avg_period);
    let mut failed = false;

    for event in events.iter() {
        match event {
            PipelineEvent::Analyzed { index, result } => {
                let shown = presenter.apply(&result);
                let avg = shown.avg_text.as_deref().unwrap_or("-");
                println!(
                    "frame {index}: {} {} {}",
                    shown.ms_text, avg, shown.fps_text
                );
                for row in &shown.rows {
                    println!("  {:<32} {}", row.name, row.score);
                }

                if let (Some(dir), Detections::Faces(faces)) = (overlay_dir, &result.detections) {
                    let overlay = render_overlay(faces, &result.transform, style);
                    let path = save_overlay(dir, index, &overlay)
                        .with_context(|| format!("failed to write overlay for frame {index}"))?;
                    debug!(path = %path.display(), "wrote overlay");
                }
            }
            PipelineEvent::Failed(message) => {
                warn!("analysis disabled after error");
                eprintln!("error during image analysis: {message}");
                failed = true;
            }
        }
    }

    Ok(failed)
}
