use std::env;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facerec::lock::DatabaseLock;
use facerec::matcher::Matcher;
use facerec::preview::{FrameSink, NullSink, PreviewFile};
use facerec::{
    config, Error, FaceDatabase, Mode, Pipeline, RunOptions, Session, SessionOutcome, StopSignal,
};
use facerec_vision::{Annotator, Camera};
use log::{info, warn};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "facerec")]
#[command(version, about = "Enroll faces from a webcam and recognize them live")]
struct Cli {
    /// Config file (defaults to the per-user config path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Wait for another session to release the database instead of failing
    #[arg(long, global = true)]
    wait: bool,

    /// Stop after this many frames
    #[arg(long, global = true)]
    max_frames: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture samples of one person and add them to the database
    Enroll {
        /// Name or ID to store the samples under
        #[arg(short, long)]
        name: String,
        /// Number of samples to capture (defaults to the configured value)
        #[arg(short, long)]
        samples: Option<usize>,
    },
    /// Label faces on the camera against the database; type q + Enter to stop
    Recognize {
        /// Similarity a match must exceed (defaults to the configured value)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Show enrolled labels and their sample counts
    List {
        #[arg(long)]
        json: bool,
    },
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll { name, samples } => {
            let mode = Mode::Enroll {
                label: name,
                target: samples.unwrap_or(cfg.samples),
            };
            run_session(&cfg, mode, Matcher::new(cfg.threshold), cli.wait, cli.max_frames)
        }
        Commands::Recognize { threshold } => {
            let matcher = Matcher::try_new(threshold.unwrap_or(cfg.threshold))?;
            run_session(&cfg, Mode::Recognize, matcher, cli.wait, cli.max_frames)
        }
        Commands::List { json } => list(&cfg.data_dir, json, cli.wait),
        Commands::Config => open_config(cli.config.as_deref()),
    }
}

fn run_session(
    cfg: &config::Config,
    mode: Mode,
    matcher: Matcher,
    wait: bool,
    max_frames: Option<usize>,
) -> Result<()> {
    mode.validate()?;

    let mut session = Session::open(&cfg.data_dir, wait).map_err(|e| match e {
        Error::CorruptDatabase { .. } => {
            anyhow::Error::new(e).context("refusing to start with a damaged face database")
        }
        Error::DatabaseLocked(_) => {
            anyhow::Error::new(e).context("another session is running; retry with --wait")
        }
        other => other.into(),
    })?;

    let mut pipeline = Pipeline::new(&cfg.detector_model, &cfg.recognizer_model)
        .context("Failed to initialize face recognition pipeline")?
        .with_thresholds(cfg.detection_score, cfg.nms_threshold);

    let annotator = match &cfg.font {
        Some(font) => Annotator::with_font_file(font)?,
        None => Annotator::new(),
    };
    if !annotator.has_font() {
        warn!("No usable font; frames get boxes without captions");
    }
    let mut sink: Box<dyn FrameSink> = match &cfg.preview {
        Some(path) => {
            info!("Writing annotated frames to {}", path.display());
            Box::new(PreviewFile::new(path)?)
        }
        None => Box::new(NullSink),
    };

    info!("Opening camera: {}", cfg.camera);
    let camera = Camera::open(&cfg.camera)
        .map_err(|e| Error::CameraUnavailable(format!("{}: {:#}", cfg.camera, e)))?;

    let opts = RunOptions {
        matcher,
        max_frames,
        stop: StopSignal::new(),
    };
    watch_stdin(opts.stop.clone());
    info!("Camera opened. Type q + Enter to stop.");

    let outcome = session.run(mode, camera, &mut pipeline, sink.as_mut(), &annotator, &opts)?;
    match outcome {
        SessionOutcome::Enrolled {
            label,
            samples,
            total,
            frames,
        } => {
            info!(
                "✓ {} samples saved for {} over {} frames ({} records total)",
                samples, label, frames, total
            );
            Ok(())
        }
        SessionOutcome::EnrollCancelled {
            label, collected, ..
        } => {
            anyhow::bail!(
                "Enrollment of {} stopped after {} samples; nothing was saved",
                label,
                collected
            )
        }
        SessionOutcome::RecognitionStopped {
            frames,
            hits,
            unknown,
        } => {
            info!("Recognition stopped after {} frames", frames);
            for (label, n) in hits {
                info!("  {}: {} face(s)", label, n);
            }
            if unknown > 0 {
                info!("  UNKNOWN: {} face(s)", unknown);
            }
            Ok(())
        }
    }
}

/// Stop the session when `q` is typed on stdin.
fn watch_stdin(stop: StopSignal) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(l) if l.trim().eq_ignore_ascii_case("q") => {
                    info!("Stop requested");
                    stop.stop();
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("stdin closed: {}", e);
                    return;
                }
            }
        }
    });
}

#[derive(Serialize)]
struct LabelSummary {
    label: String,
    samples: usize,
}

fn list(data_dir: &Path, json: bool, wait: bool) -> Result<()> {
    let lock = if wait {
        DatabaseLock::acquire(data_dir)
    } else {
        DatabaseLock::try_acquire(data_dir)
    }
    .map_err(|e| match e {
        Error::DatabaseLocked(_) => {
            anyhow::Error::new(e).context("a session is saving to the database; retry with --wait")
        }
        other => other.into(),
    })?;
    let db = FaceDatabase::load_locked(&lock).context("Failed to load face database")?;
    drop(lock);

    let summary: Vec<LabelSummary> = db
        .label_counts()
        .into_iter()
        .map(|(label, samples)| LabelSummary { label, samples })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    if summary.is_empty() {
        println!("No faces enrolled in {}", data_dir.display());
        return Ok(());
    }
    for entry in &summary {
        println!("{:<24} {:>6}", entry.label, entry.samples);
    }
    println!("{} record(s) in {}", db.len(), data_dir.display());
    Ok(())
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);
    if !config_path.exists() {
        config::save_config(&config::Config::default(), Some(config_path))
            .context("Failed to write default config")?;
    }
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {}", config_path.display());

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
