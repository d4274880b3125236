//! One enrollment or recognition run over a locked face database.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use facerec_vision::annotate::{Annotator, ENROLL_COLOR, RECOGNIZE_COLOR};
use facerec_vision::{EmbeddingProvider, FrameSource};
use image::{DynamicImage, RgbImage};

use crate::enroll::{EnrollState, Enrollment};
use crate::error::{Error, Result};
use crate::lock::DatabaseLock;
use crate::matcher::Matcher;
use crate::preview::FrameSink;
use crate::recognize::Recognition;
use crate::storage::FaceDatabase;

/// Consecutive capture failures tolerated before the camera is given up on.
pub const MAX_CAPTURE_FAILURES: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Enroll { label: String, target: usize },
    Recognize,
}

impl Mode {
    /// Check user input without touching any device.
    pub fn validate(&self) -> Result<()> {
        if let Mode::Enroll { label, target } = self {
            Enrollment::new(*target)?.set_label(label)?;
        }
        Ok(())
    }
}

/// Shared flag a control surface flips to end a running session.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Enrolled {
        label: String,
        samples: usize,
        total: usize,
        frames: usize,
    },
    EnrollCancelled {
        label: String,
        collected: usize,
        frames: usize,
    },
    RecognitionStopped {
        frames: usize,
        hits: Vec<(String, usize)>,
        unknown: usize,
    },
}

/// Per-session options that are not part of the mode itself.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub matcher: Matcher,
    pub max_frames: Option<usize>,
    pub stop: StopSignal,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            matcher: Matcher::default(),
            max_frames: None,
            stop: StopSignal::new(),
        }
    }
}

enum Flow {
    Enroll(Enrollment),
    Recognize(Recognition),
}

/// Holds the database lock and the in-memory database for one session.
///
/// The database is loaded once when the session opens and only written
/// back by a completed enrollment.
#[derive(Debug)]
pub struct Session {
    dir: PathBuf,
    db: FaceDatabase,
    _lock: DatabaseLock,
}

impl Session {
    /// Lock `dir` and load its database. With `wait` unset a held lock is
    /// reported as `DatabaseLocked` instead of blocking.
    pub fn open(dir: &Path, wait: bool) -> Result<Self> {
        let lock = if wait {
            DatabaseLock::acquire(dir)?
        } else {
            DatabaseLock::try_acquire(dir)?
        };
        let db = FaceDatabase::load_locked(&lock)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            db,
            _lock: lock,
        })
    }

    pub fn database(&self) -> &FaceDatabase {
        &self.db
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Drive frames from `source` until the mode finishes, the stop signal
    /// fires or `max_frames` is reached. `source` is dropped before this
    /// returns, whatever the outcome, and samples from an enrollment that
    /// did not complete are discarded from the session's database.
    pub fn run<S, P, K>(
        &mut self,
        mode: Mode,
        mut source: S,
        provider: &mut P,
        sink: &mut K,
        annotator: &Annotator,
        opts: &RunOptions,
    ) -> Result<SessionOutcome>
    where
        S: FrameSource,
        P: EmbeddingProvider + ?Sized,
        K: FrameSink + ?Sized,
    {
        let baseline = self.db.len();
        let mut flow = match mode {
            Mode::Enroll { label, target } => {
                let mut enrollment = Enrollment::new(target)?;
                enrollment.set_label(&label)?;
                log::info!(
                    "enrolling {} ({} samples, {} record(s) on file)",
                    label,
                    target,
                    self.db.len()
                );
                Flow::Enroll(enrollment)
            }
            Mode::Recognize => {
                if self.db.is_empty() {
                    log::warn!("face database is empty, every face will be UNKNOWN");
                }
                log::info!(
                    "recognizing against {} record(s), threshold {:.2}",
                    self.db.len(),
                    opts.matcher.threshold
                );
                Flow::Recognize(Recognition::new(opts.matcher))
            }
        };

        let driven = self.drive(&mut flow, &mut source, provider, sink, annotator, opts);
        drop(source);

        let finished = matches!(&flow, Flow::Enroll(e) if e.state() == EnrollState::Done);
        if !finished {
            self.db.truncate(baseline);
        }
        let frames = driven?;

        Ok(match flow {
            Flow::Enroll(enrollment) => {
                let label = enrollment.label().unwrap_or_default().to_string();
                if enrollment.state() == EnrollState::Done {
                    SessionOutcome::Enrolled {
                        label,
                        samples: enrollment.collected(),
                        total: self.db.len(),
                        frames,
                    }
                } else {
                    log::warn!(
                        "enrollment stopped at {}/{}, nothing saved",
                        enrollment.collected(),
                        enrollment.target()
                    );
                    SessionOutcome::EnrollCancelled {
                        label,
                        collected: enrollment.collected(),
                        frames,
                    }
                }
            }
            Flow::Recognize(recognition) => SessionOutcome::RecognitionStopped {
                frames,
                hits: recognition.hits().to_vec(),
                unknown: recognition.unknown(),
            },
        })
    }

    /// Pull and process frames until the flow finishes or a stop condition
    /// hits, returning how many frames were processed.
    fn drive<S, P, K>(
        &mut self,
        flow: &mut Flow,
        source: &mut S,
        provider: &mut P,
        sink: &mut K,
        annotator: &Annotator,
        opts: &RunOptions,
    ) -> Result<usize>
    where
        S: FrameSource,
        P: EmbeddingProvider + ?Sized,
        K: FrameSink + ?Sized,
    {
        let mut frames = 0usize;
        let mut failures = 0usize;
        loop {
            if opts.stop.is_stopped() || opts.max_frames.is_some_and(|max| frames >= max) {
                return Ok(frames);
            }

            let frame = match source.frame() {
                Ok(frame) => {
                    failures = 0;
                    frame
                }
                Err(e) => {
                    failures += 1;
                    log::warn!("capture failed ({}/{}): {:#}", failures, MAX_CAPTURE_FAILURES, e);
                    if failures >= MAX_CAPTURE_FAILURES {
                        return Err(Error::CameraUnavailable(format!("{:#}", e)));
                    }
                    continue;
                }
            };
            frames += 1;

            let shown = self.process_frame(flow, provider, annotator, frame);
            if let Err(e) = sink.show(&shown) {
                log::warn!("could not display frame {}: {:#}", frames, e);
            }

            if let Flow::Enroll(enrollment) = flow {
                if enrollment.state() == EnrollState::Saving {
                    enrollment.save_once(&self.db, &self.dir)?;
                }
                if enrollment.state() == EnrollState::Done {
                    return Ok(frames);
                }
            }
        }
    }

    /// Annotate one frame. Any failure is logged and the frame passes
    /// through untouched.
    fn process_frame<P>(
        &mut self,
        flow: &mut Flow,
        provider: &mut P,
        annotator: &Annotator,
        frame: RgbImage,
    ) -> RgbImage
    where
        P: EmbeddingProvider + ?Sized,
    {
        let img = DynamicImage::ImageRgb8(frame);
        match self.annotate(flow, provider, annotator, &img) {
            Ok(annotated) => annotated,
            Err(e) => {
                log::warn!("{}", e);
                img.into_rgb8()
            }
        }
    }

    fn annotate<P>(
        &mut self,
        flow: &mut Flow,
        provider: &mut P,
        annotator: &Annotator,
        img: &DynamicImage,
    ) -> Result<RgbImage>
    where
        P: EmbeddingProvider + ?Sized,
    {
        let detections = provider
            .detect(img)
            .map_err(|e| Error::FrameProcessing(format!("{:#}", e)))?;
        let mut canvas = img.to_rgb8();

        match flow {
            Flow::Enroll(enrollment) => {
                let progress = enrollment
                    .record(&mut self.db, &detections)
                    .map_err(|e| Error::FrameProcessing(e.to_string()))?;
                for (detection, count) in detections.iter().zip(progress) {
                    let caption = match count {
                        Some(n) => format!("{}/{}", n, enrollment.target()),
                        None => String::new(),
                    };
                    annotator.draw(&mut canvas, &detection.bounding_box, &caption, ENROLL_COLOR);
                }
            }
            Flow::Recognize(recognition) => {
                let results = recognition.identify(&self.db, &detections);
                for (detection, result) in detections.iter().zip(results) {
                    let caption = result.identity.to_string();
                    annotator.draw(&mut canvas, &detection.bounding_box, &caption, RECOGNIZE_COLOR);
                }
            }
        }
        Ok(canvas)
    }
}
