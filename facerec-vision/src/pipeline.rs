use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage};
use ort::session::Session;

use crate::face::{self, BoundingBox, Detection, Face, ALIGNED_SIZE};

/// Anything that turns a frame into detected faces with embeddings.
pub trait EmbeddingProvider {
    fn detect(&mut self, img: &DynamicImage) -> Result<Vec<Detection>>;
}

/// Full pipeline: detect faces → align → encode
pub struct Pipeline {
    pub detector: Session,
    pub encoder: Session,
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

impl Pipeline {
    pub fn new(detector_model: &Path, recognizer_model: &Path) -> Result<Self> {
        Ok(Self {
            detector: crate::model::detector_session(detector_model)?,
            encoder: crate::model::recog_session(recognizer_model)?,
            score_threshold: 0.6,
            nms_threshold: 0.3,
        })
    }

    pub fn with_thresholds(mut self, score_threshold: f32, nms_threshold: f32) -> Self {
        self.score_threshold = score_threshold;
        self.nms_threshold = nms_threshold;
        self
    }
}

impl EmbeddingProvider for Pipeline {
    fn detect(&mut self, img: &DynamicImage) -> Result<Vec<Detection>> {
        let faces = face::detect_faces(
            &mut self.detector,
            img,
            self.score_threshold,
            self.nms_threshold,
        )
        .context("detecting faces")?;

        let mut detections = Vec::with_capacity(faces.len());
        for (f, aligned) in align_faces(img, &faces) {
            let embedding =
                face::encode_face(&mut self.encoder, &aligned).context("encoding face")?;
            detections.push(Detection {
                bounding_box: BoundingBox::from(f),
                score: f.score,
                embedding,
            });
        }
        Ok(detections)
    }
}

/// Align every face, skipping the ones whose landmarks cannot be used.
fn align_faces<'a>(img: &DynamicImage, faces: &'a [Face]) -> Vec<(&'a Face, RgbImage)> {
    faces
        .iter()
        .filter_map(|f| match face::align_face(img, f, ALIGNED_SIZE) {
            Ok(aligned) => Some((f, aligned)),
            Err(e) => {
                log::warn!("skipping face at {:?}: {:#}", f.bbox, e);
                None
            }
        })
        .collect()
}

impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Box<P> {
    fn detect(&mut self, img: &DynamicImage) -> Result<Vec<Detection>> {
        (**self).detect(img)
    }
}
