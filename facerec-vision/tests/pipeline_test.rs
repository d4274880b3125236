use std::path::{Path, PathBuf};

use anyhow::Result;
use facerec_vision::{EmbeddingProvider, Pipeline, EMBEDDING_DIM};

fn model_dir() -> PathBuf {
    std::env::var("FACEREC_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("models"))
}

fn models() -> Option<(PathBuf, PathBuf)> {
    let dir = model_dir();
    let det = dir.join("face_detection_yunet_2023mar.onnx");
    let rec = dir.join("w600k_r50.onnx");
    (det.exists() && rec.exists()).then_some((det, rec))
}

#[test]
fn test_missing_models_are_reported() {
    let err = Pipeline::new(
        Path::new("/nonexistent/det.onnx"),
        Path::new("/nonexistent/rec.onnx"),
    )
    .err()
    .expect("pipeline should not load");
    assert!(err.to_string().contains("detector model not found"));
}

#[test]
fn test_blank_frame_has_no_faces() -> Result<()> {
    env_logger::try_init().ok();
    let Some((det, rec)) = models() else {
        eprintln!("Skipping: models not found in {}", model_dir().display());
        return Ok(());
    };
    let mut pipeline = Pipeline::new(&det, &rec)?;
    let blank = image::DynamicImage::new_rgb8(320, 240);
    assert!(pipeline.detect(&blank)?.is_empty());
    Ok(())
}

#[test]
fn test_embeddings_are_unit_length() -> Result<()> {
    env_logger::try_init().ok();
    let Some((det, rec)) = models() else {
        eprintln!("Skipping: models not found in {}", model_dir().display());
        return Ok(());
    };
    let img_path = "test_faces/face1.png";
    if !Path::new(img_path).exists() {
        eprintln!("Skipping: {} not found", img_path);
        return Ok(());
    }

    let mut pipeline = Pipeline::new(&det, &rec)?;
    let img = image::open(img_path)?;
    let detections = pipeline.detect(&img)?;
    assert!(!detections.is_empty(), "expected a face in {}", img_path);

    for d in &detections {
        assert_eq!(d.embedding.len(), EMBEDDING_DIM);
        assert!((d.embedding.similarity(&d.embedding) - 1.0).abs() < 1e-4);
        assert!(d.bounding_box.width() > 0.0);
    }
    Ok(())
}
