use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::matcher::Matcher;

pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| match option_env!("FACEREC_CONFIG_PATH") {
    Some(p) => PathBuf::from(p),
    None => directories::ProjectDirs::from("", "", "facerec")
        .map(|d| d.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("facerec.toml")),
});

pub static DATA_DIR: Lazy<PathBuf> = Lazy::new(|| match option_env!("FACEREC_DATA_DIR") {
    Some(p) => PathBuf::from(p),
    None => directories::ProjectDirs::from("", "", "facerec")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("data")),
});

/// Default number of samples captured per enrollment.
pub const DEFAULT_SAMPLES: usize = 80;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum cosine similarity (exclusive) for a match to be accepted.
    pub threshold: f32,
    pub camera: String,
    pub data_dir: PathBuf,
    pub detector_model: PathBuf,
    pub recognizer_model: PathBuf,
    /// Detector confidence cutoff.
    pub detection_score: f32,
    pub nms_threshold: f32,
    pub samples: usize,
    /// TrueType font for captions; the built-in DejaVu Sans Mono when unset.
    pub font: Option<PathBuf>,
    /// Where the latest annotated frame is written, if anywhere.
    pub preview: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: 0.55,
            camera: "/dev/video0".to_string(),
            data_dir: DATA_DIR.clone(),
            detector_model: PathBuf::from("models/face_detection_yunet_2023mar.onnx"),
            recognizer_model: PathBuf::from("models/w600k_r50.onnx"),
            detection_score: 0.6,
            nms_threshold: 0.3,
            samples: DEFAULT_SAMPLES,
            font: None,
            preview: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        Matcher::try_new(self.threshold)?;
        if self.samples == 0 {
            anyhow::bail!("samples must be positive");
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validating config {}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
