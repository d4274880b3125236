use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::RgbImage;

/// Destination for annotated frames.
pub trait FrameSink {
    fn show(&mut self, frame: &RgbImage) -> Result<()>;
}

/// Drops every frame.
#[derive(Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn show(&mut self, _frame: &RgbImage) -> Result<()> {
        Ok(())
    }
}

/// Keeps the latest frame in an image file for an external viewer.
///
/// Each frame is written beside the target and renamed over it, so readers
/// never observe a half-written image.
#[derive(Debug)]
pub struct PreviewFile {
    path: PathBuf,
    staging: PathBuf,
}

impl PreviewFile {
    pub fn new(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("preview path {} has no file name", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("png");
        let staging = path.with_file_name(format!(".{}.partial.{}", name.to_string_lossy(), ext));
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            staging,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSink for PreviewFile {
    fn show(&mut self, frame: &RgbImage) -> Result<()> {
        frame
            .save(&self.staging)
            .with_context(|| format!("writing {}", self.staging.display()))?;
        std::fs::rename(&self.staging, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_file_holds_latest_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/preview.png");
        let mut sink = PreviewFile::new(&path).unwrap();

        let mut frame = RgbImage::new(4, 4);
        sink.show(&frame).unwrap();
        frame.put_pixel(1, 1, image::Rgb([9, 8, 7]));
        sink.show(&frame).unwrap();

        let written = image::open(sink.path()).unwrap().to_rgb8();
        assert_eq!(*written.get_pixel(1, 1), image::Rgb([9, 8, 7]));
        assert_eq!(std::fs::read_dir(dir.path().join("out")).unwrap().count(), 1);
    }
}
