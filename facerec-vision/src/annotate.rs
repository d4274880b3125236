//! Frame overlays: face boxes plus a caption above each box.

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::face::BoundingBox;

pub const ENROLL_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const RECOGNIZE_COLOR: Rgb<u8> = Rgb([255, 128, 0]);

const CAPTION_SCALE: f32 = 18.0;
const CAPTION_GAP: i32 = 20;

static DEFAULT_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSansMono.ttf");

/// Draws a box around each face and a caption above it.
pub struct Annotator {
    font: Option<FontArc>,
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new()
    }
}

impl Annotator {
    /// Annotator using the built-in DejaVu Sans Mono.
    pub fn new() -> Self {
        let font = match FontArc::try_from_slice(DEFAULT_FONT) {
            Ok(font) => Some(font),
            Err(e) => {
                log::warn!("built-in font unusable, captions disabled: {}", e);
                None
            }
        };
        Self { font }
    }

    /// Boxes without captions.
    pub fn boxes_only() -> Self {
        Self { font: None }
    }

    pub fn with_font_file(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading font {}", path.display()))?;
        let font = FontArc::try_from_vec(bytes)
            .map_err(|e| anyhow::anyhow!("parsing font {}: {}", path.display(), e))?;
        Ok(Self { font: Some(font) })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn draw(&self, img: &mut RgbImage, bbox: &BoundingBox, caption: &str, color: Rgb<u8>) {
        let (w, h) = img.dimensions();
        let x1 = bbox.x1.clamp(0.0, w as f32) as i32;
        let y1 = bbox.y1.clamp(0.0, h as f32) as i32;
        let x2 = bbox.x2.clamp(0.0, w as f32) as i32;
        let y2 = bbox.y2.clamp(0.0, h as f32) as i32;
        let bw = (x2 - x1).max(1) as u32;
        let bh = (y2 - y1).max(1) as u32;

        draw_hollow_rect_mut(img, Rect::at(x1, y1).of_size(bw, bh), color);
        if bw > 2 && bh > 2 {
            draw_hollow_rect_mut(img, Rect::at(x1 + 1, y1 + 1).of_size(bw - 2, bh - 2), color);
        }

        if let Some(font) = &self.font {
            let ty = (y1 - CAPTION_GAP).max(0);
            draw_text_mut(img, color, x1, ty, PxScale::from(CAPTION_SCALE), font, caption);
        }
    }
}
