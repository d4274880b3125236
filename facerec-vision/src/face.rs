use crate::yunet;
use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, RgbImage};
use ndarray::{Array1, Array4, ArrayView1};
use ort::{session::Session, value::Value};

/// Dimensionality of an ArcFace embedding.
pub const EMBEDDING_DIM: usize = 512;

/// Side length of the aligned crop fed to the recognizer.
pub const ALIGNED_SIZE: u32 = 112;

// YuNet expects a fixed [1, 3, 640, 640] input
const DETECTOR_INPUT: u32 = 640;

// ArcFace 112x112 template eye positions
const REF_LEFT_EYE: (f32, f32) = (38.2946, 51.6963);
const REF_RIGHT_EYE: (f32, f32) = (73.5318, 51.5014);

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;

/// Raw face found by the detector, in original image pixels.
#[derive(Debug, Clone)]
pub struct Face {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // left eye, right eye, nose, mouth left, mouth right
}

/// Corner-form box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
}

impl From<&Face> for BoundingBox {
    fn from(face: &Face) -> Self {
        let [x, y, w, h] = face.bbox;
        Self {
            x1: x,
            y1: y,
            x2: x + w,
            y2: y + h,
        }
    }
}

/// Unit-length face embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    vector: Array1<f32>,
}

impl Embedding {
    /// Build an embedding from raw model output, L2-normalizing it.
    ///
    /// A zero vector is kept as is.
    pub fn from_raw(values: Vec<f32>) -> Self {
        let mut vector = Array1::from_vec(values);
        let norm = vector.dot(&vector).sqrt();
        if norm > 0.0 {
            vector.mapv_inplace(|x| x / norm);
        }
        Self { vector }
    }

    pub fn len(&self) -> usize {
        self.vector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }

    pub fn view(&self) -> ArrayView1<'_, f32> {
        self.vector.view()
    }

    pub fn as_slice(&self) -> &[f32] {
        // Array1::from_vec is always contiguous
        self.vector.as_slice().unwrap_or(&[])
    }

    /// Cosine similarity; both sides are unit length so this is a dot product.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.len() != other.len() {
            return 0.0;
        }
        self.vector.dot(&other.vector).clamp(-1.0, 1.0)
    }
}

/// A detected face together with its embedding.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bounding_box: BoundingBox,
    pub score: f32,
    pub embedding: Embedding,
}

/// Lay out an RGB image as a planar [1, 3, H, W] tensor.
fn planar_tensor(rgb: &RgbImage, bgr: bool, mean: f32, std: f32) -> Result<Array4<f32>> {
    let (w, h) = rgb.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    let (first, rest) = data.split_at_mut(plane);
    let (second, third) = rest.split_at_mut(plane);
    let (r, g, b) = if bgr {
        (third, second, first)
    } else {
        (first, second, third)
    };
    for (i, px) in rgb.pixels().enumerate() {
        r[i] = (px[0] as f32 - mean) / std;
        g[i] = (px[1] as f32 - mean) / std;
        b[i] = (px[2] as f32 - mean) / std;
    }
    Ok(Array4::from_shape_vec(
        (1, 3, h as usize, w as usize),
        data,
    )?)
}

/// Detect faces with YuNet.
///
/// The frame is letterboxed onto a square canvas so aspect ratio is kept;
/// returned coordinates are mapped back into the original frame.
pub fn detect_faces(
    session: &mut Session,
    img: &DynamicImage,
    score_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Face>> {
    let (orig_w, orig_h) = img.dimensions();
    if orig_w == 0 || orig_h == 0 {
        anyhow::bail!("empty frame");
    }

    let scale = DETECTOR_INPUT as f32 / orig_w.max(orig_h) as f32;
    let new_w = ((orig_w as f32 * scale) as u32).max(1);
    let new_h = ((orig_h as f32 * scale) as u32).max(1);
    let resized = img.resize_exact(new_w, new_h, image::imageops::FilterType::Triangle);

    let mut canvas = DynamicImage::new_rgb8(DETECTOR_INPUT, DETECTOR_INPUT);
    let pad_x = (DETECTOR_INPUT - new_w) / 2;
    let pad_y = (DETECTOR_INPUT - new_h) / 2;
    image::imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    let input = planar_tensor(&canvas.to_rgb8(), true, 0.0, 1.0)?;
    let outputs = session.run(ort::inputs![Value::from_array(input)?])?;

    let mut tensors: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        tensors.push((shape.iter().copied().collect(), data.to_vec()));
    }
    let heads = yunet::parse_outputs(&tensors, DETECTOR_INPUT as usize)?;
    let raw = yunet::decode(&heads, score_threshold, DETECTOR_INPUT as usize)?;

    let size = DETECTOR_INPUT as f32;
    let unpad = |v: f32, pad: u32| (v * size - pad as f32) / scale;
    let mut faces: Vec<Face> = raw
        .into_iter()
        .map(|d| {
            let mut landmarks = [0.0f32; 10];
            for k in 0..5 {
                landmarks[k * 2] = unpad(d.landmarks[k * 2], pad_x);
                landmarks[k * 2 + 1] = unpad(d.landmarks[k * 2 + 1], pad_y);
            }
            Face {
                bbox: [
                    unpad(d.bbox[0], pad_x),
                    unpad(d.bbox[1], pad_y),
                    d.bbox[2] * size / scale,
                    d.bbox[3] * size / scale,
                ],
                score: d.score,
                landmarks,
            }
        })
        .collect();

    if nms_threshold < 1.0 {
        faces = nms(&faces, nms_threshold);
    }
    log::debug!("detected {} face(s)", faces.len());
    Ok(faces)
}

/// Greedy non-maximum suppression, highest score first.
pub fn nms(faces: &[Face], iou_threshold: f32) -> Vec<Face> {
    let mut sorted = faces.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Face> = Vec::new();
    for candidate in sorted {
        if keep
            .iter()
            .all(|kept| iou(&kept.bbox, &candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);
    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }
    let inter = (x2 - x1) * (y2 - y1);
    inter / (a[2] * a[3] + b[2] * b[3] - inter)
}

/// Similarity transform (rotation, uniform scale, translation) mapping the
/// detected eyes onto the ArcFace template, applied by inverse mapping.
pub fn align_face(img: &DynamicImage, face: &Face, size: u32) -> Result<RgbImage> {
    let unit = size as f32 / ALIGNED_SIZE as f32;
    let left = (face.landmarks[0], face.landmarks[1]);
    let right = (face.landmarks[2], face.landmarks[3]);

    let (dx, dy) = (right.0 - left.0, right.1 - left.1);
    let eye_dist = (dx * dx + dy * dy).sqrt();
    if eye_dist < f32::EPSILON {
        anyhow::bail!("degenerate landmarks");
    }
    let ref_dx = REF_RIGHT_EYE.0 - REF_LEFT_EYE.0;
    let ref_dy = REF_RIGHT_EYE.1 - REF_LEFT_EYE.1;
    let scale = unit * (ref_dx * ref_dx + ref_dy * ref_dy).sqrt() / eye_dist;
    let angle = dy.atan2(dx);
    let (sin, cos) = angle.sin_cos();

    // forward: out = M * in + t
    let (a, b, c, d) = (scale * cos, scale * sin, -scale * sin, scale * cos);
    let src_center = ((left.0 + right.0) / 2.0, (left.1 + right.1) / 2.0);
    let dst_center = (
        (REF_LEFT_EYE.0 + REF_RIGHT_EYE.0) / 2.0 * unit,
        (REF_LEFT_EYE.1 + REF_RIGHT_EYE.1) / 2.0 * unit,
    );
    let tx = dst_center.0 - (a * src_center.0 + b * src_center.1);
    let ty = dst_center.1 - (c * src_center.0 + d * src_center.1);
    let det = a * d - b * c;

    let src = img.to_rgb8();
    let mut out = RgbImage::new(size, size);
    for (ox, oy, px) in out.enumerate_pixels_mut() {
        let (u, v) = (ox as f32 - tx, oy as f32 - ty);
        let ix = (d * u - b * v) / det;
        let iy = (-c * u + a * v) / det;
        if let Some(sample) = sample_bilinear(&src, ix, iy) {
            *px = sample;
        }
    }
    Ok(out)
}

fn sample_bilinear(img: &RgbImage, x: f32, y: f32) -> Option<image::Rgb<u8>> {
    let (w, h) = img.dimensions();
    if x < 0.0 || y < 0.0 || x >= w as f32 || y >= h as f32 {
        return None;
    }
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let taps = [
        (img.get_pixel(x0, y0), (1.0 - fx) * (1.0 - fy)),
        (img.get_pixel(x1, y0), fx * (1.0 - fy)),
        (img.get_pixel(x0, y1), (1.0 - fx) * fy),
        (img.get_pixel(x1, y1), fx * fy),
    ];
    let mut rgb = [0u8; 3];
    for (ch, value) in rgb.iter_mut().enumerate() {
        let acc: f32 = taps.iter().map(|(p, wgt)| p[ch] as f32 * wgt).sum();
        *value = acc.round().clamp(0.0, 255.0) as u8;
    }
    Some(image::Rgb(rgb))
}

/// Encode an aligned crop with ArcFace into a 512-d unit embedding.
pub fn encode_face(session: &mut Session, aligned: &RgbImage) -> Result<Embedding> {
    let crop = if aligned.dimensions() == (ALIGNED_SIZE, ALIGNED_SIZE) {
        aligned.clone()
    } else {
        image::imageops::resize(
            aligned,
            ALIGNED_SIZE,
            ALIGNED_SIZE,
            image::imageops::FilterType::Triangle,
        )
    };
    let input = planar_tensor(&crop, false, ARCFACE_MEAN, ARCFACE_STD)?;
    let outputs = session.run(ort::inputs![Value::from_array(input)?])?;
    let (_shape, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .context("reading recognizer output")?;

    if data.len() < EMBEDDING_DIM {
        anyhow::bail!(
            "recognizer produced a {}-d embedding, expected {}",
            data.len(),
            EMBEDDING_DIM
        );
    }
    Ok(Embedding::from_raw(data[..EMBEDDING_DIM].to_vec()))
}
