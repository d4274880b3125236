//! YuNet post-processing.
//!
//! YuNet is anchor-free. For each stride (8, 16, 32) the model emits four
//! tensors shaped `[1, H*W, C]`: `cls` (C=1), `obj` (C=1), `bbox` (C=4) and
//! `kps` (C=10), in the order cls_8, cls_16, cls_32, obj_8, ..., kps_32.
//!
//! Decoding per grid cell (row r, col c):
//! - score = sqrt(cls * obj)
//! - center = ((c + dx) * stride, (r + dy) * stride)
//! - size = (exp(dw) * stride, exp(dh) * stride)
//! - landmark k = ((c + kx) * stride, (r + ky) * stride)

use anyhow::Result;
use ndarray::Array2;

pub const STRIDES: [usize; 3] = [8, 16, 32];

/// Detector output for one stride.
#[derive(Debug, Clone)]
pub struct Head {
    pub stride: usize,
    pub scores: Vec<f32>,
    pub bbox: Array2<f32>,
    pub kps: Array2<f32>,
}

/// Detection with coordinates normalized to the square input.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10],
}

fn tensor<'a>(
    outputs: &'a [(Vec<i64>, Vec<f32>)],
    index: usize,
    rows: usize,
    cols: usize,
) -> Result<&'a [f32]> {
    let (shape, data) = outputs
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("missing detector output {}", index))?;
    let expected = [1, rows as i64, cols as i64];
    if shape.as_slice() != expected || data.len() != rows * cols {
        anyhow::bail!(
            "detector output {} has shape {:?}, expected {:?}",
            index,
            shape,
            expected
        );
    }
    Ok(data)
}

/// Group the twelve raw output tensors into per-stride heads.
pub fn parse_outputs(outputs: &[(Vec<i64>, Vec<f32>)], input_size: usize) -> Result<Vec<Head>> {
    let n = STRIDES.len();
    let mut heads = Vec::with_capacity(n);
    for (i, &stride) in STRIDES.iter().enumerate() {
        let cells = (input_size / stride).pow(2);
        let cls = tensor(outputs, i, cells, 1)?;
        let obj = tensor(outputs, i + n, cells, 1)?;
        let bbox = tensor(outputs, i + 2 * n, cells, 4)?;
        let kps = tensor(outputs, i + 3 * n, cells, 10)?;

        let scores = cls
            .iter()
            .zip(obj)
            .map(|(c, o)| (c.clamp(0.0, 1.0) * o.clamp(0.0, 1.0)).sqrt())
            .collect();
        heads.push(Head {
            stride,
            scores,
            bbox: Array2::from_shape_vec((cells, 4), bbox.to_vec())?,
            kps: Array2::from_shape_vec((cells, 10), kps.to_vec())?,
        });
    }
    Ok(heads)
}

/// Decode every cell scoring at least `score_threshold`.
pub fn decode(heads: &[Head], score_threshold: f32, input_size: usize) -> Result<Vec<RawDetection>> {
    let size = input_size as f32;
    let mut detections = Vec::new();

    for head in heads {
        let grid = input_size / head.stride;
        if head.scores.len() != grid * grid {
            anyhow::bail!(
                "stride {} expects {} cells, got {}",
                head.stride,
                grid * grid,
                head.scores.len()
            );
        }
        let stride = head.stride as f32;

        for (idx, &score) in head.scores.iter().enumerate() {
            if score < score_threshold {
                continue;
            }
            let (row, col) = ((idx / grid) as f32, (idx % grid) as f32);

            let cx = (col + head.bbox[[idx, 0]]) * stride;
            let cy = (row + head.bbox[[idx, 1]]) * stride;
            let w = head.bbox[[idx, 2]].exp() * stride;
            let h = head.bbox[[idx, 3]].exp() * stride;

            let mut landmarks = [0.0f32; 10];
            for k in 0..5 {
                landmarks[k * 2] = (col + head.kps[[idx, k * 2]]) * stride / size;
                landmarks[k * 2 + 1] = (row + head.kps[[idx, k * 2 + 1]]) * stride / size;
            }

            detections.push(RawDetection {
                bbox: [
                    (cx - w / 2.0) / size,
                    (cy - h / 2.0) / size,
                    w / size,
                    h / size,
                ],
                score,
                landmarks,
            });
        }
    }

    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_outputs(input_size: usize) -> Vec<(Vec<i64>, Vec<f32>)> {
        let mut out = Vec::new();
        for cols in [1usize, 1, 4, 10] {
            for stride in STRIDES {
                let cells = (input_size / stride).pow(2);
                out.push((vec![1, cells as i64, cols as i64], vec![0.0; cells * cols]));
            }
        }
        out
    }

    #[test]
    fn test_decode_single_cell() {
        let input_size = 640;
        let mut outputs = empty_outputs(input_size);

        // stride 32 grid is 20x20, light up (row 10, col 10)
        let idx = 10 * 20 + 10;
        outputs[2].1[idx] = 0.81; // cls_32
        outputs[5].1[idx] = 1.0; // obj_32
        let bbox = &mut outputs[8].1;
        bbox[idx * 4] = 0.5;
        bbox[idx * 4 + 1] = 0.25;
        bbox[idx * 4 + 2] = 2.0f32.ln() * 2.0; // exp -> 4
        bbox[idx * 4 + 3] = 2.0f32.ln() * 2.0;

        let heads = parse_outputs(&outputs, input_size).unwrap();
        let dets = decode(&heads, 0.5, input_size).unwrap();
        assert_eq!(dets.len(), 1);
        let d = &dets[0];

        // center (10.5 * 32, 10.25 * 32) = (336, 328), size 128
        assert!((d.score - 0.9).abs() < 1e-5);
        assert!((d.bbox[0] - (336.0 - 64.0) / 640.0).abs() < 1e-4);
        assert!((d.bbox[1] - (328.0 - 64.0) / 640.0).abs() < 1e-4);
        assert!((d.bbox[2] - 0.2).abs() < 1e-4);
        assert!((d.bbox[3] - 0.2).abs() < 1e-4);
        assert!((d.landmarks[0] - 0.5).abs() < 1e-5);
        assert!((d.landmarks[1] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_below_threshold_is_dropped() {
        let input_size = 640;
        let heads = parse_outputs(&empty_outputs(input_size), input_size).unwrap();
        assert!(decode(&heads, 0.5, input_size).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_shape() {
        let input_size = 640;
        let mut outputs = empty_outputs(input_size);
        outputs[6].0 = vec![1, 6400, 3];
        assert!(parse_outputs(&outputs, input_size).is_err());
        outputs.truncate(5);
        assert!(parse_outputs(&outputs, input_size).is_err());
    }
}
