use anyhow::{Context, Result};
use image::RgbImage;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

/// A blocking supplier of RGB frames.
pub trait FrameSource {
    fn frame(&mut self) -> Result<RgbImage>;
}

/// V4L2 capture device. The device is released when the camera is dropped.
pub struct Camera {
    stream: Stream<'static>,
    device: String,
    width: u32,
    height: u32,
    fourcc: FourCC,
}

impl Camera {
    pub fn open(device: &str) -> Result<Self> {
        let dev = Device::with_path(device).with_context(|| format!("open camera {}", device))?;
        let mut fmt = dev.format().context("get format")?;
        // Prefer RGB, fallback to YUYV, else accept existing format
        let desired = Format::new(fmt.width, fmt.height, FourCC::new(b"RGB3"));
        fmt = dev.set_format(&desired).unwrap_or(fmt);
        if fmt.fourcc != FourCC::new(b"RGB3") {
            let yuyv = Format::new(fmt.width, fmt.height, FourCC::new(b"YUYV"));
            fmt = dev.set_format(&yuyv).unwrap_or(fmt);
        }
        let stream = Stream::with_buffers(&dev, Type::VideoCapture, 4).context("stream")?;
        log::info!(
            "camera {} opened: {}x{} {:?}",
            device,
            fmt.width,
            fmt.height,
            fmt.fourcc
        );
        Ok(Self {
            stream,
            device: device.to_string(),
            width: fmt.width,
            height: fmt.height,
            fourcc: fmt.fourcc,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl FrameSource for Camera {
    fn frame(&mut self) -> Result<RgbImage> {
        let (data, meta) = self.stream.next().context("capture frame")?;
        log::debug!(
            "captured frame: seq={} len={} fourcc={:?}",
            meta.sequence,
            data.len(),
            self.fourcc
        );
        let buf = to_rgb(self.fourcc, self.width, self.height, data)?;
        RgbImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| anyhow::anyhow!("failed to build image buffer"))
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        log::debug!("releasing camera {}", self.device);
    }
}

/// Convert a raw capture buffer into packed RGB of exactly `width * height * 3` bytes.
pub fn to_rgb(fourcc: FourCC, width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>> {
    let pixels = (width * height) as usize;
    let mut out = match &fourcc.repr {
        b"RGB3" => data.to_vec(),
        b"YUYV" => yuyv_to_rgb(pixels, data)?,
        b"GREY" => grey_to_rgb(pixels, data)?,
        _ => {
            log::warn!("unexpected pixel format {:?}, passing through raw", fourcc);
            data.to_vec()
        }
    };
    let expected = pixels * 3;
    if out.len() < expected {
        anyhow::bail!("buffer too small: got {}, expected {}", out.len(), expected);
    }
    out.truncate(expected);
    Ok(out)
}

fn yuyv_to_rgb(pixels: usize, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < pixels * 2 {
        anyhow::bail!("short YUYV buffer");
    }
    let mut out = Vec::with_capacity(pixels * 3);
    for chunk in data[..pixels * 2].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0] as f32, chunk[2] as f32] {
            out.push(clamp(y + 1.402 * v));
            out.push(clamp(y - 0.344136 * u - 0.714136 * v));
            out.push(clamp(y + 1.772 * u));
        }
    }
    Ok(out)
}

fn clamp(v: f32) -> u8 {
    v.clamp(0.0, 255.0) as u8
}

fn grey_to_rgb(pixels: usize, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < pixels {
        anyhow::bail!("short GREY buffer");
    }
    Ok(data[..pixels].iter().flat_map(|&y| [y, y, y]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grey_expands_to_rgb() {
        let out = to_rgb(FourCC::new(b"GREY"), 2, 1, &[7, 9]).unwrap();
        assert_eq!(out, vec![7, 7, 7, 9, 9, 9]);
    }

    #[test]
    fn test_yuyv_neutral_chroma_is_grey() {
        let out = to_rgb(FourCC::new(b"YUYV"), 2, 1, &[100, 128, 200, 128]).unwrap();
        assert_eq!(out, vec![100, 100, 100, 200, 200, 200]);
    }

    #[test]
    fn test_short_buffer_is_error() {
        assert!(to_rgb(FourCC::new(b"RGB3"), 2, 2, &[0; 5]).is_err());
        assert!(to_rgb(FourCC::new(b"YUYV"), 2, 2, &[0; 3]).is_err());
    }

    #[test]
    fn test_oversized_buffer_is_truncated() {
        let out = to_rgb(FourCC::new(b"RGB3"), 1, 1, &[1, 2, 3, 4]).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }
}
