//! Decoded image frames.
//!
//! Frames carry pixel data in a fixed red-green-blue channel order regardless
//! of how the underlying container stores it, so processors never need to
//! know about the on-disk format.

use std::path::Path;

use anyhow::{anyhow, Context, Result};

/// A decoded frame: tightly packed RGB8 pixels plus dimensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    /// Wrap a pixel buffer. The buffer length must be exactly
    /// `width * height * 3`.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} rgb",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Raw RGB8 bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Decode an image file into an RGB8 frame.
pub fn decode_image(path: &Path) -> Result<Frame> {
    let decoded =
        image::open(path).with_context(|| format!("decode image {}", path.display()))?;
    let rgb = decoded.into_rgb8();
    let (width, height) = rgb.dimensions();
    Frame::new(rgb.into_raw(), width, height)
}
