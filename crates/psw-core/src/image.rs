use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub const fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    pub fn numel(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn plane(&self) -> usize {
        self.height * self.width
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("buffer length {got} does not match shape {shape:?} (expected {expected})")]
    LengthMismatch {
        shape: ImageShape,
        expected: usize,
        got: usize,
    },
}

/// Channel-height-width `f32` image.
///
/// Pixel values are in `[0, 1]` until a normalization transform runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    shape: ImageShape,
    data: Vec<f32>,
}

impl Image {
    pub fn zeros(shape: ImageShape) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.numel()],
        }
    }

    pub fn from_vec(shape: ImageShape, data: Vec<f32>) -> Result<Self, ImageError> {
        if data.len() != shape.numel() {
            return Err(ImageError::LengthMismatch {
                shape,
                expected: shape.numel(),
                got: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Converts planar `u8` pixels (CHW) into `[0, 1]` floats.
    pub fn from_chw_u8(shape: ImageShape, bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() != shape.numel() {
            return Err(ImageError::LengthMismatch {
                shape,
                expected: shape.numel(),
                got: bytes.len(),
            });
        }
        let data = bytes.iter().map(|&b| f32::from(b) / 255.0).collect();
        Ok(Self { shape, data })
    }

    /// Converts interleaved `u8` pixels (HWC, e.g. decoded RGB) into a CHW image.
    pub fn from_hwc_u8(shape: ImageShape, bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() != shape.numel() {
            return Err(ImageError::LengthMismatch {
                shape,
                expected: shape.numel(),
                got: bytes.len(),
            });
        }
        let mut data = vec![0.0f32; shape.numel()];
        let plane = shape.plane();
        for (px, chunk) in bytes.chunks_exact(shape.channels).enumerate() {
            for (c, &b) in chunk.iter().enumerate() {
                data[c * plane + px] = f32::from(b) / 255.0;
            }
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    fn offset(&self, c: usize, y: usize, x: usize) -> usize {
        (c * self.shape.height + y) * self.shape.width + x
    }

    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[self.offset(c, y, x)]
    }

    pub fn set(&mut self, c: usize, y: usize, x: usize, value: f32) {
        let off = self.offset(c, y, x);
        self.data[off] = value;
    }

    /// Fills rows `[y0, y1)` and cols `[x0, x1)` of every channel, clipped to the image.
    pub fn fill_rect(&mut self, y0: usize, x0: usize, y1: usize, x1: usize, value: f32) {
        let y1 = y1.min(self.shape.height);
        let x1 = x1.min(self.shape.width);
        if y0 >= y1 || x0 >= x1 {
            return;
        }
        for c in 0..self.shape.channels {
            for y in y0..y1 {
                let row = self.offset(c, y, 0);
                self.data[row + x0..row + x1].fill(value);
            }
        }
    }
}
