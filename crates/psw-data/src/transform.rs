//! Per-sample image augmentation and normalization.

use psw_core::image::Image;
use rand::{Rng, RngCore};

use crate::catalog::DatasetSpec;

pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, image: Image, rng: &mut dyn RngCore) -> Image;
}

/// Rotation by a uniform angle in `[-degrees, degrees]`, nearest sampling,
/// zero fill outside the source.
#[derive(Debug, Clone, Copy)]
pub struct RandomRotation {
    pub degrees: f32,
}

impl Transform for RandomRotation {
    fn name(&self) -> &'static str {
        "random_rotation"
    }

    fn apply(&self, image: Image, rng: &mut dyn RngCore) -> Image {
        if self.degrees <= 0.0 {
            return image;
        }
        let angle = rng.gen_range(-self.degrees..=self.degrees).to_radians();
        rotate(&image, angle)
    }
}

fn rotate(image: &Image, angle: f32) -> Image {
    let shape = image.shape();
    let (h, w) = (shape.height, shape.width);
    let (cy, cx) = ((h as f32 - 1.0) * 0.5, (w as f32 - 1.0) * 0.5);
    let (sin, cos) = angle.sin_cos();
    let mut out = Image::zeros(shape);
    for y in 0..h {
        for x in 0..w {
            let (dy, dx) = (y as f32 - cy, x as f32 - cx);
            // Inverse map: rotate the output coordinate back into the source.
            let sx = (cos * dx + sin * dy + cx).round();
            let sy = (-sin * dx + cos * dy + cy).round();
            if sx < 0.0 || sy < 0.0 || sx >= w as f32 || sy >= h as f32 {
                continue;
            }
            let (sy, sx) = (sy as usize, sx as usize);
            for c in 0..shape.channels {
                out.set(c, y, x, image.get(c, sy, sx));
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub struct RandomHorizontalFlip {
    pub p: f64,
}

impl Transform for RandomHorizontalFlip {
    fn name(&self) -> &'static str {
        "random_horizontal_flip"
    }

    fn apply(&self, mut image: Image, rng: &mut dyn RngCore) -> Image {
        if rng.gen::<f64>() >= self.p {
            return image;
        }
        let w = image.shape().width;
        for row in image.data_mut().chunks_exact_mut(w) {
            row.reverse();
        }
        image
    }
}

/// Reflect-pads by `padding` on every side, then crops back to the original
/// size at a uniform offset.
#[derive(Debug, Clone, Copy)]
pub struct RandomCrop {
    pub padding: usize,
}

fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    if n == 1 {
        return 0;
    }
    let mut i = i;
    while i < 0 || i >= n {
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * (n - 1) - i;
        }
    }
    i as usize
}

impl Transform for RandomCrop {
    fn name(&self) -> &'static str {
        "random_crop"
    }

    fn apply(&self, image: Image, rng: &mut dyn RngCore) -> Image {
        if self.padding == 0 {
            return image;
        }
        let pad = self.padding as isize;
        let top = rng.gen_range(0..=2 * self.padding) as isize - pad;
        let left = rng.gen_range(0..=2 * self.padding) as isize - pad;
        crop_reflect(&image, top, left)
    }
}

fn crop_reflect(image: &Image, top: isize, left: isize) -> Image {
    let shape = image.shape();
    let mut out = Image::zeros(shape);
    for c in 0..shape.channels {
        for y in 0..shape.height {
            let sy = reflect(top + y as isize, shape.height);
            for x in 0..shape.width {
                let sx = reflect(left + x as isize, shape.width);
                out.set(c, y, x, image.get(c, sy, sx));
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub struct Normalize {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Transform for Normalize {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn apply(&self, mut image: Image, _rng: &mut dyn RngCore) -> Image {
        let plane = image.shape().plane();
        for (c, channel) in image.data_mut().chunks_exact_mut(plane).enumerate() {
            let (mean, std) = (self.mean[c % 3], self.std[c % 3]);
            for v in channel {
                *v = (*v - mean) / std;
            }
        }
        image
    }
}

/// Ordered transform chain.
#[derive(Default)]
pub struct Pipeline {
    steps: Vec<Box<dyn Transform>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|s| s.name()))
            .finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, step: impl Transform + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Transform for Pipeline {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    fn apply(&self, image: Image, rng: &mut dyn RngCore) -> Image {
        self.steps
            .iter()
            .fold(image, |img, step| step.apply(img, rng))
    }
}

pub fn train_transforms(spec: &DatasetSpec) -> Pipeline {
    Pipeline::new()
        .then(RandomRotation { degrees: 10.0 })
        .then(RandomHorizontalFlip { p: 0.5 })
        .then(RandomCrop {
            padding: spec.shape.height / 8,
        })
        .then(Normalize {
            mean: spec.mean,
            std: spec.std,
        })
}

pub fn test_transforms(spec: &DatasetSpec) -> Pipeline {
    Pipeline::new().then(Normalize {
        mean: spec.mean,
        std: spec.std,
    })
}
