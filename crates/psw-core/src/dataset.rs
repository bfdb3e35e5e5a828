use std::sync::Arc;

use rand::RngCore;
use thiserror::Error;

use crate::image::{Image, ImageError, ImageShape};
use crate::types::ClassId;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("sample index {index} out of range for dataset of {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("label count {labels} does not match image count {images}")]
    LabelCountMismatch { labels: usize, images: usize },
    #[error("label {label} at index {index} out of range for {num_classes} classes")]
    LabelOutOfRange {
        index: usize,
        label: ClassId,
        num_classes: usize,
    },
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("load failed for sample {index}: {detail}")]
    Load { index: usize, detail: String },
}

/// Random-access image storage, indexed identically to a label array.
pub trait ImageStore: Send + Sync + 'static {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shape(&self) -> ImageShape;

    fn load(&self, index: usize) -> Result<Image, DatasetError>;
}

/// Planar `u8` images stored back to back (CIFAR style).
#[derive(Debug, Clone)]
pub struct U8ImageStore {
    shape: ImageShape,
    pixels: Arc<[u8]>,
}

impl U8ImageStore {
    pub fn new(shape: ImageShape, pixels: Vec<u8>) -> Result<Self, DatasetError> {
        let per = shape.numel();
        if per == 0 || pixels.len() % per != 0 {
            return Err(DatasetError::Image(ImageError::LengthMismatch {
                shape,
                expected: per,
                got: pixels.len(),
            }));
        }
        Ok(Self {
            shape,
            pixels: pixels.into(),
        })
    }
}

impl ImageStore for U8ImageStore {
    fn len(&self) -> usize {
        self.pixels.len() / self.shape.numel()
    }

    fn shape(&self) -> ImageShape {
        self.shape
    }

    fn load(&self, index: usize) -> Result<Image, DatasetError> {
        let len = self.len();
        if index >= len {
            return Err(DatasetError::IndexOutOfRange { index, len });
        }
        let per = self.shape.numel();
        let start = index * per;
        Ok(Image::from_chw_u8(
            self.shape,
            &self.pixels[start..start + per],
        )?)
    }
}

/// A single fetched example.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: Image,
    pub label: ClassId,
}

/// Per-access sample provider consumed by the batch loader.
///
/// `rng` is owned by the caller and private to this access; sources that
/// randomize per fetch must draw from it so parallel loading stays reproducible.
pub trait SampleSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shape(&self) -> ImageShape;

    fn num_classes(&self) -> usize;

    fn fetch(&self, index: usize, rng: &mut dyn RngCore) -> Result<Sample, DatasetError>;
}

/// Ordered (image, label) pairs with mutable labels.
#[derive(Clone)]
pub struct Dataset {
    name: String,
    num_classes: usize,
    images: Arc<dyn ImageStore>,
    labels: Vec<ClassId>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("num_classes", &self.num_classes)
            .field("len", &self.labels.len())
            .field("shape", &self.images.shape())
            .finish()
    }
}

impl Dataset {
    pub fn new(
        name: impl Into<String>,
        num_classes: usize,
        images: Arc<dyn ImageStore>,
        labels: Vec<ClassId>,
    ) -> Result<Self, DatasetError> {
        if labels.len() != images.len() {
            return Err(DatasetError::LabelCountMismatch {
                labels: labels.len(),
                images: images.len(),
            });
        }
        if let Some((index, &label)) = labels
            .iter()
            .enumerate()
            .find(|(_, l)| l.index() >= num_classes)
        {
            return Err(DatasetError::LabelOutOfRange {
                index,
                label,
                num_classes,
            });
        }
        Ok(Self {
            name: name.into(),
            num_classes,
            images,
            labels,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn shape(&self) -> ImageShape {
        self.images.shape()
    }

    pub fn labels(&self) -> &[ClassId] {
        &self.labels
    }

    pub fn labels_mut(&mut self) -> &mut [ClassId] {
        &mut self.labels
    }

    pub fn image(&self, index: usize) -> Result<Image, DatasetError> {
        self.images.load(index)
    }

    pub fn class_count(&self, class: ClassId) -> usize {
        self.labels.iter().filter(|&&l| l == class).count()
    }

    /// Restricts the dataset to the first `n` examples.
    pub fn truncate(&mut self, n: usize) {
        if n >= self.labels.len() {
            return;
        }
        self.labels.truncate(n);
        self.images = Arc::new(Prefix {
            inner: self.images.clone(),
            len: n,
        });
    }
}

struct Prefix {
    inner: Arc<dyn ImageStore>,
    len: usize,
}

impl ImageStore for Prefix {
    fn len(&self) -> usize {
        self.len
    }

    fn shape(&self) -> ImageShape {
        self.inner.shape()
    }

    fn load(&self, index: usize) -> Result<Image, DatasetError> {
        if index >= self.len {
            return Err(DatasetError::IndexOutOfRange {
                index,
                len: self.len,
            });
        }
        self.inner.load(index)
    }
}

impl SampleSource for Dataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn shape(&self) -> ImageShape {
        self.images.shape()
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn fetch(&self, index: usize, _rng: &mut dyn RngCore) -> Result<Sample, DatasetError> {
        let label = *self
            .labels
            .get(index)
            .ok_or(DatasetError::IndexOutOfRange {
                index,
                len: self.labels.len(),
            })?;
        Ok(Sample {
            image: self.images.load(index)?,
            label,
        })
    }
}
