//! Image classifiers trained by the sweep.
//!
//! Each backbone is first built in its published ImageNet layout so that
//! torchvision / timm state dicts load onto it unchanged, then
//! [`BackboneModel::adapt`] swaps the stem and head for the dataset at hand.

mod efficientnet;
pub mod pretrained;
mod resnet;
mod vgg;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use psw_core::image::ImageShape;
use psw_core::types::TypeError;

use crate::TrainError;

pub use efficientnet::{EfficientNetV2, EfficientNetV2Config};
pub use resnet::{ResNet18, ResNet18Config};
pub use vgg::{Vgg16, Vgg16Config};

/// Images whose longer side is at most this many pixels get the small-input
/// stem: stride-1 first convolution and no early downsampling.
pub const SMALL_INPUT_MAX: usize = 64;

pub fn is_small_input(input: ImageShape) -> bool {
    input.height.max(input.width) <= SMALL_INPUT_MAX
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backbone {
    Resnet18,
    EfficientnetV2B0,
    Vgg16,
}

impl Backbone {
    pub fn name(self) -> &'static str {
        match self {
            Backbone::Resnet18 => "resnet18",
            Backbone::EfficientnetV2B0 => "efficientnet_v2_b0",
            Backbone::Vgg16 => "vgg16",
        }
    }
}

impl fmt::Display for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backbone {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect();
        match norm.as_str() {
            "resnet18" | "resnet" => Ok(Backbone::Resnet18),
            "efficientnetv2b0" | "efficientnet" => Ok(Backbone::EfficientnetV2B0),
            "vgg16" | "vgg" => Ok(Backbone::Vgg16),
            _ => Err(TypeError::Unknown {
                kind: "backbone",
                value: s.to_string(),
            }),
        }
    }
}

/// Where a sweep point's initial weights come from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Weights {
    /// Fresh initialization.
    Random,
    /// The published ImageNet weights of the backbone, downloaded once into
    /// `<data_root>/weights`.
    #[default]
    Imagenet,
    /// A PyTorch state dict (`.pth`/`.pt`) or a model record written by a
    /// previous sweep (`.mpk`).
    File(PathBuf),
}

impl fmt::Display for Weights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Weights::Random => f.write_str("random"),
            Weights::Imagenet => f.write_str("imagenet"),
            Weights::File(path) => write!(f, "{}", path.display()),
        }
    }
}

impl FromStr for Weights {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" => Err(TypeError::Unknown {
                kind: "weights",
                value: s.to_string(),
            }),
            "random" | "none" => Ok(Weights::Random),
            "imagenet" | "pretrained" => Ok(Weights::Imagenet),
            _ => Ok(Weights::File(PathBuf::from(trimmed))),
        }
    }
}

/// Forward pass shared by every backbone.
pub trait ImageClassifier<B: Backend>: Module<B> {
    /// `[batch, channels, height, width]` images to `[batch, classes]` logits.
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Construction steps shared by the backbones.
pub trait BackboneModel<B: Backend>: ImageClassifier<B> + Sized {
    const BACKBONE: Backbone;

    /// The published ImageNet layout: 3 input channels, 1000 classes.
    fn published(device: &B::Device) -> Self;

    /// Regex renames from the published state-dict keys onto this module's fields.
    fn torch_key_remap() -> Vec<(&'static str, &'static str)>;

    /// Replaces the stem and classifier so the network takes `input` images
    /// and predicts `num_classes` classes.
    fn adapt(
        self,
        input: ImageShape,
        num_classes: usize,
        device: &B::Device,
    ) -> Result<Self, TrainError>;
}

/// Published network, optionally loaded from `weights`, fitted to the dataset.
pub fn build<B: Backend, M: BackboneModel<B>>(
    input: ImageShape,
    num_classes: usize,
    weights: Option<&std::path::Path>,
    device: &B::Device,
) -> Result<M, TrainError> {
    if num_classes < 2 {
        return Err(TrainError::Config(format!(
            "need at least 2 classes, got {num_classes}"
        )));
    }
    match weights {
        Some(path) if pretrained::is_model_record(path) => {
            let model = M::published(device).adapt(input, num_classes, device)?;
            pretrained::load_model_record(model, path, device)
        }
        Some(path) => {
            let model = pretrained::load_torch(M::published(device), path, device)?;
            model.adapt(input, num_classes, device)
        }
        None => M::published(device).adapt(input, num_classes, device),
    }
}

pub(crate) fn conv<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .init(device)
}

pub(crate) fn batch_norm<B: Backend>(
    features: usize,
    epsilon: f64,
    device: &B::Device,
) -> BatchNorm<B, 2> {
    BatchNormConfig::new(features)
        .with_epsilon(epsilon)
        .init(device)
}

/// `(before, after)` zero padding that makes a strided convolution produce
/// `ceil(size / stride)` outputs, with the odd pixel going after.
pub(crate) fn same_padding(size: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let out = size.div_ceil(stride);
    let total = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(size);
    (total / 2, total - total / 2)
}

pub(crate) fn pad_same<B: Backend>(x: Tensor<B, 4>, kernel: usize, stride: usize) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    let (top, bottom) = same_padding(h, kernel, stride);
    let (left, right) = same_padding(w, kernel, stride);
    if top + bottom + left + right == 0 {
        return x;
    }
    x.pad((left, right, top, bottom), 0.0)
}

/// Spatial size after a `kernel`/`stride`/`padding` window.
pub(crate) fn conv_out(size: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (size + 2 * padding).saturating_sub(kernel) / stride + 1
}
