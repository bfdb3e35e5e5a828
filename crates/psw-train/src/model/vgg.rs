use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::module::{adaptive_avg_pool2d, max_pool2d};

use psw_core::image::ImageShape;

use super::{Backbone, BackboneModel, ImageClassifier};
use crate::TrainError;

/// Output channels of the 13 convolutions; a 2x2 max-pool follows the last
/// convolution of each block.
const CONVS: [usize; 13] = [64, 64, 128, 128, 256, 256, 256, 512, 512, 512, 512, 512, 512];
const POOL_AFTER: [usize; 5] = [1, 3, 6, 9, 12];
const POOLED: usize = 7;
const MIN_SIDE: usize = 32;

fn conv3x3<B: Backend>(in_ch: usize, out_ch: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_ch, out_ch], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

#[derive(Config, Debug)]
pub struct Vgg16Config {
    #[config(default = 3)]
    pub channels: usize,
    #[config(default = 1000)]
    pub num_classes: usize,
    /// Width of the two hidden classifier layers.
    #[config(default = 4096)]
    pub hidden: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl Vgg16Config {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Vgg16<B> {
        let mut in_ch = self.channels;
        let conv = CONVS
            .iter()
            .map(|&out| {
                let layer = conv3x3(in_ch, out, device);
                in_ch = out;
                layer
            })
            .collect();
        Vgg16 {
            conv,
            fc1: LinearConfig::new(512 * POOLED * POOLED, self.hidden).init(device),
            fc2: LinearConfig::new(self.hidden, self.hidden).init(device),
            fc3: LinearConfig::new(self.hidden, self.num_classes).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

/// torchvision VGG-16 (no batch norm).
#[derive(Module, Debug)]
pub struct Vgg16<B: Backend> {
    conv: Vec<Conv2d<B>>,
    fc1: Linear<B>,
    fc2: Linear<B>,
    fc3: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> ImageClassifier<B> for Vgg16<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for (i, conv) in self.conv.iter().enumerate() {
            x = relu(conv.forward(x));
            if POOL_AFTER.contains(&i) {
                x = max_pool2d(x, [2, 2], [2, 2], [0, 0], [1, 1]);
            }
        }
        let x = adaptive_avg_pool2d(x, [POOLED, POOLED]).flatten::<2>(1, 3);
        let x = self.dropout.forward(relu(self.fc1.forward(x)));
        let x = self.dropout.forward(relu(self.fc2.forward(x)));
        self.fc3.forward(x)
    }
}

impl<B: Backend> BackboneModel<B> for Vgg16<B> {
    const BACKBONE: Backbone = Backbone::Vgg16;

    fn published(device: &B::Device) -> Self {
        Vgg16Config::new().init(device)
    }

    fn torch_key_remap() -> Vec<(&'static str, &'static str)> {
        // torchvision interleaves ReLU and pooling modules in `features`.
        vec![
            (r"^features\.0\.", "conv.0."),
            (r"^features\.2\.", "conv.1."),
            (r"^features\.5\.", "conv.2."),
            (r"^features\.7\.", "conv.3."),
            (r"^features\.10\.", "conv.4."),
            (r"^features\.12\.", "conv.5."),
            (r"^features\.14\.", "conv.6."),
            (r"^features\.17\.", "conv.7."),
            (r"^features\.19\.", "conv.8."),
            (r"^features\.21\.", "conv.9."),
            (r"^features\.24\.", "conv.10."),
            (r"^features\.26\.", "conv.11."),
            (r"^features\.28\.", "conv.12."),
            (r"^classifier\.0\.", "fc1."),
            (r"^classifier\.3\.", "fc2."),
            (r"^classifier\.6\.", "fc3."),
        ]
    }

    /// Rebuilds the last classifier layer for `num_classes`; inputs need at
    /// least 32 pixels per side to survive the five pooling stages.
    fn adapt(
        mut self,
        input: ImageShape,
        num_classes: usize,
        device: &B::Device,
    ) -> Result<Self, TrainError> {
        if input.height < MIN_SIDE || input.width < MIN_SIDE {
            return Err(TrainError::Architecture {
                backbone: Backbone::Vgg16.name(),
                input,
                reason: format!("needs at least {MIN_SIDE}x{MIN_SIDE} images"),
            });
        }
        if input.channels != 3 {
            self.conv[0] = conv3x3(input.channels, CONVS[0], device);
        }
        let [hidden, _] = self.fc3.weight.dims();
        self.fc3 = LinearConfig::new(hidden, num_classes).init(device);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn narrow_head_classifies_cifar_images() {
        let device = Default::default();
        let model = Vgg16Config::new()
            .with_hidden(32)
            .init::<B>(&device)
            .adapt(ImageShape::new(3, 32, 32), 10, &device)
            .unwrap();
        assert_eq!(model.fc3.weight.dims(), [32, 10]);
        let logits = model.forward(Tensor::zeros([2, 3, 32, 32], &device));
        assert_eq!(logits.dims(), [2, 10]);
    }

    #[test]
    fn rejects_images_smaller_than_the_pooling_stack() {
        let device = Default::default();
        let err = Vgg16Config::new()
            .with_hidden(8)
            .init::<B>(&device)
            .adapt(ImageShape::new(3, 16, 16), 10, &device)
            .unwrap_err();
        assert!(matches!(err, TrainError::Architecture { backbone: "vgg16", .. }));
    }
}
