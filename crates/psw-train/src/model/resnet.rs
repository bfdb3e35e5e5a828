use burn::nn::conv::Conv2d;
use burn::nn::{BatchNorm, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::module::{adaptive_avg_pool2d, avg_pool2d, max_pool2d};

use psw_core::image::ImageShape;

use super::{batch_norm, conv, conv_out, is_small_input, Backbone, BackboneModel, ImageClassifier};
use crate::TrainError;

const BN_EPS: f64 = 1e-5;
const WIDTHS: [usize; 4] = [64, 128, 256, 512];

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn new(in_ch: usize, out_ch: usize, stride: usize, device: &B::Device) -> Self {
        let downsample = (stride != 1 || in_ch != out_ch).then(|| Downsample {
            conv: conv([in_ch, out_ch], 1, stride, 0, device),
            bn: batch_norm(out_ch, BN_EPS, device),
        });
        Self {
            conv1: conv([in_ch, out_ch], 3, stride, 1, device),
            bn1: batch_norm(out_ch, BN_EPS, device),
            conv2: conv([out_ch, out_ch], 3, 1, 1, device),
            bn2: batch_norm(out_ch, BN_EPS, device),
            downsample,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(d) => d.bn.forward(d.conv.forward(x.clone())),
            None => x.clone(),
        };
        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));
        relu(out + identity)
    }
}

#[derive(Config, Debug)]
pub struct ResNet18Config {
    #[config(default = 3)]
    pub channels: usize,
    #[config(default = 1000)]
    pub num_classes: usize,
}

impl ResNet18Config {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet18<B> {
        let layer = |in_ch: usize, out_ch: usize, stride: usize| {
            vec![
                BasicBlock::new(in_ch, out_ch, stride, device),
                BasicBlock::new(out_ch, out_ch, 1, device),
            ]
        };
        ResNet18 {
            conv1: conv([self.channels, WIDTHS[0]], 7, 2, 3, device),
            bn1: batch_norm(WIDTHS[0], BN_EPS, device),
            layer1: layer(WIDTHS[0], WIDTHS[0], 1),
            layer2: layer(WIDTHS[0], WIDTHS[1], 2),
            layer3: layer(WIDTHS[1], WIDTHS[2], 2),
            layer4: layer(WIDTHS[2], WIDTHS[3], 2),
            fc: LinearConfig::new(WIDTHS[3], self.num_classes).init(device),
            maxpool_stride: 2,
            avgpool: 0,
        }
    }
}

/// torchvision ResNet-18.
#[derive(Module, Debug)]
pub struct ResNet18<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    layer1: Vec<BasicBlock<B>>,
    layer2: Vec<BasicBlock<B>>,
    layer3: Vec<BasicBlock<B>>,
    layer4: Vec<BasicBlock<B>>,
    fc: Linear<B>,
    maxpool_stride: usize,
    /// Fixed stride-1 average-pool window; 0 pools globally.
    avgpool: usize,
}

impl<B: Backend> ImageClassifier<B> for ResNet18<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.bn1.forward(self.conv1.forward(images)));
        let s = self.maxpool_stride;
        let mut x = max_pool2d(x, [3, 3], [s, s], [1, 1], [1, 1]);
        for block in self
            .layer1
            .iter()
            .chain(&self.layer2)
            .chain(&self.layer3)
            .chain(&self.layer4)
        {
            x = block.forward(x);
        }
        let x = match self.avgpool {
            0 => adaptive_avg_pool2d(x, [1, 1]),
            k => avg_pool2d(x, [k, k], [1, 1], [0, 0], true),
        };
        self.fc.forward(x.flatten::<2>(1, 3))
    }
}

impl<B: Backend> BackboneModel<B> for ResNet18<B> {
    const BACKBONE: Backbone = Backbone::Resnet18;

    fn published(device: &B::Device) -> Self {
        ResNet18Config::new().init(device)
    }

    fn torch_key_remap() -> Vec<(&'static str, &'static str)> {
        vec![
            (r"(.+)\.downsample\.0\.(.+)", "$1.downsample.conv.$2"),
            (r"(.+)\.downsample\.1\.(.+)", "$1.downsample.bn.$2"),
        ]
    }

    /// Small inputs get a 3x3 stride-1 stem, a stride-1 max-pool and a 2x2
    /// stride-1 average pool feeding a flattened classifier; larger inputs keep
    /// the published stem and global pooling. A new first convolution is only
    /// built when the stem changes or the channel count differs.
    fn adapt(
        mut self,
        input: ImageShape,
        num_classes: usize,
        device: &B::Device,
    ) -> Result<Self, TrainError> {
        let width = WIDTHS[3];
        if is_small_input(input) {
            self.conv1 = conv([input.channels, WIDTHS[0]], 3, 1, 1, device);
            self.maxpool_stride = 1;
            // Three stride-2 stages after a resolution-preserving stem.
            let final_side = |side: usize| (0..3).fold(side, |s, _| conv_out(s, 3, 2, 1));
            let (h, w) = (final_side(input.height), final_side(input.width));
            let features = if h >= 2 && w >= 2 {
                self.avgpool = 2;
                width * (h - 1) * (w - 1)
            } else {
                self.avgpool = 0;
                width
            };
            self.fc = LinearConfig::new(features, num_classes).init(device);
        } else {
            if input.channels != 3 {
                self.conv1 = conv([input.channels, WIDTHS[0]], 7, 2, 3, device);
            }
            self.maxpool_stride = 2;
            self.avgpool = 0;
            self.fc = LinearConfig::new(width, num_classes).init(device);
        }
        Ok(self)
    }
}
