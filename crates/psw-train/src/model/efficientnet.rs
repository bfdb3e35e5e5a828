//! EfficientNetV2-B0 in the TensorFlow-ported layout (`tf_efficientnetv2_b0`):
//! BatchNorm epsilon 1e-3 and "same" padding on strided convolutions.

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{sigmoid, silu};
use burn::tensor::module::adaptive_avg_pool2d;

use psw_core::image::ImageShape;

use super::{batch_norm, conv, is_small_input, pad_same, Backbone, BackboneModel, ImageClassifier};
use crate::TrainError;

const TF_BN_EPS: f64 = 1e-3;
const TORCH_BN_EPS: f64 = 1e-5;
const STEM: usize = 32;
const HEAD: usize = 1280;
const SE_RATIO: f64 = 0.25;

/// Strided 3x3 convolutions pad in forward; stride 1 pads symmetrically.
fn conv_k3<B: Backend>(
    channels: [usize; 2],
    stride: usize,
    groups: usize,
    device: &B::Device,
) -> Conv2d<B> {
    let padding = if stride == 1 {
        PaddingConfig2d::Explicit(1, 1)
    } else {
        PaddingConfig2d::Valid
    };
    Conv2dConfig::new(channels, [3, 3])
        .with_stride([stride, stride])
        .with_padding(padding)
        .with_groups(groups)
        .with_bias(false)
        .init(device)
}

fn strided<B: Backend>(conv: &Conv2d<B>, x: Tensor<B, 4>, stride: usize) -> Tensor<B, 4> {
    if stride == 1 {
        conv.forward(x)
    } else {
        conv.forward(pad_same(x, 3, stride))
    }
}

/// Fused 3x3 conv, BN, SiLU (`cn` stage).
#[derive(Module, Debug)]
pub struct ConvBnAct<B: Backend> {
    conv: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    stride: usize,
    skip: bool,
}

impl<B: Backend> ConvBnAct<B> {
    fn new(in_ch: usize, out_ch: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: conv_k3([in_ch, out_ch], stride, 1, device),
            bn1: batch_norm(out_ch, TF_BN_EPS, device),
            stride,
            skip: stride == 1 && in_ch == out_ch,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = silu(self.bn1.forward(strided(&self.conv, x.clone(), self.stride)));
        if self.skip {
            out + x
        } else {
            out
        }
    }
}

/// Fused-MBConv (`er` stage): expanding 3x3 conv then 1x1 projection.
#[derive(Module, Debug)]
pub struct EdgeResidual<B: Backend> {
    conv_exp: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv_pwl: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    stride: usize,
    skip: bool,
}

impl<B: Backend> EdgeResidual<B> {
    fn new(in_ch: usize, out_ch: usize, stride: usize, expand: usize, device: &B::Device) -> Self {
        let mid = in_ch * expand;
        Self {
            conv_exp: conv_k3([in_ch, mid], stride, 1, device),
            bn1: batch_norm(mid, TF_BN_EPS, device),
            conv_pwl: conv([mid, out_ch], 1, 1, 0, device),
            bn2: batch_norm(out_ch, TF_BN_EPS, device),
            stride,
            skip: stride == 1 && in_ch == out_ch,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = silu(self.bn1.forward(strided(&self.conv_exp, x.clone(), self.stride)));
        let out = self.bn2.forward(self.conv_pwl.forward(out));
        if self.skip {
            out + x
        } else {
            out
        }
    }
}

#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    conv_reduce: Conv2d<B>,
    conv_expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    fn new(channels: usize, reduced: usize, device: &B::Device) -> Self {
        let pointwise = |c: [usize; 2]| Conv2dConfig::new(c, [1, 1]).init(device);
        Self {
            conv_reduce: pointwise([channels, reduced]),
            conv_expand: pointwise([reduced, channels]),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = adaptive_avg_pool2d(x.clone(), [1, 1]);
        let scale = silu(self.conv_reduce.forward(scale));
        let scale = sigmoid(self.conv_expand.forward(scale));
        x * scale
    }
}

/// MBConv (`ir` stage): 1x1 expansion, depthwise 3x3, squeeze-excite, 1x1 projection.
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    conv_pw: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv_dw: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    se: SqueezeExcite<B>,
    conv_pwl: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    stride: usize,
    skip: bool,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(in_ch: usize, out_ch: usize, stride: usize, expand: usize, device: &B::Device) -> Self {
        let mid = in_ch * expand;
        // Squeeze width follows the block input, not the expanded width.
        let reduced = ((in_ch as f64) * SE_RATIO).round().max(1.0) as usize;
        Self {
            conv_pw: conv([in_ch, mid], 1, 1, 0, device),
            bn1: batch_norm(mid, TF_BN_EPS, device),
            conv_dw: conv_k3([mid, mid], stride, mid, device),
            bn2: batch_norm(mid, TF_BN_EPS, device),
            se: SqueezeExcite::new(mid, reduced, device),
            conv_pwl: conv([mid, out_ch], 1, 1, 0, device),
            bn3: batch_norm(out_ch, TF_BN_EPS, device),
            stride,
            skip: stride == 1 && in_ch == out_ch,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = silu(self.bn1.forward(self.conv_pw.forward(x.clone())));
        let out = silu(self.bn2.forward(strided(&self.conv_dw, out, self.stride)));
        let out = self.se.forward(out);
        let out = self.bn3.forward(self.conv_pwl.forward(out));
        if self.skip {
            out + x
        } else {
            out
        }
    }
}

/// `(repeats, stride, expansion, out channels)` per stage.
const FUSED_STAGES: [(usize, usize, usize, usize); 2] = [(2, 2, 4, 32), (2, 2, 4, 48)];
const MBCONV_STAGES: [(usize, usize, usize, usize); 3] =
    [(3, 2, 4, 96), (5, 1, 6, 112), (8, 2, 6, 192)];

#[derive(Config, Debug)]
pub struct EfficientNetV2Config {
    #[config(default = 3)]
    pub channels: usize,
    #[config(default = 1000)]
    pub num_classes: usize,
}

impl EfficientNetV2Config {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNetV2<B> {
        let fused = |(repeats, stride, expand, out): (usize, usize, usize, usize), in_ch: usize| {
            (0..repeats)
                .map(|i| {
                    let (cin, s) = if i == 0 { (in_ch, stride) } else { (out, 1) };
                    EdgeResidual::new(cin, out, s, expand, device)
                })
                .collect::<Vec<_>>()
        };
        let mbconv = |(repeats, stride, expand, out): (usize, usize, usize, usize), in_ch: usize| {
            (0..repeats)
                .map(|i| {
                    let (cin, s) = if i == 0 { (in_ch, stride) } else { (out, 1) };
                    InvertedResidual::new(cin, out, s, expand, device)
                })
                .collect::<Vec<_>>()
        };
        EfficientNetV2 {
            conv_stem: conv_k3([self.channels, STEM], 2, 1, device),
            bn1: batch_norm(STEM, TF_BN_EPS, device),
            stage0: vec![ConvBnAct::new(STEM, 16, 1, device)],
            stage1: fused(FUSED_STAGES[0], 16),
            stage2: fused(FUSED_STAGES[1], 32),
            stage3: mbconv(MBCONV_STAGES[0], 48),
            stage4: mbconv(MBCONV_STAGES[1], 96),
            stage5: mbconv(MBCONV_STAGES[2], 112),
            conv_head: conv([192, HEAD], 1, 1, 0, device),
            bn2: batch_norm(HEAD, TF_BN_EPS, device),
            classifier: LinearConfig::new(HEAD, self.num_classes).init(device),
            stem_stride: 2,
            stem_act: true,
        }
    }
}

/// timm `tf_efficientnetv2_b0`.
#[derive(Module, Debug)]
pub struct EfficientNetV2<B: Backend> {
    conv_stem: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    stage0: Vec<ConvBnAct<B>>,
    stage1: Vec<EdgeResidual<B>>,
    stage2: Vec<EdgeResidual<B>>,
    stage3: Vec<InvertedResidual<B>>,
    stage4: Vec<InvertedResidual<B>>,
    stage5: Vec<InvertedResidual<B>>,
    conv_head: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    classifier: Linear<B>,
    stem_stride: usize,
    stem_act: bool,
}

impl<B: Backend> ImageClassifier<B> for EfficientNetV2<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.bn1.forward(strided(&self.conv_stem, images, self.stem_stride));
        let mut x = if self.stem_act { silu(x) } else { x };
        for block in &self.stage0 {
            x = block.forward(x);
        }
        for block in self.stage1.iter().chain(&self.stage2) {
            x = block.forward(x);
        }
        for block in self.stage3.iter().chain(&self.stage4).chain(&self.stage5) {
            x = block.forward(x);
        }
        let x = silu(self.bn2.forward(self.conv_head.forward(x)));
        let x = adaptive_avg_pool2d(x, [1, 1]).flatten::<2>(1, 3);
        self.classifier.forward(x)
    }
}

impl<B: Backend> BackboneModel<B> for EfficientNetV2<B> {
    const BACKBONE: Backbone = Backbone::EfficientnetV2B0;

    fn published(device: &B::Device) -> Self {
        EfficientNetV2Config::new().init(device)
    }

    fn torch_key_remap() -> Vec<(&'static str, &'static str)> {
        vec![(r"^blocks\.([0-5])\.", "stage${1}.")]
    }

    /// Small inputs swap the stem for a stride-1 3x3 convolution followed by a
    /// plain BatchNorm (torch epsilon, no activation), matching the CIFAR
    /// training recipe. The classifier is always rebuilt for `num_classes`.
    fn adapt(
        mut self,
        input: ImageShape,
        num_classes: usize,
        device: &B::Device,
    ) -> Result<Self, TrainError> {
        if is_small_input(input) {
            self.conv_stem = conv([input.channels, STEM], 3, 1, 1, device);
            self.bn1 = batch_norm(STEM, TORCH_BN_EPS, device);
            self.stem_stride = 1;
            self.stem_act = false;
        } else if input.channels != 3 {
            self.conv_stem = conv_k3([input.channels, STEM], 2, 1, device);
        }
        self.classifier = LinearConfig::new(HEAD, num_classes).init(device);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn stage_layout_matches_b0() {
        let device = Default::default();
        let model = EfficientNetV2::<B>::published(&device);
        let lens = [
            model.stage0.len(),
            model.stage1.len(),
            model.stage2.len(),
            model.stage3.len(),
            model.stage4.len(),
            model.stage5.len(),
        ];
        assert_eq!(lens, [1, 2, 2, 3, 5, 8]);
        assert!(!model.stage0[0].skip);
        assert!(model.stage1[1].skip);
        assert!(!model.stage4[0].skip);
        assert!(model.stage4[1].skip);
        // 48 * 0.25 squeeze channels on 192 expanded ones.
        assert_eq!(model.stage3[0].se.conv_reduce.weight.dims(), [12, 192, 1, 1]);
        assert_eq!(model.stage5[7].conv_dw.weight.dims(), [1152, 1, 3, 3]);
    }

    #[test]
    fn published_stem_handles_odd_sizes() {
        let device = Default::default();
        let model = EfficientNetV2::<B>::published(&device)
            .adapt(ImageShape::new(3, 67, 67), 4, &device)
            .unwrap();
        assert!(model.stem_act);
        let logits = model.forward(Tensor::zeros([1, 3, 67, 67], &device));
        assert_eq!(logits.dims(), [1, 4]);
    }

    #[test]
    fn cifar_stem_keeps_resolution() {
        let device = Default::default();
        let model = EfficientNetV2::<B>::published(&device)
            .adapt(ImageShape::new(3, 8, 8), 10, &device)
            .unwrap();
        assert_eq!(model.stem_stride, 1);
        assert!(!model.stem_act);
        assert_eq!(model.classifier.weight.dims(), [1280, 10]);
        let logits = model.forward(Tensor::ones([2, 3, 8, 8], &device));
        assert_eq!(logits.dims(), [2, 10]);
    }
}
