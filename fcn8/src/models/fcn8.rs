//! FCN8: fully-convolutional network with stride-16 and stride-8 skips.
//!
//! The VGG16 encoder is followed by `fc6`/`fc7` expressed as convolutions, a
//! 1x1 class scorer, and three learned up-samplings. The coarse stride-32
//! scores are upsampled twice and fused with 1x1 scores of pool4 and pool3
//! before the final 8x up-sampling back to input resolution.

use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        Dropout, DropoutConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};
use vgg::{VggBackbone, VggConfig, POOL3_CHANNELS, POOL4_CHANNELS, POOL5_CHANNELS};

/// Configuration for [`Fcn8`].
#[derive(Config, Debug)]
pub struct Fcn8Config {
    /// Size of the output class dimension, void classes included.
    #[config(default = 5)]
    pub num_classes: usize,
    /// Use the batch-normalized VGG16 encoder.
    #[config(default = false)]
    pub batch_norm: bool,
    /// Width of the convolutional `fc6`/`fc7` layers.
    #[config(default = 4096)]
    pub fc_channels: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl Fcn8Config {
    /// Initialize the model on `device`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Fcn8<B> {
        let backbone = VggConfig::new()
            .with_batch_norm(self.batch_norm)
            .init(device);

        let fc6 = Conv2dConfig::new([POOL5_CHANNELS, self.fc_channels], [7, 7])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .init(device);
        let fc7 = Conv2dConfig::new([self.fc_channels, self.fc_channels], [1, 1]).init(device);

        let score = |channels: usize| {
            Conv2dConfig::new([channels, self.num_classes], [1, 1]).init(device)
        };

        Fcn8 {
            backbone,
            fc6,
            fc7,
            relu: Relu::new(),
            dropout: DropoutConfig::new(self.dropout).init(),
            score_fr: score(self.fc_channels),
            score_pool4: score(POOL4_CHANNELS),
            score_pool3: score(POOL3_CHANNELS),
            upscore2: bilinear_upsampler(self.num_classes, 2, device),
            upscore_pool4: bilinear_upsampler(self.num_classes, 2, device),
            upscore8: bilinear_upsampler(self.num_classes, 8, device),
        }
    }
}

/// FCN8 segmentation network.
#[derive(Module, Debug)]
pub struct Fcn8<B: Backend> {
    backbone: VggBackbone<B>,
    fc6: Conv2d<B>,
    fc7: Conv2d<B>,
    relu: Relu,
    dropout: Dropout,
    score_fr: Conv2d<B>,
    score_pool4: Conv2d<B>,
    score_pool3: Conv2d<B>,
    upscore2: ConvTranspose2d<B>,
    upscore_pool4: ConvTranspose2d<B>,
    upscore8: ConvTranspose2d<B>,
}

impl<B: Backend> Fcn8<B> {
    /// Per-pixel class scores.
    ///
    /// # Shapes
    ///
    /// - input: `[batch, 3, height, width]`, height and width divisible by 32
    /// - output: `[batch, num_classes, height, width]`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let features = self.backbone.forward(input);

        let x = self.dropout.forward(self.relu.forward(self.fc6.forward(features.pool5)));
        let x = self.dropout.forward(self.relu.forward(self.fc7.forward(x)));
        let score = self.score_fr.forward(x);

        let x = self.upscore2.forward(score) + self.score_pool4.forward(features.pool4);
        let x = self.upscore_pool4.forward(x) + self.score_pool3.forward(features.pool3);

        self.upscore8.forward(x)
    }

    /// Number of output channels.
    pub fn num_classes(&self) -> usize {
        self.score_fr.weight.dims()[0]
    }
}

/// Transposed convolution that upsamples by `factor`, initialized to
/// per-class bilinear interpolation.
fn bilinear_upsampler<B: Backend>(
    channels: usize,
    factor: usize,
    device: &B::Device,
) -> ConvTranspose2d<B> {
    let kernel = 2 * factor;
    let padding = factor / 2;

    let mut upsampler = ConvTranspose2dConfig::new([channels, channels], [kernel, kernel])
        .with_stride([factor, factor])
        .with_padding([padding, padding])
        .with_bias(false)
        .init(device);

    upsampler.weight = Param::from_tensor(bilinear_kernel(channels, kernel, device));
    upsampler
}

/// `[channels, channels, size, size]` weights that copy channel `c` to
/// channel `c` through a bilinear filter.
fn bilinear_kernel<B: Backend>(channels: usize, size: usize, device: &B::Device) -> Tensor<B, 4> {
    let factor = size.div_ceil(2) as f32;
    let center = if size % 2 == 1 {
        factor - 1.0
    } else {
        factor - 0.5
    };
    let tap = |i: usize| 1.0 - (i as f32 - center).abs() / factor;

    let mut weights = vec![0.0f32; channels * channels * size * size];
    for c in 0..channels {
        let offset = (c * channels + c) * size * size;
        for y in 0..size {
            for x in 0..size {
                weights[offset + y * size + x] = tap(y) * tap(x);
            }
        }
    }

    Tensor::from_data(TensorData::new(weights, [channels, channels, size, size]), device)
}
