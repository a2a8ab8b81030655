//! VGG16 encoder for fully-convolutional segmentation.
//!
//! The network is the torchvision VGG16 feature stack (13 convolutions, five
//! max-pool stages) without the classifier head. [`VggBackbone::forward`]
//! exposes the outputs of the last three pooling stages, which is what the
//! FCN8 decoder fuses.

use core::f64::consts::SQRT_2;

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
    },
    prelude::*,
};

/// Layer specification used to describe a VGG stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VggLayer {
    /// 3x3 convolution with the given number of output channels.
    Conv(usize),
    /// 2x2 max pooling with stride 2.
    MaxPool,
}

/// VGG16 stage layout, one slice per pooling stage.
const VGG16_STAGES: [&[VggLayer]; 5] = [
    &[VggLayer::Conv(64), VggLayer::Conv(64), VggLayer::MaxPool],
    &[VggLayer::Conv(128), VggLayer::Conv(128), VggLayer::MaxPool],
    &[
        VggLayer::Conv(256),
        VggLayer::Conv(256),
        VggLayer::Conv(256),
        VggLayer::MaxPool,
    ],
    &[
        VggLayer::Conv(512),
        VggLayer::Conv(512),
        VggLayer::Conv(512),
        VggLayer::MaxPool,
    ],
    &[
        VggLayer::Conv(512),
        VggLayer::Conv(512),
        VggLayer::Conv(512),
        VggLayer::MaxPool,
    ],
];

/// Channel count of the pool3 feature map.
pub const POOL3_CHANNELS: usize = 256;
/// Channel count of the pool4 feature map.
pub const POOL4_CHANNELS: usize = 512;
/// Channel count of the pool5 feature map.
pub const POOL5_CHANNELS: usize = 512;

/// Configuration for the VGG16 encoder.
#[derive(Config, Debug)]
pub struct VggConfig {
    /// Insert batch normalization after every convolution (VGG16-BN).
    #[config(default = false)]
    pub batch_norm: bool,
    /// Number of input channels.
    #[config(default = 3)]
    pub in_channels: usize,
}

impl VggConfig {
    /// Plain VGG16.
    pub fn vgg16() -> Self {
        Self::new()
    }

    /// VGG16 with batch normalization.
    pub fn vgg16_bn() -> Self {
        Self::new().with_batch_norm(true)
    }

    /// Initialize the encoder on `device`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> VggBackbone<B> {
        let mut in_channels = self.in_channels;
        let mut stages = Vec::with_capacity(VGG16_STAGES.len());

        for layout in VGG16_STAGES {
            let stage = VggStage::new(layout, in_channels, self.batch_norm, device);
            in_channels = stage.out_channels(in_channels);
            stages.push(stage);
        }

        VggBackbone { stages }
    }
}

/// Multi-scale features produced by the encoder.
#[derive(Debug, Clone)]
pub struct VggFeatures<B: Backend> {
    /// Stride-8 features, `[B, 256, H/8, W/8]`.
    pub pool3: Tensor<B, 4>,
    /// Stride-16 features, `[B, 512, H/16, W/16]`.
    pub pool4: Tensor<B, 4>,
    /// Stride-32 features, `[B, 512, H/32, W/32]`.
    pub pool5: Tensor<B, 4>,
}

/// VGG16 feature extractor.
#[derive(Module, Debug)]
pub struct VggBackbone<B: Backend> {
    stages: Vec<VggStage<B>>,
}

impl<B: Backend> VggBackbone<B> {
    /// Run the five stages and return the pool3/pool4/pool5 taps.
    ///
    /// # Shapes
    ///
    /// - input: `[batch, in_channels, height, width]`, height and width
    ///   divisible by 32
    pub fn forward(&self, input: Tensor<B, 4>) -> VggFeatures<B> {
        let mut x = input;
        let mut taps = Vec::with_capacity(3);

        for (index, stage) in self.stages.iter().enumerate() {
            x = stage.forward(x);
            if index >= 2 {
                taps.push(x.clone());
            }
        }

        let pool5 = taps.pop().unwrap_or_else(|| x.clone());
        let pool4 = taps.pop().unwrap_or_else(|| pool5.clone());
        let pool3 = taps.pop().unwrap_or_else(|| pool4.clone());

        VggFeatures {
            pool3,
            pool4,
            pool5,
        }
    }
}

/// One pooling stage of VGG.
#[derive(Module, Debug)]
pub struct VggStage<B: Backend> {
    layers: Vec<VggBlockLayer<B>>,
}

impl<B: Backend> VggStage<B> {
    fn new(layout: &[VggLayer], in_channels: usize, batch_norm: bool, device: &B::Device) -> Self {
        let mut layers = Vec::with_capacity(layout.len());
        let mut current_channels = in_channels;

        for layer in layout {
            match *layer {
                VggLayer::Conv(out_channels) => {
                    layers.push(VggBlockLayer::Conv(VggConvLayer::new(
                        current_channels,
                        out_channels,
                        batch_norm,
                        device,
                    )));
                    current_channels = out_channels;
                }
                VggLayer::MaxPool => {
                    let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
                    layers.push(VggBlockLayer::MaxPool(pool));
                }
            }
        }

        Self { layers }
    }

    fn out_channels(&self, in_channels: usize) -> usize {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| match layer {
                VggBlockLayer::Conv(conv) => Some(conv.out_channels()),
                VggBlockLayer::MaxPool(_) => None,
            })
            .unwrap_or(in_channels)
    }

    /// Forward pass through the stage.
    pub fn forward(&self, mut input: Tensor<B, 4>) -> Tensor<B, 4> {
        for layer in &self.layers {
            input = layer.forward(input);
        }
        input
    }
}

/// Layer kinds inside a stage.
#[derive(Module, Debug)]
pub enum VggBlockLayer<B: Backend> {
    Conv(VggConvLayer<B>),
    MaxPool(MaxPool2d),
}

impl<B: Backend> VggBlockLayer<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Conv(conv) => conv.forward(input),
            Self::MaxPool(pool) => pool.forward(input),
        }
    }
}

/// 3x3 convolution, optional batch normalization, ReLU.
#[derive(Module, Debug)]
pub struct VggConvLayer<B: Backend> {
    conv: Conv2d<B>,
    batch_norm: Option<BatchNorm<B, 2>>,
    relu: Relu,
}

impl<B: Backend> VggConvLayer<B> {
    fn new(in_channels: usize, out_channels: usize, batch_norm: bool, device: &B::Device) -> Self {
        let initializer = Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: true,
        };

        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(!batch_norm)
            .with_initializer(initializer)
            .init(device);

        let batch_norm = batch_norm.then(|| BatchNormConfig::new(out_channels).init(device));

        Self {
            conv,
            batch_norm,
            relu: Relu::new(),
        }
    }

    fn out_channels(&self) -> usize {
        self.conv.weight.dims()[0]
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv.forward(input);
        let out = match &self.batch_norm {
            Some(bn) => bn.forward(out),
            None => out,
        };
        self.relu.forward(out)
    }
}
