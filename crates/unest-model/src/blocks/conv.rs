//! Convolutional blocks shared by the encoder stages, the decoder ladder and
//! the bottleneck projection.

use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::nn::{Dropout, DropoutConfig, LeakyRelu, LeakyReluConfig, PRelu, PReluConfig, PaddingConfig3d};
use burn::prelude::*;

use super::norm::{Norm, NormKind};

/// `kernel_size`-cube convolution with "same" padding for odd kernels.
fn conv3d<B: Backend>(
    channels: [usize; 2],
    kernel_size: usize,
    stride: usize,
    bias: bool,
    device: &B::Device,
) -> Conv3d<B> {
    let pad = (kernel_size - 1) / 2;
    Conv3dConfig::new(channels, [kernel_size; 3])
        .with_stride([stride; 3])
        .with_padding(PaddingConfig3d::Explicit(pad, pad, pad))
        .with_bias(bias)
        .init(device)
}

#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 1)]
    pub stride: usize,
    #[config(default = "NormKind::Instance")]
    pub norm: NormKind,
    /// Adds an identity (or 1x1x1-projected) shortcut around the two convolutions.
    #[config(default = true)]
    pub res_block: bool,
}

impl ConvBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        let (in_ch, out_ch) = (self.in_channels, self.out_channels);
        let needs_projection = self.res_block && (in_ch != out_ch || self.stride != 1);

        let (shortcut, shortcut_norm) = if needs_projection {
            (
                Some(conv3d([in_ch, out_ch], 1, self.stride, false, device)),
                Some(self.norm.init(out_ch, device)),
            )
        } else {
            (None, None)
        };

        ConvBlock {
            conv1: conv3d([in_ch, out_ch], self.kernel_size, self.stride, false, device),
            norm1: self.norm.init(out_ch, device),
            conv2: conv3d([out_ch, out_ch], self.kernel_size, 1, false, device),
            norm2: self.norm.init(out_ch, device),
            shortcut,
            shortcut_norm,
            act: LeakyReluConfig::new().with_negative_slope(0.01).init(),
            residual: self.res_block,
            in_channels: in_ch,
        }
    }
}

/// Two `conv -> norm -> LeakyReLU` units, optionally residual.
///
/// Basic: `act(norm2(conv2(act(norm1(conv1(x))))))`.
/// Residual: `act(norm2(conv2(act(norm1(conv1(x))))) + shortcut(x))`.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv3d<B>,
    norm1: Norm<B>,
    conv2: Conv3d<B>,
    norm2: Norm<B>,
    shortcut: Option<Conv3d<B>>,
    shortcut_norm: Option<Norm<B>>,
    act: LeakyRelu,
    residual: bool,
    in_channels: usize,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let identity = x.clone();

        let x = self.act.forward(self.norm1.forward(self.conv1.forward(x)));
        let x = self.norm2.forward(self.conv2.forward(x));

        if !self.residual {
            return self.act.forward(x);
        }

        let identity = match (&self.shortcut, &self.shortcut_norm) {
            (Some(conv), Some(norm)) => norm.forward(conv.forward(identity)),
            _ => identity,
        };
        self.act.forward(x + identity)
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }
}

/// Strided projection with post-conv activation, dropout and normalization
/// applied in that order.
#[derive(Config, Debug)]
pub struct ConvNormActConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 2)]
    pub stride: usize,
    #[config(default = "NormKind::Instance")]
    pub norm: NormKind,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl ConvNormActConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvNormAct<B> {
        ConvNormAct {
            conv: conv3d(
                [self.in_channels, self.out_channels],
                self.kernel_size,
                self.stride,
                true,
                device,
            ),
            act: PReluConfig::new().init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            norm: self.norm.init(self.out_channels, device),
            in_channels: self.in_channels,
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvNormAct<B: Backend> {
    conv: Conv3d<B>,
    act: PRelu<B>,
    dropout: Dropout,
    norm: Norm<B>,
    in_channels: usize,
}

impl<B: Backend> ConvNormAct<B> {
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.conv.forward(x);
        let x = self.act.forward(x);
        // Dropout divides by the keep probability, which is zero at p = 1.
        let x = if B::ad_enabled() && self.dropout.prob >= 1.0 {
            x.zeros_like()
        } else {
            self.dropout.forward(x)
        };
        self.norm.forward(x)
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }
}
