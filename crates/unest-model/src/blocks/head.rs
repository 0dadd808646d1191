//! Per-voxel logit heads.

use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::prelude::*;

#[derive(Config, Debug)]
pub struct OutputHeadConfig {
    pub in_channels: usize,
    pub out_channels: usize,
}

impl OutputHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> OutputHead<B> {
        OutputHead {
            conv: Conv3dConfig::new([self.in_channels, self.out_channels], [1, 1, 1])
                .with_bias(true)
                .init(device),
        }
    }
}

/// 1x1x1 convolution producing raw logits; no activation is applied.
#[derive(Module, Debug)]
pub struct OutputHead<B: Backend> {
    conv: Conv3d<B>,
}

impl<B: Backend> OutputHead<B> {
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        self.conv.forward(x)
    }
}
