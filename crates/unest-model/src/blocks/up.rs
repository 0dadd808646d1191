//! Upsampling blocks.
//!
//! [`DecoderBlock`] is one rung of the decoder ladder: it doubles the
//! resolution of its input, concatenates the matching skip connection and
//! refines the result. [`ProgressiveUpBlock`] lifts a coarse transformer
//! feature map to a finer encoder skip without any fusion.

use burn::nn::conv::{ConvTranspose3d, ConvTranspose3dConfig};
use burn::prelude::*;

use super::conv::{ConvBlock, ConvBlockConfig};
use super::norm::NormKind;
use crate::error;
use crate::shape::{expect_channels, expect_fusable};

fn transposed<B: Backend>(
    channels: [usize; 2],
    kernel_size: usize,
    device: &B::Device,
) -> ConvTranspose3d<B> {
    ConvTranspose3dConfig::new(channels, [kernel_size; 3])
        .with_stride([kernel_size; 3])
        .with_bias(false)
        .init(device)
}

#[derive(Config, Debug)]
pub struct DecoderBlockConfig {
    /// Channels of the tensor coming up the ladder.
    pub in_channels: usize,
    /// Channels of the skip connection and of the block output.
    pub out_channels: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    /// Kernel and stride of the transposed convolution.
    #[config(default = 2)]
    pub upsample_kernel_size: usize,
    #[config(default = "NormKind::Instance")]
    pub norm: NormKind,
    #[config(default = true)]
    pub res_block: bool,
}

impl DecoderBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DecoderBlock<B> {
        DecoderBlock {
            upsample: transposed(
                [self.in_channels, self.out_channels],
                self.upsample_kernel_size,
                device,
            ),
            fusion: ConvBlockConfig::new(2 * self.out_channels, self.out_channels)
                .with_kernel_size(self.kernel_size)
                .with_norm(self.norm)
                .with_res_block(self.res_block)
                .init(device),
            in_channels: self.in_channels,
            out_channels: self.out_channels,
        }
    }
}

#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    upsample: ConvTranspose3d<B>,
    fusion: ConvBlock<B>,
    in_channels: usize,
    out_channels: usize,
}

impl<B: Backend> DecoderBlock<B> {
    /// Upsample `x`, concatenate `skip` along channels and fuse.
    ///
    /// # Arguments
    /// * `stage` - Name used in shape errors
    /// * `x` - Input from the previous rung [batch, in_ch, d, h, w]
    /// * `skip` - Encoder skip [batch, out_ch, d*k, h*k, w*k]
    pub fn forward(
        &self,
        stage: &str,
        x: Tensor<B, 5>,
        skip: Tensor<B, 5>,
    ) -> error::Result<Tensor<B, 5>> {
        expect_channels(stage, &x, self.in_channels)?;
        expect_channels(stage, &skip, self.out_channels)?;

        let up = self.upsample.forward(x);
        expect_fusable(stage, &up, &skip)?;

        let cat = Tensor::cat(vec![up, skip], 1);
        Ok(self.fusion.forward(cat))
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }
}

#[derive(Config, Debug)]
pub struct ProgressiveUpBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Number of resolution doublings.
    #[config(default = 1)]
    pub num_upsamples: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 2)]
    pub upsample_kernel_size: usize,
    #[config(default = "NormKind::Instance")]
    pub norm: NormKind,
    /// Follow every transposed convolution with a [`ConvBlock`].
    #[config(default = false)]
    pub conv_block: bool,
    #[config(default = false)]
    pub res_block: bool,
}

impl ProgressiveUpBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ProgressiveUpBlock<B> {
        let layers = (0..self.num_upsamples.max(1))
            .map(|i| {
                let in_ch = if i == 0 { self.in_channels } else { self.out_channels };
                ProgressiveUpLayer {
                    upsample: transposed(
                        [in_ch, self.out_channels],
                        self.upsample_kernel_size,
                        device,
                    ),
                    refine: self.conv_block.then(|| {
                        ConvBlockConfig::new(self.out_channels, self.out_channels)
                            .with_kernel_size(self.kernel_size)
                            .with_norm(self.norm)
                            .with_res_block(self.res_block)
                            .init(device)
                    }),
                }
            })
            .collect();

        ProgressiveUpBlock {
            layers,
            in_channels: self.in_channels,
        }
    }
}

#[derive(Module, Debug)]
pub struct ProgressiveUpLayer<B: Backend> {
    upsample: ConvTranspose3d<B>,
    refine: Option<ConvBlock<B>>,
}

#[derive(Module, Debug)]
pub struct ProgressiveUpBlock<B: Backend> {
    layers: Vec<ProgressiveUpLayer<B>>,
    in_channels: usize,
}

impl<B: Backend> ProgressiveUpBlock<B> {
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let mut x = x;
        for layer in &self.layers {
            x = layer.upsample.forward(x);
            if let Some(refine) = &layer.refine {
                x = refine.forward(x);
            }
        }
        x
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }
}
