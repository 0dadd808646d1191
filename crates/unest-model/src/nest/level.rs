use burn::{
    module::Param,
    nn::{
        conv::{Conv3d, Conv3dConfig},
        Dropout, DropoutConfig, Initializer, LayerNorm, LayerNormConfig, PaddingConfig3d,
    },
    prelude::*,
    tensor::module::max_pool2d,
};

use super::attention::{TransformerBlock, TransformerBlockConfig};

/// One level of the nested hierarchy: optional aggregation from the previous
/// level, then transformer blocks over non-overlapping nested blocks.
#[derive(Module, Debug)]
pub struct NestLevel<B: Backend> {
    pool: Option<ConvPool<B>>,
    pos_embed: Param<Tensor<B, 4>>,
    pos_drop: Dropout,
    blocks: Vec<TransformerBlock<B>>,
    block_size: usize,
}

#[derive(Config, Debug)]
pub struct NestLevelConfig {
    /// Channels of the previous level, `None` for the first level.
    pub prev_embed_dim: Option<usize>,
    pub embed_dim: usize,
    pub num_heads: usize,
    /// Number of nested blocks (cubic).
    pub num_blocks: usize,
    /// Edge length of each nested block, in voxels.
    pub block_size: usize,
    /// Per-block drop path rates; its length is the level depth.
    pub drop_path: Vec<f64>,
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
    #[config(default = true)]
    pub qkv_bias: bool,
    #[config(default = 0.0)]
    pub drop_rate: f64,
    #[config(default = 0.0)]
    pub attn_drop_rate: f64,
}

impl NestLevelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> NestLevel<B> {
        let pool = self
            .prev_embed_dim
            .map(|prev| ConvPool::new(prev, self.embed_dim, device));

        let tokens = self.block_size.pow(3);
        let pos_embed = Initializer::Normal {
            mean: 0.0,
            std: 0.02,
        }
        .init([1, self.num_blocks, tokens, self.embed_dim], device);

        let blocks = self
            .drop_path
            .iter()
            .map(|&drop_path| {
                TransformerBlockConfig::new(self.embed_dim, self.num_heads)
                    .with_mlp_ratio(self.mlp_ratio)
                    .with_qkv_bias(self.qkv_bias)
                    .with_dropout(self.drop_rate)
                    .with_attention_dropout(self.attn_drop_rate)
                    .with_drop_path(drop_path)
                    .init(device)
            })
            .collect();

        NestLevel {
            pool,
            pos_embed,
            pos_drop: DropoutConfig::new(self.drop_rate).init(),
            blocks,
            block_size: self.block_size,
        }
    }
}

impl<B: Backend> NestLevel<B> {
    /// Input and output are `[B, C, D, H, W]`.
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        };

        let x = x.permute([0, 2, 3, 4, 1]); // [B, D, H, W, C]
        let [b, d, h, w, c] = x.dims();
        let bs = self.block_size;
        let num_blocks = (d / bs) * (h / bs) * (w / bs);

        let x = blockify(x, bs).reshape([b, num_blocks, bs * bs * bs, c]);
        let mut x = self.pos_drop.forward(x + self.pos_embed.val());
        for block in &self.blocks {
            x = block.forward(x);
        }

        let x = deblockify(x.reshape([b * num_blocks, bs * bs * bs, c]), bs, d, h, w);
        x.permute([0, 4, 1, 2, 3])
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }
}

/// Aggregation between levels: 3x3x3 conv, channel layer norm, then a
/// 3x3x3 stride-2 max pool halving every spatial axis.
#[derive(Module, Debug)]
pub struct ConvPool<B: Backend> {
    conv: Conv3d<B>,
    norm: LayerNorm<B>,
}

impl<B: Backend> ConvPool<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv3dConfig::new([in_channels, out_channels], [3, 3, 3])
                .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
                .init(device),
            norm: LayerNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.conv.forward(x);
        let x = self
            .norm
            .forward(x.permute([0, 2, 3, 4, 1]))
            .permute([0, 4, 1, 2, 3]);
        max_pool3d(x)
    }
}

/// 3x3x3 max pool, stride 2, padding 1, over `[B, C, D, H, W]`.
///
/// Max is separable, so this pools (H, W) then D with the 2D kernel.
fn max_pool3d<B: Backend>(x: Tensor<B, 5>) -> Tensor<B, 5> {
    let [b, c, d, h, w] = x.dims();

    let x = max_pool2d(x.reshape([b, c * d, h, w]), [3, 3], [2, 2], [1, 1], [1, 1]);
    let [_, _, ho, wo] = x.dims();

    let x = max_pool2d(x.reshape([b, c, d, ho * wo]), [3, 1], [2, 1], [1, 0], [1, 1]);
    let [_, _, do_, _] = x.dims();

    x.reshape([b, c, do_, ho, wo])
}

/// Split `[B, D, H, W, C]` into `[B * Blocks, bs^3, C]`.
///
/// Blocks are ordered (D, H, W) block-major and tokens inside a block
/// are ordered (D, H, W) as well. Reshapes stay within six dimensions.
pub(crate) fn blockify<B: Backend>(x: Tensor<B, 5>, bs: usize) -> Tensor<B, 3> {
    let [b, d, h, w, c] = x.dims();
    let (nd, nh, nw) = (d / bs, h / bs, w / bs);

    // D-split: [B, D/bs, bs, H, W, C] -> [B, D/bs, H, W, bs(D), C]
    let x = x.reshape([b, nd, bs, h, w, c]).permute([0, 1, 3, 4, 2, 5]);
    let x = x.reshape([b * nd, h, w, bs, c]);

    // H-split: -> [B', H/bs, W, bs(D), bs(H), C]
    let x = x.reshape([b * nd, nh, bs, w, bs, c]).permute([0, 1, 3, 4, 2, 5]);
    let x = x.reshape([b * nd * nh, w, bs, bs, c]);

    // W-split: -> [B'', W/bs, bs(D), bs(H), bs(W), C]
    let x = x.reshape([b * nd * nh, nw, bs, bs, bs, c]).permute([0, 1, 3, 4, 2, 5]);

    x.reshape([b * nd * nh * nw, bs * bs * bs, c])
}

/// Inverse of [`blockify`]: `[B * Blocks, bs^3, C]` back to `[B, D, H, W, C]`.
pub(crate) fn deblockify<B: Backend>(
    blocks: Tensor<B, 3>,
    bs: usize,
    d: usize,
    h: usize,
    w: usize,
) -> Tensor<B, 5> {
    let [total, _, c] = blocks.dims();
    let (nd, nh, nw) = (d / bs, h / bs, w / bs);
    let b = total / (nd * nh * nw);

    // [B'', W/bs, bs(D), bs(H), bs(W), C] -> [B'', W, bs(D), bs(H), C]
    let x = blocks.reshape([b * nd * nh, nw, bs, bs, bs, c]);
    let x = x.permute([0, 1, 4, 2, 3, 5]);
    let x = x.reshape([b * nd * nh, w, bs, bs, c]);

    // [B', H/bs, W, bs(D), bs(H), C] -> [B', H, W, bs(D), C]
    let x = x.reshape([b * nd, nh, w, bs, bs, c]);
    let x = x.permute([0, 1, 4, 2, 3, 5]);
    let x = x.reshape([b * nd, h, w, bs, c]);

    // [B, D/bs, H, W, bs(D), C] -> [B, D, H, W, C]
    let x = x.reshape([b, nd, h, w, bs, c]);
    let x = x.permute([0, 1, 4, 2, 3, 5]);
    x.reshape([b, d, h, w, c])
}
