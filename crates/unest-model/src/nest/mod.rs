//! NesT-3D: Hierarchical Nested Transformer Feature Extractor
//!
//! Partitions a volume into non-overlapping patches, then processes the patch
//! grid as a hierarchy of nested blocks. Self-attention runs only inside a
//! block; between levels a conv-pool aggregation halves the grid, so every
//! level sees fewer, more abstract blocks of the same token count.
//!
//! # Architecture
//!
//! ```text
//! Input: [batch, 1, 96, 96, 96]
//!          │
//!          ▼
//!    ┌─────────────┐
//!    │ Patch embed │──► hidden[0]: [batch, 128, 24, 24, 24]
//!    └─────────────┘
//!          │
//!          ▼
//!    ┌─────────────┐
//!    │   Level 0   │──► hidden[1]: [batch, 128, 24, 24, 24]   64 blocks of 6^3
//!    └─────────────┘
//!          │ conv-pool
//!          ▼
//!    ┌─────────────┐
//!    │   Level 1   │──► hidden[2]: [batch, 256, 12, 12, 12]    8 blocks of 6^3
//!    └─────────────┘
//!          │ conv-pool
//!          ▼
//!    ┌─────────────┐
//!    │   Level 2   │──► hidden[3]: [batch, 512, 6, 6, 6]       1 block of 6^3
//!    └─────────────┘
//!          │ layer norm
//!          ▼
//!    Deep feature: [batch, 512, 6, 6, 6]
//! ```
//!
//! References:
//! - "Nested Hierarchical Transformer: Towards Accurate, Data-Efficient and
//!   Interpretable Visual Understanding" (Zhang et al., AAAI 2022)
//! - "UNesT: Local Spatial Representation Learning with Hierarchical
//!   Transformer for Efficient Medical Segmentation" (Yu et al., MedIA 2023)

pub mod attention;
pub mod level;

use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::nn::{LayerNorm, LayerNormConfig};
use burn::prelude::*;

use crate::error::{self, ModelError};
use crate::shape::expect_dims;

pub use attention::{BlockAttention, DropPath, Mlp, TransformerBlock, TransformerBlockConfig};
pub use level::{ConvPool, NestLevel, NestLevelConfig};

/// Output of the hierarchical extractor.
#[derive(Debug, Clone)]
pub struct NestOutput<B: Backend> {
    /// Layer-normalized output of the last level [batch, C_last, G_last^3]
    pub deep: Tensor<B, 5>,
    /// Patch embedding followed by every level output, finest first
    pub hidden_states: Vec<Tensor<B, 5>>,
}

/// Configuration for the nested transformer
#[derive(Config, Debug, PartialEq)]
pub struct NestTransformerConfig {
    /// Edge length of the (cubic) input volume
    #[config(default = 96)]
    pub image_size: usize,
    #[config(default = 1)]
    pub in_channels: usize,
    /// Edge length of the (cubic) patches
    #[config(default = 4)]
    pub patch_size: usize,
    #[config(default = 3)]
    pub num_levels: usize,
    #[config(default = "vec![128, 256, 512]")]
    pub embed_dims: Vec<usize>,
    #[config(default = "vec![4, 8, 16]")]
    pub num_heads: Vec<usize>,
    #[config(default = "vec![2, 2, 8]")]
    pub depths: Vec<usize>,
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
    #[config(default = true)]
    pub qkv_bias: bool,
    #[config(default = 0.0)]
    pub drop_rate: f64,
    #[config(default = 0.0)]
    pub attn_drop_rate: f64,
    /// Stochastic depth rate reached by the last transformer block
    #[config(default = 0.5)]
    pub drop_path_rate: f64,
}

impl NestTransformerConfig {
    /// Patch grid edge length (`image_size / patch_size`)
    pub fn grid_size(&self) -> usize {
        self.image_size.checked_div(self.patch_size).unwrap_or(0)
    }

    /// Edge length of every nested block, identical across levels
    pub fn block_size(&self) -> usize {
        halve(self.grid_size(), self.num_levels.saturating_sub(1))
    }

    /// `(channels, edge length)` of each hidden state, finest first.
    pub fn hidden_state_specs(&self) -> Vec<(usize, usize)> {
        let grid = self.grid_size();
        self.embed_dims
            .first()
            .map(|&dim| (dim, grid))
            .into_iter()
            .chain(
                self.embed_dims
                    .iter()
                    .enumerate()
                    .map(|(i, &dim)| (dim, halve(grid, i))),
            )
            .collect()
    }

    /// Check level bookkeeping, head divisibility, grid divisibility and rates.
    pub fn validate(&self) -> error::Result<()> {
        if self.num_levels == 0 {
            return Err(ModelError::invalid_configuration("num_levels must be at least 1"));
        }
        for (name, len) in [
            ("embed_dims", self.embed_dims.len()),
            ("num_heads", self.num_heads.len()),
            ("depths", self.depths.len()),
        ] {
            if len != self.num_levels {
                return Err(ModelError::invalid_configuration(format!(
                    "{name} has {len} entries for {} levels",
                    self.num_levels
                )));
            }
        }
        for (&dim, &heads) in self.embed_dims.iter().zip(&self.num_heads) {
            if heads == 0 || dim % heads != 0 {
                return Err(ModelError::invalid_configuration(format!(
                    "embed dim {dim} is not divisible by {heads} heads"
                )));
            }
        }
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            return Err(ModelError::invalid_configuration(format!(
                "image size {} is not divisible by patch size {}",
                self.image_size, self.patch_size
            )));
        }
        // The grid must halve evenly num_levels - 1 times.
        let grid = self.grid_size();
        if grid == 0 || self.num_levels > grid.trailing_zeros() as usize + 1 {
            return Err(ModelError::invalid_configuration(format!(
                "patch grid {grid} cannot be nested over {} levels",
                self.num_levels
            )));
        }
        // Dropout layers rescale by 1 / (1 - p), so p = 1 is excluded.
        for (name, rate) in [
            ("drop_rate", self.drop_rate),
            ("attn_drop_rate", self.attn_drop_rate),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(ModelError::invalid_configuration(format!(
                    "{name} should be in [0, 1), got {rate}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.drop_path_rate) {
            return Err(ModelError::invalid_configuration(format!(
                "drop_path_rate should be between 0 and 1, got {}",
                self.drop_path_rate
            )));
        }
        Ok(())
    }

    /// Drop path rate of every block, rising linearly across the whole stack
    pub fn drop_path_schedule(&self) -> Vec<Vec<f64>> {
        let total: usize = self.depths.iter().sum();
        let step = if total > 1 {
            self.drop_path_rate / (total - 1) as f64
        } else {
            0.0
        };

        let mut index = 0;
        self.depths
            .iter()
            .map(|&depth| {
                let rates = (index..index + depth).map(|i| i as f64 * step).collect();
                index += depth;
                rates
            })
            .collect()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<NestTransformer<B>> {
        self.validate()?;

        let patch_embed = Conv3dConfig::new(
            [self.in_channels, self.embed_dims[0]],
            [self.patch_size; 3],
        )
        .with_stride([self.patch_size; 3])
        .init(device);

        let block_size = self.block_size();
        let levels = self
            .drop_path_schedule()
            .into_iter()
            .enumerate()
            .map(|(i, drop_path)| {
                let blocks_per_axis = 1usize << (self.num_levels - 1 - i);
                let prev_embed_dim = (i > 0).then(|| self.embed_dims[i - 1]);
                NestLevelConfig::new(
                    self.embed_dims[i],
                    self.num_heads[i],
                    blocks_per_axis.pow(3),
                    block_size,
                    drop_path,
                )
                .with_prev_embed_dim(prev_embed_dim)
                .with_mlp_ratio(self.mlp_ratio)
                .with_qkv_bias(self.qkv_bias)
                .with_drop_rate(self.drop_rate)
                .with_attn_drop_rate(self.attn_drop_rate)
                .init(device)
            })
            .collect();

        let last_dim = self.embed_dims[self.num_levels - 1];

        Ok(NestTransformer {
            patch_embed,
            levels,
            norm: LayerNormConfig::new(last_dim).init(device),
            in_channels: self.in_channels,
            image_size: self.image_size,
        })
    }
}

/// `grid / 2^times`, zero once every bit has been shifted out.
fn halve(grid: usize, times: usize) -> usize {
    u32::try_from(times)
        .ok()
        .and_then(|t| grid.checked_shr(t))
        .unwrap_or(0)
}

/// Hierarchical nested transformer producing multi-scale features
#[derive(Module, Debug)]
pub struct NestTransformer<B: Backend> {
    patch_embed: Conv3d<B>,
    levels: Vec<NestLevel<B>>,
    norm: LayerNorm<B>,
    in_channels: usize,
    image_size: usize,
}

impl<B: Backend> NestTransformer<B> {
    /// Extract deep and intermediate features
    ///
    /// # Arguments
    /// * `x` - Image [batch, in_channels, S, S, S] with S the configured image size
    ///
    /// # Returns
    /// * Deep feature plus `num_levels + 1` hidden states
    pub fn forward(&self, x: Tensor<B, 5>) -> error::Result<NestOutput<B>> {
        let batch = x.dims()[0];
        let s = self.image_size;
        expect_dims("nest input", &x, [batch, self.in_channels, s, s, s])?;

        let mut x = self.patch_embed.forward(x);
        let mut hidden_states = Vec::with_capacity(self.levels.len() + 1);
        hidden_states.push(x.clone());

        for level in &self.levels {
            x = level.forward(x);
            hidden_states.push(x.clone());
        }

        let deep = self
            .norm
            .forward(x.permute([0, 2, 3, 4, 1]))
            .permute([0, 4, 1, 2, 3]);

        Ok(NestOutput {
            deep,
            hidden_states,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config() -> NestTransformerConfig {
        NestTransformerConfig::new()
            .with_image_size(32)
            .with_embed_dims(vec![8, 16, 32])
            .with_num_heads(vec![2, 2, 4])
            .with_depths(vec![1, 1, 2])
    }

    #[test]
    fn test_default_geometry() {
        let config = NestTransformerConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.grid_size(), 24);
        assert_eq!(config.block_size(), 6);
        assert_eq!(
            config.hidden_state_specs(),
            vec![(128, 24), (128, 24), (256, 12), (512, 6)]
        );
    }

    #[test]
    fn test_drop_path_schedule() {
        let config = NestTransformerConfig::new()
            .with_depths(vec![1, 1, 3])
            .with_drop_path_rate(0.4);
        let schedule = config.drop_path_schedule();

        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule[0], vec![0.0]);
        assert!((schedule[1][0] - 0.1).abs() < 1e-12);
        assert!((schedule[2][2] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_configs() {
        let heads = small_config().with_num_heads(vec![3, 2, 4]);
        assert!(matches!(heads.validate(), Err(ModelError::InvalidConfiguration(_))));

        let levels = small_config().with_depths(vec![1, 1]);
        assert!(levels.validate().is_err());

        let grid = small_config().with_image_size(36);
        assert!(grid.validate().is_err());

        let rate = small_config().with_drop_path_rate(1.5);
        assert!(rate.validate().is_err());

        // Full stochastic depth is allowed, full dropout is not.
        assert!(small_config().with_drop_path_rate(1.0).validate().is_ok());
        assert!(small_config().with_drop_rate(1.0).validate().is_err());
        assert!(small_config().with_attn_drop_rate(1.0).validate().is_err());
    }

    #[test]
    fn test_level_count_is_bounded_by_grid() {
        // 32 / 4 = 8 = 2^3: at most 4 levels.
        let four = small_config()
            .with_num_levels(4)
            .with_embed_dims(vec![8, 16, 32, 64])
            .with_num_heads(vec![2, 2, 4, 4])
            .with_depths(vec![1, 1, 1, 1]);
        assert!(four.validate().is_ok());
        assert_eq!(four.block_size(), 1);

        let five = four
            .clone()
            .with_num_levels(5)
            .with_embed_dims(vec![8; 5])
            .with_num_heads(vec![2; 5])
            .with_depths(vec![1; 5]);
        assert!(five.validate().is_err());

        let many = small_config()
            .with_num_levels(70)
            .with_embed_dims(vec![8; 70])
            .with_num_heads(vec![2; 70])
            .with_depths(vec![1; 70]);
        assert!(matches!(many.validate(), Err(ModelError::InvalidConfiguration(_))));
        assert_eq!(many.block_size(), 0);
        assert_eq!(many.hidden_state_specs().last(), Some(&(8, 0)));

        let no_patch = small_config().with_patch_size(0);
        assert_eq!(no_patch.grid_size(), 0);
        assert!(no_patch.validate().is_err());
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let nest = small_config().init::<TestBackend>(&device).unwrap();
        assert_eq!(nest.num_levels(), 3);

        let x = Tensor::<TestBackend, 5>::random([2, 1, 32, 32, 32], Distribution::Normal(0.0, 1.0), &device);
        let out = nest.forward(x).unwrap();

        let dims: Vec<_> = out.hidden_states.iter().map(|h| h.dims()).collect();
        assert_eq!(
            dims,
            vec![
                [2, 8, 8, 8, 8],
                [2, 8, 8, 8, 8],
                [2, 16, 4, 4, 4],
                [2, 32, 2, 2, 2],
            ]
        );
        assert_eq!(out.deep.dims(), [2, 32, 2, 2, 2]);
    }

    #[test]
    fn test_rejects_wrong_input_size() {
        let device = Default::default();
        let nest = small_config().init::<TestBackend>(&device).unwrap();

        let x = Tensor::<TestBackend, 5>::zeros([1, 1, 16, 32, 32], &device);
        assert!(matches!(nest.forward(x), Err(ModelError::ShapeMismatch { .. })));

        let x = Tensor::<TestBackend, 5>::zeros([1, 2, 32, 32, 32], &device);
        assert!(matches!(nest.forward(x), Err(ModelError::ShapeMismatch { .. })));
    }
}
