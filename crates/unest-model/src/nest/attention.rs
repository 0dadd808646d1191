use burn::{
    nn::{Dropout, DropoutConfig, Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig},
    prelude::*,
    tensor::{activation::softmax, Distribution},
};

/// Pre-norm transformer block operating on nested blocks of tokens.
///
/// Input and output are `[Batch, Blocks, Tokens, Channels]`; attention never
/// crosses a block boundary.
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    norm1: LayerNorm<B>,
    attention: BlockAttention<B>,
    norm2: LayerNorm<B>,
    mlp: Mlp<B>,
    drop_path: DropPath,
}

#[derive(Config, Debug)]
pub struct TransformerBlockConfig {
    pub input_dim: usize,
    pub num_heads: usize,
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
    #[config(default = true)]
    pub qkv_bias: bool,
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = 0.0)]
    pub attention_dropout: f64,
    #[config(default = 0.0)]
    pub drop_path: f64,
}

impl TransformerBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TransformerBlock<B> {
        let mlp_hidden_dim = (self.input_dim as f64 * self.mlp_ratio) as usize;

        TransformerBlock {
            norm1: LayerNormConfig::new(self.input_dim).init(device),
            attention: BlockAttentionConfig::new(self.input_dim, self.num_heads)
                .with_qkv_bias(self.qkv_bias)
                .with_attention_dropout(self.attention_dropout)
                .with_proj_dropout(self.dropout)
                .init(device),
            norm2: LayerNormConfig::new(self.input_dim).init(device),
            mlp: MlpConfig::new(self.input_dim, mlp_hidden_dim)
                .with_dropout(self.dropout)
                .init(device),
            drop_path: DropPath::new(self.drop_path),
        }
    }
}

impl<B: Backend> TransformerBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let shortcut = x.clone();
        let x = self.attention.forward(self.norm1.forward(x));
        let x = shortcut + self.drop_path.forward(x);

        let shortcut = x.clone();
        let x = self.mlp.forward(self.norm2.forward(x));
        shortcut + self.drop_path.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct BlockAttention<B: Backend> {
    query: Linear<B>,
    key: Linear<B>,
    value: Linear<B>,
    proj: Linear<B>,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    attention_dropout: Dropout,
    proj_dropout: Dropout,
}

#[derive(Config, Debug)]
pub struct BlockAttentionConfig {
    input_dim: usize,
    num_heads: usize,
    #[config(default = true)]
    qkv_bias: bool,
    #[config(default = 0.0)]
    attention_dropout: f64,
    #[config(default = 0.0)]
    proj_dropout: f64,
}

impl BlockAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> BlockAttention<B> {
        let head_dim = self.input_dim / self.num_heads;
        let qkv = || {
            LinearConfig::new(self.input_dim, self.input_dim)
                .with_bias(self.qkv_bias)
                .init(device)
        };

        BlockAttention {
            query: qkv(),
            key: qkv(),
            value: qkv(),
            proj: LinearConfig::new(self.input_dim, self.input_dim).init(device),
            num_heads: self.num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            attention_dropout: DropoutConfig::new(self.attention_dropout).init(),
            proj_dropout: DropoutConfig::new(self.proj_dropout).init(),
        }
    }
}

impl<B: Backend> BlockAttention<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        // x: [B, T, N, C]; every block is attended independently
        let [b, t, n, c] = x.dims();
        let x = x.reshape([b * t, n, c]);

        let heads = |tokens: Tensor<B, 3>| {
            tokens
                .reshape([b * t, n, self.num_heads, self.head_dim])
                .permute([0, 2, 1, 3]) // [B*T, Heads, N, HeadDim]
        };
        let q = heads(self.query.forward(x.clone()));
        let k = heads(self.key.forward(x.clone()));
        let v = heads(self.value.forward(x));

        let attn = q.matmul(k.transpose()) * self.scale;
        let attn = softmax(attn, 3);
        let attn = self.attention_dropout.forward(attn);

        let x = attn
            .matmul(v)
            .permute([0, 2, 1, 3]) // [B*T, N, Heads, HeadDim]
            .reshape([b * t, n, c]);

        let x = self.proj_dropout.forward(self.proj.forward(x));
        x.reshape([b, t, n, c])
    }
}

/// Token-wise feed-forward: Linear -> GELU -> Linear, dropout after each
/// projection. Works on any rank; only the last axis is mixed.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    fc1: Linear<B>,
    act: Gelu,
    fc2: Linear<B>,
    dropout: Dropout,
}

/// `hidden_dim` is `input_dim * mlp_ratio` inside a [`TransformerBlock`].
#[derive(Config, Debug)]
pub struct MlpConfig {
    input_dim: usize,
    hidden_dim: usize,
    #[config(default = 0.0)]
    dropout: f64,
}

impl MlpConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        Mlp {
            fc1: LinearConfig::new(self.input_dim, self.hidden_dim).init(device),
            act: Gelu::new(),
            fc2: LinearConfig::new(self.hidden_dim, self.input_dim).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

impl<B: Backend> Mlp<B> {
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let x = self.fc1.forward(x);
        let x = self.act.forward(x);
        let x = self.dropout.forward(x);
        let x = self.fc2.forward(x);
        self.dropout.forward(x)
    }
}

/// Stochastic depth: drops whole residual branches per sample.
///
/// Like [`Dropout`], only active when the backend tracks gradients.
#[derive(Module, Clone, Debug)]
pub struct DropPath {
    prob: f64,
}

impl DropPath {
    pub fn new(prob: f64) -> Self {
        Self { prob }
    }

    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        if !B::ad_enabled() || self.prob == 0.0 {
            return x;
        }

        let keep = 1.0 - self.prob;
        if keep <= 0.0 {
            return x.zeros_like();
        }

        let mut shape = [1; D];
        shape[0] = x.dims()[0];
        let mask = Tensor::<B, D>::random(shape, Distribution::Bernoulli(keep), &x.device());
        x * mask / keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_transformer_block_shape() {
        let device = Default::default();
        let block = TransformerBlockConfig::new(16, 4)
            .with_drop_path(0.3)
            .init::<TestBackend>(&device);

        let x = Tensor::<TestBackend, 4>::random([2, 8, 27, 16], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(block.forward(x).dims(), [2, 8, 27, 16]);
    }

    #[test]
    fn test_attention_stays_within_block() {
        let device = Default::default();
        let attention = BlockAttentionConfig::new(8, 2).init::<TestBackend>(&device);

        let x = Tensor::<TestBackend, 4>::random([1, 2, 4, 8], Distribution::Normal(0.0, 1.0), &device);
        let out = attention.forward(x.clone());

        // Perturbing block 1 must leave block 0 untouched.
        let perturbed = Tensor::cat(
            vec![
                x.clone().slice([0..1, 0..1, 0..4, 0..8]),
                x.slice([0..1, 1..2, 0..4, 0..8]).add_scalar(5.0),
            ],
            1,
        );
        let out_perturbed = attention.forward(perturbed);

        let block0 = out.slice([0..1, 0..1, 0..4, 0..8]).into_data();
        let block0_perturbed = out_perturbed.slice([0..1, 0..1, 0..4, 0..8]).into_data();
        block0.assert_approx_eq(&block0_perturbed, 5);
    }

    #[test]
    fn test_drop_path_training() {
        type TrainBackend = Autodiff<TestBackend>;
        let device = Default::default();
        let x = Tensor::<TrainBackend, 3>::ones([64, 3, 2], &device);

        // Every branch dropped: exact zeros rather than 0/0.
        let dropped = DropPath::new(1.0).forward(x.clone()).into_data();
        dropped.assert_approx_eq(&TensorData::zeros::<f32, _>([64, 3, 2]), 5);

        // Survivors are rescaled by 1 / keep, whole samples at a time.
        let values = DropPath::new(0.5).forward(x).into_data().to_vec::<f32>().unwrap();
        for sample in values.chunks(6) {
            assert!(sample.iter().all(|&v| v == sample[0]));
            assert!(sample[0] == 0.0 || (sample[0] - 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_drop_path_is_identity_without_autodiff() {
        let device = Default::default();
        let drop_path = DropPath::new(0.9);
        let x = Tensor::<TestBackend, 3>::ones([4, 3, 2], &device);
        let y = drop_path.forward(x.clone());
        assert_eq!(x.into_data(), y.into_data());
    }
}
