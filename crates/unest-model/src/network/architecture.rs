//! UNesT Network Architecture - U-Shaped Segmentation Network
//!
//! Fuses the multi-scale hidden states of the nested transformer with
//! convolutional feature maps through a symmetric encoder/decoder ladder.
//!
//! # Architecture Overview
//!
//! ```text
//! Input [batch, 1, 96, 96, 96]
//!   │
//!   ├──► encoder1 (conv) ─────────────────────────────── enc0 [32, 96^3] ──┐
//!   │                                                                        │
//!   └──► NesT ──► hidden[0] ─► encoder2 (up) ─────────── enc1 [64, 48^3] ─┐ │
//!               ├ hidden[1] ─► encoder3 (conv) ───────── enc2 [128, 24^3] ┐│ │
//!               ├ hidden[2] ─► encoder4 (conv) ───────── enc3 [256, 12^3] ││ │
//!               ├ hidden[3] ──────────────────────────── enc4 [512, 6^3] ┐││ │
//!               └ deep [512, 6^3]                                        ││││ │
//!                    │                                                   ││││ │
//!                    ▼                                                   ││││ │
//!               bottleneck [1024, 3^3]                                   ││││ │
//!                    │                                                   ││││ │
//!                    ▼                                                   ││││ │
//!               decoder5 ◄───────────────────────────────────────────────┘│││ │
//!               decoder4 ◄────────────────────────────────────────────────┘││ │
//!               decoder3 ◄─────────────────────────────────────────────────┘│ │
//!               decoder2 ◄──────────────────────────────────────────────────┘ │
//!               decoder1 ◄────────────────────────────────────────────────────┘
//!                    │ [32, 96^3]
//!                    ▼
//!               out head(s) ──► logits [out_channels (+2), 96^3]
//! ```
//!
//! Channel counts above are for `feature_size = 16`.

use std::str::FromStr;

use burn::prelude::*;

use crate::blocks::{
    ConvBlock, ConvBlockConfig, ConvNormAct, ConvNormActConfig, DecoderBlock, DecoderBlockConfig,
    NormKind, OutputHead, OutputHeadConfig, ProgressiveUpBlock, ProgressiveUpBlockConfig,
};
use crate::error::{self, ModelError};
use crate::nest::{NestOutput, NestTransformer, NestTransformerConfig};
use crate::shape::expect_channels;

/// Output from a UNesT forward pass
#[derive(Debug, Clone)]
pub struct UNesTOutput<B: Backend> {
    /// Raw logits [batch, out_channels (+2 with auxiliary heads), D, H, W]
    pub logits: Tensor<B, 5>,
    /// Final decoder feature map [batch, feature_size * 2, D, H, W]
    pub decoded: Tensor<B, 5>,
    /// Encoder skip connections, finest first (enc0..enc4)
    pub skips: Vec<Tensor<B, 5>>,
    /// Bottleneck features [batch, feature_size * 64, S/8p, ...]
    pub bottleneck: Tensor<B, 5>,
}

/// Logits split per head
#[derive(Debug, Clone)]
pub struct HeadLogits<B: Backend> {
    /// Segmentation labels [batch, out_channels, D, H, W]
    pub labels: Tensor<B, 5>,
    /// Total intracranial volume [batch, 1, D, H, W]
    pub ticv: Option<Tensor<B, 5>>,
    /// Posterior fossa volume [batch, 1, D, H, W]
    pub pfv: Option<Tensor<B, 5>>,
}

/// Configuration for the UNesT network
#[derive(Config, Debug, PartialEq)]
pub struct UNesTConfig {
    pub in_channels: usize,
    /// Number of segmentation classes
    pub out_channels: usize,
    /// Edge length of the (cubic) input volume
    #[config(default = 96)]
    pub img_size: usize,
    /// Base channel multiplier of the convolutional ladder
    #[config(default = 16)]
    pub feature_size: usize,
    #[config(default = 4)]
    pub patch_size: usize,
    #[config(default = "vec![2, 2, 8]")]
    pub depths: Vec<usize>,
    #[config(default = "vec![4, 8, 16]")]
    pub num_heads: Vec<usize>,
    #[config(default = "vec![128, 256, 512]")]
    pub embed_dim: Vec<usize>,
    /// Accepted for configuration compatibility; nested blocks take their
    /// extent from the patch grid instead.
    #[config(default = "[7, 7, 7]")]
    pub window_size: [usize; 3],
    #[config(default = "NormKind::Instance")]
    pub norm_name: NormKind,
    /// Refine the transformer-to-encoder upsampling with conv blocks
    #[config(default = false)]
    pub conv_block: bool,
    /// Use residual conv blocks
    #[config(default = true)]
    pub res_block: bool,
    /// Dropout inside the bottleneck projection, in [0, 1]
    #[config(default = 0.0)]
    pub dropout_rate: f64,
    /// Stochastic depth of the nested transformer
    #[config(default = 0.5)]
    pub drop_path_rate: f64,
    #[config(default = 2)]
    pub upsample_kernel_size: usize,
    /// Append TICV and PFV single-channel heads to the output
    #[config(default = false)]
    pub auxiliary_heads: bool,
}

impl UNesTConfig {
    /// Set the normalization scheme by name (`"instance"`, `"batch"`, ...)
    pub fn with_norm_scheme(self, name: &str) -> error::Result<Self> {
        Ok(self.with_norm_name(NormKind::from_str(name)?))
    }

    /// Configuration of the hierarchical extractor
    pub fn nest_config(&self) -> NestTransformerConfig {
        NestTransformerConfig::new()
            .with_image_size(self.img_size)
            .with_in_channels(self.in_channels)
            .with_patch_size(self.patch_size)
            .with_num_levels(3)
            .with_embed_dims(self.embed_dim.clone())
            .with_num_heads(self.num_heads.clone())
            .with_depths(self.depths.clone())
            .with_drop_path_rate(self.drop_path_rate)
    }

    /// Total output channels, auxiliary heads included
    pub fn total_out_channels(&self) -> usize {
        if self.auxiliary_heads {
            self.out_channels + 2
        } else {
            self.out_channels
        }
    }

    /// Check everything that can be checked without running the network.
    ///
    /// Channel agreement between the extractor and the ladder is checked
    /// on the first forward pass.
    pub fn validate(&self) -> error::Result<()> {
        if !(0.0..=1.0).contains(&self.dropout_rate) {
            return Err(ModelError::invalid_configuration(format!(
                "dropout_rate should be between 0 and 1, got {}",
                self.dropout_rate
            )));
        }
        if self.in_channels == 0 || self.out_channels == 0 || self.feature_size == 0 {
            return Err(ModelError::invalid_configuration(
                "in_channels, out_channels and feature_size must be positive",
            ));
        }
        if self.upsample_kernel_size == 0 {
            return Err(ModelError::invalid_configuration(
                "upsample_kernel_size must be positive",
            ));
        }
        if self.window_size.contains(&0) {
            return Err(ModelError::invalid_configuration(format!(
                "window_size must be positive, got {:?}",
                self.window_size
            )));
        }
        for mult in [2, 4, 8, 16, 32, 64] {
            self.norm_name.validate(self.feature_size * mult)?;
        }
        self.nest_config().validate()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<UNesT<B>> {
        self.validate()?;

        let fs = self.feature_size;
        let embed = &self.embed_dim;
        let norm = self.norm_name;

        let nest = self.nest_config().init(device)?;

        let conv = |in_ch: usize, out_ch: usize| {
            ConvBlockConfig::new(in_ch, out_ch)
                .with_norm(norm)
                .with_res_block(self.res_block)
                .init(device)
        };
        let decoder = |in_ch: usize, out_ch: usize| {
            DecoderBlockConfig::new(in_ch, out_ch)
                .with_upsample_kernel_size(self.upsample_kernel_size)
                .with_norm(norm)
                .with_res_block(self.res_block)
                .init(device)
        };

        // Encoder
        let encoder1 = conv(self.in_channels, fs * 2);
        let encoder2 = ProgressiveUpBlockConfig::new(embed[0], fs * 4)
            .with_upsample_kernel_size(self.upsample_kernel_size)
            .with_norm(norm)
            .with_conv_block(self.conv_block)
            .with_res_block(self.res_block)
            .init(device);
        let encoder3 = conv(embed[0], fs * 8);
        let encoder4 = conv(embed[1], fs * 16);

        // Bottleneck: stride-2 projection of the deep feature
        let bottleneck = ConvNormActConfig::new(fs * 32, fs * 64)
            .with_norm(norm)
            .with_dropout(self.dropout_rate)
            .init(device);

        // Decoder
        let decoder5 = decoder(2 * embed[2], fs * 32);
        let decoder4 = decoder(embed[2], fs * 16);
        let decoder3 = decoder(fs * 16, fs * 8);
        let decoder2 = decoder(fs * 8, fs * 4);
        let decoder1 = decoder(fs * 4, fs * 2);

        // Heads
        let out = OutputHeadConfig::new(fs * 2, self.out_channels).init(device);
        let auxiliary = self.auxiliary_heads.then(|| AuxiliaryHeads {
            ticv: OutputHeadConfig::new(fs * 2, 1).init(device),
            pfv: OutputHeadConfig::new(fs * 2, 1).init(device),
        });

        let model = UNesT {
            nest,
            encoder1,
            encoder2,
            encoder3,
            encoder4,
            bottleneck,
            decoder5,
            decoder4,
            decoder3,
            decoder2,
            decoder1,
            out,
            auxiliary,
            out_channels: self.out_channels,
        };

        tracing::info!(
            "UNesT initialized: {} parameters, {} output channels, auxiliary heads: {}",
            model.num_params(),
            self.total_out_channels(),
            self.auxiliary_heads
        );

        Ok(model)
    }
}

/// Single-channel heads for whole-brain volume structures
#[derive(Module, Debug)]
pub struct AuxiliaryHeads<B: Backend> {
    ticv: OutputHead<B>,
    pfv: OutputHead<B>,
}

/// UNesT network for volumetric segmentation
///
/// Hierarchical nested-transformer encoder plus convolutional ladder.
/// With auxiliary heads enabled, TICV and PFV logits are appended as the
/// last two output channels.
#[derive(Module, Debug)]
pub struct UNesT<B: Backend> {
    /// Hierarchical feature extractor
    pub nest: NestTransformer<B>,
    encoder1: ConvBlock<B>,
    encoder2: ProgressiveUpBlock<B>,
    encoder3: ConvBlock<B>,
    encoder4: ConvBlock<B>,
    bottleneck: ConvNormAct<B>,
    decoder5: DecoderBlock<B>,
    decoder4: DecoderBlock<B>,
    decoder3: DecoderBlock<B>,
    decoder2: DecoderBlock<B>,
    decoder1: DecoderBlock<B>,
    out: OutputHead<B>,
    auxiliary: Option<AuxiliaryHeads<B>>,
    out_channels: usize,
}

impl<B: Backend> UNesT<B> {
    /// Forward pass returning raw per-voxel logits
    ///
    /// # Arguments
    /// * `x` - Image [batch, in_channels, S, S, S]
    ///
    /// # Returns
    /// * Logits [batch, out_channels (+2), S, S, S]
    pub fn forward(&self, x: Tensor<B, 5>) -> error::Result<Tensor<B, 5>> {
        self.forward_features(x).map(|output| output.logits)
    }

    /// Forward pass keeping the intermediate feature maps
    pub fn forward_features(&self, x: Tensor<B, 5>) -> error::Result<UNesTOutput<B>> {
        let NestOutput {
            deep,
            hidden_states,
        } = self.nest.forward(x.clone())?;
        let found = hidden_states.len();
        let [x1, x2, x3, x4]: [Tensor<B, 5>; 4] = hidden_states
            .try_into()
            .map_err(|_| ModelError::shape_mismatch("nest hidden states", vec![4], vec![found]))?;

        // Encoder skips
        expect_channels("encoder1", &x, self.encoder1.in_channels())?;
        let enc0 = self.encoder1.forward(x);
        expect_channels("encoder2", &x1, self.encoder2.in_channels())?;
        let enc1 = self.encoder2.forward(x1);
        expect_channels("encoder3", &x2, self.encoder3.in_channels())?;
        let enc2 = self.encoder3.forward(x2);
        expect_channels("encoder4", &x3, self.encoder4.in_channels())?;
        let enc3 = self.encoder4.forward(x3);
        let enc4 = x4;
        tracing::debug!(
            "encoder skips: {:?} {:?} {:?} {:?} {:?}",
            enc0.dims(),
            enc1.dims(),
            enc2.dims(),
            enc3.dims(),
            enc4.dims()
        );

        expect_channels("bottleneck", &deep, self.bottleneck.in_channels())?;
        let bottleneck = self.bottleneck.forward(deep);
        tracing::debug!("bottleneck: {:?}", bottleneck.dims());

        // Decoder, consuming skips deepest first
        let dec3 = self
            .decoder5
            .forward("decoder5", bottleneck.clone(), enc4.clone())?;
        let dec2 = self.decoder4.forward("decoder4", dec3, enc3.clone())?;
        let dec1 = self.decoder3.forward("decoder3", dec2, enc2.clone())?;
        let dec0 = self.decoder2.forward("decoder2", dec1, enc1.clone())?;
        let decoded = self.decoder1.forward("decoder1", dec0, enc0.clone())?;
        tracing::debug!("decoded: {:?}", decoded.dims());

        let logits = self.heads(decoded.clone());

        Ok(UNesTOutput {
            logits,
            decoded,
            skips: vec![enc0, enc1, enc2, enc3, enc4],
            bottleneck,
        })
    }

    fn heads(&self, decoded: Tensor<B, 5>) -> Tensor<B, 5> {
        let labels = self.out.forward(decoded.clone());
        match &self.auxiliary {
            Some(aux) => {
                let ticv = aux.ticv.forward(decoded.clone());
                let pfv = aux.pfv.forward(decoded);
                Tensor::cat(vec![labels, ticv, pfv], 1)
            }
            None => labels,
        }
    }

    /// Split concatenated logits into the primary and auxiliary heads
    pub fn split_heads(&self, logits: Tensor<B, 5>) -> error::Result<HeadLogits<B>> {
        expect_channels("split heads", &logits, self.total_out_channels())?;
        let [b, _, d, h, w] = logits.dims();
        let n = self.out_channels;

        let channels = |range: std::ops::Range<usize>| {
            logits.clone().slice([0..b, range, 0..d, 0..h, 0..w])
        };
        let (ticv, pfv) = if self.has_auxiliary_heads() {
            (Some(channels(n..n + 1)), Some(channels(n + 1..n + 2)))
        } else {
            (None, None)
        };

        Ok(HeadLogits {
            labels: channels(0..n),
            ticv,
            pfv,
        })
    }

    /// Number of segmentation classes
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Channels of the forward output, auxiliary heads included
    pub fn total_out_channels(&self) -> usize {
        if self.has_auxiliary_heads() {
            self.out_channels + 2
        } else {
            self.out_channels
        }
    }

    pub fn has_auxiliary_heads(&self) -> bool {
        self.auxiliary.is_some()
    }
}

/// Preset configurations
pub mod presets {
    use super::*;

    /// Whole-brain segmentation (133 labels) of 96^3 T1-weighted patches
    pub fn whole_brain() -> UNesTConfig {
        UNesTConfig::new(1, 133)
    }

    /// Whole-brain segmentation with TICV and PFV heads (135 output channels)
    pub fn whole_brain_with_volumes() -> UNesTConfig {
        whole_brain().with_auxiliary_heads(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config(out_channels: usize) -> UNesTConfig {
        UNesTConfig::new(1, out_channels)
            .with_img_size(32)
            .with_feature_size(2)
            .with_embed_dim(vec![16, 32, 64])
            .with_num_heads(vec![2, 4, 8])
            .with_depths(vec![1, 1, 2])
    }

    #[test]
    fn test_dropout_rate_validation() {
        for rate in [1.5, -0.1] {
            let config = small_config(4).with_dropout_rate(rate);
            let err = config.init::<TestBackend>(&Default::default()).unwrap_err();
            assert!(matches!(err, ModelError::InvalidConfiguration(_)));
        }
        for rate in [0.0, 0.3, 1.0] {
            assert!(small_config(4).with_dropout_rate(rate).validate().is_ok());
        }
    }

    #[test]
    fn test_norm_scheme_by_name() {
        let config = small_config(4).with_norm_scheme("batch").unwrap();
        assert_eq!(config.norm_name, NormKind::Batch);
        assert!(small_config(4).with_norm_scheme("weight").is_err());

        // 2 * feature_size = 4 channels cannot be split into 8 groups.
        let config = small_config(4).with_norm_scheme("group").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets() {
        let config = presets::whole_brain();
        assert!(config.validate().is_ok());
        assert_eq!(config.total_out_channels(), 133);
        assert!(!config.auxiliary_heads);

        let config = presets::whole_brain_with_volumes();
        assert_eq!(config.total_out_channels(), 135);
        assert_eq!(config.nest_config().hidden_state_specs().len(), 4);
    }

    #[test]
    fn test_forward_features_shapes() {
        let device = Default::default();
        let model = small_config(3).init::<TestBackend>(&device).unwrap();

        let x = Tensor::<TestBackend, 5>::random([1, 1, 32, 32, 32], Distribution::Normal(0.0, 1.0), &device);
        let output = model.forward_features(x).unwrap();

        let skips: Vec<_> = output.skips.iter().map(|s| s.dims()).collect();
        assert_eq!(
            skips,
            vec![
                [1, 4, 32, 32, 32],
                [1, 8, 16, 16, 16],
                [1, 16, 8, 8, 8],
                [1, 32, 4, 4, 4],
                [1, 64, 2, 2, 2],
            ]
        );
        assert_eq!(output.bottleneck.dims(), [1, 128, 1, 1, 1]);
        assert_eq!(output.decoded.dims(), [1, 4, 32, 32, 32]);
        assert_eq!(output.logits.dims(), [1, 3, 32, 32, 32]);
    }

    #[test]
    fn test_auxiliary_heads_are_concatenated_in_order() {
        let device = Default::default();
        let model = small_config(4)
            .with_auxiliary_heads(true)
            .init::<TestBackend>(&device)
            .unwrap();
        assert!(model.has_auxiliary_heads());

        let x = Tensor::<TestBackend, 5>::random([1, 1, 32, 32, 32], Distribution::Normal(0.0, 1.0), &device);
        let output = model.forward_features(x).unwrap();
        assert_eq!(output.logits.dims(), [1, 6, 32, 32, 32]);

        let heads = model.split_heads(output.logits).unwrap();
        let aux = model.auxiliary.as_ref().unwrap();

        let labels = model.out.forward(output.decoded.clone());
        let ticv = aux.ticv.forward(output.decoded.clone());
        let pfv = aux.pfv.forward(output.decoded);

        heads.labels.into_data().assert_approx_eq(&labels.into_data(), 5);
        heads.ticv.unwrap().into_data().assert_approx_eq(&ticv.into_data(), 5);
        heads.pfv.unwrap().into_data().assert_approx_eq(&pfv.into_data(), 5);
    }

    #[test]
    fn test_split_heads_without_auxiliary() {
        let device = Default::default();
        let model = small_config(4).init::<TestBackend>(&device).unwrap();

        let logits = Tensor::<TestBackend, 5>::zeros([2, 4, 3, 3, 3], &device);
        let heads = model.split_heads(logits).unwrap();
        assert_eq!(heads.labels.dims(), [2, 4, 3, 3, 3]);
        assert!(heads.ticv.is_none());
        assert!(heads.pfv.is_none());

        let logits = Tensor::<TestBackend, 5>::zeros([2, 6, 3, 3, 3], &device);
        assert!(model.split_heads(logits).is_err());
    }

    #[test]
    fn test_training_forward_with_full_drop_rates_is_finite() {
        type TrainBackend = Autodiff<TestBackend>;
        let device = Default::default();
        let model = small_config(2)
            .with_dropout_rate(1.0)
            .with_drop_path_rate(1.0)
            .init::<TrainBackend>(&device)
            .unwrap();

        let x = Tensor::<TrainBackend, 5>::random([1, 1, 32, 32, 32], Distribution::Normal(0.0, 1.0), &device);
        let logits = model.forward(x).unwrap();
        assert_eq!(logits.dims(), [1, 2, 32, 32, 32]);

        let values = logits.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_mismatched_embed_dim_fails_at_bottleneck() {
        let device = Default::default();
        // The deepest embed dim must equal 32 * feature_size (64 here).
        let model = small_config(4)
            .with_embed_dim(vec![16, 32, 48])
            .init::<TestBackend>(&device)
            .unwrap();

        let x = Tensor::<TestBackend, 5>::zeros([1, 1, 32, 32, 32], &device);
        match model.forward(x) {
            Err(ModelError::ShapeMismatch {
                stage,
                expected,
                actual,
            }) => {
                assert_eq!(stage, "bottleneck");
                assert_eq!(expected, vec![1, 64, 2, 2, 2]);
                assert_eq!(actual, vec![1, 48, 2, 2, 2]);
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }
}
