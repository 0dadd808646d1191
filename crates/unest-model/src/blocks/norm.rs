//! Feature normalization selected by scheme name.

use std::fmt;
use std::str::FromStr;

use burn::nn::{
    BatchNorm, BatchNormConfig, GroupNorm, GroupNormConfig, InstanceNorm, InstanceNormConfig,
    LayerNorm, LayerNormConfig,
};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Normalization scheme for convolutional blocks.
///
/// Serialized by scheme name (`"instance"`, `{"group": {"num_groups": 4}}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    /// Per-sample, per-channel normalization.
    #[default]
    Instance,
    /// Batch statistics.
    Batch,
    /// Channel groups.
    Group { num_groups: usize },
    /// Channel-wise layer norm (channels-last internally).
    Layer,
}

impl FromStr for NormKind {
    type Err = ModelError;

    /// Parses `"instance"`, `"batch"`, `"layer"`, `"group"` (8 groups) or
    /// `"group:<n>"`.
    fn from_str(name: &str) -> Result<Self> {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "instance" | "instancenorm" => Ok(Self::Instance),
            "batch" | "batchnorm" => Ok(Self::Batch),
            "layer" | "layernorm" => Ok(Self::Layer),
            "group" | "groupnorm" => Ok(Self::Group { num_groups: 8 }),
            other => match other.strip_prefix("group:") {
                Some(n) => n
                    .parse::<usize>()
                    .ok()
                    .filter(|&n| n > 0)
                    .map(|num_groups| Self::Group { num_groups })
                    .ok_or_else(|| {
                        ModelError::invalid_configuration(format!(
                            "invalid group count in norm name '{name}'"
                        ))
                    }),
                None => Err(ModelError::invalid_configuration(format!(
                    "unknown norm name '{name}'"
                ))),
            },
        }
    }
}

impl fmt::Display for NormKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance => write!(f, "instance"),
            Self::Batch => write!(f, "batch"),
            Self::Group { num_groups } => write!(f, "group:{num_groups}"),
            Self::Layer => write!(f, "layer"),
        }
    }
}

impl NormKind {
    /// Checks that this scheme can normalize `channels` features.
    pub fn validate(&self, channels: usize) -> Result<()> {
        if let Self::Group { num_groups } = *self {
            if num_groups == 0 || channels % num_groups != 0 {
                return Err(ModelError::invalid_configuration(format!(
                    "{channels} channels cannot be split into {num_groups} groups"
                )));
            }
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, channels: usize, device: &B::Device) -> Norm<B> {
        let mut norm = Norm {
            instance: None,
            batch: None,
            group: None,
            layer: None,
        };
        match *self {
            Self::Instance => norm.instance = Some(InstanceNormConfig::new(channels).init(device)),
            Self::Batch => norm.batch = Some(BatchNormConfig::new(channels).init(device)),
            Self::Group { num_groups } => {
                norm.group = Some(GroupNormConfig::new(num_groups, channels).init(device))
            }
            Self::Layer => norm.layer = Some(LayerNormConfig::new(channels).init(device)),
        }
        norm
    }
}

/// Normalization layer over `[B, C, D, H, W]` tensors. Exactly one of the
/// slots is populated.
#[derive(Module, Debug)]
pub struct Norm<B: Backend> {
    instance: Option<InstanceNorm<B>>,
    batch: Option<BatchNorm<B, 3>>,
    group: Option<GroupNorm<B>>,
    layer: Option<LayerNorm<B>>,
}

impl<B: Backend> Norm<B> {
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        if let Some(norm) = &self.instance {
            return norm.forward(x);
        }
        if let Some(norm) = &self.batch {
            return norm.forward(x);
        }
        if let Some(norm) = &self.group {
            return norm.forward(x);
        }
        match &self.layer {
            // LayerNorm normalizes the last axis.
            Some(norm) => norm
                .forward(x.permute([0, 2, 3, 4, 1]))
                .permute([0, 4, 1, 2, 3]),
            None => x,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_parse_norm_names() {
        assert_eq!("instance".parse::<NormKind>().unwrap(), NormKind::Instance);
        assert_eq!("BATCH".parse::<NormKind>().unwrap(), NormKind::Batch);
        assert_eq!("layer".parse::<NormKind>().unwrap(), NormKind::Layer);
        assert_eq!(
            "group:4".parse::<NormKind>().unwrap(),
            NormKind::Group { num_groups: 4 }
        );
        assert!("spectral".parse::<NormKind>().is_err());
        assert!("group:0".parse::<NormKind>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for kind in [
            NormKind::Instance,
            NormKind::Batch,
            NormKind::Layer,
            NormKind::Group { num_groups: 2 },
        ] {
            assert_eq!(kind.to_string().parse::<NormKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_group_validation() {
        assert!(NormKind::Group { num_groups: 4 }.validate(16).is_ok());
        assert!(NormKind::Group { num_groups: 3 }.validate(16).is_err());
        assert!(NormKind::Instance.validate(3).is_ok());
    }

    #[test]
    fn test_norm_preserves_shape() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 5>::random([2, 4, 3, 3, 3], Distribution::Normal(0.0, 1.0), &device);

        for kind in [
            NormKind::Instance,
            NormKind::Batch,
            NormKind::Layer,
            NormKind::Group { num_groups: 2 },
        ] {
            let norm = kind.init::<TestBackend>(4, &device);
            assert_eq!(norm.forward(x.clone()).dims(), [2, 4, 3, 3, 3]);
        }
    }
}
