//! Convolutional building blocks of the U-shaped ladder.

pub mod conv;
pub mod head;
pub mod norm;
pub mod up;

pub use conv::{ConvBlock, ConvBlockConfig, ConvNormAct, ConvNormActConfig};
pub use head::{OutputHead, OutputHeadConfig};
pub use norm::{Norm, NormKind};
pub use up::{
    DecoderBlock, DecoderBlockConfig, ProgressiveUpBlock, ProgressiveUpBlockConfig,
    ProgressiveUpLayer,
};
