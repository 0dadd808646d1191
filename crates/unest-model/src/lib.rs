pub mod blocks;
pub mod error;
pub mod nest;
pub mod network;

mod shape;

pub use blocks::NormKind;
pub use error::{ModelError, Result};
pub use nest::{NestOutput, NestTransformer, NestTransformerConfig};
pub use network::{presets, HeadLogits, UNesT, UNesTConfig, UNesTOutput};
