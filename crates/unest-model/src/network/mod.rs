//! UNesT Network Module - Segmentation Architecture
//!
//! # Module Structure
//!
//! ```text
//! network/
//! └── architecture.rs    - Main network (UNesT), configuration and presets
//! ```
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use unest_model::network::presets;
//! use burn::tensor::Tensor;
//! use burn_ndarray::NdArray;
//!
//! type B = NdArray;
//! let device = Default::default();
//!
//! let network = presets::whole_brain().init::<B>(&device)?;
//!
//! let image = Tensor::<B, 5>::zeros([1, 1, 96, 96, 96], &device);
//! let logits = network.forward(image)?;
//! assert_eq!(logits.dims(), [1, 133, 96, 96, 96]);
//! # Ok::<(), unest_model::ModelError>(())
//! ```

pub mod architecture;

// Re-export main types for convenience
pub use architecture::{
    AuxiliaryHeads,
    HeadLogits,
    UNesT,
    UNesTConfig,
    UNesTOutput,
    presets,
};
