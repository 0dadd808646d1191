//! Shape checks applied before every projection and fusion point.

use burn::prelude::*;

use crate::error::{ModelError, Result};

/// Fails unless `x` carries `expected` channels.
pub(crate) fn expect_channels<B: Backend>(
    stage: &str,
    x: &Tensor<B, 5>,
    expected: usize,
) -> Result<()> {
    let dims = x.dims();
    if dims[1] != expected {
        let mut want = dims;
        want[1] = expected;
        return Err(ModelError::shape_mismatch(stage, want, dims));
    }
    Ok(())
}

/// Fails unless `x` has exactly `expected` shape.
pub(crate) fn expect_dims<B: Backend>(
    stage: &str,
    x: &Tensor<B, 5>,
    expected: [usize; 5],
) -> Result<()> {
    let dims = x.dims();
    if dims != expected {
        return Err(ModelError::shape_mismatch(stage, expected, dims));
    }
    Ok(())
}

/// Fails unless an upsampled tensor and its skip connection can be
/// concatenated along channels: batch and spatial extents must agree.
pub(crate) fn expect_fusable<B: Backend>(
    stage: &str,
    upsampled: &Tensor<B, 5>,
    skip: &Tensor<B, 5>,
) -> Result<()> {
    let [b, _, d, h, w] = upsampled.dims();
    let [sb, sc, sd, sh, sw] = skip.dims();
    if b != sb || d != sd || h != sh || w != sw {
        return Err(ModelError::shape_mismatch(
            stage,
            vec![b, sc, d, h, w],
            vec![sb, sc, sd, sh, sw],
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_expect_channels() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 5>::zeros([1, 8, 2, 2, 2], &device);
        assert!(expect_channels("stem", &x, 8).is_ok());

        let err = expect_channels("stem", &x, 4).unwrap_err();
        assert_eq!(
            err,
            ModelError::shape_mismatch("stem", vec![1, 4, 2, 2, 2], vec![1, 8, 2, 2, 2])
        );
    }

    #[test]
    fn test_expect_fusable_ignores_channels() {
        let device = Default::default();
        let up = Tensor::<TestBackend, 5>::zeros([2, 16, 4, 4, 4], &device);
        let skip = Tensor::<TestBackend, 5>::zeros([2, 8, 4, 4, 4], &device);
        assert!(expect_fusable("decoder", &up, &skip).is_ok());

        let skip = Tensor::<TestBackend, 5>::zeros([2, 8, 3, 4, 4], &device);
        assert!(matches!(
            expect_fusable("decoder", &up, &skip),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }
}
