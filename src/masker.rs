use std::fmt::Debug;

use ndarray::{Array, ArrayD, Dimension};

use crate::errors::{ModelError, Result};

/// Activation pruning hook.
///
/// Pruned attention, pruned MLP and sparse normalization hand their
/// intermediate activations to a masker, which may zero or sparsify entries.
/// What gets pruned is entirely the masker's decision; callers only require
/// that the shape comes back unchanged.
pub trait ActivationMasker: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn mask(&self, activations: ArrayD<f32>) -> ArrayD<f32>;
}

/// Passes activations through untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMasker;

impl ActivationMasker for IdentityMasker {
    fn name(&self) -> &str {
        "identity"
    }

    fn mask(&self, activations: ArrayD<f32>) -> ArrayD<f32> {
        activations
    }
}

/// Zeroes every activation whose magnitude falls below `threshold`
#[derive(Debug, Clone, Copy)]
pub struct MagnitudeMasker {
    pub threshold: f32,
}

impl MagnitudeMasker {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl ActivationMasker for MagnitudeMasker {
    fn name(&self) -> &str {
        "magnitude"
    }

    fn mask(&self, mut activations: ArrayD<f32>) -> ArrayD<f32> {
        let threshold = self.threshold;
        activations.mapv_inplace(|x| if x.abs() < threshold { 0.0 } else { x });
        activations
    }
}

/// Run `masker` on a typed array and check it kept the shape
pub(crate) fn apply_masker<D: Dimension>(
    masker: &dyn ActivationMasker,
    activations: Array<f32, D>,
    context: &str,
) -> Result<Array<f32, D>> {
    let expected = activations.shape().to_vec();
    let masked = masker.mask(activations.into_dyn());
    if masked.shape() != expected.as_slice() {
        return Err(ModelError::shape_mismatch(
            format!("{} (masker '{}')", context, masker.name()),
            expected,
            masked.shape(),
        ));
    }
    Ok(masked.into_dimensionality::<D>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, IxDyn, array};

    #[derive(Debug)]
    struct Flatten;

    impl ActivationMasker for Flatten {
        fn name(&self) -> &str {
            "flatten"
        }

        fn mask(&self, activations: ArrayD<f32>) -> ArrayD<f32> {
            let n = activations.len();
            activations.into_shape_with_order(IxDyn(&[n])).unwrap()
        }
    }

    #[test]
    fn test_magnitude_masker_zeroes_small_entries() {
        let masked =
            apply_masker(&MagnitudeMasker::new(0.5), array![[0.1, -0.7], [0.49, 2.0]], "test")
                .unwrap();
        assert_eq!(masked, array![[0.0, -0.7], [0.0, 2.0]]);
    }

    #[test]
    fn test_identity_masker() {
        let input = Array2::from_elem((2, 3), 0.25f32);
        assert_eq!(apply_masker(&IdentityMasker, input.clone(), "test").unwrap(), input);
    }

    #[test]
    fn test_shape_change_is_rejected() {
        let result = apply_masker(&Flatten, Array2::<f32>::zeros((2, 2)), "mlp activations");
        assert!(matches!(result, Err(ModelError::ShapeMismatch { .. })));
    }
}
