use ndarray::{Array1, Array2, Array3, ArrayView2};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::errors::{ModelError, Result};
use crate::layer::{ParamVisitor, ParamVisitorMut, join};

/// Dense projection `y = x · Wᵀ + b`.
///
/// `weight` is stored `[out_features, in_features]`; checkpoint kernels arrive
/// as `[in, out]` and are transposed on import.
#[derive(Clone, Debug)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    /// Default initialization: weights and biases from U(-1/√fan_in, 1/√fan_in)
    pub fn new(in_features: usize, out_features: usize) -> Self {
        let mut rng = rand::rng();
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();

        Linear {
            weight: Array2::from_shape_fn((out_features, in_features), |_| {
                rng.random_range(-bound..bound)
            }),
            bias: Array1::from_shape_fn(out_features, |_| rng.random_range(-bound..bound)),
        }
    }

    /// Xavier-uniform weights with near-zero normal biases (std 1e-6)
    pub fn xavier(in_features: usize, out_features: usize) -> Self {
        let mut rng = rand::rng();
        let a = (6.0 / (in_features + out_features).max(1) as f32).sqrt();

        Linear {
            weight: Array2::from_shape_fn((out_features, in_features), |_| {
                rng.random_range(-a..a)
            }),
            bias: Array1::from_shape_fn(out_features, |_| {
                let z: f32 = rng.sample(StandardNormal);
                z * 1e-6
            }),
        }
    }

    pub fn zeros(in_features: usize, out_features: usize) -> Self {
        Linear {
            weight: Array2::zeros((out_features, in_features)),
            bias: Array1::zeros(out_features),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Project a `[rows, in]` matrix
    pub fn forward_2d(&self, input: &ArrayView2<f32>) -> Result<Array2<f32>> {
        if input.ncols() != self.in_features() {
            return Err(ModelError::shape_mismatch(
                "linear input features",
                self.in_features(),
                input.ncols(),
            ));
        }
        Ok(input.dot(&self.weight.t()) + &self.bias)
    }

    /// Project every token of a `[B, T, in]` batch
    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let (batch, tokens, features) = input.dim();
        let flat = input.to_shape((batch * tokens, features))?;
        let out = self.forward_2d(&flat.view())?;
        Ok(out.into_shape_with_order((batch, tokens, self.out_features()))?)
    }

    /// Overwrite both parameters, keeping the layer's shape
    pub fn set_parameters(&mut self, weight: Array2<f32>, bias: Array1<f32>) -> Result<()> {
        if weight.dim() != self.weight.dim() {
            return Err(ModelError::shape_mismatch(
                "linear weight",
                self.weight.dim(),
                weight.dim(),
            ));
        }
        if bias.len() != self.bias.len() {
            return Err(ModelError::shape_mismatch(
                "linear bias",
                self.bias.len(),
                bias.len(),
            ));
        }
        self.weight = weight;
        self.bias = bias;
        Ok(())
    }

    pub fn parameters(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    pub fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        visitor(&join(prefix, "weight"), self.weight.view().into_dyn());
        visitor(&join(prefix, "bias"), self.bias.view().into_dyn());
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        visitor(&join(prefix, "weight"), self.weight.view_mut().into_dyn());
        visitor(&join(prefix, "bias"), self.bias.view_mut().into_dyn());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_linear_forward_matches_manual() {
        let mut linear = Linear::zeros(2, 3);
        linear
            .set_parameters(
                array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]],
                array![0.5, -0.5, 0.0],
            )
            .unwrap();

        let input = Array3::from_shape_vec((1, 2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = linear.forward(&input).unwrap();

        assert_eq!(out.dim(), (1, 2, 3));
        assert_eq!(out[[0, 0, 0]], 1.5);
        assert_eq!(out[[0, 0, 1]], 1.5);
        assert_eq!(out[[0, 1, 2]], 7.0);
    }

    #[test]
    fn test_xavier_bounds() {
        let linear = Linear::xavier(16, 48);
        let a = (6.0f32 / 64.0).sqrt();
        assert!(linear.weight.iter().all(|w| w.abs() <= a));
        assert!(linear.bias.iter().all(|b| b.abs() < 1e-4));
    }

    #[test]
    fn test_feature_mismatch_is_error() {
        let linear = Linear::new(4, 2);
        let input = Array3::zeros((1, 3, 5));
        assert!(matches!(
            linear.forward(&input),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }
}
