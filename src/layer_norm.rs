use ndarray::{Array1, Array3, Axis, Zip};

use crate::errors::{ModelError, Result};
use crate::layer::{ParamVisitor, ParamVisitorMut, join};

/// Layer Normalization over the hidden axis
///
/// ```text
/// x̂ = (x - mean(x)) / √(var(x) + ε)
/// y = x̂ ⊙ γ + β
/// ```
///
/// `var` is the biased (population) variance. ε defaults to 1e-6, the value
/// the pretrained checkpoints were trained with.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    epsilon: f32,
    /// Learnable scale γ (shape: [hidden])
    pub gamma: Array1<f32>,
    /// Learnable shift β (shape: [hidden])
    pub beta: Array1<f32>,
}

impl LayerNorm {
    pub fn new(embedding_dim: usize) -> Self {
        Self::with_epsilon(embedding_dim, 1e-6)
    }

    pub fn with_epsilon(embedding_dim: usize, epsilon: f32) -> Self {
        LayerNorm {
            epsilon,
            gamma: Array1::ones(embedding_dim),
            beta: Array1::zeros(embedding_dim),
        }
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn dim(&self) -> usize {
        self.gamma.len()
    }

    /// The standardized input x̂, before the affine transform
    pub fn standardize(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        if input.len_of(Axis(2)) != self.dim() {
            return Err(ModelError::shape_mismatch(
                "layer norm hidden size",
                self.dim(),
                input.len_of(Axis(2)),
            ));
        }

        let mut normalized = input.clone();
        let epsilon = self.epsilon;
        for mut row in normalized.lanes_mut(Axis(2)) {
            let n = row.len() as f32;
            let mean = row.sum() / n;
            let var = row.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / n;
            let inv_std = 1.0 / (var + epsilon).sqrt();
            row.mapv_inplace(|x| (x - mean) * inv_std);
        }
        Ok(normalized)
    }

    /// y = x̂ ⊙ γ + β
    pub fn affine(&self, mut normalized: Array3<f32>) -> Array3<f32> {
        for mut row in normalized.lanes_mut(Axis(2)) {
            Zip::from(&mut row)
                .and(&self.gamma)
                .and(&self.beta)
                .for_each(|x, &g, &b| *x = *x * g + b);
        }
        normalized
    }

    pub fn normalize(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        Ok(self.affine(self.standardize(input)?))
    }

    pub fn set_parameters(&mut self, gamma: Array1<f32>, beta: Array1<f32>) -> Result<()> {
        if gamma.len() != self.dim() || beta.len() != self.dim() {
            return Err(ModelError::shape_mismatch(
                "layer norm parameters",
                (self.dim(), self.dim()),
                (gamma.len(), beta.len()),
            ));
        }
        self.gamma = gamma;
        self.beta = beta;
        Ok(())
    }

    pub fn parameters(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }

    pub fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        visitor(&join(prefix, "weight"), self.gamma.view().into_dyn());
        visitor(&join(prefix, "bias"), self.beta.view().into_dyn());
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        visitor(&join(prefix, "weight"), self.gamma.view_mut().into_dyn());
        visitor(&join(prefix, "bias"), self.beta.view_mut().into_dyn());
    }
}
