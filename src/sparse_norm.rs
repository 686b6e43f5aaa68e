use std::sync::Arc;

use half::f16;
use ndarray::{Array1, Array3};

use crate::errors::Result;
use crate::layer::{ParamVisitor, ParamVisitorMut};
use crate::layer_norm::LayerNorm;
use crate::masker::{ActivationMasker, apply_masker};

/// Elements per quantization block
pub const BLOCK_SIZE: usize = 32;

/// Compact copy of the standardized activation a backward pass would consume
#[derive(Clone, Debug)]
pub enum SavedActivation {
    Full(Array3<f32>),
    Half {
        shape: (usize, usize, usize),
        values: Vec<f16>,
    },
    /// Symmetric 8-bit blocks of [`BLOCK_SIZE`] with one f16 scale each
    Quantized {
        shape: (usize, usize, usize),
        scales: Vec<f16>,
        values: Vec<i8>,
    },
}

impl SavedActivation {
    fn store(activation: Array3<f32>, quantize: bool, half: bool) -> Self {
        let shape = activation.dim();
        if quantize {
            let data: Vec<f32> = activation.iter().copied().collect();
            let mut scales = Vec::with_capacity(data.len().div_ceil(BLOCK_SIZE));
            let mut values = Vec::with_capacity(data.len());
            for block in data.chunks(BLOCK_SIZE) {
                let max_abs = block.iter().map(|x| x.abs()).fold(0.0_f32, f32::max);
                let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
                let inv_scale = 1.0 / scale;
                scales.push(f16::from_f32(scale));
                values.extend(
                    block
                        .iter()
                        .map(|&v| (v * inv_scale).round().clamp(-127.0, 127.0) as i8),
                );
            }
            SavedActivation::Quantized {
                shape,
                scales,
                values,
            }
        } else if half {
            SavedActivation::Half {
                shape,
                values: activation.iter().map(|&v| f16::from_f32(v)).collect(),
            }
        } else {
            SavedActivation::Full(activation)
        }
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        match self {
            SavedActivation::Full(a) => a.dim(),
            SavedActivation::Half { shape, .. } | SavedActivation::Quantized { shape, .. } => {
                *shape
            }
        }
    }

    /// Expand back to f32
    pub fn dequantize(&self) -> Result<Array3<f32>> {
        match self {
            SavedActivation::Full(a) => Ok(a.clone()),
            SavedActivation::Half { shape, values } => Ok(Array3::from_shape_vec(
                *shape,
                values.iter().map(|v| v.to_f32()).collect(),
            )?),
            SavedActivation::Quantized {
                shape,
                scales,
                values,
            } => {
                let data = values
                    .chunks(BLOCK_SIZE)
                    .zip(scales)
                    .flat_map(|(block, scale)| {
                        let scale = scale.to_f32();
                        block.iter().map(move |&q| f32::from(q) * scale)
                    })
                    .collect();
                Ok(Array3::from_shape_vec(*shape, data)?)
            }
        }
    }

    /// Storage footprint in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            SavedActivation::Full(a) => a.len() * 4,
            SavedActivation::Half { values, .. } => values.len() * 2,
            SavedActivation::Quantized { scales, values, .. } => scales.len() * 2 + values.len(),
        }
    }

    /// Fraction of stored entries that are exactly zero
    pub fn sparsity(&self) -> f32 {
        let (zeros, total) = match self {
            SavedActivation::Full(a) => (a.iter().filter(|&&x| x == 0.0).count(), a.len()),
            SavedActivation::Half { values, .. } => (
                values.iter().filter(|v| v.to_f32() == 0.0).count(),
                values.len(),
            ),
            SavedActivation::Quantized { values, .. } => {
                (values.iter().filter(|&&q| q == 0).count(), values.len())
            }
        };
        if total == 0 { 0.0 } else { zeros as f32 / total as f32 }
    }
}

/// Layer normalization whose retained activation is sparsified by a masker
/// and optionally stored in half precision or 8-bit blocks.
///
/// The forward output is exactly that of [`LayerNorm`]; only the saved
/// standardized input differs. Nothing is saved outside training mode.
#[derive(Clone, Debug)]
pub struct SparseLayerNorm {
    norm: LayerNorm,
    masker: Arc<dyn ActivationMasker>,
    quantize: bool,
    half: bool,
    training: bool,
    saved: Option<SavedActivation>,
}

impl SparseLayerNorm {
    pub fn new(
        embedding_dim: usize,
        masker: Arc<dyn ActivationMasker>,
        quantize: bool,
        half: bool,
    ) -> Self {
        Self {
            norm: LayerNorm::new(embedding_dim),
            masker,
            quantize,
            half,
            training: false,
            saved: None,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn normalize(&mut self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let standardized = self.norm.standardize(input)?;
        if !self.training {
            return Ok(self.norm.affine(standardized));
        }
        let retained = apply_masker(
            self.masker.as_ref(),
            standardized.clone(),
            "sparse layer norm activation",
        )?;
        self.saved = Some(SavedActivation::store(retained, self.quantize, self.half));
        Ok(self.norm.affine(standardized))
    }

    /// Activation retained by the last training-mode forward call
    pub fn saved_activation(&self) -> Option<&SavedActivation> {
        self.saved.as_ref()
    }

    pub fn inner(&self) -> &LayerNorm {
        &self.norm
    }

    pub fn set_parameters(&mut self, gamma: Array1<f32>, beta: Array1<f32>) -> Result<()> {
        self.norm.set_parameters(gamma, beta)
    }

    pub fn parameters(&self) -> usize {
        self.norm.parameters()
    }

    pub fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        self.norm.visit_parameters(prefix, visitor);
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        self.norm.visit_parameters_mut(prefix, visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masker::{IdentityMasker, MagnitudeMasker};
    use approx::assert_abs_diff_eq;

    fn sample_input() -> Array3<f32> {
        Array3::from_shape_fn((2, 3, 40), |(b, t, h)| {
            ((b * 7 + t * 3 + h) as f32 * 0.37).sin() * 3.0
        })
    }

    #[test]
    fn test_output_matches_layer_norm() {
        let input = sample_input();
        let mut sparse = SparseLayerNorm::new(40, Arc::new(MagnitudeMasker::new(0.5)), true, false);
        let dense = LayerNorm::new(40);
        assert_eq!(sparse.normalize(&input).unwrap(), dense.normalize(&input).unwrap());
    }

    #[test]
    fn test_eval_mode_saves_nothing() {
        let input = sample_input();
        let mut sparse = SparseLayerNorm::new(40, Arc::new(MagnitudeMasker::new(0.5)), true, false);
        let eval_output = sparse.normalize(&input).unwrap();
        assert!(sparse.saved_activation().is_none());

        sparse.set_training(true);
        assert_eq!(sparse.normalize(&input).unwrap(), eval_output);
        assert!(sparse.saved_activation().is_some());
    }

    #[test]
    fn test_saved_activation_is_masked() {
        let input = sample_input();
        let mut sparse =
            SparseLayerNorm::new(40, Arc::new(MagnitudeMasker::new(0.5)), false, false);
        sparse.set_training(true);
        sparse.normalize(&input).unwrap();

        let saved = sparse.saved_activation().unwrap().dequantize().unwrap();
        assert!(saved.iter().all(|&x| x == 0.0 || x.abs() >= 0.5));
        assert!(sparse.saved_activation().unwrap().sparsity() > 0.0);
    }

    #[test]
    fn test_quantized_storage_round_trip() {
        let input = sample_input();
        let mut sparse = SparseLayerNorm::new(40, Arc::new(IdentityMasker), true, true);
        sparse.set_training(true);
        sparse.normalize(&input).unwrap();

        let saved = sparse.saved_activation().unwrap();
        assert!(matches!(saved, SavedActivation::Quantized { .. }));
        assert!(saved.size_bytes() < input.len() * 4 / 3);

        let restored = saved.dequantize().unwrap();
        let reference = LayerNorm::new(40).standardize(&input).unwrap();
        for (r, e) in restored.iter().zip(reference.iter()) {
            assert_abs_diff_eq!(r, e, epsilon = 0.05);
        }
    }

    #[test]
    fn test_half_storage() {
        let input = sample_input();
        let mut sparse = SparseLayerNorm::new(40, Arc::new(IdentityMasker), false, true);
        sparse.set_training(true);
        sparse.normalize(&input).unwrap();

        let saved = sparse.saved_activation().unwrap();
        assert_eq!(saved.size_bytes(), input.len() * 2);
        assert_eq!(saved.shape(), (2, 3, 40));
    }
}
