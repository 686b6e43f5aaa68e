use ndarray::{Array3, Array4, Axis, Zip};

use crate::attention_mask::AttentionMask;
use crate::errors::{ModelError, Result};

/// Running per-position mean and variance of attention probabilities.
///
/// Each batch sample of a `[B, heads, T, T]` update counts as one observation
/// (Welford's algorithm, population variance). A pruning controller reads the
/// statistics to decide which query/key pairs to drop.
#[derive(Clone, Debug)]
pub struct ActivationStats {
    count: usize,
    mean: Array3<f32>,
    m2: Array3<f32>,
}

impl ActivationStats {
    pub fn new(num_heads: usize, n_tokens: usize) -> Self {
        Self {
            count: 0,
            mean: Array3::zeros((num_heads, n_tokens, n_tokens)),
            m2: Array3::zeros((num_heads, n_tokens, n_tokens)),
        }
    }

    /// Fold one batch of attention probabilities into the statistics
    pub fn update(&mut self, probs: &Array4<f32>) -> Result<()> {
        let (_, heads, rows, cols) = probs.dim();
        if (heads, rows, cols) != self.mean.dim() {
            return Err(ModelError::shape_mismatch(
                "activation statistics update",
                self.mean.dim(),
                (heads, rows, cols),
            ));
        }

        for sample in probs.axis_iter(Axis(0)) {
            self.count += 1;
            let n = self.count as f32;
            Zip::from(&mut self.mean)
                .and(&mut self.m2)
                .and(&sample)
                .for_each(|mean, m2, &x| {
                    let delta = x - *mean;
                    *mean += delta / n;
                    *m2 += delta * (x - *mean);
                });
        }
        Ok(())
    }

    /// Number of samples observed since the last reset
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> &Array3<f32> {
        &self.mean
    }

    pub fn variance(&self) -> Array3<f32> {
        if self.count == 0 {
            return Array3::zeros(self.m2.dim());
        }
        &self.m2 / self.count as f32
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.mean.fill(0.0);
        self.m2.fill(0.0);
    }

    /// Keep every pair whose running mean is at least `threshold`
    pub fn mask_below(&self, threshold: f32) -> AttentionMask {
        AttentionMask::from_head_masks(self.mean.mapv(|m| m >= threshold))
    }
}
