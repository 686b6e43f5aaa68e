use ndarray::{Array3, Array4, Axis};
use serde::{Deserialize, Serialize};

use crate::errors::{ModelError, Result};

/// Where a pruning mask enters the attention computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AttentionMaskMode {
    /// No mask is allocated
    #[default]
    Disabled,
    /// Pruned scores are set to -inf, so every row still sums to one
    PreSoftmax,
    /// Pruned probabilities are zeroed after a full softmax. Rows are left
    /// unnormalized unless `renormalize` is set.
    ///
    /// The mask keeps its `true` = keep polarity here too. Masks written for
    /// code that multiplies probabilities by the inverted mask in this mode
    /// must be negated before use.
    PostSoftmax { renormalize: bool },
}

impl AttentionMaskMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, AttentionMaskMode::Disabled)
    }
}

/// Boolean query/key mask of shape `[1, num_heads, n_tokens, n_tokens]`.
///
/// `true` keeps a query/key pair, `false` prunes it. Not trainable; a pruning
/// controller replaces it between training phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionMask {
    mask: Array4<bool>,
}

impl AttentionMask {
    /// Keep everything
    pub fn ones(num_heads: usize, n_tokens: usize) -> Self {
        Self {
            mask: Array4::from_elem((1, num_heads, n_tokens, n_tokens), true),
        }
    }

    pub fn from_array(mask: Array4<bool>) -> Result<Self> {
        let (lead, _, rows, cols) = mask.dim();
        if lead != 1 || rows != cols {
            return Err(ModelError::shape_mismatch(
                "attention mask",
                "[1, heads, n, n]",
                mask.shape(),
            ));
        }
        Ok(Self { mask })
    }

    /// Per-head `[heads, n, n]` keep flags, square by construction
    pub(crate) fn from_head_masks(keep: Array3<bool>) -> Self {
        Self {
            mask: keep.insert_axis(Axis(0)),
        }
    }

    pub fn num_heads(&self) -> usize {
        self.mask.dim().1
    }

    pub fn n_tokens(&self) -> usize {
        self.mask.dim().2
    }

    pub fn shape(&self) -> (usize, usize, usize, usize) {
        self.mask.dim()
    }

    pub fn as_array(&self) -> &Array4<bool> {
        &self.mask
    }

    pub fn is_kept(&self, head: usize, query: usize, key: usize) -> bool {
        self.mask[[0, head, query, key]]
    }

    /// Prune a single query/key pair of one head
    pub fn prune(&mut self, head: usize, query: usize, key: usize) {
        self.mask[[0, head, query, key]] = false;
    }

    /// Fraction of pairs still kept
    pub fn keep_ratio(&self) -> f32 {
        let kept = self.mask.iter().filter(|&&m| m).count();
        kept as f32 / self.mask.len().max(1) as f32
    }

    /// Fail unless the mask fits `num_heads` heads over `n_tokens` tokens
    pub fn check_shape(&self, num_heads: usize, n_tokens: usize) -> Result<()> {
        if self.shape() != (1, num_heads, n_tokens, n_tokens) {
            return Err(ModelError::shape_mismatch(
                "attention mask",
                (1, num_heads, n_tokens, n_tokens),
                self.shape(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ones_keeps_everything() {
        let mask = AttentionMask::ones(2, 3);
        assert_eq!(mask.shape(), (1, 2, 3, 3));
        assert_eq!(mask.keep_ratio(), 1.0);
    }

    #[test]
    fn test_prune_updates_keep_ratio() {
        let mut mask = AttentionMask::ones(1, 2);
        mask.prune(0, 0, 1);
        assert!(!mask.is_kept(0, 0, 1));
        assert_eq!(mask.keep_ratio(), 0.75);
    }

    #[test]
    fn test_shape_validation() {
        assert!(AttentionMask::from_array(Array4::from_elem((2, 1, 3, 3), true)).is_err());
        assert!(AttentionMask::from_array(Array4::from_elem((1, 1, 3, 4), true)).is_err());

        let mask = AttentionMask::ones(4, 5);
        assert!(mask.check_shape(4, 5).is_ok());
        assert!(matches!(
            mask.check_shape(4, 6),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }
}
