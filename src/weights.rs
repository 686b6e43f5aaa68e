use std::collections::HashMap;
use std::fs;
use std::path::Path;

use ndarray::{Array, Array1, Array2, Array4, ArrayD, Dimension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{ModelError, Result};
use crate::linear::Linear;

pub const ATTENTION_Q: &str = "MultiHeadDotProductAttention_1/query";
pub const ATTENTION_K: &str = "MultiHeadDotProductAttention_1/key";
pub const ATTENTION_V: &str = "MultiHeadDotProductAttention_1/value";
pub const ATTENTION_OUT: &str = "MultiHeadDotProductAttention_1/out";
pub const FC_0: &str = "MlpBlock_3/Dense_0";
pub const FC_1: &str = "MlpBlock_3/Dense_1";
pub const ATTENTION_NORM: &str = "LayerNorm_0";
pub const MLP_NORM: &str = "LayerNorm_2";

pub const ENCODER_NORM: &str = "Transformer/encoder_norm";
pub const POSITION_EMBEDDING: &str = "Transformer/posembed_input/pos_embedding";
pub const PATCH_EMBEDDING: &str = "embedding";
pub const CLASS_TOKEN: &str = "cls";
pub const HEAD: &str = "head";

/// Key prefix of encoder block `index`
pub fn block_root(index: usize) -> String {
    format!("Transformer/encoderblock_{}", index)
}

/// Join checkpoint path segments with `/`
pub fn key(parts: &[&str]) -> String {
    parts.join("/")
}

/// Pretrained checkpoint: slash-delimited keys mapping to dense arrays.
///
/// Kernels follow the checkpoint conventions: dense kernels are `[in, out]`
/// (attention kernels may carry the head split, e.g. `[hidden, heads,
/// head_size]`), convolution kernels are `[kh, kw, in, out]`. The typed
/// getters convert to the in-memory layout and reject any array whose stored
/// shape is not one of the accepted layouts.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct WeightBundle {
    arrays: HashMap<String, ArrayD<f32>>,
}

impl WeightBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<D: Dimension>(&mut self, key: impl Into<String>, array: Array<f32, D>) {
        self.arrays.insert(key.into(), array.into_dyn());
    }

    pub fn get(&self, key: &str) -> Result<&ArrayD<f32>> {
        self.arrays.get(key).ok_or_else(|| ModelError::MissingWeight {
            key: key.to_string(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.arrays.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.arrays.keys().map(String::as_str)
    }

    /// The array at `key`, which must have exactly one of the `accepted` shapes
    fn checked(&self, key: &str, accepted: &[&[usize]]) -> Result<&ArrayD<f32>> {
        let array = self.get(key)?;
        if !accepted.iter().any(|shape| array.shape() == *shape) {
            let expected = match accepted {
                [only] => format!("{:?}", only),
                _ => format!("one of {:?}", accepted),
            };
            return Err(ModelError::shape_mismatch(key, expected, array.shape()));
        }
        Ok(array)
    }

    /// A vector stored with exactly `len` elements in one dimension
    pub fn vector(&self, key: &str, len: usize) -> Result<Array1<f32>> {
        let array = self.checked(key, &[&[len]])?;
        Ok(Array1::from_iter(array.iter().copied()))
    }

    /// A `[1, 1, dim]` or `[dim]` token vector
    pub fn token(&self, key: &str, dim: usize) -> Result<Array1<f32>> {
        let array = self.checked(key, &[&[1, 1, dim], &[dim]])?;
        Ok(Array1::from_iter(array.iter().copied()))
    }

    /// A matrix stored exactly `[rows, cols]`
    pub fn matrix(&self, key: &str, rows: usize, cols: usize) -> Result<Array2<f32>> {
        let array = self.checked(key, &[&[rows, cols]])?;
        Ok(array.to_shape((rows, cols))?.to_owned())
    }

    /// A `[1, tokens, dim]` or `[tokens, dim]` table; the token count is
    /// taken from the stored shape once the last axis matches `dim`
    pub fn table(&self, key: &str, dim: usize) -> Result<Array2<f32>> {
        let array = self.get(key)?;
        let tokens = match array.shape() {
            &[1, tokens, d] | &[tokens, d] if d == dim && tokens > 0 => tokens,
            other => {
                return Err(ModelError::shape_mismatch(
                    key,
                    format!("[1, tokens, {}] or [tokens, {}]", dim, dim),
                    other,
                ));
            }
        };
        Ok(array.to_shape((tokens, dim))?.to_owned())
    }

    /// A dense kernel stored `[in, out]`, returned as an `[out, in]` weight
    pub fn dense_kernel(&self, key: &str, in_features: usize, out_features: usize) -> Result<Array2<f32>> {
        let kernel = self.matrix(key, in_features, out_features)?;
        Ok(kernel.t().to_owned())
    }

    /// `{root}/kernel` and `{root}/bias` as a `(weight, bias)` pair
    pub fn dense(&self, root: &str, in_features: usize, out_features: usize) -> Result<(Array2<f32>, Array1<f32>)> {
        Ok((
            self.dense_kernel(&key(&[root, "kernel"]), in_features, out_features)?,
            self.vector(&key(&[root, "bias"]), out_features)?,
        ))
    }

    /// A query, key or value projection: kernel `[hidden, hidden]` or
    /// `[hidden, heads, head_size]`, bias `[hidden]` or `[heads, head_size]`
    pub fn attention_projection(
        &self,
        root: &str,
        heads: usize,
        head_size: usize,
    ) -> Result<(Array2<f32>, Array1<f32>)> {
        let hidden = heads * head_size;
        let kernel = self.checked(
            &key(&[root, "kernel"]),
            &[&[hidden, hidden], &[hidden, heads, head_size]],
        )?;
        let bias = self.checked(&key(&[root, "bias"]), &[&[hidden], &[heads, head_size]])?;
        Ok((
            kernel.to_shape((hidden, hidden))?.t().to_owned(),
            Array1::from_iter(bias.iter().copied()),
        ))
    }

    /// The attention output projection: kernel `[hidden, hidden]` or
    /// `[heads, head_size, hidden]`, bias `[hidden]`
    pub fn attention_output(
        &self,
        root: &str,
        heads: usize,
        head_size: usize,
    ) -> Result<(Array2<f32>, Array1<f32>)> {
        let hidden = heads * head_size;
        let kernel = self.checked(
            &key(&[root, "kernel"]),
            &[&[hidden, hidden], &[heads, head_size, hidden]],
        )?;
        Ok((
            kernel.to_shape((hidden, hidden))?.t().to_owned(),
            self.vector(&key(&[root, "bias"]), hidden)?,
        ))
    }

    /// `{root}/scale` and `{root}/bias` of a normalization layer
    pub fn norm(&self, root: &str, dim: usize) -> Result<(Array1<f32>, Array1<f32>)> {
        Ok((
            self.vector(&key(&[root, "scale"]), dim)?,
            self.vector(&key(&[root, "bias"]), dim)?,
        ))
    }

    /// A convolution kernel stored HWIO, returned as OIHW
    pub fn conv_kernel(
        &self,
        key: &str,
        out_channels: usize,
        in_channels: usize,
        kernel: (usize, usize),
    ) -> Result<Array4<f32>> {
        let array = self.checked(key, &[&[kernel.0, kernel.1, in_channels, out_channels]])?;
        let hwio = array.to_shape((kernel.0, kernel.1, in_channels, out_channels))?;
        Ok(hwio.permuted_axes([3, 2, 0, 1]).as_standard_layout().into_owned())
    }

    /// Store a dense layer as `{root}/kernel` `[in, out]` and `{root}/bias`
    pub fn insert_dense(&mut self, root: &str, linear: &Linear) {
        self.insert(key(&[root, "kernel"]), linear.weight.t().to_owned());
        self.insert(key(&[root, "bias"]), linear.bias.clone());
    }

    /// Store a normalization layer as `{root}/scale` and `{root}/bias`
    pub fn insert_norm(&mut self, root: &str, gamma: &Array1<f32>, beta: &Array1<f32>) {
        self.insert(key(&[root, "scale"]), gamma.clone());
        self.insert(key(&[root, "bias"]), beta.clone());
    }

    /// Store an OIHW convolution kernel in HWIO order
    pub fn insert_conv_kernel(&mut self, key: impl Into<String>, kernel: &Array4<f32>) {
        let hwio = kernel.view().permuted_axes([2, 3, 1, 0]);
        self.insert(key, hwio.as_standard_layout().into_owned());
    }

    /// Write as JSON (`.json`) or bincode (any other extension)
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = if is_json(path) {
            serde_json::to_vec(self).map_err(|e| ModelError::Serialization {
                source: Box::new(e),
            })?
        } else {
            bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| {
                ModelError::Serialization {
                    source: Box::new(e),
                }
            })?
        };
        fs::write(path, bytes)?;
        info!(path = %path.display(), arrays = self.len(), "weight bundle saved");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let bundle: WeightBundle = if is_json(path) {
            serde_json::from_slice(&bytes).map_err(|e| ModelError::Serialization {
                source: Box::new(e),
            })?
        } else {
            let (bundle, _) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).map_err(
                    |e| ModelError::Serialization {
                        source: Box::new(e),
                    },
                )?;
            bundle
        };
        info!(path = %path.display(), arrays = bundle.len(), "weight bundle loaded");
        Ok(bundle)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, array};

    #[test]
    fn test_dense_kernel_is_transposed() {
        let mut bundle = WeightBundle::new();
        bundle.insert("k", array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let weight = bundle.dense_kernel("k", 2, 3).unwrap();
        assert_eq!(weight, array![[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]]);
    }

    #[test]
    fn test_head_split_kernel_is_flattened() {
        let mut bundle = WeightBundle::new();
        let kernel = Array3::from_shape_fn((4, 2, 2), |(i, h, d)| (i * 4 + h * 2 + d) as f32);
        bundle.insert("q/kernel", kernel);
        bundle.insert("q/bias", Array2::<f32>::zeros((2, 2)));
        let (weight, bias) = bundle.attention_projection("q", 2, 2).unwrap();
        assert_eq!(bias.len(), 4);
        assert_eq!(weight[[3, 1]], 7.0);
        assert_eq!(weight[[0, 2]], 8.0);
    }

    #[test]
    fn test_conv_kernel_permutation() {
        let mut bundle = WeightBundle::new();
        let hwio = Array4::from_shape_fn((2, 2, 3, 5), |(h, w, i, o)| {
            (h * 1000 + w * 100 + i * 10 + o) as f32
        });
        bundle.insert("conv", hwio);
        let oihw = bundle.conv_kernel("conv", 5, 3, (2, 2)).unwrap();
        assert_eq!(oihw.dim(), (5, 3, 2, 2));
        assert_eq!(oihw[[4, 2, 1, 0]], 1024.0);

        let mut exported = WeightBundle::new();
        exported.insert_conv_kernel("conv", &oihw);
        assert_eq!(exported, bundle);
    }

    #[test]
    fn test_missing_and_mismatched() {
        let mut bundle = WeightBundle::new();
        bundle.insert("b", array![1.0, 2.0]);
        assert!(matches!(bundle.get("a"), Err(ModelError::MissingWeight { .. })));
        assert!(matches!(
            bundle.vector("b", 3),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_same_count_wrong_layout_rejected() {
        let mut bundle = WeightBundle::new();
        bundle.insert("k", Array2::<f32>::zeros((3, 2)));
        assert!(bundle.dense_kernel("k", 3, 2).is_ok());
        assert!(matches!(
            bundle.dense_kernel("k", 2, 3),
            Err(ModelError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            bundle.vector("k", 6),
            Err(ModelError::ShapeMismatch { .. })
        ));

        bundle.insert("conv", Array4::<f32>::zeros((5, 3, 2, 2)));
        assert!(bundle.conv_kernel("conv", 5, 3, (2, 2)).is_err());

        bundle.insert("pos", Array3::<f32>::zeros((1, 5, 4)));
        assert_eq!(bundle.table("pos", 4).unwrap().dim(), (5, 4));
        assert!(matches!(
            bundle.table("pos", 2),
            Err(ModelError::ShapeMismatch { .. })
        ));
        bundle.insert("pos", Array2::<f32>::zeros((5, 4)));
        assert_eq!(bundle.table("pos", 4).unwrap().dim(), (5, 4));

        // the head split belongs to the input axis for q/k/v and the output axis for out
        bundle.insert("a/kernel", Array3::<f32>::zeros((2, 2, 4)));
        bundle.insert("a/bias", Array1::<f32>::zeros(4));
        assert!(bundle.attention_output("a", 2, 2).is_ok());
        assert!(bundle.attention_projection("a", 2, 2).is_err());
    }
}
