use ndarray::{Array1, Array2, Array3, Array4, ArrayView2, Axis, s, stack};
use rand::Rng;
use rayon::prelude::*;

use crate::errors::{ModelError, Result};
use crate::layer::{ParamVisitor, ParamVisitorMut, join};

/// Non-overlapping patch projection: a convolution whose stride equals its
/// kernel, producing one `hidden`-sized token per patch in row-major order.
#[derive(Clone, Debug)]
pub struct PatchEmbedding {
    /// `[hidden, in_channels, patch_h, patch_w]`
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
}

impl PatchEmbedding {
    pub fn new(in_channels: usize, hidden_size: usize, patch_size: (usize, usize)) -> Self {
        let mut rng = rand::rng();
        let fan_in = (in_channels * patch_size.0 * patch_size.1).max(1);
        let bound = 1.0 / (fan_in as f32).sqrt();

        PatchEmbedding {
            weight: Array4::from_shape_fn(
                (hidden_size, in_channels, patch_size.0, patch_size.1),
                |_| rng.random_range(-bound..bound),
            ),
            bias: Array1::from_shape_fn(hidden_size, |_| rng.random_range(-bound..bound)),
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.weight.dim().0
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn patch_size(&self) -> (usize, usize) {
        let (_, _, ph, pw) = self.weight.dim();
        (ph, pw)
    }

    /// Number of patches along each axis for an input of `size`
    pub fn grid_for(&self, size: (usize, usize)) -> Result<(usize, usize)> {
        let (ph, pw) = self.patch_size();
        if size.0 % ph != 0 || size.1 % pw != 0 {
            return Err(ModelError::shape_mismatch(
                "image size divisible by patch size",
                (ph, pw),
                size,
            ));
        }
        Ok((size.0 / ph, size.1 / pw))
    }

    /// `[B, C, H, W]` -> `[B, n_patches, hidden]`
    pub fn forward(&self, images: &Array4<f32>) -> Result<Array3<f32>> {
        let (batch, channels, height, width) = images.dim();
        if channels != self.in_channels() {
            return Err(ModelError::shape_mismatch(
                "patch embedding input channels",
                self.in_channels(),
                channels,
            ));
        }
        let (gh, gw) = self.grid_for((height, width))?;
        let (ph, pw) = self.patch_size();
        let patch_len = channels * ph * pw;
        let kernel = self.weight.to_shape((self.hidden_size(), patch_len))?;

        let tokens: Vec<Array2<f32>> = (0..batch)
            .into_par_iter()
            .map(|b| {
                let image = images.index_axis(Axis(0), b);
                let mut patches = Array2::<f32>::zeros((gh * gw, patch_len));
                for (n, mut row) in patches.axis_iter_mut(Axis(0)).enumerate() {
                    let (i, j) = (n / gw, n % gw);
                    let patch = image.slice(s![.., i * ph..(i + 1) * ph, j * pw..(j + 1) * pw]);
                    row.iter_mut().zip(patch.iter()).for_each(|(dst, &src)| *dst = src);
                }
                patches.dot(&kernel.t()) + &self.bias
            })
            .collect();

        let views: Vec<ArrayView2<f32>> = tokens.iter().map(|t| t.view()).collect();
        if views.is_empty() {
            return Ok(Array3::zeros((0, gh * gw, self.hidden_size())));
        }
        Ok(stack(Axis(0), &views)?)
    }

    pub fn set_parameters(&mut self, weight: Array4<f32>, bias: Array1<f32>) -> Result<()> {
        if weight.dim() != self.weight.dim() || bias.len() != self.bias.len() {
            return Err(ModelError::shape_mismatch(
                "patch embedding parameters",
                (self.weight.dim(), self.bias.len()),
                (weight.dim(), bias.len()),
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
