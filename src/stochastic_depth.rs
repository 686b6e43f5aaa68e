use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::errors::{ModelError, Result};
use crate::layer::{Layer, ParamVisitor, ParamVisitorMut};

/// Randomly skips the wrapped module during training.
///
/// Training: with probability `p` the input is returned unchanged, otherwise
/// the module runs and its output is scaled by `1 - p`. Inference: the module
/// always runs, unscaled. The coin is flipped on every forward call.
#[derive(Clone, Debug)]
pub struct StochasticDepth<M: Layer> {
    module: M,
    p: f32,
    training: bool,
    rng: StdRng,
}

impl<M: Layer> StochasticDepth<M> {
    pub fn new(module: M, p: f32) -> Result<Self> {
        Self::validate(p)?;
        Ok(Self {
            module,
            p,
            training: false,
            rng: StdRng::from_rng(&mut rand::rng()),
        })
    }

    /// Same as [`StochasticDepth::new`] with a reproducible coin
    pub fn with_seed(module: M, p: f32, seed: u64) -> Result<Self> {
        Self::validate(p)?;
        Ok(Self {
            module,
            p,
            training: false,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    fn validate(p: f32) -> Result<()> {
        if p <= 0.0 || p >= 1.0 || p.is_nan() {
            return Err(ModelError::InvalidArgument {
                message: format!("drop probability has to be between 0 and 1, but got {}", p),
            });
        }
        Ok(())
    }

    pub fn drop_probability(&self) -> f32 {
        self.p
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn inner(&self) -> &M {
        &self.module
    }

    pub fn inner_mut(&mut self) -> &mut M {
        &mut self.module
    }
}

impl<M: Layer> Layer for StochasticDepth<M> {
    fn layer_type(&self) -> &str {
        "StochasticDepth"
    }

    fn forward(&mut self, input: &Array3<f32>) -> Result<Array3<f32>> {
        if !self.training {
            return self.module.forward(input);
        }
        if self.rng.random::<f32>() < self.p {
            return Ok(input.clone());
        }
        let output = self.module.forward(input)?;
        Ok(output * (1.0 - self.p))
    }

    fn parameters(&self) -> usize {
        self.module.parameters()
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        self.module.set_training(training);
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        self.module.visit_parameters(prefix, visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        self.module.visit_parameters_mut(prefix, visitor);
    }
}
