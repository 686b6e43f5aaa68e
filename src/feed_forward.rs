use std::sync::Arc;

use ndarray::Array3;

use crate::activations::Activation;
use crate::dropout::Dropout;
use crate::errors::Result;
use crate::layer::{Layer, ParamVisitor, ParamVisitorMut, join};
use crate::linear::Linear;
use crate::masker::{ActivationMasker, apply_masker};
use crate::model_config::ViTConfig;

/// Position-wise feed-forward block: `H -> mlp_dim -> H`
#[derive(Clone, Debug)]
pub struct Mlp {
    pub fc1: Linear,
    pub fc2: Linear,
    activation: Activation,
    dropout: Dropout,
}

impl Mlp {
    pub fn new(config: &ViTConfig) -> Result<Self> {
        Ok(Self {
            // Xavier-uniform weights, biases ~ N(0, 1e-6)
            fc1: Linear::xavier(config.hidden_size, config.transformer.mlp_dim),
            fc2: Linear::xavier(config.transformer.mlp_dim, config.hidden_size),
            activation: Activation::Gelu,
            dropout: Dropout::new(config.transformer.dropout_rate)?,
        })
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// fc1 -> act -> [hook] -> dropout -> fc2 -> dropout
    pub fn forward_with_hook(
        &mut self,
        input: &Array3<f32>,
        hook: Option<&dyn ActivationMasker>,
    ) -> Result<Array3<f32>> {
        let mut hidden = self.activation.apply(self.fc1.forward(input)?);
        if let Some(masker) = hook {
            hidden = apply_masker(masker, hidden, "mlp activations")?;
        }
        let hidden = self.dropout.forward(hidden);
        let output = self.fc2.forward(&hidden)?;
        Ok(self.dropout.forward(output))
    }

    pub fn parameters(&self) -> usize {
        self.fc1.parameters() + self.fc2.parameters()
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }

    pub fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        self.fc1.visit_parameters(&join(prefix, "fc1"), visitor);
        self.fc2.visit_parameters(&join(prefix, "fc2"), visitor);
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        self.fc1.visit_parameters_mut(&join(prefix, "fc1"), visitor);
        self.fc2.visit_parameters_mut(&join(prefix, "fc2"), visitor);
    }
}

impl Layer for Mlp {
    fn layer_type(&self) -> &str {
        "Mlp"
    }

    fn forward(&mut self, input: &Array3<f32>) -> Result<Array3<f32>> {
        self.forward_with_hook(input, None)
    }

    fn parameters(&self) -> usize {
        Mlp::parameters(self)
    }

    fn set_training(&mut self, training: bool) {
        Mlp::set_training(self, training);
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        Mlp::visit_parameters(self, prefix, visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        Mlp::visit_parameters_mut(self, prefix, visitor);
    }
}

/// MLP whose post-activation hidden units pass through an activation masker
#[derive(Clone, Debug)]
pub struct PrunedMlp {
    inner: Mlp,
    masker: Arc<dyn ActivationMasker>,
}

impl PrunedMlp {
    pub fn new(config: &ViTConfig, masker: Arc<dyn ActivationMasker>) -> Result<Self> {
        Ok(Self {
            inner: Mlp::new(config)?,
            masker,
        })
    }

    pub fn inner(&self) -> &Mlp {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut Mlp {
        &mut self.inner
    }

    pub fn masker(&self) -> &dyn ActivationMasker {
        self.masker.as_ref()
    }
}

impl Layer for PrunedMlp {
    fn layer_type(&self) -> &str {
        "PrunedMlp"
    }

    fn forward(&mut self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let masker = Arc::clone(&self.masker);
        self.inner.forward_with_hook(input, Some(masker.as_ref()))
    }

    fn parameters(&self) -> usize {
        self.inner.parameters()
    }

    fn set_training(&mut self, training: bool) {
        self.inner.set_training(training);
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        self.inner.visit_parameters(prefix, visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        self.inner.visit_parameters_mut(prefix, visitor);
    }
}
