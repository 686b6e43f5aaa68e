use std::collections::BTreeMap;

use ndarray::{Array2, Array3, Array4, ArrayD, Axis, s};
use tracing::{info, instrument};

use crate::embeddings::{Backbone, Embeddings};
use crate::encoder::Encoder;
use crate::errors::{ModelError, Result};
use crate::layer::{Layer, ParamVisitor, ParamVisitorMut, join};
use crate::linear::Linear;
use crate::model_config::{Classifier, ViTConfig};
use crate::transformer::BlockOptions;
use crate::weights::{HEAD, WeightBundle};

/// What [`VisionTransformer::forward`] produced
#[derive(Debug, Clone, PartialEq)]
pub enum VitOutput {
    /// `[B, num_classes]`
    Logits(Array2<f32>),
    /// Mean cross-entropy over the batch
    Loss(f32),
    /// Encoded token sequence `[B, T, hidden]`
    Features(Array3<f32>),
}

impl VitOutput {
    pub fn logits(self) -> Option<Array2<f32>> {
        match self {
            VitOutput::Logits(logits) => Some(logits),
            _ => None,
        }
    }

    pub fn loss(self) -> Option<f32> {
        match self {
            VitOutput::Loss(loss) => Some(loss),
            _ => None,
        }
    }

    pub fn features(self) -> Option<Array3<f32>> {
        match self {
            VitOutput::Features(features) => Some(features),
            _ => None,
        }
    }
}

/// Embeddings followed by the encoder stack
#[derive(Debug)]
pub struct Transformer {
    pub embeddings: Embeddings,
    pub encoder: Encoder,
}

impl Transformer {
    pub fn new(config: &ViTConfig, image_size: (usize, usize), options: &BlockOptions) -> Result<Self> {
        let embeddings = Embeddings::new(config, image_size)?;
        let encoder = Encoder::new(config, options, embeddings.n_tokens())?;
        Ok(Self { embeddings, encoder })
    }

    pub fn hybrid(
        config: &ViTConfig,
        image_size: (usize, usize),
        options: &BlockOptions,
        backbone: Box<dyn Backbone>,
    ) -> Result<Self> {
        let embeddings = Embeddings::hybrid(config, image_size, backbone)?;
        let encoder = Encoder::new(config, options, embeddings.n_tokens())?;
        Ok(Self { embeddings, encoder })
    }

    pub fn forward(&mut self, images: &Array4<f32>) -> Result<Array3<f32>> {
        let tokens = self.embeddings.forward(images)?;
        self.encoder.forward(&tokens)
    }

    pub fn set_training(&mut self, training: bool) {
        self.embeddings.set_training(training);
        self.encoder.set_training(training);
    }

    pub fn parameters(&self) -> usize {
        self.embeddings.parameters() + self.encoder.parameters()
    }
}

/// Vision Transformer image classifier with pruning hooks.
///
/// Built once from a [`ViTConfig`] and [`BlockOptions`]; the block structure
/// never changes afterwards, only parameter values do. All modules start in
/// inference mode.
#[derive(Debug)]
pub struct VisionTransformer {
    config: ViTConfig,
    num_classes: usize,
    zero_head: bool,
    training: bool,
    transformer: Transformer,
    pub head: Linear,
}

impl VisionTransformer {
    pub fn new(
        config: &ViTConfig,
        image_size: usize,
        num_classes: usize,
        options: &BlockOptions,
    ) -> Result<Self> {
        let config = Self::prepare(config, options)?;
        let transformer = Transformer::new(&config, (image_size, image_size), options)?;
        Ok(Self::assemble(config, num_classes, transformer))
    }

    /// A hybrid model tokenizing the feature map of `backbone`
    pub fn hybrid(
        config: &ViTConfig,
        image_size: usize,
        num_classes: usize,
        options: &BlockOptions,
        backbone: Box<dyn Backbone>,
    ) -> Result<Self> {
        let config = Self::prepare(config, options)?;
        let transformer =
            Transformer::hybrid(&config, (image_size, image_size), options, backbone)?;
        Ok(Self::assemble(config, num_classes, transformer))
    }

    fn prepare(config: &ViTConfig, options: &BlockOptions) -> Result<ViTConfig> {
        config.validate()?;
        Ok(config.clone().with_precision(options.quantize, options.half))
    }

    fn assemble(config: ViTConfig, num_classes: usize, transformer: Transformer) -> Self {
        let model = Self {
            head: Linear::new(config.hidden_size, num_classes),
            config,
            num_classes,
            zero_head: false,
            training: false,
            transformer,
        };
        info!(
            name = model.config.name.as_deref().unwrap_or("custom"),
            layers = model.config.transformer.num_layers,
            tokens = model.n_tokens(),
            params = model.parameters(),
            "vision transformer built"
        );
        model
    }

    /// Zero the classification head on import instead of reading `head/*`
    pub fn with_zero_head(mut self, zero_head: bool) -> Self {
        self.zero_head = zero_head;
        self
    }

    pub fn config(&self) -> &ViTConfig {
        &self.config
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Sequence length seen by every block, class token included
    pub fn n_tokens(&self) -> usize {
        self.transformer.embeddings.n_tokens()
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    pub fn transformer_mut(&mut self) -> &mut Transformer {
        &mut self.transformer
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn train(&mut self) {
        self.set_training(true);
    }

    pub fn eval(&mut self) {
        self.set_training(false);
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        self.transformer.set_training(training);
    }

    pub fn parameters(&self) -> usize {
        self.transformer.parameters() + self.head.parameters()
    }

    /// Attention probabilities recorded by each block during the last forward
    pub fn attention_maps(&self) -> Vec<&Array4<f32>> {
        self.transformer.encoder.attention_maps()
    }

    /// Classify `images` (`[B, 3, H, W]`).
    ///
    /// With `features_only` the encoded tokens are returned and the head is
    /// skipped. Otherwise logits are returned, or the mean cross-entropy when
    /// `labels` are given.
    #[instrument(skip(self, images, labels), fields(batch = images.dim().0))]
    pub fn forward(
        &mut self,
        images: &Array4<f32>,
        labels: Option<&[usize]>,
        features_only: bool,
    ) -> Result<VitOutput> {
        let encoded = self.transformer.forward(images)?;
        if features_only {
            return Ok(VitOutput::Features(encoded));
        }

        let pooled = match self.config.classifier {
            Classifier::Token => encoded.slice(s![.., 0, ..]).to_owned(),
            Classifier::Gap => encoded.mean_axis(Axis(1)).ok_or_else(|| {
                ModelError::shape_mismatch("pooled tokens", "at least one token", encoded.dim())
            })?,
        };
        let logits = self.head.forward_2d(&pooled.view())?;

        match labels {
            Some(labels) => Ok(VitOutput::Loss(cross_entropy(&logits, labels)?)),
            None => Ok(VitOutput::Logits(logits)),
        }
    }

    /// Shorthand for `forward(images, None, false)`
    pub fn logits(&mut self, images: &Array4<f32>) -> Result<Array2<f32>> {
        let output = self.forward(images, None, false)?;
        output
            .logits()
            .ok_or_else(|| ModelError::InvalidArgument {
                message: "forward did not produce logits".to_string(),
            })
    }

    /// Import a pretrained checkpoint.
    ///
    /// Every array is read, converted and validated before anything is
    /// written; a position embedding of a different grid size is resized.
    /// A hybrid backbone is loaded last, by the backbone itself.
    #[instrument(skip(self, weights), fields(arrays = weights.len()))]
    pub fn load_from(&mut self, weights: &WeightBundle) -> Result<()> {
        let head = if self.zero_head {
            None
        } else {
            Some(weights.dense(HEAD, self.config.hidden_size, self.num_classes)?)
        };
        let embeddings = self.transformer.embeddings.read_weights(weights)?;
        let encoder = self.transformer.encoder.read_weights(weights)?;

        match head {
            Some((weight, bias)) => self.head.set_parameters(weight, bias)?,
            None => {
                self.head.weight.fill(0.0);
                self.head.bias.fill(0.0);
            }
        }
        self.transformer.embeddings.apply_weights(embeddings)?;
        self.transformer.encoder.apply_weights(encoder)?;
        self.transformer.embeddings.load_backbone(weights)?;

        info!(
            blocks = self.transformer.encoder.layers().len(),
            zero_head = self.zero_head,
            "pretrained weights imported"
        );
        Ok(())
    }

    /// Export every transformer parameter in checkpoint layout
    pub fn to_weight_bundle(&self) -> WeightBundle {
        let mut weights = WeightBundle::new();
        weights.insert_dense(HEAD, &self.head);
        self.transformer.embeddings.export_into(&mut weights);
        self.transformer.encoder.export_into(&mut weights);
        weights
    }

    pub fn visit_parameters(&self, visitor: &mut ParamVisitor<'_>) {
        self.transformer
            .embeddings
            .visit_parameters("transformer.embeddings", visitor);
        self.transformer
            .encoder
            .visit_parameters("transformer.encoder", visitor);
        self.head.visit_parameters("head", visitor);
    }

    /// Hand every named parameter to an external optimizer
    pub fn visit_parameters_mut(&mut self, visitor: &mut ParamVisitorMut<'_>) {
        self.transformer
            .embeddings
            .visit_parameters_mut("transformer.embeddings", visitor);
        self.transformer
            .encoder
            .visit_parameters_mut("transformer.encoder", visitor);
        self.head.visit_parameters_mut("head", visitor);
    }

    /// Owned copy of every parameter keyed by its dotted path
    pub fn state_dict(&self) -> BTreeMap<String, ArrayD<f32>> {
        let mut state = BTreeMap::new();
        self.visit_parameters(&mut |name, value| {
            state.insert(name.to_string(), value.to_owned());
        });
        state
    }

    /// Dotted path of a block parameter, as spelled in [`Self::state_dict`]
    pub fn block_parameter_name(index: usize, name: &str) -> String {
        join("transformer.encoder", &format!("layer.{}.{}", index, name))
    }
}

/// Mean softmax cross-entropy of `logits` `[B, C]` against integer labels
pub fn cross_entropy(logits: &Array2<f32>, labels: &[usize]) -> Result<f32> {
    let (batch, num_classes) = logits.dim();
    if labels.len() != batch {
        return Err(ModelError::shape_mismatch("labels", batch, labels.len()));
    }
    if batch == 0 {
        return Ok(0.0);
    }

    let mut total = 0.0f32;
    for (row, &label) in logits.outer_iter().zip(labels) {
        if label >= num_classes {
            return Err(ModelError::InvalidLabel { label, num_classes });
        }
        let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        let log_sum = row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
        total += log_sum - row[label];
    }
    Ok(total / batch as f32)
}
