use ndarray::{Array1, Array3, Array4};
use tracing::debug;

use crate::errors::Result;
use crate::layer::{Layer, ParamVisitor, ParamVisitorMut, join};
use crate::layer_norm::LayerNorm;
use crate::model_config::ViTConfig;
use crate::transformer::{Block, BlockOptions, BlockWeights};
use crate::weights::{ENCODER_NORM, WeightBundle};

/// Checkpoint values for a whole encoder
#[derive(Clone, Debug)]
pub struct EncoderWeights {
    blocks: Vec<BlockWeights>,
    norm: (Array1<f32>, Array1<f32>),
}

/// `num_layers` independently initialized blocks followed by a final LayerNorm
#[derive(Clone, Debug)]
pub struct Encoder {
    layers: Vec<Block>,
    encoder_norm: LayerNorm,
}

impl Encoder {
    pub fn new(config: &ViTConfig, options: &BlockOptions, n_tokens: usize) -> Result<Self> {
        config.validate()?;
        let layers = (0..config.transformer.num_layers)
            .map(|_| Block::new(config, options, n_tokens))
            .collect::<Result<Vec<_>>>()?;
        debug!(num_layers = layers.len(), n_tokens, "encoder built");

        Ok(Self {
            layers,
            encoder_norm: LayerNorm::new(config.hidden_size),
        })
    }

    pub fn layers(&self) -> &[Block] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Block] {
        &mut self.layers
    }

    pub fn encoder_norm(&self) -> &LayerNorm {
        &self.encoder_norm
    }

    /// Attention probabilities recorded by each block during the last forward
    pub fn attention_maps(&self) -> Vec<&Array4<f32>> {
        self.layers
            .iter()
            .filter_map(|block| block.attention().attention_probs())
            .collect()
    }

    /// Fetch and shape-check every block and the final norm
    pub fn read_weights(&self, weights: &WeightBundle) -> Result<EncoderWeights> {
        let blocks = self
            .layers
            .iter()
            .enumerate()
            .map(|(index, block)| block.read_weights(weights, index))
            .collect::<Result<Vec<_>>>()?;
        let norm = weights.norm(ENCODER_NORM, self.encoder_norm.dim())?;
        Ok(EncoderWeights { blocks, norm })
    }

    pub fn apply_weights(&mut self, staged: EncoderWeights) -> Result<()> {
        for (block, weights) in self.layers.iter_mut().zip(staged.blocks) {
            block.apply_weights(weights)?;
        }
        self.encoder_norm.set_parameters(staged.norm.0, staged.norm.1)
    }

    pub fn load_from(&mut self, weights: &WeightBundle) -> Result<()> {
        let staged = self.read_weights(weights)?;
        self.apply_weights(staged)
    }

    pub fn export_into(&self, weights: &mut WeightBundle) {
        for (index, block) in self.layers.iter().enumerate() {
            block.export_into(weights, index);
        }
        weights.insert_norm(ENCODER_NORM, &self.encoder_norm.gamma, &self.encoder_norm.beta);
    }
}

impl Layer for Encoder {
    fn layer_type(&self) -> &str {
        "Encoder"
    }

    fn forward(&mut self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let mut hidden = input.clone();
        for block in &mut self.layers {
            hidden = block.forward(&hidden)?;
        }
        self.encoder_norm.normalize(&hidden)
    }

    fn parameters(&self) -> usize {
        self.layers.iter().map(Layer::parameters).sum::<usize>() + self.encoder_norm.parameters()
    }

    fn set_training(&mut self, training: bool) {
        for block in &mut self.layers {
            block.set_training(training);
        }
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        for (i, block) in self.layers.iter().enumerate() {
            block.visit_parameters(&join(prefix, &format!("layer.{}", i)), visitor);
        }
        self.encoder_norm.visit_parameters(&join(prefix, "encoder_norm"), visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        for (i, block) in self.layers.iter_mut().enumerate() {
            block.visit_parameters_mut(&join(prefix, &format!("layer.{}", i)), visitor);
        }
        self.encoder_norm.visit_parameters_mut(&join(prefix, "encoder_norm"), visitor);
    }
}
