use std::sync::Arc;

use ndarray::{Array1, Array2, Array3};
use tracing::debug;

use crate::{
    attention_mask::AttentionMaskMode,
    errors::Result,
    feed_forward::{Mlp, PrunedMlp},
    layer::{Layer, ParamVisitor, ParamVisitorMut, join},
    layer_norm::LayerNorm,
    masker::{ActivationMasker, IdentityMasker},
    model_config::ViTConfig,
    self_attention::{Attention, PrunedAttention},
    sparse_norm::SparseLayerNorm,
    stochastic_depth::StochasticDepth,
    weights::{
        ATTENTION_K, ATTENTION_NORM, ATTENTION_OUT, ATTENTION_Q, ATTENTION_V, FC_0, FC_1,
        MLP_NORM, WeightBundle, block_root, key,
    },
};

/// Pruning and regularization switches shared by every block of a model
#[derive(Clone, Debug)]
pub struct BlockOptions {
    /// Where the attention mask is applied, if anywhere
    pub mask_mode: AttentionMaskMode,
    /// Accumulate attention-probability statistics (needs a mask mode)
    pub track_attention_stats: bool,
    /// Keep the last attention probabilities for visualization
    pub record_attention_probs: bool,
    /// Use [`SparseLayerNorm`] for both normalizations
    pub sparse_norm: bool,
    /// Route attention probabilities and MLP activations through `masker`
    pub activation_pruning: bool,
    pub masker: Arc<dyn ActivationMasker>,
    /// Stochastic-depth drop probability for the attention branch
    pub attention_drop_path: Option<f32>,
    /// Stochastic-depth drop probability for the MLP branch
    pub mlp_drop_path: Option<f32>,
    /// Store sparse-norm activations as 8-bit blocks
    pub quantize: bool,
    /// Store sparse-norm activations as f16
    pub half: bool,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            mask_mode: AttentionMaskMode::Disabled,
            track_attention_stats: false,
            record_attention_probs: false,
            sparse_norm: false,
            activation_pruning: false,
            masker: Arc::new(IdentityMasker),
            attention_drop_path: None,
            mlp_drop_path: None,
            quantize: false,
            half: false,
        }
    }
}

/// Normalization layer type for Block
#[derive(Clone, Debug)]
pub enum NormLayer {
    LayerNorm(Box<LayerNorm>),
    Sparse(Box<SparseLayerNorm>),
}

impl NormLayer {
    pub fn layer_norm(embedding_dim: usize) -> Self {
        NormLayer::LayerNorm(Box::new(LayerNorm::new(embedding_dim)))
    }

    pub fn sparse(config: &ViTConfig, masker: Arc<dyn ActivationMasker>) -> Self {
        NormLayer::Sparse(Box::new(SparseLayerNorm::new(
            config.hidden_size,
            masker,
            config.quantize,
            config.half,
        )))
    }

    pub fn normalize(&mut self, input: &Array3<f32>) -> Result<Array3<f32>> {
        match self {
            NormLayer::LayerNorm(norm) => norm.normalize(input),
            NormLayer::Sparse(norm) => norm.normalize(input),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        if let NormLayer::Sparse(norm) = self {
            norm.set_training(training);
        }
    }

    /// The affine LayerNorm underneath either variant
    pub fn layer_norm_ref(&self) -> &LayerNorm {
        match self {
            NormLayer::LayerNorm(norm) => norm,
            NormLayer::Sparse(norm) => norm.inner(),
        }
    }

    pub fn set_affine(&mut self, gamma: Array1<f32>, beta: Array1<f32>) -> Result<()> {
        match self {
            NormLayer::LayerNorm(norm) => norm.set_parameters(gamma, beta),
            NormLayer::Sparse(norm) => norm.set_parameters(gamma, beta),
        }
    }

    pub fn parameters(&self) -> usize {
        self.layer_norm_ref().parameters()
    }

    pub fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        self.layer_norm_ref().visit_parameters(prefix, visitor);
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        match self {
            NormLayer::LayerNorm(norm) => norm.visit_parameters_mut(prefix, visitor),
            NormLayer::Sparse(norm) => norm.visit_parameters_mut(prefix, visitor),
        }
    }
}

/// Attention sub-module variant, fixed when the block is built
#[derive(Clone, Debug)]
pub enum AttentionLayer {
    Plain(Box<Attention>),
    Pruned(Box<PrunedAttention>),
    WrappedPlain(Box<StochasticDepth<Attention>>),
    WrappedPruned(Box<StochasticDepth<PrunedAttention>>),
}

impl AttentionLayer {
    pub fn build(config: &ViTConfig, options: &BlockOptions, n_tokens: usize) -> Result<Self> {
        let attention = Attention::new(
            config,
            n_tokens,
            options.mask_mode,
            options.track_attention_stats,
            options.record_attention_probs,
        )?;

        Ok(match (options.activation_pruning, options.attention_drop_path) {
            (false, None) => AttentionLayer::Plain(Box::new(attention)),
            (true, None) => AttentionLayer::Pruned(Box::new(PrunedAttention::new(
                attention,
                Arc::clone(&options.masker),
            ))),
            (false, Some(p)) => {
                AttentionLayer::WrappedPlain(Box::new(StochasticDepth::new(attention, p)?))
            }
            (true, Some(p)) => AttentionLayer::WrappedPruned(Box::new(StochasticDepth::new(
                PrunedAttention::new(attention, Arc::clone(&options.masker)),
                p,
            )?)),
        })
    }

    /// The attention computation regardless of pruning or wrapping
    pub fn attention(&self) -> &Attention {
        match self {
            AttentionLayer::Plain(attn) => attn,
            AttentionLayer::Pruned(attn) => attn.inner(),
            AttentionLayer::WrappedPlain(sd) => sd.inner(),
            AttentionLayer::WrappedPruned(sd) => sd.inner().inner(),
        }
    }

    pub fn attention_mut(&mut self) -> &mut Attention {
        match self {
            AttentionLayer::Plain(attn) => attn,
            AttentionLayer::Pruned(attn) => attn.inner_mut(),
            AttentionLayer::WrappedPlain(sd) => sd.inner_mut(),
            AttentionLayer::WrappedPruned(sd) => sd.inner_mut().inner_mut(),
        }
    }

    fn as_layer_mut(&mut self) -> &mut dyn Layer {
        match self {
            AttentionLayer::Plain(attn) => &mut **attn,
            AttentionLayer::Pruned(attn) => &mut **attn,
            AttentionLayer::WrappedPlain(sd) => &mut **sd,
            AttentionLayer::WrappedPruned(sd) => &mut **sd,
        }
    }
}

impl Layer for AttentionLayer {
    fn layer_type(&self) -> &str {
        match self {
            AttentionLayer::Plain(_) => "Attention",
            AttentionLayer::Pruned(_) => "PrunedAttention",
            AttentionLayer::WrappedPlain(_) => "StochasticDepth(Attention)",
            AttentionLayer::WrappedPruned(_) => "StochasticDepth(PrunedAttention)",
        }
    }

    fn forward(&mut self, input: &Array3<f32>) -> Result<Array3<f32>> {
        self.as_layer_mut().forward(input)
    }

    fn parameters(&self) -> usize {
        self.attention().parameters()
    }

    fn set_training(&mut self, training: bool) {
        self.as_layer_mut().set_training(training);
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        self.attention().visit_parameters(prefix, visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        self.attention_mut().visit_parameters_mut(prefix, visitor);
    }
}

/// MLP sub-module variant, fixed when the block is built
#[derive(Clone, Debug)]
pub enum MlpLayer {
    Plain(Box<Mlp>),
    Pruned(Box<PrunedMlp>),
    WrappedPlain(Box<StochasticDepth<Mlp>>),
    WrappedPruned(Box<StochasticDepth<PrunedMlp>>),
}

impl MlpLayer {
    pub fn build(config: &ViTConfig, options: &BlockOptions) -> Result<Self> {
        Ok(match (options.activation_pruning, options.mlp_drop_path) {
            (false, None) => MlpLayer::Plain(Box::new(Mlp::new(config)?)),
            (true, None) => MlpLayer::Pruned(Box::new(PrunedMlp::new(
                config,
                Arc::clone(&options.masker),
            )?)),
            (false, Some(p)) => {
                MlpLayer::WrappedPlain(Box::new(StochasticDepth::new(Mlp::new(config)?, p)?))
            }
            (true, Some(p)) => MlpLayer::WrappedPruned(Box::new(StochasticDepth::new(
                PrunedMlp::new(config, Arc::clone(&options.masker))?,
                p,
            )?)),
        })
    }

    pub fn mlp(&self) -> &Mlp {
        match self {
            MlpLayer::Plain(mlp) => mlp,
            MlpLayer::Pruned(mlp) => mlp.inner(),
            MlpLayer::WrappedPlain(sd) => sd.inner(),
            MlpLayer::WrappedPruned(sd) => sd.inner().inner(),
        }
    }

    pub fn mlp_mut(&mut self) -> &mut Mlp {
        match self {
            MlpLayer::Plain(mlp) => mlp,
            MlpLayer::Pruned(mlp) => mlp.inner_mut(),
            MlpLayer::WrappedPlain(sd) => sd.inner_mut(),
            MlpLayer::WrappedPruned(sd) => sd.inner_mut().inner_mut(),
        }
    }

    fn as_layer_mut(&mut self) -> &mut dyn Layer {
        match self {
            MlpLayer::Plain(mlp) => &mut **mlp,
            MlpLayer::Pruned(mlp) => &mut **mlp,
            MlpLayer::WrappedPlain(sd) => &mut **sd,
            MlpLayer::WrappedPruned(sd) => &mut **sd,
        }
    }
}

impl Layer for MlpLayer {
    fn layer_type(&self) -> &str {
        match self {
            MlpLayer::Plain(_) => "Mlp",
            MlpLayer::Pruned(_) => "PrunedMlp",
            MlpLayer::WrappedPlain(_) => "StochasticDepth(Mlp)",
            MlpLayer::WrappedPruned(_) => "StochasticDepth(PrunedMlp)",
        }
    }

    fn forward(&mut self, input: &Array3<f32>) -> Result<Array3<f32>> {
        self.as_layer_mut().forward(input)
    }

    fn parameters(&self) -> usize {
        self.mlp().parameters()
    }

    fn set_training(&mut self, training: bool) {
        self.as_layer_mut().set_training(training);
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        self.mlp().visit_parameters(prefix, visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        self.mlp_mut().visit_parameters_mut(prefix, visitor);
    }
}

/// Checkpoint values for one block, already in in-memory layout
#[derive(Clone, Debug)]
pub struct BlockWeights {
    query: (Array2<f32>, Array1<f32>),
    key: (Array2<f32>, Array1<f32>),
    value: (Array2<f32>, Array1<f32>),
    out: (Array2<f32>, Array1<f32>),
    fc1: (Array2<f32>, Array1<f32>),
    fc2: (Array2<f32>, Array1<f32>),
    attention_norm: (Array1<f32>, Array1<f32>),
    ffn_norm: (Array1<f32>, Array1<f32>),
}

/// Pre-norm encoder block
///
/// ```text
/// x = x + attn(norm(x))
/// x = x + mlp(norm(x))
/// ```
///
/// The residual always adds the untouched input; pruning only changes what
/// the sub-modules return.
#[derive(Clone, Debug)]
pub struct Block {
    hidden_size: usize,
    mlp_dim: usize,
    attention_norm: NormLayer,
    attn: AttentionLayer,
    ffn_norm: NormLayer,
    ffn: MlpLayer,
}

impl Block {
    pub fn new(config: &ViTConfig, options: &BlockOptions, n_tokens: usize) -> Result<Self> {
        let norm = || {
            if options.sparse_norm {
                NormLayer::sparse(config, Arc::clone(&options.masker))
            } else {
                NormLayer::layer_norm(config.hidden_size)
            }
        };

        let block = Self {
            hidden_size: config.hidden_size,
            mlp_dim: config.transformer.mlp_dim,
            attention_norm: norm(),
            attn: AttentionLayer::build(config, options, n_tokens)?,
            ffn_norm: norm(),
            ffn: MlpLayer::build(config, options)?,
        };
        debug!(
            attn = block.attn.layer_type(),
            ffn = block.ffn.layer_type(),
            sparse_norm = options.sparse_norm,
            "block built"
        );
        Ok(block)
    }

    pub fn attention_layer(&self) -> &AttentionLayer {
        &self.attn
    }

    pub fn mlp_layer(&self) -> &MlpLayer {
        &self.ffn
    }

    pub fn attention(&self) -> &Attention {
        self.attn.attention()
    }

    pub fn attention_mut(&mut self) -> &mut Attention {
        self.attn.attention_mut()
    }

    pub fn mlp(&self) -> &Mlp {
        self.ffn.mlp()
    }

    pub fn mlp_mut(&mut self) -> &mut Mlp {
        self.ffn.mlp_mut()
    }

    pub fn attention_norm(&self) -> &NormLayer {
        &self.attention_norm
    }

    pub fn ffn_norm(&self) -> &NormLayer {
        &self.ffn_norm
    }

    /// Fetch and shape-check encoder block `index` of a checkpoint
    pub fn read_weights(&self, weights: &WeightBundle, index: usize) -> Result<BlockWeights> {
        let root = block_root(index);
        let (hidden, mlp_dim) = (self.hidden_size, self.mlp_dim);
        let attn = self.attention();
        let (heads, head_size) = (attn.num_heads(), attn.head_size());

        Ok(BlockWeights {
            query: weights.attention_projection(&key(&[&root, ATTENTION_Q]), heads, head_size)?,
            key: weights.attention_projection(&key(&[&root, ATTENTION_K]), heads, head_size)?,
            value: weights.attention_projection(&key(&[&root, ATTENTION_V]), heads, head_size)?,
            out: weights.attention_output(&key(&[&root, ATTENTION_OUT]), heads, head_size)?,
            fc1: weights.dense(&key(&[&root, FC_0]), hidden, mlp_dim)?,
            fc2: weights.dense(&key(&[&root, FC_1]), mlp_dim, hidden)?,
            attention_norm: weights.norm(&key(&[&root, ATTENTION_NORM]), hidden)?,
            ffn_norm: weights.norm(&key(&[&root, MLP_NORM]), hidden)?,
        })
    }

    /// Overwrite every parameter with previously read checkpoint values
    pub fn apply_weights(&mut self, staged: BlockWeights) -> Result<()> {
        let attn = self.attn.attention_mut();
        attn.query.set_parameters(staged.query.0, staged.query.1)?;
        attn.key.set_parameters(staged.key.0, staged.key.1)?;
        attn.value.set_parameters(staged.value.0, staged.value.1)?;
        attn.out.set_parameters(staged.out.0, staged.out.1)?;

        let mlp = self.ffn.mlp_mut();
        mlp.fc1.set_parameters(staged.fc1.0, staged.fc1.1)?;
        mlp.fc2.set_parameters(staged.fc2.0, staged.fc2.1)?;

        self.attention_norm
            .set_affine(staged.attention_norm.0, staged.attention_norm.1)?;
        self.ffn_norm.set_affine(staged.ffn_norm.0, staged.ffn_norm.1)
    }

    /// Copy encoder block `index` of a checkpoint into this block.
    ///
    /// Every array is fetched and shape-checked before any parameter is
    /// written, so a failed import leaves the block untouched.
    pub fn load_from(&mut self, weights: &WeightBundle, index: usize) -> Result<()> {
        let staged = self.read_weights(weights, index)?;
        self.apply_weights(staged)?;
        debug!(index, "block weights imported");
        Ok(())
    }

    /// Write this block's parameters as encoder block `index` of a checkpoint
    pub fn export_into(&self, weights: &mut WeightBundle, index: usize) {
        let root = block_root(index);
        let attn = self.attn.attention();
        weights.insert_dense(&key(&[&root, ATTENTION_Q]), &attn.query);
        weights.insert_dense(&key(&[&root, ATTENTION_K]), &attn.key);
        weights.insert_dense(&key(&[&root, ATTENTION_V]), &attn.value);
        weights.insert_dense(&key(&[&root, ATTENTION_OUT]), &attn.out);

        let mlp = self.ffn.mlp();
        weights.insert_dense(&key(&[&root, FC_0]), &mlp.fc1);
        weights.insert_dense(&key(&[&root, FC_1]), &mlp.fc2);

        let norm = self.attention_norm.layer_norm_ref();
        weights.insert_norm(&key(&[&root, ATTENTION_NORM]), &norm.gamma, &norm.beta);
        let norm = self.ffn_norm.layer_norm_ref();
        weights.insert_norm(&key(&[&root, MLP_NORM]), &norm.gamma, &norm.beta);
    }
}

impl Layer for Block {
    fn layer_type(&self) -> &str {
        "Block"
    }

    fn forward(&mut self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let h = input;
        let x = self.attention_norm.normalize(input)?;
        let x = self.attn.forward(&x)?;
        let x = x + h;

        let h = &x;
        let y = self.ffn_norm.normalize(h)?;
        let y = self.ffn.forward(&y)?;
        Ok(y + h)
    }

    fn parameters(&self) -> usize {
        self.attention_norm.parameters()
            + self.attn.parameters()
            + self.ffn_norm.parameters()
            + self.ffn.parameters()
    }

    fn set_training(&mut self, training: bool) {
        self.attention_norm.set_training(training);
        self.attn.set_training(training);
        self.ffn_norm.set_training(training);
        self.ffn.set_training(training);
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        self.attention_norm.visit_parameters(&join(prefix, "attention_norm"), visitor);
        self.attn.visit_parameters(&join(prefix, "attn"), visitor);
        self.ffn_norm.visit_parameters(&join(prefix, "ffn_norm"), visitor);
        self.ffn.visit_parameters(&join(prefix, "ffn"), visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        self.attention_norm.visit_parameters_mut(&join(prefix, "attention_norm"), visitor);
        self.attn.visit_parameters_mut(&join(prefix, "attn"), visitor);
        self.ffn_norm.visit_parameters_mut(&join(prefix, "ffn_norm"), visitor);
        self.ffn.visit_parameters_mut(&join(prefix, "ffn"), visitor);
    }
}
