use std::sync::Arc;

use ndarray::{Array3, Array4, ArrayViewMut1, Axis, Zip, s};
use tracing::debug;

use crate::activation_stats::ActivationStats;
use crate::attention_mask::{AttentionMask, AttentionMaskMode};
use crate::dropout::Dropout;
use crate::errors::{ModelError, Result};
use crate::layer::{Layer, ParamVisitor, ParamVisitorMut, join};
use crate::linear::Linear;
use crate::masker::{ActivationMasker, apply_masker};
use crate::model_config::ViTConfig;

/// Multi-head scaled dot-product self-attention with an optional pruning mask.
///
/// ```text
/// scores = Q·Kᵀ / √head_size           [B, heads, T, T]
/// probs  = softmax(scores)              (mask applied before or after)
/// out    = proj(concat_heads(probs·V))
/// ```
///
/// When a mask mode is set the layer owns an [`AttentionMask`] sized for
/// exactly `n_tokens` tokens, and forward calls with any other sequence
/// length are rejected.
#[derive(Clone, Debug)]
pub struct Attention {
    num_heads: usize,
    head_size: usize,
    n_tokens: usize,

    pub query: Linear,
    pub key: Linear,
    pub value: Linear,
    pub out: Linear,

    attn_dropout: Dropout,
    proj_dropout: Dropout,

    mask_mode: AttentionMaskMode,
    mask: Option<AttentionMask>,
    stats: Option<ActivationStats>,

    record_probs: bool,
    recorded: Option<Array4<f32>>,
}

impl Attention {
    pub fn new(
        config: &ViTConfig,
        n_tokens: usize,
        mask_mode: AttentionMaskMode,
        track_stats: bool,
        record_probs: bool,
    ) -> Result<Self> {
        let hidden = config.hidden_size;
        let num_heads = config.transformer.num_heads;
        if num_heads == 0 || hidden % num_heads != 0 {
            return Err(ModelError::InvalidConfig {
                message: format!(
                    "hidden size {} is not divisible by {} attention heads",
                    hidden, num_heads
                ),
            });
        }
        if track_stats && !mask_mode.is_enabled() {
            return Err(ModelError::InvalidConfig {
                message: "attention statistics require a mask mode".to_string(),
            });
        }

        let mask = mask_mode
            .is_enabled()
            .then(|| AttentionMask::ones(num_heads, n_tokens));
        let stats = track_stats.then(|| ActivationStats::new(num_heads, n_tokens));

        debug!(hidden, num_heads, n_tokens, ?mask_mode, track_stats, "attention built");

        Ok(Self {
            num_heads,
            head_size: hidden / num_heads,
            n_tokens,
            query: Linear::new(hidden, hidden),
            key: Linear::new(hidden, hidden),
            value: Linear::new(hidden, hidden),
            out: Linear::new(hidden, hidden),
            attn_dropout: Dropout::new(config.transformer.attention_dropout_rate)?,
            proj_dropout: Dropout::new(config.transformer.attention_dropout_rate)?,
            mask_mode,
            mask,
            stats,
            record_probs,
            recorded: None,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn all_head_size(&self) -> usize {
        self.num_heads * self.head_size
    }

    pub fn mask_mode(&self) -> AttentionMaskMode {
        self.mask_mode
    }

    pub fn mask(&self) -> Option<&AttentionMask> {
        self.mask.as_ref()
    }

    /// Replace the pruning mask. Only valid when a mask mode is enabled.
    pub fn set_attention_mask(&mut self, mask: AttentionMask) -> Result<()> {
        if !self.mask_mode.is_enabled() {
            return Err(ModelError::InvalidConfig {
                message: "attention layer was built without a mask mode".to_string(),
            });
        }
        mask.check_shape(self.num_heads, self.n_tokens)?;
        self.mask = Some(mask);
        Ok(())
    }

    pub fn stats(&self) -> Option<&ActivationStats> {
        self.stats.as_ref()
    }

    pub fn stats_mut(&mut self) -> Option<&mut ActivationStats> {
        self.stats.as_mut()
    }

    /// Probabilities from the last forward pass, kept only when recording
    pub fn attention_probs(&self) -> Option<&Array4<f32>> {
        self.recorded.as_ref()
    }

    pub fn set_training(&mut self, training: bool) {
        self.attn_dropout.set_training(training);
        self.proj_dropout.set_training(training);
    }

    /// Softmax attention probabilities `[B, heads, T, T]` with the mask applied
    pub fn attention_probabilities(
        &self,
        query: &Array3<f32>,
        key: &Array3<f32>,
    ) -> Array4<f32> {
        let (batch, tokens, _) = query.dim();
        let hs = self.head_size;
        let scale = 1.0 / (hs as f32).sqrt();

        let mut scores = Array4::<f32>::zeros((batch, self.num_heads, tokens, tokens));
        for b in 0..batch {
            for h in 0..self.num_heads {
                let q = query.slice(s![b, .., h * hs..(h + 1) * hs]);
                let k = key.slice(s![b, .., h * hs..(h + 1) * hs]);
                let mut head_scores = scores.slice_mut(s![b, h, .., ..]);
                head_scores.assign(&(q.dot(&k.t()) * scale));
            }
        }

        if let (AttentionMaskMode::PreSoftmax, Some(mask)) = (self.mask_mode, &self.mask) {
            let keep = mask.as_array().index_axis(Axis(0), 0);
            for mut sample in scores.axis_iter_mut(Axis(0)) {
                Zip::from(&mut sample).and(&keep).for_each(|score, &kept| {
                    if !kept {
                        *score = f32::NEG_INFINITY;
                    }
                });
            }
        }

        Zip::from(scores.lanes_mut(Axis(3))).par_for_each(softmax_row);

        if let (AttentionMaskMode::PostSoftmax { renormalize }, Some(mask)) =
            (self.mask_mode, &self.mask)
        {
            let keep = mask.as_array().index_axis(Axis(0), 0);
            for mut sample in scores.axis_iter_mut(Axis(0)) {
                Zip::from(&mut sample).and(&keep).for_each(|p, &kept| {
                    if !kept {
                        *p = 0.0;
                    }
                });
            }
            if renormalize {
                for mut row in scores.lanes_mut(Axis(3)) {
                    let sum = row.sum();
                    if sum > 0.0 {
                        row.mapv_inplace(|p| p / sum);
                    }
                }
            }
        }

        scores
    }

    /// Forward pass; `hook` sees the probabilities before they are recorded
    pub fn forward_with_hook(
        &mut self,
        input: &Array3<f32>,
        hook: Option<&dyn ActivationMasker>,
    ) -> Result<Array3<f32>> {
        let (batch, tokens, hidden) = input.dim();
        if hidden != self.all_head_size() {
            return Err(ModelError::shape_mismatch(
                "attention hidden size",
                self.all_head_size(),
                hidden,
            ));
        }
        if self.mask.is_some() && tokens != self.n_tokens {
            return Err(ModelError::shape_mismatch(
                "attention sequence length (mask)",
                self.n_tokens,
                tokens,
            ));
        }

        let query = self.query.forward(input)?;
        let key = self.key.forward(input)?;
        let value = self.value.forward(input)?;

        let mut probs = self.attention_probabilities(&query, &key);
        if let Some(masker) = hook {
            probs = apply_masker(masker, probs, "attention probabilities")?;
        }

        if let Some(stats) = self.stats.as_mut() {
            stats.update(&probs)?;
        }
        self.recorded = self.record_probs.then(|| probs.clone());

        let probs = self.attn_dropout.forward(probs);

        let hs = self.head_size;
        let mut context = Array3::<f32>::zeros((batch, tokens, hidden));
        for b in 0..batch {
            for h in 0..self.num_heads {
                let p = probs.slice(s![b, h, .., ..]);
                let v = value.slice(s![b, .., h * hs..(h + 1) * hs]);
                context
                    .slice_mut(s![b, .., h * hs..(h + 1) * hs])
                    .assign(&p.dot(&v));
            }
        }

        let output = self.out.forward(&context)?;
        Ok(self.proj_dropout.forward(output))
    }

    pub fn parameters(&self) -> usize {
        self.query.parameters()
            + self.key.parameters()
            + self.value.parameters()
            + self.out.parameters()
    }

    pub fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        self.query.visit_parameters(&join(prefix, "query"), visitor);
        self.key.visit_parameters(&join(prefix, "key"), visitor);
        self.value.visit_parameters(&join(prefix, "value"), visitor);
        self.out.visit_parameters(&join(prefix, "out"), visitor);
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        self.query.visit_parameters_mut(&join(prefix, "query"), visitor);
        self.key.visit_parameters_mut(&join(prefix, "key"), visitor);
        self.value.visit_parameters_mut(&join(prefix, "value"), visitor);
        self.out.visit_parameters_mut(&join(prefix, "out"), visitor);
    }
}

/// Numerically stable softmax of one row; an all `-inf` row becomes zeros
fn softmax_row(mut row: ArrayViewMut1<f32>) {
    let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
    if max == f32::NEG_INFINITY {
        row.fill(0.0);
        return;
    }
    row.mapv_inplace(|x| (x - max).exp());
    let sum = row.sum();
    row.mapv_inplace(|x| x / sum);
}

impl Layer for Attention {
    fn layer_type(&self) -> &str {
        "Attention"
    }

    fn forward(&mut self, input: &Array3<f32>) -> Result<Array3<f32>> {
        self.forward_with_hook(input, None)
    }

    fn parameters(&self) -> usize {
        Attention::parameters(self)
    }

    fn set_training(&mut self, training: bool) {
        Attention::set_training(self, training);
    }

    fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        Attention::visit_parameters(self, prefix, visitor);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        Attention::visit_parameters_mut(self, prefix, visitor);
    }
}

/// Attention whose probabilities pass through an activation masker
#[derive(Clone, Debug)]
pub struct PrunedAttention {
    inner: Attention,
    masker: Arc<dyn ActivationMasker>,
}

impl PrunedAttention {
    pub fn new(inner: Attention, masker: Arc<dyn ActivationMasker>) -> Self {
        Self { inner, masker }
    }

    pub fn inner(&self) -> &Attention {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut Attention {
        &mut self.inner
    }

    pub fn masker(&self) -> &dyn ActivationMasker {
        self.masker.as_ref()
    }
}

impl Layer for PrunedAttention {
    fn layer_type(&self) -> &str {
        "PrunedAttention"
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
