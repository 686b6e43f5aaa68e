use std::fmt::Debug;

use ndarray::{Array1, Array2, Array3, Array4, Axis, concatenate};
use tracing::{info, warn};

use crate::dropout::Dropout;
use crate::errors::{ModelError, Result};
use crate::layer::{ParamVisitor, ParamVisitorMut, join};
use crate::model_config::{Classifier, Patches, ViTConfig};
use crate::patch_embedding::PatchEmbedding;
use crate::pos_embed::resize_position_embedding;
use crate::weights::{CLASS_TOKEN, PATCH_EMBEDDING, POSITION_EMBEDDING, WeightBundle, key};

/// Spatial downsampling of every hybrid backbone
pub const BACKBONE_STRIDE: usize = 16;

/// Convolutional feature extractor used in place of raw pixels by hybrid
/// models. Must downsample by [`BACKBONE_STRIDE`].
pub trait Backbone: Debug + Send + Sync {
    /// Channels of the produced feature map
    fn out_channels(&self) -> usize;

    /// `[B, 3, H, W]` -> `[B, out_channels, H / 16, W / 16]`
    fn forward(&mut self, images: &Array4<f32>) -> Result<Array4<f32>>;

    fn set_training(&mut self, training: bool);

    fn load_from(&mut self, weights: &WeightBundle) -> Result<()>;

    fn parameters(&self) -> usize;
}

/// Checkpoint values for the embedding layer, already in in-memory layout
#[derive(Clone, Debug)]
pub struct EmbeddingWeights {
    kernel: Array4<f32>,
    bias: Array1<f32>,
    cls_token: Option<Array1<f32>>,
    position_embeddings: Array2<f32>,
}

/// Image batch -> token sequence: patch projection, class token, learned
/// absolute position embedding and dropout.
#[derive(Debug)]
pub struct Embeddings {
    image_size: (usize, usize),
    classifier: Classifier,
    hybrid: Option<Box<dyn Backbone>>,
    pub patch_embeddings: PatchEmbedding,
    /// `[n_tokens, hidden]`, class position first when present
    pub position_embeddings: Array2<f32>,
    pub cls_token: Option<Array1<f32>>,
    dropout: Dropout,
}

impl Embeddings {
    /// Plain patch tokenizer; the image size must be a multiple of the patch size
    pub fn new(config: &ViTConfig, image_size: (usize, usize)) -> Result<Self> {
        config.validate()?;
        let patch_size = match config.patches {
            Patches::Size(h, w) => (h, w),
            Patches::Grid(..) => {
                return Err(ModelError::InvalidConfig {
                    message: "grid patches need a hybrid backbone (use Embeddings::hybrid)"
                        .to_string(),
                });
            }
        };
        let patch_embeddings = PatchEmbedding::new(3, config.hidden_size, patch_size);
        let (gh, gw) = patch_embeddings.grid_for(image_size)?;
        Self::assemble(config, image_size, None, patch_embeddings, gh * gw)
    }

    /// Tokenize the feature map of `backbone`; the patch size is derived from
    /// the configured grid
    pub fn hybrid(
        config: &ViTConfig,
        image_size: (usize, usize),
        backbone: Box<dyn Backbone>,
    ) -> Result<Self> {
        config.validate()?;
        let Patches::Grid(grid_h, grid_w) = config.patches else {
            return Err(ModelError::InvalidConfig {
                message: "a hybrid backbone needs grid patches".to_string(),
            });
        };
        if image_size.0 % BACKBONE_STRIDE != 0 || image_size.1 % BACKBONE_STRIDE != 0 {
            return Err(ModelError::shape_mismatch(
                "image size divisible by backbone stride",
                (BACKBONE_STRIDE, BACKBONE_STRIDE),
                image_size,
            ));
        }

        let feature_size = (image_size.0 / BACKBONE_STRIDE, image_size.1 / BACKBONE_STRIDE);
        let patch_size = (feature_size.0 / grid_h, feature_size.1 / grid_w);
        if patch_size.0 == 0 || patch_size.1 == 0 {
            return Err(ModelError::InvalidConfig {
                message: format!(
                    "grid {:?} is finer than the {:?} backbone feature map",
                    (grid_h, grid_w),
                    feature_size
                ),
            });
        }

        let patch_embeddings =
            PatchEmbedding::new(backbone.out_channels(), config.hidden_size, patch_size);
        let (gh, gw) = patch_embeddings.grid_for(feature_size)?;
        Self::assemble(config, image_size, Some(backbone), patch_embeddings, gh * gw)
    }

    fn assemble(
        config: &ViTConfig,
        image_size: (usize, usize),
        hybrid: Option<Box<dyn Backbone>>,
        patch_embeddings: PatchEmbedding,
        n_patches: usize,
    ) -> Result<Self> {
        let cls_token = match config.classifier {
            Classifier::Token => Some(Array1::zeros(config.hidden_size)),
            Classifier::Gap => None,
        };
        let n_tokens = n_patches + usize::from(cls_token.is_some());

        Ok(Self {
            image_size,
            classifier: config.classifier,
            hybrid,
            patch_embeddings,
            position_embeddings: Array2::zeros((n_tokens, config.hidden_size)),
            cls_token,
            dropout: Dropout::new(config.transformer.dropout_rate)?,
        })
    }

    /// Sequence length produced by `forward`, class token included
    pub fn n_tokens(&self) -> usize {
        self.position_embeddings.nrows()
    }

    pub fn image_size(&self) -> (usize, usize) {
        self.image_size
    }

    pub fn is_hybrid(&self) -> bool {
        self.hybrid.is_some()
    }

    pub fn backbone(&self) -> Option<&dyn Backbone> {
        self.hybrid.as_deref()
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
        if let Some(backbone) = self.hybrid.as_mut() {
            backbone.set_training(training);
        }
    }

    pub fn forward(&mut self, images: &Array4<f32>) -> Result<Array3<f32>> {
        let (batch, _, height, width) = images.dim();
        if (height, width) != self.image_size {
            return Err(ModelError::shape_mismatch(
                "input image size",
                self.image_size,
                (height, width),
            ));
        }

        let patches = match self.hybrid.as_mut() {
            Some(backbone) => {
                let features = backbone.forward(images)?;
                let expected = (
                    batch,
                    backbone.out_channels(),
                    height / BACKBONE_STRIDE,
                    width / BACKBONE_STRIDE,
                );
                if features.dim() != expected {
                    return Err(ModelError::shape_mismatch(
                        "backbone feature map",
                        expected,
                        features.dim(),
                    ));
                }
                self.patch_embeddings.forward(&features)?
            }
            None => self.patch_embeddings.forward(images)?,
        };

        let mut tokens = match &self.cls_token {
            Some(cls) => {
                let hidden = cls.len();
                let cls_tokens = cls
                    .view()
                    .into_shape_with_order((1, 1, hidden))?
                    .broadcast((batch, 1, hidden))
                    .ok_or_else(|| {
                        ModelError::shape_mismatch("class token", (batch, 1, hidden), cls.dim())
                    })?
                    .to_owned();
                concatenate(Axis(1), &[cls_tokens.view(), patches.view()])?
            }
            None => patches,
        };

        if tokens.len_of(Axis(1)) != self.n_tokens() {
            return Err(ModelError::shape_mismatch(
                "token count",
                self.n_tokens(),
                tokens.len_of(Axis(1)),
            ));
        }
        tokens += &self.position_embeddings;
        Ok(self.dropout.forward(tokens))
    }

    /// Fetch, convert and (if needed) resize the embedding parameters of a
    /// checkpoint without touching the layer
    pub fn read_weights(&self, weights: &WeightBundle) -> Result<EmbeddingWeights> {
        let hidden = self.patch_embeddings.hidden_size();
        let kernel = weights.conv_kernel(
            &key(&[PATCH_EMBEDDING, "kernel"]),
            hidden,
            self.patch_embeddings.in_channels(),
            self.patch_embeddings.patch_size(),
        )?;
        let bias = weights.vector(&key(&[PATCH_EMBEDDING, "bias"]), hidden)?;
        let cls_token = match self.cls_token {
            Some(_) => Some(weights.token(CLASS_TOKEN, hidden)?),
            None => None,
        };

        let stored = weights.table(POSITION_EMBEDDING, hidden)?;
        let stored_tokens = stored.nrows();
        let position_embeddings = if stored.dim() == self.position_embeddings.dim() {
            stored
        } else {
            info!(
                from = stored_tokens,
                to = self.n_tokens(),
                "load_pretrained: resized position embedding"
            );
            resize_position_embedding(&stored, self.n_tokens(), self.cls_token.is_some())?
        };

        Ok(EmbeddingWeights {
            kernel,
            bias,
            cls_token,
            position_embeddings,
        })
    }

    pub fn apply_weights(&mut self, staged: EmbeddingWeights) -> Result<()> {
        self.patch_embeddings.set_parameters(staged.kernel, staged.bias)?;
        if let Some(cls) = staged.cls_token {
            self.cls_token = Some(cls);
        }
        self.position_embeddings = staged.position_embeddings;
        Ok(())
    }

    /// Import the backbone's own parameters, if there is a backbone
    pub fn load_backbone(&mut self, weights: &WeightBundle) -> Result<()> {
        if let Some(backbone) = self.hybrid.as_mut() {
            warn!(
                params = backbone.parameters(),
                "delegating hybrid backbone import; a failure here leaves it partially loaded"
            );
            backbone.load_from(weights)?;
        }
        Ok(())
    }

    pub fn export_into(&self, weights: &mut WeightBundle) {
        weights.insert_conv_kernel(
            key(&[PATCH_EMBEDDING, "kernel"]),
            &self.patch_embeddings.weight,
        );
        weights.insert(
            key(&[PATCH_EMBEDDING, "bias"]),
            self.patch_embeddings.bias.clone(),
        );
        if let Some(cls) = &self.cls_token {
            weights.insert(CLASS_TOKEN, cls.clone());
        }
        weights.insert(POSITION_EMBEDDING, self.position_embeddings.clone());
    }

    pub fn parameters(&self) -> usize {
        self.patch_embeddings.parameters()
            + self.position_embeddings.len()
            + self.cls_token.as_ref().map_or(0, |c| c.len())
            + self.hybrid.as_ref().map_or(0, |b| b.parameters())
    }

    pub fn visit_parameters(&self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        self.patch_embeddings
            .visit_parameters(&join(prefix, "patch_embeddings"), visitor);
        visitor(
            &join(prefix, "position_embeddings"),
            self.position_embeddings.view().into_dyn(),
        );
        if let Some(cls) = &self.cls_token {
            visitor(&join(prefix, "cls_token"), cls.view().into_dyn());
        }
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, visitor: &mut ParamVisitorMut<'_>) {
        self.patch_embeddings
            .visit_parameters_mut(&join(prefix, "patch_embeddings"), visitor);
        visitor(
            &join(prefix, "position_embeddings"),
            self.position_embeddings.view_mut().into_dyn(),
        );
        if let Some(cls) = self.cls_token.as_mut() {
            visitor(&join(prefix, "cls_token"), cls.view_mut().into_dyn());
        }
    }

    pub fn classifier(&self) -> Classifier {
        self.classifier
    }
}
