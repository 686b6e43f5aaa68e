pub mod activation_stats;
pub mod activations;
pub mod attention_mask;
pub mod dropout;
pub mod embeddings;
pub mod encoder;
pub mod errors;
pub mod feed_forward;
pub mod layer;
pub mod layer_norm;
pub mod linear;
pub mod masker;
pub mod model_config;
pub mod model_persistence;
pub mod patch_embedding;
pub mod pos_embed;
pub mod self_attention;
pub mod sparse_norm;
pub mod stochastic_depth;
pub mod transformer;
pub mod vision_transformer;
pub mod weights;
// Re-export key structs for easier access
pub use activation_stats::ActivationStats;
pub use activations::Activation;
pub use attention_mask::{AttentionMask, AttentionMaskMode};
pub use dropout::Dropout;
pub use embeddings::{BACKBONE_STRIDE, Backbone, Embeddings};
pub use encoder::Encoder;
pub use errors::{ModelError, Result};
pub use feed_forward::{Mlp, PrunedMlp};
pub use layer::Layer;
pub use layer_norm::LayerNorm;
pub use linear::Linear;
pub use masker::{ActivationMasker, IdentityMasker, MagnitudeMasker};
pub use model_config::{Classifier, Patches, ResNetConfig, TransformerConfig, ViTConfig};
pub use model_persistence::{CheckpointFormat, VersionedCheckpoint};
pub use patch_embedding::PatchEmbedding;
pub use pos_embed::resize_position_embedding;
pub use self_attention::{Attention, PrunedAttention};
pub use sparse_norm::{SavedActivation, SparseLayerNorm};
pub use stochastic_depth::StochasticDepth;
pub use transformer::{AttentionLayer, Block, BlockOptions, MlpLayer, NormLayer};
pub use vision_transformer::{Transformer, VisionTransformer, VitOutput, cross_entropy};
pub use weights::WeightBundle;
