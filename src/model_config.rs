use serde::{Deserialize, Serialize};

use crate::errors::{ModelError, Result};

/// How the pooled representation is taken from the encoder output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Classifier {
    /// A learned class token is prepended; its final state feeds the head
    #[default]
    Token,
    /// No class token; the head sees the mean over all patch tokens
    Gap,
}

/// Patch tokenization scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Patches {
    /// Fixed patch size `(h, w)` in pixels, applied to the raw image
    Size(usize, usize),
    /// Token grid `(h, w)` taken from a hybrid backbone feature map
    Grid(usize, usize),
}

/// ResNet stem settings, only meaningful for hybrid (grid) models
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResNetConfig {
    pub num_layers: Vec<usize>,
    pub width_factor: usize,
}

/// Encoder hyper-parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub num_heads: usize,
    pub mlp_dim: usize,
    pub num_layers: usize,
    pub dropout_rate: f32,
    pub attention_dropout_rate: f32,
}

/// Vision Transformer configuration.
///
/// Read-only once a model is built. `quantize` and `half` are annotations
/// stamped at build time from the pruning options and consumed by the sparse
/// normalization layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViTConfig {
    /// Preset this config was derived from, if any
    #[serde(default)]
    pub name: Option<String>,
    pub hidden_size: usize,
    pub transformer: TransformerConfig,
    pub patches: Patches,
    #[serde(default)]
    pub classifier: Classifier,
    #[serde(default)]
    pub resnet: Option<ResNetConfig>,
    #[serde(default)]
    pub quantize: bool,
    #[serde(default)]
    pub half: bool,
}

const PRESETS: &[&str] = &[
    "ViT-B_16",
    "ViT-Ti_16",
    "ViT-B_32",
    "ViT-L_16",
    "ViT-L_32",
    "ViT-H_14",
    "R50-ViT-B_16",
    "testing",
];

impl ViTConfig {
    /// Names accepted by [`ViTConfig::preset`]
    pub fn preset_names() -> &'static [&'static str] {
        PRESETS
    }

    /// Look up one of the published configurations by name
    pub fn preset(name: &str) -> Result<Self> {
        let config = match name {
            "ViT-B_16" => Self::b16(),
            "ViT-Ti_16" => Self::ti16(),
            "ViT-B_32" => Self::b16().with_patch_size(32),
            "ViT-L_16" => Self::l16(),
            "ViT-L_32" => Self::l16().with_patch_size(32),
            "ViT-H_14" => Self::h14(),
            "R50-ViT-B_16" => Self::r50_b16(),
            "testing" => Self::testing(),
            other => {
                return Err(ModelError::InvalidConfig {
                    message: format!(
                        "unknown preset '{}', expected one of {}",
                        other,
                        PRESETS.join(", ")
                    ),
                });
            }
        };
        Ok(config.named(name))
    }

    fn base(hidden_size: usize, num_heads: usize, mlp_dim: usize, num_layers: usize) -> Self {
        Self {
            name: None,
            hidden_size,
            transformer: TransformerConfig {
                num_heads,
                mlp_dim,
                num_layers,
                dropout_rate: 0.1,
                attention_dropout_rate: 0.0,
            },
            patches: Patches::Size(16, 16),
            classifier: Classifier::Token,
            resnet: None,
            quantize: false,
            half: false,
        }
    }

    /// Minimal single-layer model used for smoke tests
    pub fn testing() -> Self {
        Self::base(1, 1, 1, 1)
    }

    pub fn b16() -> Self {
        Self::base(768, 12, 3072, 12)
    }

    pub fn ti16() -> Self {
        Self::base(192, 3, 768, 12)
    }

    pub fn l16() -> Self {
        Self::base(1024, 16, 4096, 24)
    }

    pub fn h14() -> Self {
        Self::base(1280, 16, 5120, 32).with_patch_size(14)
    }

    pub fn r50_b16() -> Self {
        let mut config = Self::b16();
        config.patches = Patches::Grid(14, 14);
        config.resnet = Some(ResNetConfig {
            num_layers: vec![3, 4, 9],
            width_factor: 1,
        });
        config
    }

    /// Small custom encoder, handy for experiments and tests
    pub fn custom(
        hidden_size: usize,
        num_heads: usize,
        mlp_dim: usize,
        num_layers: usize,
        patch_size: usize,
    ) -> Self {
        Self::base(hidden_size, num_heads, mlp_dim, num_layers).with_patch_size(patch_size)
    }

    pub fn with_patch_size(mut self, patch_size: usize) -> Self {
        self.patches = Patches::Size(patch_size, patch_size);
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_dropout(mut self, dropout_rate: f32, attention_dropout_rate: f32) -> Self {
        self.transformer.dropout_rate = dropout_rate;
        self.transformer.attention_dropout_rate = attention_dropout_rate;
        self
    }

    /// Stamp the precision annotations read by sparse normalization
    pub fn with_precision(mut self, quantize: bool, half: bool) -> Self {
        self.quantize = quantize;
        self.half = half;
        self
    }

    fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn head_size(&self) -> usize {
        self.hidden_size / self.transformer.num_heads
    }

    pub fn is_hybrid(&self) -> bool {
        matches!(self.patches, Patches::Grid(..))
    }

    /// Check the structural constraints every layer relies on
    pub fn validate(&self) -> Result<()> {
        let t = &self.transformer;
        if self.hidden_size == 0 || t.num_heads == 0 || t.mlp_dim == 0 || t.num_layers == 0 {
            return Err(ModelError::InvalidConfig {
                message: format!(
                    "sizes must be non-zero (hidden_size={}, num_heads={}, mlp_dim={}, num_layers={})",
                    self.hidden_size, t.num_heads, t.mlp_dim, t.num_layers
                ),
            });
        }
        if self.hidden_size % t.num_heads != 0 {
            return Err(ModelError::InvalidConfig {
                message: format!(
                    "hidden_size {} is not divisible by num_heads {}",
                    self.hidden_size, t.num_heads
                ),
            });
        }
        for (label, rate) in [
            ("dropout_rate", t.dropout_rate),
            ("attention_dropout_rate", t.attention_dropout_rate),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(ModelError::InvalidConfig {
                    message: format!("{} must be in [0, 1), got {}", label, rate),
                });
            }
        }
        match self.patches {
            Patches::Size(h, w) | Patches::Grid(h, w) if h == 0 || w == 0 => {
                Err(ModelError::InvalidConfig {
                    message: format!("patch dimensions must be non-zero, got {:?}", self.patches),
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_validate() {
        for name in ViTConfig::preset_names() {
            let config = ViTConfig::preset(name).unwrap();
            config.validate().unwrap();
            assert_eq!(config.name.as_deref(), Some(*name));
        }
    }

    #[test]
    fn test_preset_values() {
        let b32 = ViTConfig::preset("ViT-B_32").unwrap();
        assert_eq!(b32.hidden_size, 768);
        assert_eq!(b32.patches, Patches::Size(32, 32));

        let hybrid = ViTConfig::preset("R50-ViT-B_16").unwrap();
        assert!(hybrid.is_hybrid());
        assert_eq!(hybrid.resnet.unwrap().num_layers, vec![3, 4, 9]);
    }

    #[test]
    fn test_unknown_preset() {
        assert!(matches!(
            ViTConfig::preset("ViT-X_99"),
            Err(ModelError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let config = ViTConfig::custom(10, 3, 8, 1, 4);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "hidden_size": 8,
            "transformer": {
                "num_heads": 2, "mlp_dim": 16, "num_layers": 2,
                "dropout_rate": 0.0, "attention_dropout_rate": 0.0
            },
            "patches": {"size": [4, 4]},
            "classifier": "gap",
            "representation_size": null
        }"#;
        let config: ViTConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.classifier, Classifier::Gap);
        assert_eq!(config.patches, Patches::Size(4, 4));
        assert!(!config.quantize);
    }
}
