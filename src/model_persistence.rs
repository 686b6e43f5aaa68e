use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ModelError, Result};
use crate::model_config::ViTConfig;
use crate::vision_transformer::VisionTransformer;
use crate::weights::WeightBundle;

/// Current checkpoint format version
/// Increment this when making breaking changes to the serialization format
const CHECKPOINT_VERSION: u32 = 1;

/// Serialization format of the embedded weight bundle
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointFormat {
    Json,
    Binary,
}

impl CheckpointFormat {
    /// `.json` files hold JSON, everything else bincode
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => CheckpointFormat::Json,
            _ => CheckpointFormat::Binary,
        }
    }
}

/// Versioned checkpoint container with integrity checking
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VersionedCheckpoint {
    /// Format version for backward compatibility
    pub version: u32,
    /// SHA256 checksum of the serialized weight data (hex string)
    pub checksum: String,
    pub format: CheckpointFormat,
    /// Serialized [`WeightBundle`]
    pub data: Vec<u8>,
    pub metadata: CheckpointMetadata,
}

/// Metadata about the exported model
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CheckpointMetadata {
    /// Timestamp when the checkpoint was saved (RFC 3339)
    pub saved_at: String,
    /// Configuration the model was built from
    pub config: ViTConfig,
    pub num_classes: usize,
    pub num_parameters: usize,
    pub description: Option<String>,
}

fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn invalid_data(message: String) -> ModelError {
    ModelError::Serialization {
        source: Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    }
}

impl VersionedCheckpoint {
    /// Export `model` into a checkpoint container
    ///
    /// # Errors
    /// Returns `ModelError::Serialization` if serialization fails
    pub fn from_model(
        model: &VisionTransformer,
        format: CheckpointFormat,
        description: Option<String>,
    ) -> Result<Self> {
        let weights = model.to_weight_bundle();
        let data = match format {
            CheckpointFormat::Json => {
                serde_json::to_vec(&weights).map_err(|e| ModelError::Serialization {
                    source: Box::new(e),
                })?
            }
            CheckpointFormat::Binary => {
                let config = bincode::config::standard();
                bincode::serde::encode_to_vec(&weights, config).map_err(|e| {
                    ModelError::Serialization {
                        source: Box::new(e),
                    }
                })?
            }
        };

        let metadata = CheckpointMetadata {
            saved_at: chrono::Utc::now().to_rfc3339(),
            config: model.config().clone(),
            num_classes: model.num_classes(),
            num_parameters: model.parameters(),
            description,
        };

        Ok(VersionedCheckpoint {
            version: CHECKPOINT_VERSION,
            checksum: checksum(&data),
            format,
            data,
            metadata,
        })
    }

    /// # Errors
    /// Returns `ModelError::Serialization` if checksum validation fails
    pub fn validate_checksum(&self) -> Result<()> {
        let computed = checksum(&self.data);
        if computed != self.checksum {
            return Err(invalid_data(format!(
                "Checksum mismatch: expected {}, got {}",
                self.checksum, computed
            )));
        }
        Ok(())
    }

    /// # Errors
    /// Returns `ModelError::Serialization` if the version is newer than supported
    pub fn validate_version(&self) -> Result<()> {
        if self.version > CHECKPOINT_VERSION {
            return Err(invalid_data(format!(
                "Checkpoint version {} is newer than supported version {}",
                self.version, CHECKPOINT_VERSION
            )));
        }
        if self.version < CHECKPOINT_VERSION {
            tracing::warn!(
                version = self.version,
                current = CHECKPOINT_VERSION,
                "loading checkpoint written by an older format version"
            );
        }
        Ok(())
    }

    /// Validate and decode the embedded weight bundle
    pub fn to_weights(&self) -> Result<WeightBundle> {
        self.validate_version()?;
        self.validate_checksum()?;

        let weights = match self.format {
            CheckpointFormat::Json => {
                serde_json::from_slice(&self.data).map_err(|e| ModelError::Serialization {
                    source: Box::new(e),
                })?
            }
            CheckpointFormat::Binary => {
                let config = bincode::config::standard();
                let (weights, _): (WeightBundle, usize) =
                    bincode::serde::decode_from_slice(&self.data, config).map_err(|e| {
                        ModelError::Serialization {
                            source: Box::new(e),
                        }
                    })?;
                weights
            }
        };
        Ok(weights)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string(self).map_err(|e| ModelError::Serialization {
            source: Box::new(e),
        })?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| ModelError::Serialization {
            source: Box::new(e),
        })
    }
}

impl VisionTransformer {
    /// Save all parameters with versioning and integrity checking
    ///
    /// The file extension selects the weight encoding (`.json` or bincode).
    pub fn save_versioned(&self, path: impl AsRef<Path>, description: Option<String>) -> Result<()> {
        let path = path.as_ref();
        let versioned =
            VersionedCheckpoint::from_model(self, CheckpointFormat::for_path(path), description)?;
        versioned.save_to_file(path)?;

        tracing::info!(
            path = %path.display(),
            version = CHECKPOINT_VERSION,
            checksum = &versioned.checksum[..16],
            params = versioned.metadata.num_parameters,
            "checkpoint saved with versioning and integrity check"
        );
        Ok(())
    }

    /// Load a checkpoint written by [`VisionTransformer::save_versioned`]
    /// into this model
    pub fn load_versioned(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let versioned = VersionedCheckpoint::load_from_file(path)?;

        tracing::info!(
            path = %path.display(),
            version = versioned.version,
            checksum = versioned.checksum.get(..16).unwrap_or(&versioned.checksum),
            saved_at = %versioned.metadata.saved_at,
            "loading versioned checkpoint"
        );

        if versioned.metadata.num_classes != self.num_classes() {
            return Err(ModelError::shape_mismatch(
                "checkpoint classes",
                self.num_classes(),
                versioned.metadata.num_classes,
            ));
        }
        let weights = versioned.to_weights()?;
        self.load_from(&weights)
    }
}
