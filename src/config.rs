//! Serde-backed configuration for building, training and serving a CVDD model.

use crate::error::{CvddError, Result};
use crate::io::ReaderConfig;
use crate::labels::{LabelSets, ANOMALOUS};
use crate::nn::{DistanceKind, EncoderConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvddConfig {
    /// Raw dataset labels treated as the normal class.
    pub normal_labels: Vec<String>,
    /// Raw dataset labels treated as anomalies.
    #[serde(default)]
    pub anomalous_labels: Vec<String>,
    /// Label vocabulary entry excluded from the loss when `train_without_anomaly` is set.
    #[serde(default = "default_anomaly_label")]
    pub anomaly_label: String,
    #[serde(default)]
    pub distance: DistanceKind,
    /// Sharpness of the per-head softmax (alpha).
    #[serde(default)]
    pub distance_weight: f32,
    /// Weight of the orthogonality penalty on the context bank (lambda).
    #[serde(default = "default_context_regularization")]
    pub context_regularization: f32,
    #[serde(default = "default_true")]
    pub train_without_anomaly: bool,
    /// Decision threshold for the prediction wrapper.
    #[serde(default)]
    pub threshold: Option<f32>,
    pub embedding_dim: usize,
    /// Tokens seen fewer times than this map to the unknown token.
    #[serde(default = "default_min_count")]
    pub min_token_count: usize,
    pub context_encoder: EncoderConfig,
    pub attention_encoder: EncoderConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
}

fn default_anomaly_label() -> String {
    ANOMALOUS.to_string()
}

fn default_context_regularization() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_min_count() -> usize {
    1
}

/// Training loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Global gradient norm limit; `None` disables clipping.
    #[serde(default)]
    pub grad_clip: Option<f32>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            num_epochs: default_num_epochs(),
            learning_rate: default_learning_rate(),
            grad_clip: None,
            seed: default_seed(),
            shuffle: true,
        }
    }
}

fn default_batch_size() -> usize {
    16
}

fn default_num_epochs() -> usize {
    10
}

fn default_learning_rate() -> f32 {
    1e-2
}

fn default_seed() -> u64 {
    13
}

impl CvddConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CvddConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        log::info!("loading cvdd config from {}", path.display());
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.label_sets()?;
        if self.trainer.batch_size == 0 {
            return Err(CvddError::config("trainer.batch_size must be positive"));
        }
        if self.embedding_dim == 0 {
            return Err(CvddError::config("embedding_dim must be positive"));
        }
        for (name, encoder) in [
            ("context_encoder", &self.context_encoder),
            ("attention_encoder", &self.attention_encoder),
        ] {
            if encoder.input_dim() == 0 || encoder.output_dim() == 0 {
                return Err(CvddError::config(format!("{} widths must be positive", name)));
            }
        }
        if !self.distance_weight.is_finite() || !self.context_regularization.is_finite() {
            return Err(CvddError::config("distance_weight and context_regularization must be finite"));
        }
        Ok(())
    }

    pub fn label_sets(&self) -> Result<LabelSets> {
        LabelSets::new(self.normal_labels.iter().cloned(), self.anomalous_labels.iter().cloned())
    }
}
