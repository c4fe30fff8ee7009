//! Configuration for the multimodal price predictor.
//!
//! [`ModelConfig`] must match the checkpoint it loads: every tensor shape in
//! the transformer is derived from it.

use std::path::{Path, PathBuf};

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of tokens in every model input: `[TEXT, CATEGORY, NUMERIC]`.
pub const NUM_TOKENS: usize = 3;

/// Transformer hyperparameters, fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Embedding width shared by all tokens and internal representations.
    pub d_model: usize,
    /// Self-attention heads per encoder layer.
    pub nhead: usize,
    /// Number of encoder layers.
    pub num_layers: usize,
    /// Dropout rate used in training. Inference runs in eval mode and ignores it.
    pub dropout: f64,
    /// Upper clamp for the predicted log-price (~₹440k).
    pub max_price_log: f64,
    /// Lower clamp for the predicted log-price (~₹7).
    pub min_price_log: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_model: 128,
            nhead: 4,
            num_layers: 2,
            dropout: 0.2,
            max_price_log: 13.0,
            min_price_log: 2.0,
        }
    }
}

impl ModelConfig {
    /// Feed-forward width inside each encoder layer (2x expansion).
    pub fn ff_dim(&self) -> usize {
        self.d_model * 2
    }

    /// Hidden width of the regression head.
    pub fn head_hidden(&self) -> usize {
        self.d_model / 2
    }

    /// Per-head dimension of the encoder self-attention.
    pub fn head_dim(&self) -> usize {
        self.d_model / self.nhead
    }

    /// Reject configurations that cannot produce a valid model.
    pub fn validate(&self) -> Result<()> {
        if self.d_model < 2 {
            return Err(Error::Config(format!(
                "d_model must be at least 2, got {}",
                self.d_model
            )));
        }
        if self.nhead == 0 || self.d_model % self.nhead != 0 {
            return Err(Error::Config(format!(
                "d_model ({}) must be divisible by nhead ({})",
                self.d_model, self.nhead
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if !self.min_price_log.is_finite()
            || !self.max_price_log.is_finite()
            || self.min_price_log >= self.max_price_log
        {
            return Err(Error::Config(format!(
                "invalid log-price range [{}, {}]",
                self.min_price_log, self.max_price_log
            )));
        }
        Ok(())
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Settings for the pretrained text representation model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextEncoderConfig {
    /// Maximum number of sub-word tokens fed to the text model.
    pub max_length: usize,
    /// HuggingFace repo used when no local copy exists.
    pub hf_repo: String,
    /// Revision of `hf_repo`.
    pub hf_revision: String,
}

impl Default for TextEncoderConfig {
    fn default() -> Self {
        Self {
            max_length: 128,
            hf_repo: "bert-base-uncased".to_string(),
            hf_revision: "main".to_string(),
        }
    }
}

/// Everything needed to build a [`crate::pipeline::PricePredictor`].
#[derive(Debug, Clone)]
pub struct PredictorConfig {
    /// Directory holding the checkpoint and optional side artifacts.
    pub artifact_dir: PathBuf,
    /// Text model settings.
    pub text: TextEncoderConfig,
    /// CUDA device ordinal (0 = first GPU). Ignored when CUDA is unavailable.
    pub cuda_device: usize,
    /// Data type for weights and activations.
    pub dtype: DType,
    /// Fetch the text model from the HuggingFace Hub when no local copy exists.
    pub allow_download: bool,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            text: TextEncoderConfig::default(),
            cuda_device: 0,
            dtype: DType::F32,
            allow_download: true,
        }
    }
}

/// `$XDG_DATA_HOME/price-predictor`, or `./artifacts` when no data dir exists.
pub fn default_artifact_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("price-predictor"))
        .unwrap_or_else(|| PathBuf::from("artifacts"))
}
