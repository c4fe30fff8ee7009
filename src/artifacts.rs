//! Model-artifact directory layout.
//!
//! ```text
//! <artifact_dir>/
//!   price_transformer.safetensors   required transformer checkpoint
//!   model_config.json               optional ModelConfig override
//!   category_encoder.json           optional fitted category encoder
//!   text_encoder/                   optional local copy of the text model
//!     config.json
//!     tokenizer.json
//!     model.safetensors
//! ```
//!
//! When `text_encoder/` is incomplete the text model is fetched from the
//! HuggingFace Hub (cached by `hf-hub`), unless downloads are disabled.

use std::path::{Path, PathBuf};

use hf_hub::{Repo, RepoType, api::sync::Api};

use crate::config::{ModelConfig, TextEncoderConfig};
use crate::{Error, Result};

pub const CHECKPOINT_FILE: &str = "price_transformer.safetensors";
pub const MODEL_CONFIG_FILE: &str = "model_config.json";
pub const CATEGORY_ENCODER_FILE: &str = "category_encoder.json";
pub const TEXT_MODEL_DIR: &str = "text_encoder";

const TEXT_CONFIG_FILE: &str = "config.json";
const TEXT_TOKENIZER_FILE: &str = "tokenizer.json";
const TEXT_WEIGHTS_FILE: &str = "model.safetensors";

/// Resolved paths of the three text model files.
#[derive(Debug, Clone, PartialEq)]
pub struct TextModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl TextModelFiles {
    fn in_dir(dir: &Path) -> Self {
        Self {
            config: dir.join(TEXT_CONFIG_FILE),
            tokenizer: dir.join(TEXT_TOKENIZER_FILE),
            weights: dir.join(TEXT_WEIGHTS_FILE),
        }
    }

    fn all_exist(&self) -> bool {
        self.config.exists() && self.tokenizer.exists() && self.weights.exists()
    }
}

/// Paths inside one artifact directory.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    dir: PathBuf,
}

impl ArtifactPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    pub fn model_config(&self) -> PathBuf {
        self.dir.join(MODEL_CONFIG_FILE)
    }

    pub fn category_encoder(&self) -> PathBuf {
        self.dir.join(CATEGORY_ENCODER_FILE)
    }

    pub fn text_model_dir(&self) -> PathBuf {
        self.dir.join(TEXT_MODEL_DIR)
    }

    /// `model_config.json` if present, otherwise [`ModelConfig::default`].
    pub fn load_model_config(&self) -> Result<ModelConfig> {
        let path = self.model_config();
        if path.exists() {
            tracing::info!("Loading model config from {:?}", path);
            ModelConfig::from_file(&path)
        } else {
            tracing::info!("No model_config.json, using default ModelConfig");
            Ok(ModelConfig::default())
        }
    }

    /// Local text model files, or a HuggingFace Hub download.
    pub fn resolve_text_model(
        &self,
        settings: &TextEncoderConfig,
        allow_download: bool,
    ) -> Result<TextModelFiles> {
        let local = TextModelFiles::in_dir(&self.text_model_dir());
        if local.all_exist() {
            tracing::info!("Using local text model in {:?}", self.text_model_dir());
            return Ok(local);
        }
        if !allow_download {
            return Err(Error::WeightLoad(format!(
                "text model not found in {} and downloads are disabled",
                self.text_model_dir().display()
            )));
        }
        download_text_model(settings)
    }
}

/// Fetch `config.json`, `tokenizer.json`, and `model.safetensors` from the Hub.
pub fn download_text_model(settings: &TextEncoderConfig) -> Result<TextModelFiles> {
    tracing::info!(
        repo = %settings.hf_repo,
        revision = %settings.hf_revision,
        "fetching text model from HuggingFace Hub"
    );
    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        settings.hf_repo.clone(),
        RepoType::Model,
        settings.hf_revision.clone(),
    ));
    Ok(TextModelFiles {
        config: repo.get(TEXT_CONFIG_FILE)?,
        tokenizer: repo.get(TEXT_TOKENIZER_FILE)?,
        weights: repo.get(TEXT_WEIGHTS_FILE)?,
    })
}
