//! Text encoder wrapping a pretrained BERT.
//!
//! The product name is tokenized (truncated to `max_length` sub-word tokens),
//! run through BERT in eval mode, and the hidden state of the leading `[CLS]`
//! token is taken as the text representation. When BERT's hidden size differs
//! from `d_model` a trained `text_projection` from the price checkpoint maps it
//! down; an untrained projection is never constructed.

use std::path::Path;

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::models::bert;
use tokenizers::{Tokenizer, TruncationParams};

use crate::artifacts::TextModelFiles;
use crate::config::TextEncoderConfig;
use crate::error::TokenizerError;
use crate::model::tokens::{EncodingResult, TokenEmbedding, TokenRole};
use crate::{Error, Result};

/// Parsed text model configuration plus its hidden width.
#[derive(Debug, Clone)]
pub struct TextModelConfig {
    pub bert: bert::Config,
    pub hidden_size: usize,
}

impl TextModelConfig {
    /// Parse a HuggingFace `config.json`.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(text)?;
        let hidden_size = raw
            .get("hidden_size")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::Config("text model config has no hidden_size".into()))?
            as usize;
        let bert: bert::Config = serde_json::from_value(raw)?;
        Ok(Self { bert, hidden_size })
    }
}

/// Load the optional trained projection from the price checkpoint.
///
/// Returns `None` when the text width already equals `d_model` and the
/// checkpoint carries no projection. A width mismatch without a projection is
/// a load error.
pub fn load_text_projection(
    vb: &VarBuilder,
    hidden_size: usize,
    d_model: usize,
) -> Result<Option<Linear>> {
    if vb.contains_tensor("text_projection.weight") {
        let projection = candle_nn::linear(hidden_size, d_model, vb.pp("text_projection"))
            .map_err(|e| Error::WeightLoad(format!("text_projection: {e}")))?;
        return Ok(Some(projection));
    }
    if hidden_size == d_model {
        return Ok(None);
    }
    Err(Error::WeightLoad(format!(
        "text model hidden size {hidden_size} differs from d_model {d_model} \
         and the checkpoint has no trained text_projection"
    )))
}

/// BERT `[CLS]` text encoder.
pub struct BertTextEncoder {
    model: bert::BertModel,
    tokenizer: Tokenizer,
    projection: Option<Linear>,
    cls_id: u32,
    hidden_size: usize,
    d_model: usize,
    device: Device,
}

impl BertTextEncoder {
    /// Build from an already-constructed VarBuilder and tokenizer.
    ///
    /// `projection` must be `Some` whenever `cfg.hidden_size != d_model`.
    pub fn new(
        cfg: &TextModelConfig,
        vb: VarBuilder,
        mut tokenizer: Tokenizer,
        projection: Option<Linear>,
        d_model: usize,
        max_length: usize,
    ) -> Result<Self> {
        if projection.is_none() && cfg.hidden_size != d_model {
            return Err(Error::WeightLoad(format!(
                "text hidden size {} needs a projection to d_model {d_model}",
                cfg.hidden_size
            )));
        }
        let device = vb.device().clone();
        let model = bert::BertModel::load(vb, &cfg.bert)
            .map_err(|e| Error::WeightLoad(format!("text model: {e}")))?;

        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| Error::Tokenizer(TokenizerError(format!("truncation: {e}"))))?;
        tokenizer.with_padding(None);
        let cls_id = tokenizer.token_to_id("[CLS]").unwrap_or(0);

        Ok(Self {
            model,
            tokenizer,
            projection,
            cls_id,
            hidden_size: cfg.hidden_size,
            d_model,
            device,
        })
    }

    /// Load BERT weights, config, and tokenizer from resolved files.
    ///
    /// `checkpoint` is the price-model VarBuilder; it supplies the trained
    /// `text_projection` when the text width differs from `d_model`.
    pub fn load(
        files: &TextModelFiles,
        settings: &TextEncoderConfig,
        checkpoint: &VarBuilder,
        d_model: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        tracing::info!("Loading text model config from {:?}", files.config);
        let cfg = TextModelConfig::from_json(&std::fs::read_to_string(&files.config)?)?;
        let projection = load_text_projection(checkpoint, cfg.hidden_size, d_model)?;

        tracing::info!("Loading tokenizer from {:?}", files.tokenizer);
        let tokenizer = load_tokenizer(&files.tokenizer)?;

        tracing::info!("Loading text model weights from {:?}", files.weights);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.weights], dtype, device)
                .map_err(|e| Error::WeightLoad(format!("text model weights: {e}")))?
        };
        Self::new(&cfg, vb, tokenizer, projection, d_model, settings.max_length)
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    /// Encode `text` into a `d_model`-wide token.
    ///
    /// If the tokenizer yields no tokens at all (no post-processor and empty
    /// input), a lone `[CLS]` is fed instead and the result is flagged as a
    /// fallback.
    pub fn encode(&self, text: &str) -> Result<EncodingResult> {
        let encoding = self.tokenizer.encode(text, true)?;
        let mut ids = encoding.get_ids().to_vec();
        let mut type_ids = encoding.get_type_ids().to_vec();
        let used_fallback = ids.is_empty();
        if used_fallback {
            ids.push(self.cls_id);
            type_ids.push(0);
        }
        let len = ids.len();

        let input_ids = Tensor::from_vec(ids, (1, len), &self.device)?;
        let token_type_ids = Tensor::from_vec(type_ids, (1, len), &self.device)?;
        let attention_mask = Tensor::ones((1, len), DType::U32, &self.device)?;

        // [1, T, hidden] -> CLS [1, hidden]
        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        let cls = hidden.i((.., 0, ..))?;
        let cls = match &self.projection {
            Some(projection) => projection.forward(&cls)?,
            None => cls,
        };

        let values = cls.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        debug_assert_eq!(values.len(), self.d_model);
        let embedding = TokenEmbedding::new(TokenRole::Text, values);
        Ok(EncodingResult {
            embedding,
            used_fallback,
        })
    }
}

/// Read a `tokenizer.json`.
pub fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(|e| Error::Tokenizer(TokenizerError(format!("{}: {e}", path.display()))))
}
