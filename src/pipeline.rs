//! End-to-end price prediction.
//!
//! [`PricePredictor`] owns the three encoders and the transformer, all loaded
//! once from an artifact directory and read-only afterwards:
//!
//! ```text
//! product name ─→ BERT [CLS] (+ trained projection) ─┐
//! category ─────→ one-hot (fitted or hashed) ─────────┼→ [TEXT, CATEGORY, NUMERIC]
//! ratings, count, discount → tiled features ─────────┘              ↓
//!                                      encoder layers → attention pooling → head
//!                                                                   ↓
//!                                               clamped log-price → exp → price
//! ```
//!
//! Confidence is a fixed heuristic over the predicted price magnitude. It
//! says how typical the price range is, not how certain the model is.

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::artifacts::ArtifactPaths;
use crate::config::{ModelConfig, NUM_TOKENS, PredictorConfig};
use crate::manager::preferred_device;
use crate::model::encoder::category::CategoryEncoderState;
use crate::model::encoder::numeric::encode_numeric;
use crate::model::encoder::text::BertTextEncoder;
use crate::model::tokens::TokenSequence;
use crate::model::transformer::{PriceTransformer, checkpoint_var_builder};
use crate::{Error, Result};

/// Confidence for atypical prices: below 100 or above 100,000.
pub const LOW_CONFIDENCE: f64 = 0.60;
/// Confidence for unusual prices: below 500 or above 50,000.
pub const MEDIUM_CONFIDENCE: f64 = 0.75;
/// Confidence for the common 500..=50,000 range.
pub const HIGH_CONFIDENCE: f64 = 0.90;

/// Half-width of the displayed price interval, as a fraction of the price.
const PRICE_RANGE_FRACTION: f64 = 0.15;

/// Bucket a predicted price into one of three confidence levels.
pub fn confidence_for_price(price: f64) -> f64 {
    if !(100.0..=100_000.0).contains(&price) {
        LOW_CONFIDENCE
    } else if !(500.0..=50_000.0).contains(&price) {
        MEDIUM_CONFIDENCE
    } else {
        HIGH_CONFIDENCE
    }
}

/// A single price estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Predicted price, always positive.
    pub predicted_price: f64,
    /// One of [`LOW_CONFIDENCE`], [`MEDIUM_CONFIDENCE`], [`HIGH_CONFIDENCE`].
    pub confidence: f64,
}

impl PredictionResult {
    fn from_log_price(log_price: f64) -> Self {
        let predicted_price = log_price.exp();
        Self {
            predicted_price,
            confidence: confidence_for_price(predicted_price),
        }
    }

    /// `(0.85 * price, 1.15 * price)`.
    pub fn price_range(&self) -> (f64, f64) {
        (
            self.predicted_price * (1.0 - PRICE_RANGE_FRACTION),
            self.predicted_price * (1.0 + PRICE_RANGE_FRACTION),
        )
    }

    pub fn confidence_percent(&self) -> f64 {
        self.confidence * 100.0
    }
}

fn default_category() -> String {
    "electronics".to_string()
}

fn default_ratings() -> f64 {
    4.0
}

fn default_no_of_ratings() -> i64 {
    100
}

/// One product to price, as received from a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDescriptor {
    pub product_name: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_ratings")]
    pub ratings: f64,
    #[serde(default = "default_no_of_ratings")]
    pub no_of_ratings: i64,
    #[serde(default)]
    pub discount_ratio: f64,
}

impl ProductDescriptor {
    /// A descriptor with default category and numeric signals.
    pub fn new(product_name: impl Into<String>) -> Self {
        Self {
            product_name: product_name.into(),
            category: default_category(),
            ratings: default_ratings(),
            no_of_ratings: default_no_of_ratings(),
            discount_ratio: 0.0,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_signals(mut self, ratings: f64, no_of_ratings: i64, discount_ratio: f64) -> Self {
        self.ratings = ratings;
        self.no_of_ratings = no_of_ratings;
        self.discount_ratio = discount_ratio;
        self
    }

    /// Range checks applied before anything reaches the model.
    pub fn validate(&self) -> Result<()> {
        if self.product_name.trim().is_empty() {
            return Err(Error::InvalidInput("product_name must not be empty".into()));
        }
        if self.category.trim().is_empty() {
            return Err(Error::InvalidInput("category must not be empty".into()));
        }
        if !self.ratings.is_finite() || !(0.0..=5.0).contains(&self.ratings) {
            return Err(Error::InvalidInput(format!(
                "ratings must be within [0, 5], got {}",
                self.ratings
            )));
        }
        if self.no_of_ratings < 0 {
            return Err(Error::InvalidInput(format!(
                "no_of_ratings must be non-negative, got {}",
                self.no_of_ratings
            )));
        }
        if !self.discount_ratio.is_finite() || !(0.0..=1.0).contains(&self.discount_ratio) {
            return Err(Error::InvalidInput(format!(
                "discount_ratio must be within [0, 1], got {}",
                self.discount_ratio
            )));
        }
        Ok(())
    }

    /// Trimmed name, trimmed lowercase category.
    pub fn normalized(&self) -> Self {
        Self {
            product_name: self.product_name.trim().to_string(),
            category: self.category.trim().to_lowercase(),
            ..self.clone()
        }
    }
}

/// A product encoded into its three tokens, with fallback flags.
#[derive(Debug, Clone)]
pub struct EncodedProduct {
    pub sequence: TokenSequence,
    pub text_fallback: bool,
    pub category_fallback: bool,
}

/// Loaded multimodal price predictor.
///
/// Immutable after construction; share it behind an `Arc` for concurrent use.
pub struct PricePredictor {
    text_encoder: BertTextEncoder,
    categories: CategoryEncoderState,
    transformer: PriceTransformer,
}

impl PricePredictor {
    /// Load everything from `config.artifact_dir` on the preferred device.
    pub fn initialize(config: &PredictorConfig) -> Result<Self> {
        let device = preferred_device(config.cuda_device);
        Self::load(config, &device)
    }

    /// Load everything from `config.artifact_dir` on `device`.
    ///
    /// Fails with [`Error::WeightLoad`] when the checkpoint is missing or does
    /// not match the model config, or when the text model width cannot be
    /// mapped to `d_model`.
    pub fn load(config: &PredictorConfig, device: &Device) -> Result<Self> {
        let paths = ArtifactPaths::new(&config.artifact_dir);
        tracing::info!(dir = %paths.dir().display(), device = ?device, "loading price predictor");

        let model_cfg = paths.load_model_config()?;
        let checkpoint = checkpoint_var_builder(&paths.checkpoint(), config.dtype, device)?;
        let transformer = PriceTransformer::new(&model_cfg, checkpoint.clone())?;

        let text_files = paths.resolve_text_model(&config.text, config.allow_download)?;
        let text_encoder = BertTextEncoder::load(
            &text_files,
            &config.text,
            &checkpoint,
            model_cfg.d_model,
            device,
            config.dtype,
        )?;

        let categories = CategoryEncoderState::load_or_absent(&paths.category_encoder());

        let predictor = Self::from_parts(text_encoder, categories, transformer)?;
        tracing::info!(d_model = model_cfg.d_model, "price predictor ready");
        Ok(predictor)
    }

    /// Assemble from already-loaded components.
    pub fn from_parts(
        text_encoder: BertTextEncoder,
        categories: CategoryEncoderState,
        transformer: PriceTransformer,
    ) -> Result<Self> {
        let d_model = transformer.config().d_model;
        if text_encoder.d_model() != d_model {
            return Err(Error::WeightLoad(format!(
                "text encoder produces width {}, transformer expects d_model {d_model}",
                text_encoder.d_model()
            )));
        }
        Ok(Self {
            text_encoder,
            categories,
            transformer,
        })
    }

    pub fn model_config(&self) -> &ModelConfig {
        self.transformer.config()
    }

    pub fn device(&self) -> &Device {
        self.transformer.device()
    }

    pub fn dtype(&self) -> DType {
        self.transformer.dtype()
    }

    /// Run the three encoders and assemble `[TEXT, CATEGORY, NUMERIC]`.
    pub fn encode(
        &self,
        product_name: &str,
        category: &str,
        ratings: f64,
        no_of_ratings: u64,
        discount_ratio: f64,
    ) -> Result<EncodedProduct> {
        let d_model = self.model_config().d_model;
        let text = self.text_encoder.encode(product_name)?;
        let category = self.categories.encode(category, d_model);
        let numeric = encode_numeric(ratings, no_of_ratings, discount_ratio, d_model);

        let text_fallback = text.used_fallback;
        let category_fallback = category.used_fallback;
        let sequence = TokenSequence::new(
            text.embedding,
            category.embedding,
            numeric.embedding,
            d_model,
        )?;
        Ok(EncodedProduct {
            sequence,
            text_fallback,
            category_fallback,
        })
    }

    /// Predict the price of one product.
    ///
    /// Inputs are assumed range-checked; see [`ProductDescriptor::validate`].
    pub fn predict_price(
        &self,
        product_name: &str,
        category: &str,
        ratings: f64,
        no_of_ratings: u64,
        discount_ratio: f64,
    ) -> Result<PredictionResult> {
        let encoded = self.encode(product_name, category, ratings, no_of_ratings, discount_ratio)?;
        let log_price = self.transformer.predict_log_price(&encoded.sequence)?;
        let result = PredictionResult::from_log_price(log_price);
        tracing::debug!(
            log_price,
            price = result.predicted_price,
            confidence = result.confidence,
            text_fallback = encoded.text_fallback,
            category_fallback = encoded.category_fallback,
            "predicted price"
        );
        Ok(result)
    }

    /// Validate, normalize, and predict one descriptor.
    pub fn predict(&self, item: &ProductDescriptor) -> Result<PredictionResult> {
        item.validate()?;
        let item = item.normalized();
        self.predict_price(
            &item.product_name,
            &item.category,
            item.ratings,
            item.no_of_ratings as u64,
            item.discount_ratio,
        )
    }

    /// Predict each item independently, preserving order.
    ///
    /// A failing item yields an `Err` at its index; the others still run.
    pub fn predict_batch(&self, items: &[ProductDescriptor]) -> Vec<Result<PredictionResult>> {
        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let result = self.predict(item);
                if let Err(error) = &result {
                    tracing::warn!(index, %error, "batch item failed");
                }
                result
            })
            .collect()
    }

    /// Known category labels, sorted.
    pub fn available_categories(&self) -> Vec<String> {
        self.categories.available_categories()
    }

    /// Attention-pooling weights over `[TEXT, CATEGORY, NUMERIC]`.
    pub fn attention_weights(
        &self,
        product_name: &str,
        category: &str,
        ratings: f64,
        no_of_ratings: u64,
        discount_ratio: f64,
    ) -> Result<[f32; NUM_TOKENS]> {
        let encoded = self.encode(product_name, category, ratings, no_of_ratings, discount_ratio)?;
        self.transformer.sequence_attention(&encoded.sequence)
    }
}
