//! Price predictor CLI.
//!
//! Loads the predictor from an artifact directory and prices products given on
//! the command line or in a JSON file. Also writes fresh, seeded checkpoints.
//!
//! # Output
//!
//! Every subcommand prints one JSON document to stdout:
//!
//! ```json
//! {"predicted_price":24999.0,"confidence":0.9,"confidence_percent":90.0,"price_range":[21249.15,28748.85]}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use anyhow::Context;
use candle_core::{DType, Device};
use clap::{Args as ClapArgs, Parser, Subcommand};
use price_predictor::{
    artifacts::{ArtifactPaths, TextModelFiles},
    config::{ModelConfig, PredictorConfig, TextEncoderConfig, default_artifact_dir},
    model::encoder::category::{CategoryEncoderState, FittedCategories},
    model::encoder::text::TextModelConfig,
    model::transformer::init,
    pipeline::{PredictionResult, PricePredictor, ProductDescriptor},
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "price-predict",
    about = "Multimodal e-commerce price prediction",
    long_about = "Predict a product price from its name, category, ratings, and discount.\n\
                  Downloads the text model from HuggingFace on first run unless --offline."
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct CommonArgs {
    /// Artifact directory holding the checkpoint and side files.
    #[arg(long, global = true)]
    artifacts: Option<PathBuf>,

    /// CUDA device ordinal (0 = first GPU).
    #[arg(long, global = true, default_value_t = 0)]
    device: usize,

    /// Never download the text model; require a local copy.
    #[arg(long, global = true, default_value_t = false)]
    offline: bool,

    /// HuggingFace repo of the text model.
    #[arg(long, global = true, default_value = "bert-base-uncased")]
    text_model: String,

    /// Maximum text tokens per product name.
    #[arg(long, global = true, default_value_t = 128)]
    max_length: usize,
}

impl CommonArgs {
    fn predictor_config(&self) -> PredictorConfig {
        PredictorConfig {
            artifact_dir: self.artifacts.clone().unwrap_or_else(default_artifact_dir),
            text: TextEncoderConfig {
                max_length: self.max_length,
                hf_repo: self.text_model.clone(),
                ..TextEncoderConfig::default()
            },
            cuda_device: self.device,
            allow_download: !self.offline,
            ..PredictorConfig::default()
        }
    }
}

#[derive(ClapArgs, Debug)]
struct ProductArgs {
    /// Product name.
    #[arg(long, short = 'n')]
    name: String,

    /// Product category.
    #[arg(long, short = 'c', default_value = "electronics")]
    category: String,

    /// Average rating, 0–5.
    #[arg(long, short = 'r', default_value_t = 4.0)]
    ratings: f64,

    /// Number of ratings.
    #[arg(long, default_value_t = 100)]
    num_ratings: i64,

    /// Discount as a fraction, 0–1.
    #[arg(long, short = 'd', default_value_t = 0.0)]
    discount: f64,
}

impl ProductArgs {
    fn descriptor(&self) -> ProductDescriptor {
        ProductDescriptor::new(self.name.clone())
            .with_category(self.category.clone())
            .with_signals(self.ratings, self.num_ratings, self.discount)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Predict the price of one product.
    Predict(ProductArgs),

    /// Predict every product in a JSON array file.
    Batch {
        /// JSON file: `[{"product_name": ..., "category": ..., ...}, ...]`.
        file: PathBuf,
    },

    /// List known categories.
    Categories,

    /// Show attention-pooling weights over [text, category, numeric].
    Attention(ProductArgs),

    /// Write a freshly initialized checkpoint and its model config.
    InitCheckpoint {
        /// Output directory (defaults to the artifact directory).
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,

        /// Seed for weight initialization.
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Embedding width.
        #[arg(long, default_value_t = 128)]
        d_model: usize,

        /// Attention heads per encoder layer.
        #[arg(long, default_value_t = 4)]
        nhead: usize,

        /// Number of encoder layers.
        #[arg(long, default_value_t = 2)]
        num_layers: usize,

        /// Fitted category labels, comma-separated, written to category_encoder.json.
        #[arg(long, value_delimiter = ',')]
        categories: Vec<String>,
    },
}

#[derive(Serialize)]
struct PredictionOutput {
    predicted_price: f64,
    confidence: f64,
    confidence_percent: f64,
    price_range: (f64, f64),
}

impl From<PredictionResult> for PredictionOutput {
    fn from(result: PredictionResult) -> Self {
        Self {
            predicted_price: result.predicted_price,
            confidence: result.confidence,
            confidence_percent: result.confidence_percent(),
            price_range: result.price_range(),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum BatchItemOutput {
    Ok(PredictionOutput),
    Err { error: String },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.common.predictor_config();

    match cli.command {
        Command::Predict(product) => {
            let predictor = load(&config)?;
            let result = predictor.predict(&product.descriptor())?;
            print_json(&PredictionOutput::from(result))
        }
        Command::Batch { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let items: Vec<ProductDescriptor> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", file.display()))?;
            let predictor = load(&config)?;
            let outputs: Vec<BatchItemOutput> = predictor
                .predict_batch(&items)
                .into_iter()
                .map(|result| match result {
                    Ok(result) => BatchItemOutput::Ok(result.into()),
                    Err(e) => BatchItemOutput::Err {
                        error: e.to_string(),
                    },
                })
                .collect();
            print_json(&outputs)
        }
        Command::Categories => {
            // Only the category encoder is needed; skip loading the models.
            let paths = ArtifactPaths::new(&config.artifact_dir);
            let state = CategoryEncoderState::load_or_absent(&paths.category_encoder());
            print_json(&state.available_categories())
        }
        Command::Attention(product) => {
            let item = product.descriptor();
            item.validate()?;
            let item = item.normalized();
            let predictor = load(&config)?;
            let weights = predictor.attention_weights(
                &item.product_name,
                &item.category,
                item.ratings,
                item.no_of_ratings as u64,
                item.discount_ratio,
            )?;
            print_json(&serde_json::json!({
                "text": weights[0],
                "category": weights[1],
                "numeric": weights[2],
            }))
        }
        Command::InitCheckpoint {
            output,
            seed,
            d_model,
            nhead,
            num_layers,
            categories,
        } => {
            let dir = output.unwrap_or_else(|| config.artifact_dir.clone());
            let model_cfg = ModelConfig {
                d_model,
                nhead,
                num_layers,
                ..ModelConfig::default()
            };
            init_checkpoint(&config, &dir, &model_cfg, seed, categories)
        }
    }
}

fn load(config: &PredictorConfig) -> anyhow::Result<PricePredictor> {
    tracing::info!("Loading price predictor from {:?}", config.artifact_dir);
    PricePredictor::initialize(config).map_err(|e| anyhow::anyhow!("failed to load predictor: {e}"))
}

/// Write `price_transformer.safetensors`, `model_config.json`, and optionally
/// `category_encoder.json`. A projection is included when the text model
/// width differs from `d_model`.
fn init_checkpoint(
    config: &PredictorConfig,
    dir: &std::path::Path,
    model_cfg: &ModelConfig,
    seed: u64,
    categories: Vec<String>,
) -> anyhow::Result<()> {
    model_cfg.validate()?;
    std::fs::create_dir_all(dir)?;
    let paths = ArtifactPaths::new(dir);

    let source = ArtifactPaths::new(&config.artifact_dir);
    let text_files: TextModelFiles = source.resolve_text_model(&config.text, config.allow_download)?;
    let text_cfg = TextModelConfig::from_json(&std::fs::read_to_string(&text_files.config)?)?;

    let weights = init::initialize_weights(model_cfg, Some(text_cfg.hidden_size), seed, &Device::Cpu)?;
    init::save_checkpoint(&weights, DType::F32, &paths.checkpoint())?;
    std::fs::write(paths.model_config(), serde_json::to_string_pretty(model_cfg)?)?;

    if !categories.is_empty() {
        CategoryEncoderState::Fitted(FittedCategories::new(categories))
            .save(&paths.category_encoder())?;
    }

    print_json(&serde_json::json!({
        "checkpoint": paths.checkpoint(),
        "model_config": paths.model_config(),
        "tensors": weights.len(),
        "seed": seed,
    }))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
