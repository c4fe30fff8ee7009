//! Price prediction daemon: Unix socket, line-delimited JSON.
//!
//! Keeps the predictor resident across requests. Each client connection sends
//! one JSON request line and receives one JSON response line, then closes.
//!
//! # Socket path
//!
//! Default: `/tmp/price-predictor.sock`. Override with `--socket`.
//!
//! # Protocol
//!
//! **Requests** (one JSON line, tagged by `op`):
//! ```json
//! {"op": "predict", "product_name": "Samsung Galaxy S21 5G Smartphone",
//!  "category": "electronics", "ratings": 4.5, "no_of_ratings": 1500, "discount_ratio": 0.15}
//! {"op": "predict_batch", "items": [{"product_name": "Nike Air Zoom"}, ...]}
//! {"op": "categories"}
//! {"op": "health"}
//! ```
//! `category`, `ratings`, `no_of_ratings`, and `discount_ratio` are optional
//! and default to `"electronics"`, `4.0`, `100`, and `0.0`.
//!
//! **Response on success** (one JSON line):
//! ```json
//! {"ok": true, "predicted_price": 24999.0, "confidence": 90.0, "price_range": [21249.15, 28748.85]}
//! ```
//! Batch responses carry `results`, one entry per item in input order; a
//! failed item is `{"ok": false, "error": "..."}` and does not fail the batch.
//!
//! **Response on error** (one JSON line):
//! ```json
//! {"ok": false, "error": "invalid input: ratings must be within [0, 5], got 7"}
//! ```
//!
//! # Example (shell)
//!
//! ```sh
//! echo '{"op":"predict","product_name":"Nike Air Zoom","category":"sports"}' \
//!   | socat - UNIX-CONNECT:/tmp/price-predictor.sock
//! ```

use std::path::PathBuf;

use clap::Parser;
use price_predictor::{
    config::{PredictorConfig, TextEncoderConfig, default_artifact_dir},
    manager::PredictorService,
    pipeline::{PredictionResult, ProductDescriptor},
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "price-daemon",
    about = "Price prediction daemon, resident predictor, Unix socket JSON interface"
)]
struct Args {
    /// Unix socket path to listen on.
    #[arg(long, default_value = "/tmp/price-predictor.sock")]
    socket: PathBuf,

    /// Artifact directory holding the checkpoint and side files.
    #[arg(long)]
    artifacts: Option<PathBuf>,

    /// CUDA device ordinal (0 = first GPU).
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Never download the text model; require a local copy.
    #[arg(long, default_value_t = false)]
    offline: bool,

    /// HuggingFace repo of the text model.
    #[arg(long, default_value = "bert-base-uncased")]
    text_model: String,

    /// Maximum text tokens per product name.
    #[arg(long, default_value_t = 128)]
    max_length: usize,

    /// Defer loading until the first request instead of loading at startup.
    #[arg(long, default_value_t = false)]
    lazy: bool,
}

// ── Wire types ───────────────────────────────────────────────────────────────

/// A request received over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Predict(ProductDescriptor),
    PredictBatch { items: Vec<ProductDescriptor> },
    Categories,
    Health,
}

/// One priced product as sent to clients. `confidence` is a percentage.
#[derive(Debug, Serialize)]
struct Prediction {
    ok: bool, // always true
    predicted_price: f64,
    confidence: f64,
    price_range: (f64, f64),
}

impl From<PredictionResult> for Prediction {
    fn from(result: PredictionResult) -> Self {
        Self {
            ok: true,
            predicted_price: result.predicted_price,
            confidence: result.confidence_percent(),
            price_range: result.price_range(),
        }
    }
}

/// Response sent back to the client.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Prediction(Prediction),
    Batch {
        ok: bool, // always true
        results: Vec<Response>,
    },
    Categories {
        ok: bool, // always true
        categories: Vec<String>,
    },
    Health {
        ok: bool, // always true
        loaded: bool,
    },
    Err {
        ok: bool, // always false
        error: String,
    },
}

impl Response {
    fn prediction(result: price_predictor::Result<PredictionResult>) -> Self {
        match result {
            Ok(result) => Self::Prediction(result.into()),
            Err(e) => Self::err(e.to_string()),
        }
    }

    fn err(msg: impl Into<String>) -> Self {
        Self::Err {
            ok: false,
            error: msg.into(),
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Remove stale socket file if present.
    if args.socket.exists() {
        std::fs::remove_file(&args.socket)?;
    }

    // Bind first so clients can connect while the predictor loads.
    let listener = UnixListener::bind(&args.socket)?;
    tracing::info!("Listening on {:?}", args.socket);

    let config = PredictorConfig {
        artifact_dir: args.artifacts.clone().unwrap_or_else(default_artifact_dir),
        text: TextEncoderConfig {
            max_length: args.max_length,
            hf_repo: args.text_model.clone(),
            ..TextEncoderConfig::default()
        },
        cuda_device: args.device,
        allow_download: !args.offline,
        ..PredictorConfig::default()
    };
    let service = PredictorService::new(config);

    if !args.lazy {
        tracing::info!("Loading predictor...");
        service.warm_up().await?;
        tracing::info!("Predictor ready");
    }

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, service).await {
                        tracing::warn!("connection error: {e}");
                    }
                });
            }
            Err(e) => {
                tracing::error!("accept error: {e}");
            }
        }
    }
}

// ── Connection handler ────────────────────────────────────────────────────────

async fn handle_connection(stream: UnixStream, service: PredictorService) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // Read exactly one line (the JSON request).
    let line = match lines.next_line().await? {
        Some(l) if !l.trim().is_empty() => l,
        _ => {
            send_response(&mut writer, Response::err("empty request")).await?;
            return Ok(());
        }
    };

    let response = process_request(&line, &service).await;
    send_response(&mut writer, response).await?;
    Ok(())
}

async fn process_request(line: &str, service: &PredictorService) -> Response {
    let req: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return Response::err(format!("invalid JSON request: {e}")),
    };

    match req {
        Request::Predict(item) => {
            tracing::info!(product = %item.product_name, category = %item.category, "predict");
            Response::prediction(service.predict(item).await)
        }
        Request::PredictBatch { items } => {
            tracing::info!(items = items.len(), "predict_batch");
            match service.predict_batch(items).await {
                Ok(results) => Response::Batch {
                    ok: true,
                    results: results.into_iter().map(Response::prediction).collect(),
                },
                Err(e) => Response::err(format!("batch failed: {e}")),
            }
        }
        Request::Categories => match service.categories().await {
            Ok(categories) => Response::Categories { ok: true, categories },
            Err(e) => Response::err(format!("could not list categories: {e}")),
        },
        Request::Health => Response::Health {
            ok: true,
            loaded: service.is_loaded(),
        },
    }
}

async fn send_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: Response,
) -> anyhow::Result<()> {
    let mut json = serde_json::to_string(&response)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}
