//! Predictor service: loads the predictor once and serves async callers.
//!
//! The service owns at most one [`PricePredictor`]. The first caller to need
//! it triggers the load inside `spawn_blocking`; concurrent callers wait on
//! the same load rather than starting their own. Inference runs on the
//! blocking pool against a shared `Arc`, so the model stays read-only.
//!
//! # Example
//!
//! ```no_run
//! use price_predictor::config::PredictorConfig;
//! use price_predictor::manager::PredictorService;
//! use price_predictor::pipeline::ProductDescriptor;
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = PredictorService::new(PredictorConfig::default());
//!     let result = service
//!         .predict(ProductDescriptor::new("Samsung Galaxy S21 5G Smartphone"))
//!         .await
//!         .unwrap();
//!     println!("{:.2} ({:.0}%)", result.predicted_price, result.confidence_percent());
//! }
//! ```

use std::sync::Arc;

use candle_core::Device;
use tokio::sync::OnceCell;

use crate::config::PredictorConfig;
use crate::pipeline::{PredictionResult, PricePredictor, ProductDescriptor};
use crate::{Error, Result};

/// Handle to a lazily loaded, shared predictor.
#[derive(Clone)]
pub struct PredictorService {
    config: Arc<PredictorConfig>,
    predictor: Arc<OnceCell<Arc<PricePredictor>>>,
}

impl PredictorService {
    /// Create the service without loading anything yet.
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            config: Arc::new(config),
            predictor: Arc::new(OnceCell::new()),
        }
    }

    /// Wrap an already-loaded predictor.
    pub fn with_predictor(config: PredictorConfig, predictor: PricePredictor) -> Self {
        Self {
            config: Arc::new(config),
            predictor: Arc::new(OnceCell::new_with(Some(Arc::new(predictor)))),
        }
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    /// True once a load has succeeded.
    pub fn is_loaded(&self) -> bool {
        self.predictor.initialized()
    }

    /// The shared predictor, loading it on first use.
    ///
    /// A failed load leaves the cell empty, so a later call retries.
    pub async fn get(&self) -> Result<Arc<PricePredictor>> {
        let predictor = self
            .predictor
            .get_or_try_init(|| async {
                let config = Arc::clone(&self.config);
                tokio::task::spawn_blocking(move || -> Result<PricePredictor> {
                    PricePredictor::initialize(&config)
                })
                .await
                .map_err(|join_error| {
                    Error::Manager(format!("predictor load task panicked: {join_error}"))
                })?
                .map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(predictor))
    }

    /// Load eagerly, logging how long it took.
    pub async fn warm_up(&self) -> Result<()> {
        let started = std::time::Instant::now();
        self.get().await?;
        tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "predictor warm");
        Ok(())
    }

    /// Predict one product.
    pub async fn predict(&self, item: ProductDescriptor) -> Result<PredictionResult> {
        let predictor = self.get().await?;
        run_blocking(move || predictor.predict(&item)).await?
    }

    /// Predict a batch; per-item results keep input order.
    pub async fn predict_batch(
        &self,
        items: Vec<ProductDescriptor>,
    ) -> Result<Vec<Result<PredictionResult>>> {
        let predictor = self.get().await?;
        run_blocking(move || predictor.predict_batch(&items)).await
    }

    /// Known category labels.
    pub async fn categories(&self) -> Result<Vec<String>> {
        Ok(self.get().await?.available_categories())
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|join_error| Error::Manager(format!("inference task panicked: {join_error}")))
}

/// Return the preferred device: CUDA if available, otherwise CPU.
pub fn preferred_device(cuda_ordinal: usize) -> Device {
    Device::cuda_if_available(cuda_ordinal).unwrap_or(Device::Cpu)
}
