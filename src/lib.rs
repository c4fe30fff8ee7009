//! Multimodal e-commerce price prediction in pure Rust.
//!
//! A candle-based transformer that prices a product from its name, its
//! category, and a few numeric signals. Loads safetensors checkpoints laid out
//! like the trained model's state dict, so exported weights load unchanged.
//!
//! ## Architecture
//!
//! Every prediction is a 3-token sequence:
//!
//! ```text
//! product name ─→ BERT [CLS] ────────────┐
//! category ─────→ one-hot (fitted/hash) ─┼→ [TEXT, CATEGORY, NUMERIC]
//! ratings/count/discount → tiled ────────┘            ↓
//!                       + positional & token-type embeddings
//!                                                     ↓
//!                           pre-norm encoder layers (ReLU FFN)
//!                                                     ↓
//!                        attention pooling → regression head
//!                                                     ↓
//!                        log-price clamped to [2, 13] → exp
//! ```
//!
//! ## Modules
//!
//! - [`config`]: model hyperparameters and predictor settings
//! - [`artifacts`]: artifact directory layout, text model resolution
//! - [`model`]: the three encoders, token types, and the transformer
//! - [`pipeline`]: [`pipeline::PricePredictor`], confidence heuristic, batch API
//! - [`manager`]: async service with at-most-once loading

pub mod artifacts;
pub mod config;
pub mod manager;
pub mod model;
pub mod pipeline;

mod error;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
