//! Numeric feature encoder.
//!
//! Four derived scalars are tiled cyclically across the full `d_model` width
//! (`embedding[i] = features[i % 4]`), giving the numeric token signal in every
//! dimension without a learned projection.

use crate::model::tokens::{EncodingResult, TokenEmbedding, TokenRole};

/// Number of derived numeric features.
pub const NUM_NUMERIC_FEATURES: usize = 4;

/// Derived features, computed in f64:
///
/// 1. `ratings / 5`
/// 2. `ln(1 + no_of_ratings) / 10`
/// 3. `discount_ratio`
/// 4. `ratings * ln(1 + no_of_ratings) / 30`
///
/// Inputs are expected to be range-checked by the caller.
pub fn numeric_features(ratings: f64, no_of_ratings: u64, discount_ratio: f64) -> [f64; NUM_NUMERIC_FEATURES] {
    let log_count = (no_of_ratings as f64).ln_1p();
    [
        ratings / 5.0,
        log_count / 10.0,
        discount_ratio,
        ratings * log_count / 30.0,
    ]
}

/// Encode numeric signals into a `d_model`-wide token.
pub fn encode_numeric(
    ratings: f64,
    no_of_ratings: u64,
    discount_ratio: f64,
    d_model: usize,
) -> EncodingResult {
    let features = numeric_features(ratings, no_of_ratings, discount_ratio);
    let values = (0..d_model)
        .map(|i| features[i % NUM_NUMERIC_FEATURES] as f32)
        .collect();
    EncodingResult::direct(TokenEmbedding::new(TokenRole::Numeric, values))
}
