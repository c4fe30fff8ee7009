//! Model components for multimodal price prediction.
//!
//! ## Components
//!
//! - [`tokens`]: token roles, embeddings, and the fixed 3-token sequence
//! - [`encoder`]: text (BERT), category, and numeric feature encoders
//! - [`transformer`]: the multimodal transformer with attention pooling

pub mod encoder;
pub mod tokens;
pub mod transformer;
