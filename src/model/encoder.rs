//! Input encoders, one per token role.
//!
//! - [`text`]: BERT `[CLS]` embedding, optionally projected to `d_model`
//! - [`category`]: fitted label index or stable-hash fallback, one-hot
//! - [`numeric`]: four derived scalars tiled across `d_model`

pub mod category;
pub mod numeric;
pub mod text;
