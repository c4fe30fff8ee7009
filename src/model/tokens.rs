//! Token types shared by the encoders and the transformer.
//!
//! Every prediction produces exactly three [`TokenEmbedding`]s which are
//! assembled into a [`TokenSequence`] in the fixed order
//! `[TEXT, CATEGORY, NUMERIC]`. The transformer's positional and token-type
//! tables are indexed by that position, so the order is enforced at
//! construction rather than trusted.

use candle_core::{Device, Tensor};

use crate::config::NUM_TOKENS;
use crate::{Error, Result};

/// Role of a token in the sequence. The discriminant is its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenRole {
    Text = 0,
    Category = 1,
    Numeric = 2,
}

impl TokenRole {
    /// All roles in sequence order.
    pub const ORDER: [TokenRole; NUM_TOKENS] =
        [TokenRole::Text, TokenRole::Category, TokenRole::Numeric];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// One `d_model`-wide embedding vector tagged with its role.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenEmbedding {
    role: TokenRole,
    values: Vec<f32>,
}

impl TokenEmbedding {
    pub fn new(role: TokenRole, values: Vec<f32>) -> Self {
        Self { role, values }
    }

    pub fn role(&self) -> TokenRole {
        self.role
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn width(&self) -> usize {
        self.values.len()
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }
}

/// Output of an encoder, recording whether a fallback path produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingResult {
    pub embedding: TokenEmbedding,
    pub used_fallback: bool,
}

impl EncodingResult {
    pub fn direct(embedding: TokenEmbedding) -> Self {
        Self {
            embedding,
            used_fallback: false,
        }
    }

    pub fn fallback(embedding: TokenEmbedding) -> Self {
        Self {
            embedding,
            used_fallback: true,
        }
    }
}

/// The model's only accepted input: three finite, equal-width tokens in role order.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSequence {
    tokens: [TokenEmbedding; NUM_TOKENS],
}

impl TokenSequence {
    /// Assemble `[text, category, numeric]`.
    ///
    /// Fails with [`Error::Encoding`] if a token carries the wrong role, the
    /// widths differ from `d_model`, or any value is NaN/infinite.
    pub fn new(
        text: TokenEmbedding,
        category: TokenEmbedding,
        numeric: TokenEmbedding,
        d_model: usize,
    ) -> Result<Self> {
        let tokens = [text, category, numeric];
        for (token, expected) in tokens.iter().zip(TokenRole::ORDER) {
            if token.role != expected {
                return Err(Error::Encoding(format!(
                    "token at position {} has role {:?}, expected {:?}",
                    expected.index(),
                    token.role,
                    expected
                )));
            }
            if token.width() != d_model {
                return Err(Error::Encoding(format!(
                    "{:?} token has width {}, expected d_model={d_model}",
                    token.role,
                    token.width()
                )));
            }
            if let Some(pos) = token.values.iter().position(|v| !v.is_finite()) {
                return Err(Error::Encoding(format!(
                    "{:?} token has non-finite value at index {pos}",
                    token.role
                )));
            }
        }
        Ok(Self { tokens })
    }

    pub fn d_model(&self) -> usize {
        self.tokens[0].width()
    }

    pub fn token(&self, role: TokenRole) -> &TokenEmbedding {
        &self.tokens[role.index()]
    }

    /// Stack into a `[1, 3, d_model]` f32 tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let d_model = self.d_model();
        let flat: Vec<f32> = self
            .tokens
            .iter()
            .flat_map(|t| t.values.iter().copied())
            .collect();
        Ok(Tensor::from_vec(flat, (1, NUM_TOKENS, d_model), device)?)
    }
}
