//! Building blocks of the price transformer.
//!
//! - [`EncoderLayer`]: pre-norm self-attention + pre-norm ReLU feed-forward
//! - [`PriceHead`]: LayerNorm → Linear(D, D/2) → ReLU → Linear(D/2, 1)
//!
//! Dropout only acts during training; these layers are inference-only, so it
//! is the identity and is not represented.

use candle_core::{Module, Result, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use super::attention::MultiHeadAttention;
use crate::config::ModelConfig;

/// LayerNorm epsilon used throughout the model.
pub const LAYER_NORM_EPS: f64 = 1e-5;

// ---------------------------------------------------------------------------
// Encoder layer
// ---------------------------------------------------------------------------

/// Transformer encoder layer with pre-normalization.
///
/// ```text
/// x = x + SelfAttn(norm1(x))
/// x = x + linear2(relu(linear1(norm2(x))))
/// ```
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    self_attn: MultiHeadAttention,
    linear1: Linear,
    linear2: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
}

impl EncoderLayer {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let d = cfg.d_model;
        Ok(Self {
            self_attn: MultiHeadAttention::load(vb.pp("self_attn"), d, cfg.nhead)?,
            linear1: candle_nn::linear(d, cfg.ff_dim(), vb.pp("linear1"))?,
            linear2: candle_nn::linear(cfg.ff_dim(), d, vb.pp("linear2"))?,
            norm1: candle_nn::layer_norm(d, LAYER_NORM_EPS, vb.pp("norm1"))?,
            norm2: candle_nn::layer_norm(d, LAYER_NORM_EPS, vb.pp("norm2"))?,
        })
    }

    /// `hidden_states`: `[B, S, D]` → `[B, S, D]`
    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        // Self-attention with residual
        let h = self.norm1.forward(hidden_states)?;
        let (attn, _) = self.self_attn.forward(&h, &h, &h)?;
        let h = (hidden_states + attn)?;

        // Feed-forward with residual
        let ff = self
            .norm2
            .forward(&h)?
            .apply(&self.linear1)?
            .relu()?
            .apply(&self.linear2)?;
        &h + ff
    }
}

// ---------------------------------------------------------------------------
// Regression head
// ---------------------------------------------------------------------------

/// Regression head mapping a pooled vector to one log-price.
///
/// Weight names keep the sequential layer indices of the checkpoint
/// (`0` norm, `1` reduce, `4` output).
#[derive(Debug, Clone)]
pub struct PriceHead {
    norm: LayerNorm,
    reduce: Linear,
    out: Linear,
}

impl PriceHead {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let d = cfg.d_model;
        let hidden = cfg.head_hidden();
        Ok(Self {
            norm: candle_nn::layer_norm(d, LAYER_NORM_EPS, vb.pp("0"))?,
            reduce: candle_nn::linear(d, hidden, vb.pp("1"))?,
            out: candle_nn::linear(hidden, 1, vb.pp("4"))?,
        })
    }
}

impl Module for PriceHead {
    /// `[B, D]` → `[B, 1]`
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.norm)?
            .apply(&self.reduce)?
            .relu()?
            .apply(&self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn small_cfg() -> ModelConfig {
        ModelConfig {
            d_model: 16,
            nhead: 2,
            num_layers: 1,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_encoder_layer_shape() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layer = EncoderLayer::new(&cfg, vb.pp("layer")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 16), &dev).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 3, 16]);
    }

    #[test]
    fn test_zero_weights_are_residual_identity() {
        // With all-zero parameters every sub-block outputs zero, so the
        // residual stream passes through untouched.
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let layer = EncoderLayer::new(&cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 3, 16), &dev).unwrap();
        let y = layer.forward(&x).unwrap();
        let diff: f32 = (y - &x)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_price_head_shape() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let head = PriceHead::new(&cfg, vb.pp("price_head")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (4, 16), &dev).unwrap();
        assert_eq!(head.forward(&x).unwrap().dims(), &[4, 1]);
    }
}
