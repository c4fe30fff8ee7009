//! Multimodal price transformer.
//!
//! A compact pre-norm encoder over the 3-token sequence
//! `[TEXT, CATEGORY, NUMERIC]`:
//!
//! ```text
//! tokens [B, 3, D]
//!   + pos_encoding[3, D]            (learned per-position offset)
//!   + token_type_embedding[role]    (learned per-role offset)
//!   → N × EncoderLayer              (pre-norm self-attn + ReLU FFN)
//!   → attention pooling             (TEXT position queries all 3 tokens, 1 head)
//!   → PriceHead                     (LN → D/2 → ReLU → 1)
//!   → clamp [min_price_log, max_price_log]
//! ```
//!
//! Weight names match the state dict of the trained model, so an
//! exported checkpoint loads without renaming.

pub mod attention;
pub mod init;
pub mod layers;

use std::path::Path;

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Embedding, VarBuilder};

use self::attention::MultiHeadAttention;
use self::layers::{EncoderLayer, PriceHead};
use crate::config::{ModelConfig, NUM_TOKENS};
use crate::model::tokens::TokenSequence;
use crate::{Error, Result};

/// Memory-map a safetensors checkpoint.
///
/// A missing file is reported as [`Error::WeightLoad`], not as a bare I/O error.
pub fn checkpoint_var_builder(
    path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    if !path.exists() {
        return Err(Error::WeightLoad(format!(
            "transformer checkpoint not found: {}",
            path.display()
        )));
    }
    tracing::info!("Loading price transformer weights from {:?}", path);
    unsafe {
        VarBuilder::from_mmaped_safetensors(&[path], dtype, device)
            .map_err(|e| Error::WeightLoad(format!("{}: {e}", path.display())))
    }
}

/// The multimodal price regression model. Immutable after construction.
#[derive(Debug, Clone)]
pub struct PriceTransformer {
    pos_encoding: Tensor,
    token_type_embedding: Embedding,
    layers: Vec<EncoderLayer>,
    attention_pooling: MultiHeadAttention,
    price_head: PriceHead,
    cfg: ModelConfig,
}

impl PriceTransformer {
    /// Build from a VarBuilder scoped at the checkpoint root.
    ///
    /// Any missing tensor or shape disagreement with `cfg` is an
    /// [`Error::WeightLoad`], as is a checkpoint with more encoder layers than
    /// `cfg.num_layers`.
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let load = |e: candle_core::Error| Error::WeightLoad(e.to_string());
        let d = cfg.d_model;

        let pos_encoding = vb.get((NUM_TOKENS, d), "pos_encoding").map_err(load)?;
        let token_type_embedding =
            candle_nn::embedding(NUM_TOKENS, d, vb.pp("token_type_embedding")).map_err(load)?;

        let layers_vb = vb.pp("transformer.layers");
        let mut layers = Vec::with_capacity(cfg.num_layers);
        for i in 0..cfg.num_layers {
            layers.push(EncoderLayer::new(cfg, layers_vb.pp(i)).map_err(load)?);
        }
        let extra = format!("transformer.layers.{}.norm1.weight", cfg.num_layers);
        if vb.contains_tensor(&extra) {
            return Err(Error::WeightLoad(format!(
                "checkpoint has more than num_layers={} encoder layers",
                cfg.num_layers
            )));
        }

        let attention_pooling =
            MultiHeadAttention::load(vb.pp("attention_pooling"), d, 1).map_err(load)?;
        let price_head = PriceHead::new(cfg, vb.pp("price_head")).map_err(load)?;

        Ok(Self {
            pos_encoding,
            token_type_embedding,
            layers,
            attention_pooling,
            price_head,
            cfg: cfg.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    pub fn dtype(&self) -> DType {
        self.pos_encoding.dtype()
    }

    pub fn device(&self) -> &Device {
        self.pos_encoding.device()
    }

    /// Steps 1–3: position + type offsets, then the encoder stack.
    fn encode(&self, tokens: &Tensor) -> candle_core::Result<Tensor> {
        let (_b, seq_len, width) = tokens.dims3()?;
        if seq_len != NUM_TOKENS || width != self.cfg.d_model {
            candle_core::bail!(
                "expected tokens [B, {NUM_TOKENS}, {}], got [_, {seq_len}, {width}]",
                self.cfg.d_model
            );
        }
        let x = tokens.to_dtype(self.dtype())?;
        let x = x.broadcast_add(&self.pos_encoding.unsqueeze(0)?)?;

        // 0 = text, 1 = category, 2 = numeric
        let type_ids = Tensor::arange(0u32, NUM_TOKENS as u32, x.device())?;
        let type_emb = self.token_type_embedding.forward(&type_ids)?;
        let mut h = x.broadcast_add(&type_emb.unsqueeze(0)?)?;

        for layer in &self.layers {
            h = layer.forward(&h)?;
        }
        Ok(h)
    }

    /// Step 4: the TEXT position queries all three encoded tokens.
    ///
    /// Returns `(pooled [B, D], weights [B, 1, 3])`.
    fn pool(&self, encoded: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let query = encoded.narrow(1, 0, 1)?;
        let (pooled, weights) = self.attention_pooling.forward(&query, encoded, encoded)?;
        Ok((pooled.squeeze(1)?, weights))
    }

    /// Forward pass.
    ///
    /// Input: `tokens` `[B, 3, D]` in role order.
    /// Output: `[B]` natural-log prices, clamped to
    /// `[min_price_log, max_price_log]`.
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let encoded = self.encode(tokens)?;
        let (pooled, _) = self.pool(&encoded)?;
        let log_price = self.price_head.forward(&pooled)?.squeeze(D::Minus1)?;
        let clamped = log_price
            .to_dtype(DType::F32)?
            .clamp(self.cfg.min_price_log, self.cfg.max_price_log)?;
        Ok(clamped)
    }

    /// Attention-pooling weights over `[TEXT, CATEGORY, NUMERIC]`: `[B, 1, 3]`.
    ///
    /// Pure function of the input; no state is touched.
    pub fn attention_weights(&self, tokens: &Tensor) -> Result<Tensor> {
        let encoded = self.encode(tokens)?;
        let (_, weights) = self.pool(&encoded)?;
        Ok(weights.to_dtype(DType::F32)?)
    }

    /// Predict one log-price from an assembled sequence.
    ///
    /// A non-finite result means an upstream encoding bug and is returned as
    /// [`Error::Encoding`] rather than passed on.
    pub fn predict_log_price(&self, sequence: &TokenSequence) -> Result<f64> {
        let tokens = sequence.to_tensor(self.device())?;
        let out: Vec<f32> = self.forward(&tokens)?.to_vec1()?;
        let log_price = out
            .first()
            .copied()
            .ok_or_else(|| Error::Encoding("empty model output".into()))? as f64;
        if !log_price.is_finite() {
            return Err(Error::Encoding(format!("non-finite log-price {log_price}")));
        }
        Ok(log_price)
    }

    /// Pooling weights for one sequence as `[text, category, numeric]`.
    pub fn sequence_attention(&self, sequence: &TokenSequence) -> Result<[f32; NUM_TOKENS]> {
        let tokens = sequence.to_tensor(self.device())?;
        let weights: Vec<f32> = self.attention_weights(&tokens)?.flatten_all()?.to_vec1()?;
        let mut out = [0f32; NUM_TOKENS];
        if weights.len() != NUM_TOKENS {
            return Err(Error::Encoding(format!(
                "expected {NUM_TOKENS} attention weights, got {}",
                weights.len()
            )));
        }
        out.copy_from_slice(&weights);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seeded_transformer, seeded_weights, small_model_config};

    fn tokens(values: Vec<f32>, d: usize) -> Tensor {
        Tensor::from_vec(values, (1, NUM_TOKENS, d), &Device::Cpu).unwrap()
    }

    fn random_tokens(d: usize, seed: u64) -> Tensor {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        let values = (0..NUM_TOKENS * d)
            .map(|_| rng.random_range(-1.0f32..1.0))
            .collect();
        tokens(values, d)
    }

    #[test]
    fn test_forward_shape_and_range() {
        let cfg = small_model_config();
        let model = seeded_transformer(&cfg, 1, 7.5);
        let x = Tensor::randn(0f32, 1.0, (4, 3, cfg.d_model), &Device::Cpu).unwrap();
        let out: Vec<f32> = model.forward(&x).unwrap().to_vec1().unwrap();
        assert_eq!(out.len(), 4);
        for v in out {
            assert!(v >= cfg.min_price_log as f32 && v <= cfg.max_price_log as f32);
        }
    }

    #[test]
    fn test_clamp_holds_for_adversarial_inputs() {
        let cfg = small_model_config();
        let d = cfg.d_model;
        let inputs = [
            vec![0f32; NUM_TOKENS * d],
            vec![1e4f32; NUM_TOKENS * d],
            vec![-1e4f32; NUM_TOKENS * d],
            (0..NUM_TOKENS * d)
                .map(|i| if i % 2 == 0 { 1e4 } else { -1e4 })
                .collect(),
        ];
        // Output biases far outside the range force both rails.
        for bias in [-1e3f32, 0.0, 7.5, 1e3] {
            let model = seeded_transformer(&cfg, 11, bias);
            for input in &inputs {
                let out: Vec<f32> = model.forward(&tokens(input.clone(), d)).unwrap().to_vec1().unwrap();
                let v = out[0];
                assert!(v.is_finite(), "bias {bias}: non-finite {v}");
                assert!(v >= cfg.min_price_log as f32, "bias {bias}: {v} below min");
                assert!(v <= cfg.max_price_log as f32, "bias {bias}: {v} above max");
            }
        }
        let high = seeded_transformer(&cfg, 11, 1e3);
        let out: Vec<f32> = high.forward(&random_tokens(d, 0)).unwrap().to_vec1().unwrap();
        assert_eq!(out[0], cfg.max_price_log as f32);
        let low = seeded_transformer(&cfg, 11, -1e3);
        let out: Vec<f32> = low.forward(&random_tokens(d, 0)).unwrap().to_vec1().unwrap();
        assert_eq!(out[0], cfg.min_price_log as f32);
    }

    #[test]
    fn test_token_order_changes_output() {
        let cfg = small_model_config();
        let d = cfg.d_model;
        let model = seeded_transformer(&cfg, 5, 7.5);
        let x = random_tokens(d, 42);
        let swapped = Tensor::cat(
            &[
                &x.narrow(1, 1, 1).unwrap(),
                &x.narrow(1, 0, 1).unwrap(),
                &x.narrow(1, 2, 1).unwrap(),
            ],
            1,
        )
        .unwrap();
        let a: Vec<f32> = model.forward(&x).unwrap().to_vec1().unwrap();
        let b: Vec<f32> = model.forward(&swapped).unwrap().to_vec1().unwrap();
        assert_ne!(a[0].to_bits(), b[0].to_bits());
    }

    #[test]
    fn test_forward_is_deterministic() {
        let cfg = small_model_config();
        let model = seeded_transformer(&cfg, 9, 7.5);
        let x = random_tokens(cfg.d_model, 3);
        let a: Vec<f32> = model.forward(&x).unwrap().to_vec1().unwrap();
        let b: Vec<f32> = model.forward(&x).unwrap().to_vec1().unwrap();
        assert_eq!(a[0].to_bits(), b[0].to_bits());
    }

    #[test]
    fn test_attention_weights_distribution() {
        let cfg = small_model_config();
        let model = seeded_transformer(&cfg, 2, 7.5);
        let x = random_tokens(cfg.d_model, 8);
        let before: Vec<f32> = model.forward(&x).unwrap().to_vec1().unwrap();

        let w = model.attention_weights(&x).unwrap();
        assert_eq!(w.dims(), &[1, 1, 3]);
        let w: Vec<f32> = w.flatten_all().unwrap().to_vec1().unwrap();
        assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-5);

        // Reading the weights leaves the model untouched.
        let after: Vec<f32> = model.forward(&x).unwrap().to_vec1().unwrap();
        assert_eq!(before[0].to_bits(), after[0].to_bits());
    }

    #[test]
    fn test_rejects_wrong_token_count() {
        let cfg = small_model_config();
        let model = seeded_transformer(&cfg, 1, 7.5);
        let x = Tensor::zeros((1, 2, cfg.d_model), DType::F32, &Device::Cpu).unwrap();
        assert!(model.forward(&x).is_err());
    }

    #[test]
    fn test_shape_mismatch_is_weight_load_error() {
        let dev = Device::Cpu;
        let cfg = small_model_config();
        let weights = seeded_weights(&cfg, 1, 0.0);
        let wider = ModelConfig {
            d_model: cfg.d_model * 2,
            ..cfg.clone()
        };
        let vb = VarBuilder::from_tensors(weights, DType::F32, &dev);
        assert!(matches!(
            PriceTransformer::new(&wider, vb),
            Err(Error::WeightLoad(_))
        ));
    }

    #[test]
    fn test_extra_layers_rejected() {
        let dev = Device::Cpu;
        let cfg = small_model_config();
        let weights = seeded_weights(&cfg, 1, 0.0);
        let fewer = ModelConfig {
            num_layers: cfg.num_layers - 1,
            ..cfg.clone()
        };
        let vb = VarBuilder::from_tensors(weights, DType::F32, &dev);
        assert!(matches!(
            PriceTransformer::new(&fewer, vb),
            Err(Error::WeightLoad(_))
        ));
    }

    #[test]
    fn test_missing_checkpoint_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = checkpoint_var_builder(&dir.path().join("nope.safetensors"), DType::F32, &Device::Cpu);
        assert!(matches!(result, Err(Error::WeightLoad(_))));
    }

    #[test]
    fn test_checkpoint_file_roundtrip() {
        let dev = Device::Cpu;
        let cfg = small_model_config();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("price_transformer.safetensors");
        let weights = seeded_weights(&cfg, 4, 7.5);
        init::save_checkpoint(&weights, DType::F32, &path).unwrap();

        let from_file = PriceTransformer::new(&cfg, checkpoint_var_builder(&path, DType::F32, &dev).unwrap()).unwrap();
        let in_memory = PriceTransformer::new(&cfg, VarBuilder::from_tensors(weights, DType::F32, &dev)).unwrap();
        let x = random_tokens(cfg.d_model, 1);
        let a: Vec<f32> = from_file.forward(&x).unwrap().to_vec1().unwrap();
        let b: Vec<f32> = in_memory.forward(&x).unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}
