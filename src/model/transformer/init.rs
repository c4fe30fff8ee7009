//! Seeded weight initialization for a fresh price transformer.
//!
//! Produces the full named-tensor map of an untrained checkpoint:
//!
//! - linear weights (including the packed attention `in_proj_weight`):
//!   Xavier-uniform, `U(-a, a)` with `a = sqrt(6 / (fan_in + fan_out))`
//! - all biases: zero
//! - layer norms: unit scale, zero bias
//! - positional table: `N(0, 0.1²)`
//! - token-type table: `N(0, 1)`
//!
//! Uses `ChaCha8Rng` so the same seed always yields the same checkpoint.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::config::{ModelConfig, NUM_TOKENS};
use crate::{Error, Result};

struct Initializer<'a> {
    rng: ChaCha8Rng,
    device: &'a Device,
    tensors: HashMap<String, Tensor>,
}

impl<'a> Initializer<'a> {
    fn xavier(&mut self, name: &str, fan_out: usize, fan_in: usize) -> Result<()> {
        let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
        let values: Vec<f32> = (0..fan_out * fan_in)
            .map(|_| self.rng.random_range(-bound..bound) as f32)
            .collect();
        self.insert(name, Tensor::from_vec(values, (fan_out, fan_in), self.device)?);
        Ok(())
    }

    fn normal(&mut self, name: &str, shape: (usize, usize), std: f64) -> Result<()> {
        let normal = Normal::new(0.0, std)
            .map_err(|e| Error::Config(format!("{name}: invalid std {std}: {e}")))?;
        let values: Vec<f32> = (0..shape.0 * shape.1)
            .map(|_| normal.sample(&mut self.rng) as f32)
            .collect();
        self.insert(name, Tensor::from_vec(values, shape, self.device)?);
        Ok(())
    }

    fn fill(&mut self, name: &str, len: usize, value: f32) -> Result<()> {
        self.insert(name, Tensor::full(value, len, self.device)?);
        Ok(())
    }

    fn linear(&mut self, prefix: &str, fan_in: usize, fan_out: usize) -> Result<()> {
        self.xavier(&format!("{prefix}.weight"), fan_out, fan_in)?;
        self.fill(&format!("{prefix}.bias"), fan_out, 0.0)
    }

    fn layer_norm(&mut self, prefix: &str, dim: usize) -> Result<()> {
        self.fill(&format!("{prefix}.weight"), dim, 1.0)?;
        self.fill(&format!("{prefix}.bias"), dim, 0.0)
    }

    fn attention(&mut self, prefix: &str, dim: usize) -> Result<()> {
        self.xavier(&format!("{prefix}.in_proj_weight"), 3 * dim, dim)?;
        self.fill(&format!("{prefix}.in_proj_bias"), 3 * dim, 0.0)?;
        self.linear(&format!("{prefix}.out_proj"), dim, dim)
    }

    fn insert(&mut self, name: &str, tensor: Tensor) {
        self.tensors.insert(name.to_string(), tensor);
    }
}

/// Build the named tensors of an untrained checkpoint.
///
/// When `text_hidden` is given and differs from `d_model`, a
/// `text_projection` of shape `[d_model, text_hidden]` is included.
pub fn initialize_weights(
    cfg: &ModelConfig,
    text_hidden: Option<usize>,
    seed: u64,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    cfg.validate()?;
    let d = cfg.d_model;
    let mut init = Initializer {
        rng: ChaCha8Rng::seed_from_u64(seed),
        device,
        tensors: HashMap::new(),
    };

    init.normal("pos_encoding", (NUM_TOKENS, d), 0.1)?;
    init.normal("token_type_embedding.weight", (NUM_TOKENS, d), 1.0)?;

    for i in 0..cfg.num_layers {
        let prefix = format!("transformer.layers.{i}");
        init.attention(&format!("{prefix}.self_attn"), d)?;
        init.linear(&format!("{prefix}.linear1"), d, cfg.ff_dim())?;
        init.linear(&format!("{prefix}.linear2"), cfg.ff_dim(), d)?;
        init.layer_norm(&format!("{prefix}.norm1"), d)?;
        init.layer_norm(&format!("{prefix}.norm2"), d)?;
    }

    init.attention("attention_pooling", d)?;

    init.layer_norm("price_head.0", d)?;
    init.linear("price_head.1", d, cfg.head_hidden())?;
    init.linear("price_head.4", cfg.head_hidden(), 1)?;

    if let Some(hidden) = text_hidden
        && hidden != d
    {
        init.linear("text_projection", hidden, d)?;
    }

    let params: usize = init.tensors.values().map(|t| t.elem_count()).sum();
    tracing::info!(params, tensors = init.tensors.len(), seed, "initialized price transformer weights");
    Ok(init.tensors)
}

/// Write tensors as a safetensors checkpoint, converted to `dtype`.
pub fn save_checkpoint(tensors: &HashMap<String, Tensor>, dtype: DType, path: &Path) -> Result<()> {
    let converted = tensors
        .iter()
        .map(|(name, t)| Ok((name.clone(), t.to_dtype(dtype)?)))
        .collect::<Result<HashMap<String, Tensor>>>()?;
    candle_core::safetensors::save(&converted, path)?;
    tracing::info!(path = %path.display(), "saved checkpoint");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> ModelConfig {
        ModelConfig {
            d_model: 16,
            nhead: 2,
            num_layers: 2,
            ..ModelConfig::default()
        }
    }

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_same_seed_same_weights() {
        let dev = Device::Cpu;
        let a = initialize_weights(&small_cfg(), None, 7, &dev).unwrap();
        let b = initialize_weights(&small_cfg(), None, 7, &dev).unwrap();
        let c = initialize_weights(&small_cfg(), None, 8, &dev).unwrap();
        let name = "transformer.layers.1.linear1.weight";
        assert_eq!(to_vec(&a[name]), to_vec(&b[name]));
        assert_ne!(to_vec(&a[name]), to_vec(&c[name]));
    }

    #[test]
    fn test_positional_table_spread() {
        let dev = Device::Cpu;
        let cfg = ModelConfig {
            d_model: 512,
            nhead: 8,
            num_layers: 1,
            ..ModelConfig::default()
        };
        let w = initialize_weights(&cfg, None, 13, &dev).unwrap();
        let values = to_vec(&w["pos_encoding"]);
        let n = values.len() as f64;
        let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
        let var = values.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 0.02, "mean {mean}");
        assert!((var.sqrt() - 0.1).abs() < 0.01, "std {}", var.sqrt());

        let types = to_vec(&w["token_type_embedding.weight"]);
        let type_std = (types.iter().map(|v| (*v as f64).powi(2)).sum::<f64>() / types.len() as f64).sqrt();
        assert!((type_std - 1.0).abs() < 0.1, "std {type_std}");
    }

    #[test]
    fn test_shapes_and_identity_norms() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let w = initialize_weights(&cfg, None, 0, &dev).unwrap();
        assert_eq!(w["pos_encoding"].dims(), &[3, 16]);
        assert_eq!(w["transformer.layers.0.self_attn.in_proj_weight"].dims(), &[48, 16]);
        assert_eq!(w["transformer.layers.0.linear1.weight"].dims(), &[32, 16]);
        assert_eq!(w["price_head.1.weight"].dims(), &[8, 16]);
        assert_eq!(w["price_head.4.weight"].dims(), &[1, 8]);
        assert!(to_vec(&w["price_head.0.weight"]).iter().all(|v| *v == 1.0));
        assert!(to_vec(&w["price_head.0.bias"]).iter().all(|v| *v == 0.0));
        assert!(to_vec(&w["price_head.4.bias"]).iter().all(|v| *v == 0.0));
        assert!(!w.contains_key("text_projection.weight"));
    }

    #[test]
    fn test_xavier_bound() {
        let dev = Device::Cpu;
        let w = initialize_weights(&small_cfg(), None, 3, &dev).unwrap();
        let bound = (6.0f64 / (16 + 32) as f64).sqrt() as f32;
        let values = to_vec(&w["transformer.layers.0.linear1.weight"]);
        assert!(values.iter().all(|v| v.abs() <= bound));
        assert!(values.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_text_projection_only_on_mismatch() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let with = initialize_weights(&cfg, Some(24), 0, &dev).unwrap();
        assert_eq!(with["text_projection.weight"].dims(), &[16, 24]);
        let without = initialize_weights(&cfg, Some(16), 0, &dev).unwrap();
        assert!(!without.contains_key("text_projection.weight"));
    }

    #[test]
    fn test_save_checkpoint_roundtrip() {
        let dev = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let w = initialize_weights(&small_cfg(), None, 1, &dev).unwrap();
        save_checkpoint(&w, DType::F32, &path).unwrap();
        let loaded = candle_core::safetensors::load(&path, &dev).unwrap();
        assert_eq!(loaded.len(), w.len());
        assert_eq!(to_vec(&loaded["pos_encoding"]), to_vec(&w["pos_encoding"]));
    }
}
