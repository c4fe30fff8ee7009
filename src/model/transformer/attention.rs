//! Scaled dot-product multi-head attention.
//!
//! Parameters use the packed layout of a PyTorch `nn.MultiheadAttention`
//! state dict: `in_proj_weight` `[3D, D]` and `in_proj_bias` `[3D]` hold the
//! query/key/value projections stacked in that order, followed by `out_proj`.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

/// Multi-head attention returning both the context and the head-averaged weights.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn load(vb: VarBuilder, embed_dim: usize, num_heads: usize) -> Result<Self> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            candle_core::bail!("embed_dim {embed_dim} not divisible by num_heads {num_heads}");
        }
        let in_proj_weight = vb.get((3 * embed_dim, embed_dim), "in_proj_weight")?;
        let in_proj_bias = vb.get(3 * embed_dim, "in_proj_bias")?;

        // Slice the packed projection into Q, K, V.
        let slice = |i: usize| -> Result<Linear> {
            let w = in_proj_weight.narrow(0, i * embed_dim, embed_dim)?;
            let b = in_proj_bias.narrow(0, i * embed_dim, embed_dim)?;
            Ok(Linear::new(w, Some(b)))
        };
        let q_proj = slice(0)?;
        let k_proj = slice(1)?;
        let v_proj = slice(2)?;
        let out_proj = candle_nn::linear(embed_dim, embed_dim, vb.pp("out_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads,
            head_dim: embed_dim / num_heads,
        })
    }

    /// Forward pass.
    ///
    /// - `query`: `[B, Lq, D]`
    /// - `key`, `value`: `[B, Lk, D]`
    ///
    /// Returns `(context [B, Lq, D], weights [B, Lq, Lk])` where the weights are
    /// the softmax attention probabilities averaged over heads.
    pub fn forward(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, len_q, _) = query.dims3()?;
        let (_, len_k, _) = key.dims3()?;

        // [B, L, D] -> [B, H, L, hd]
        let q = self
            .q_proj
            .forward(query)?
            .reshape((batch, len_q, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(key)?
            .reshape((batch, len_k, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(value)?
            .reshape((batch, len_k, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / scale)?; // [B, H, Lq, Lk]
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;

        let context = weights
            .matmul(&v)? // [B, H, Lq, hd]
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, len_q, self.num_heads * self.head_dim))?;
        let context = self.out_proj.forward(&context)?;

        let averaged = weights.mean(1)?; // [B, Lq, Lk]
        Ok((context, averaged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn self_attention_output_shape() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = MultiHeadAttention::load(vb, 16, 4).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 3, 16), &device).unwrap();
        let (out, weights) = attn.forward(&x, &x, &x).unwrap();
        assert_eq!(out.dims(), &[2, 3, 16]);
        assert_eq!(weights.dims(), &[2, 3, 3]);
    }

    #[test]
    fn single_query_weights_sum_to_one() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = MultiHeadAttention::load(vb, 8, 1).unwrap();

        let kv = Tensor::randn(0f32, 1.0, (1, 3, 8), &device).unwrap();
        let q = kv.narrow(1, 0, 1).unwrap();
        let (out, weights) = attn.forward(&q, &kv, &kv).unwrap();
        assert_eq!(out.dims(), &[1, 1, 8]);

        let w: Vec<f32> = weights.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(w.len(), 3);
        assert!(w.iter().all(|x| *x >= 0.0));
        assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_indivisible_heads() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        assert!(MultiHeadAttention::load(vb, 10, 3).is_err());
    }
}
