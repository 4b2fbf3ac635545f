//! Attention mechanisms
//!
//! Two kinds of attention are used by the encoder:
//!
//! - [`NeighborAttention`]: a single query per agent scored against the keys
//!   of its neighbors. Neighbors outside the observation radius are masked
//!   out before normalisation, so they never receive weight.
//! - [`MultiHeadAttention`]: standard scaled dot-product self attention used
//!   by the graph aggregation path (across agents, and across the
//!   aggregation history).

use crate::ops::{forward_flat, leaky_relu};
use crate::VrnnResult;
use candle_core::{DType, Tensor, D};
use candle_nn::{Linear, VarBuilder};

/// Masked single-query attention over a padded neighbor axis
#[derive(Debug, Clone, Copy)]
pub struct NeighborAttention {
    negative_slope: f64,
}

impl Default for NeighborAttention {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl NeighborAttention {
    pub fn new(negative_slope: f64) -> Self {
        Self { negative_slope }
    }

    /// Attention weights `N x Nn`.
    ///
    /// `q: N x F`, `k: N x Nn x F`, `mask: N x Nn` (`u8`, 1 = visible).
    /// Rows with a visible neighbor sum to 1; rows without one are all 0.
    pub fn weights(&self, q: &Tensor, k: &Tensor, mask: &Tensor) -> VrnnResult<Tensor> {
        let (n_agents, n_neighbors, _) = k.dims3()?;
        if n_neighbors == 0 {
            return Ok(Tensor::zeros((n_agents, 0), DType::F32, k.device())?);
        }

        let scores = k.matmul(&q.unsqueeze(2)?)?.squeeze(2)?;
        let scores = leaky_relu(&scores, self.negative_slope)?;

        let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.dims(), scores.device())?;
        let masked = mask.where_cond(&scores, &neg_inf)?;

        // an all -inf row would softmax to NaN; score it as zeros and drop it after
        let visible = mask
            .to_dtype(DType::F32)?
            .sum_keepdim(D::Minus1)?
            .gt(0f32)?
            .broadcast_as(masked.dims())?
            .contiguous()?;
        let logits = visible.where_cond(&masked, &masked.zeros_like()?)?;
        let att = candle_nn::ops::softmax(&logits, D::Minus1)?;
        Ok(visible.where_cond(&att, &att.zeros_like()?)?)
    }

    /// Weighted sum of neighbor values: `weights: N x Nn`, `values: N x Nn x E` → `N x E`
    pub fn aggregate(&self, weights: &Tensor, values: &Tensor) -> VrnnResult<Tensor> {
        let (n_agents, n_neighbors, width) = values.dims3()?;
        if n_neighbors == 0 {
            return Ok(Tensor::zeros((n_agents, width), DType::F32, values.device())?);
        }
        Ok(weights.unsqueeze(1)?.matmul(values)?.squeeze(1)?)
    }

    /// `aggregate(weights(q, k, mask), values)`
    pub fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        mask: &Tensor,
        values: &Tensor,
    ) -> VrnnResult<Tensor> {
        let weights = self.weights(q, k, mask)?;
        self.aggregate(&weights, values)
    }
}

/// Multi-head scaled dot-product self attention on `B x S x D`
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    n_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl MultiHeadAttention {
    pub fn new(d_model: usize, n_heads: usize, vb: VarBuilder) -> VrnnResult<Self> {
        let head_dim = d_model / n_heads;
        let scale = 1.0 / (head_dim as f64).sqrt();

        let query = candle_nn::linear(d_model, d_model, vb.pp("query"))?;
        let key = candle_nn::linear(d_model, d_model, vb.pp("key"))?;
        let value = candle_nn::linear(d_model, d_model, vb.pp("value"))?;
        let output = candle_nn::linear(d_model, d_model, vb.pp("output"))?;

        Ok(Self {
            query,
            key,
            value,
            output,
            n_heads,
            head_dim,
            scale,
        })
    }

    pub fn forward(&self, x: &Tensor) -> VrnnResult<Tensor> {
        let (batch_size, seq_len, d_model) = x.dims3()?;

        let split = |t: Tensor| -> VrnnResult<Tensor> {
            Ok(t.reshape((batch_size, seq_len, self.n_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };

        // [B, S, D] -> [B, H, S, D/H]
        let q = split(forward_flat(&self.query, x)?)?;
        let k = split(forward_flat(&self.key, x)?)?;
        let v = split(forward_flat(&self.value, x)?)?;

        let scores = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        let attn_weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let attn_output = attn_weights.matmul(&v)?;

        // [B, H, S, D/H] -> [B, S, D]
        let attn_output = attn_output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, seq_len, d_model))?;

        forward_flat(&self.output, &attn_output)
    }
}
