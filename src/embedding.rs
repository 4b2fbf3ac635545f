//! Bounded feed-forward embeddings
//!
//! Every network in the model is a short stack of linear layers with a
//! ReLU6 between them. `bounded_output` adds a ReLU6 after the last layer as
//! well, which pins every output to `[0, 6]`.

use crate::config::{VrnnConfig, DISPLACEMENT_DIM};
use crate::ops::forward_flat;
use crate::VrnnResult;
use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

/// Linear stack with ReLU6 activations, usable on tensors of any rank
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
    bounded_output: bool,
    input_dim: usize,
    output_dim: usize,
}

impl Mlp {
    /// `dims = [in, hidden.., out]`, one linear layer per consecutive pair
    pub fn new(dims: &[usize], bounded_output: bool, vb: VarBuilder) -> VrnnResult<Self> {
        let mut layers = Vec::with_capacity(dims.len().saturating_sub(1));
        for (i, pair) in dims.windows(2).enumerate() {
            layers.push(candle_nn::linear(pair[0], pair[1], vb.pp(format!("layer_{}", i)))?);
        }
        Ok(Self {
            layers,
            bounded_output,
            input_dim: dims.first().copied().unwrap_or(0),
            output_dim: dims.last().copied().unwrap_or(0),
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn is_bounded(&self) -> bool {
        self.bounded_output
    }

    /// Apply to `... x input_dim`, returning `... x output_dim`
    pub fn forward(&self, x: &Tensor) -> VrnnResult<Tensor> {
        forward_flat(self, x)
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let last = self.layers.len().saturating_sub(1);
        let mut h = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if i < last || self.bounded_output {
                h = h.clamp(0f32, 6f32)?;
            }
        }
        Ok(h)
    }
}

/// The four input embeddings of the encoder
#[derive(Debug, Clone)]
pub struct EmbeddingNetworks {
    /// `(v, a)` → self embedding
    pub self_embed: Mlp,
    /// `(dp, dv)` → neighbor embedding
    pub neighbor_embed: Mlp,
    /// `(dist, bearing, mpd)` → attention key
    pub key_embed: Mlp,
    /// hidden state → attention query
    pub query_embed: Mlp,
}

impl EmbeddingNetworks {
    pub fn new(config: &VrnnConfig, vb: VarBuilder) -> VrnnResult<Self> {
        let kinematics = 2 * DISPLACEMENT_DIM;
        let f = config.feature_dim;
        let e = config.neighbor_embed_dim;
        Ok(Self {
            self_embed: Mlp::new(&[kinematics, 64, config.self_embed_dim], false, vb.pp("embed_s"))?,
            neighbor_embed: Mlp::new(&[kinematics, 64, e, e], false, vb.pp("embed_n"))?,
            key_embed: Mlp::new(&[3, f, f, f], false, vb.pp("embed_k"))?,
            query_embed: Mlp::new(&[config.hidden_dim, f, f, f], false, vb.pp("embed_q"))?,
        })
    }
}
