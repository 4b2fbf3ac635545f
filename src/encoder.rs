//! Temporal encoder
//!
//! Runs the forward GRU over the observed window, attending over visible
//! neighbors at every step. With a future window it also runs the backward
//! GRU that feeds the posterior during training.
//!
//! ```text
//! h0 = Σ_visible init(dp0)          (or the graph fusion, once available)
//! for t in 0..L1:
//!     q   = query(h)
//!     ctx = attention(q, k[t], mask[t]) · n[t]
//!     h   = gru_fx(cat(ctx, s[t]), h)
//! ```

use crate::attention::NeighborAttention;
use crate::config::VrnnConfig;
use crate::embedding::{EmbeddingNetworks, Mlp};
use crate::features::{FeatureExtractor, SocialFeatures};
use crate::graph::{GraphFusion, Similarity};
use crate::recurrent::GruCell;
use crate::VrnnResult;
use candle_core::{DType, IndexOp, Tensor, D};
use candle_nn::VarBuilder;

/// Encoded scene
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Final forward hidden state, `N x H`
    pub hidden: Tensor,
    /// Backward hidden states over the future window, `L2 x N x Hb`
    pub backward: Option<Tensor>,
    /// Whether the graph fusion replaced the initial hidden state
    pub graph_fused: bool,
}

#[derive(Debug)]
pub struct TemporalEncoder {
    extractor: FeatureExtractor,
    embeddings: EmbeddingNetworks,
    attention: NeighborAttention,
    hidden_init: Mlp,
    gru_fx: GruCell,
    gru_by: GruCell,
    graph: Option<GraphFusion>,
    hidden_dim: usize,
    backward_hidden_dim: usize,
}

impl TemporalEncoder {
    pub fn new(config: &VrnnConfig, vb: VarBuilder) -> VrnnResult<Self> {
        let h = config.hidden_dim;
        let step_input = config.neighbor_embed_dim + config.self_embed_dim;
        let graph = if config.graph.enabled {
            Some(GraphFusion::new(config, vb.pp("graph"))?)
        } else {
            None
        };
        Ok(Self {
            extractor: FeatureExtractor::from_config(config),
            embeddings: EmbeddingNetworks::new(config, vb.clone())?,
            attention: NeighborAttention::new(config.attention_slope),
            hidden_init: Mlp::new(&[2, h, h, h], false, vb.pp("rnn_fx_init"))?,
            gru_fx: GruCell::new(step_input, h, vb.pp("rnn_fx"))?,
            gru_by: GruCell::new(step_input, config.backward_hidden_dim, vb.pp("rnn_by"))?,
            graph,
            hidden_dim: h,
            backward_hidden_dim: config.backward_hidden_dim,
        })
    }

    pub fn graph(&self) -> Option<&GraphFusion> {
        self.graph.as_ref()
    }

    /// Forget the graph aggregation history
    pub fn reset_history(&mut self) {
        if let Some(graph) = self.graph.as_mut() {
            graph.reset();
        }
    }

    /// Encode `x: (L1+1) x N x C` with `neighbor: (L1+L2+1) x N x Nn x 4`.
    ///
    /// The backward pass runs only when `y` is given.
    pub fn encode(
        &mut self,
        x: &Tensor,
        neighbor: &Tensor,
        y: Option<&Tensor>,
        similarity: &Similarity,
    ) -> VrnnResult<EncoderOutput> {
        let features = self.extractor.extract(x, neighbor, y)?;
        let n_agents = features.num_agents();
        let n_neighbors = features.num_neighbors();
        let l1 = features.observed_steps;
        let steps = l1 + features.future_steps;
        let device = x.device();

        let s = self.embeddings.self_embed.forward(&features.kinematics()?)?;
        let (k, n) = if n_neighbors == 0 {
            let e = self.embeddings.neighbor_embed.output_dim();
            let f = self.embeddings.key_embed.output_dim();
            (
                Tensor::zeros((steps, n_agents, 0, f), DType::F32, device)?,
                Tensor::zeros((steps, n_agents, 0, e), DType::F32, device)?,
            )
        } else {
            (
                self.embeddings.key_embed.forward(&features.social)?,
                self.embeddings.neighbor_embed.forward(&features.relative_state()?)?,
            )
        };

        let mut h = self.initial_hidden(&features)?;
        let mut graph_fused = false;
        if let Some(graph) = self.graph.as_mut() {
            let state = x.to_dtype(DType::F32)?;
            if let Some(fused) = graph.fuse(&state, similarity)? {
                h = fused;
                graph_fused = true;
            }
        }

        for t in 0..l1 {
            let q = self.embeddings.query_embed.forward(&h)?;
            let ctx = self
                .attention
                .attend(&q, &k.i(t)?, &features.mask.i(t)?, &n.i(t)?)?;
            let step_input = Tensor::cat(&[&ctx, &s.i(t)?], D::Minus1)?;
            h = self.gru_fx.step(&step_input, &h)?;
        }

        let backward = match y {
            Some(_) => Some(self.backward(&features, &s, &n)?),
            None => None,
        };

        Ok(EncoderOutput {
            hidden: h,
            backward,
            graph_fused,
        })
    }

    /// `Σ_visible init(dp0)`, zeros without neighbors
    fn initial_hidden(&self, features: &SocialFeatures) -> VrnnResult<Tensor> {
        let n_agents = features.num_agents();
        let device = features.velocity.device();
        if features.num_neighbors() == 0 {
            return Ok(Tensor::zeros((n_agents, self.hidden_dim), DType::F32, device)?);
        }
        let per_neighbor = self.hidden_init.forward(&features.initial_offset)?;
        let visible = features.initial_mask.to_dtype(DType::F32)?.unsqueeze(D::Minus1)?;
        Ok(per_neighbor.broadcast_mul(&visible)?.sum(1)?)
    }

    /// Backward GRU over the future window, outputs in forward time order
    fn backward(&self, features: &SocialFeatures, s: &Tensor, n: &Tensor) -> VrnnResult<Tensor> {
        let l1 = features.observed_steps;
        let l2 = features.future_steps;
        let n_agents = features.num_agents();
        let device = features.velocity.device();

        let s_t = s.narrow(0, l1, l2)?;
        let n_t = if features.num_neighbors() == 0 {
            Tensor::zeros((l2, n_agents, n.dim(D::Minus1)?), DType::F32, device)?
        } else {
            let visible = features
                .mask
                .narrow(0, l1, l2)?
                .to_dtype(DType::F32)?
                .unsqueeze(D::Minus1)?;
            n.narrow(0, l1, l2)?.broadcast_mul(&visible)?.sum(2)?
        };
        let inputs = Tensor::cat(&[&n_t, &s_t], D::Minus1)?;
        let h0 = Tensor::zeros((n_agents, self.backward_hidden_dim), DType::F32, device)?;
        self.gru_by.run(&inputs, &h0, true)
    }
}
