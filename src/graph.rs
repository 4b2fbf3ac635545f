//! Similarity-weighted graph aggregation
//!
//! The graph path summarises the whole observed scene into one vector per
//! agent and, once enough calls have been seen, folds that summary into the
//! encoder's initial hidden state.
//!
//! ```text
//! state T x N x 6 ─► feature_transform ─► self attention (across agents)
//!                                              │
//!                          support = X·W + b, scaled by mean(1 - similarity)
//!                                              │
//!                          AggregationHistory (ring buffer, K entries)
//!                                              │ full?
//!      cat(attended, mean(history), temporal attention(history)) ─► 3H → H
//!                                              │
//!                                   time mean ─► initial hidden state
//! ```
//!
//! The history is owned by the model instance. It is mutated on every call,
//! so callers need `&mut` access; sharing a model across threads requires
//! external synchronisation.

use crate::attention::MultiHeadAttention;
use crate::config::{VrnnConfig, STATE_DIM};
use crate::error::VrnnError;
use crate::ops::forward_flat;
use crate::VrnnResult;
use candle_core::{DType, Tensor, Var, D};
use candle_nn::{Init, Linear, VarBuilder};
use std::collections::{BTreeMap, VecDeque};

/// External social-affinity signal
#[derive(Debug, Clone)]
pub enum Similarity {
    Scalar(f64),
    Values(Vec<f64>),
    Tensor(Tensor),
}

impl Default for Similarity {
    fn default() -> Self {
        Similarity::Scalar(0.0)
    }
}

impl From<f64> for Similarity {
    fn from(value: f64) -> Self {
        Similarity::Scalar(value)
    }
}

impl Similarity {
    /// Mean similarity; empty collections count as 0
    pub fn mean(&self) -> VrnnResult<f64> {
        match self {
            Similarity::Scalar(s) => Ok(*s),
            Similarity::Values(values) if values.is_empty() => Ok(0.0),
            Similarity::Values(values) => Ok(values.iter().sum::<f64>() / values.len() as f64),
            Similarity::Tensor(t) if t.elem_count() == 0 => Ok(0.0),
            Similarity::Tensor(t) => Ok(t
                .to_dtype(DType::F64)?
                .flatten_all()?
                .mean_all()?
                .to_scalar::<f64>()?),
        }
    }

    /// Aggregation weight `mean(1 - similarity)`
    pub fn aggregation_weight(&self) -> VrnnResult<f64> {
        Ok(1.0 - self.mean()?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// AGGREGATION HISTORY
// ═══════════════════════════════════════════════════════════════════════════

/// Fixed-capacity ring buffer of recent aggregation outputs (oldest evicted)
#[derive(Debug, Clone)]
pub struct AggregationHistory {
    capacity: usize,
    entries: VecDeque<Tensor>,
}

impl AggregationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Shape shared by every buffered entry
    pub fn entry_dims(&self) -> Option<&[usize]> {
        self.entries.front().map(|t| t.dims())
    }

    /// Store a detached copy; returns the evicted entry, if any.
    ///
    /// Entries of a different shape cannot be stacked with the buffered
    /// ones, so a shape change clears the buffer first.
    pub fn push(&mut self, entry: &Tensor) -> Option<Tensor> {
        if let Some(dims) = self.entry_dims() {
            if dims != entry.dims() {
                log::debug!(
                    "aggregation history reset: shape {:?} -> {:?}",
                    dims,
                    entry.dims()
                );
                self.entries.clear();
            }
        }
        let evicted = if self.is_full() {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry.detach());
        evicted
    }

    /// Stack entries along `dim`, substituting `live` for the newest entry so
    /// gradients reach the current call's aggregation.
    pub fn stack_with_live(&self, live: &Tensor, dim: usize) -> VrnnResult<Tensor> {
        let mut parts: Vec<Tensor> = self.entries.iter().cloned().collect();
        if let Some(last) = parts.last_mut() {
            *last = live.clone();
        }
        Ok(Tensor::stack(&parts, dim)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// GRAPH AGGREGATOR
// ═══════════════════════════════════════════════════════════════════════════

/// Result of one aggregation
#[derive(Debug, Clone)]
pub struct GraphOutput {
    /// Aggregated features, same shape as the input
    pub features: Tensor,
    /// `Some(width)` when this call created the bias variant for `width`
    pub reinitialized: Option<usize>,
}

/// `support = X·W[:w,:w] + b(w)`, scaled by the similarity weight.
///
/// The weight and bias are created for the configured `width`. A narrower
/// input selects a bias variant indexed by its width; the first use of a
/// width creates that variant from the leading entries of the base bias and
/// reports it as a re-initialisation event. Variants live outside the
/// `VarMap` and can be collected with [`GraphAggregator::bias_variants`].
#[derive(Debug)]
pub struct GraphAggregator {
    width: usize,
    weight: Tensor,
    bias: Tensor,
    variants: BTreeMap<usize, Var>,
}

impl GraphAggregator {
    pub fn new(width: usize, vb: VarBuilder) -> VrnnResult<Self> {
        let stdev = 1.0 / (width as f64).sqrt();
        let weight = vb.get_with_hints((width, width), "weight", Init::Randn { mean: 0.0, stdev })?;
        let bias = vb.get_with_hints(width, "bias", Init::Const(0.0))?;
        Ok(Self {
            width,
            weight,
            bias,
            variants: BTreeMap::new(),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Bias variants created for narrower inputs, keyed by width
    pub fn bias_variants(&self) -> &BTreeMap<usize, Var> {
        &self.variants
    }

    fn bias_for(&mut self, width: usize) -> VrnnResult<(Tensor, Option<usize>)> {
        if width == self.width {
            return Ok((self.bias.clone(), None));
        }
        if let Some(var) = self.variants.get(&width) {
            return Ok((var.as_tensor().clone(), None));
        }
        let var = Var::from_tensor(&self.bias.narrow(0, 0, width)?.detach())?;
        log::warn!(
            "graph bias re-initialised for input width {} (configured {})",
            width,
            self.width
        );
        let tensor = var.as_tensor().clone();
        self.variants.insert(width, var);
        Ok((tensor, Some(width)))
    }

    /// Aggregate `... x w` features with `w <= width`
    pub fn aggregate(&mut self, input: &Tensor, similarity: &Similarity) -> VrnnResult<GraphOutput> {
        let width = input.dim(D::Minus1)?;
        if width > self.width {
            return Err(VrnnError::GraphWidth {
                width,
                max: self.width,
            });
        }
        let weight = if width == self.width {
            self.weight.clone()
        } else {
            self.weight.narrow(0, 0, width)?.narrow(1, 0, width)?.contiguous()?
        };
        let (bias, reinitialized) = self.bias_for(width)?;

        let dims = input.dims().to_vec();
        let rows = input.elem_count() / width.max(1);
        let support = input
            .reshape((rows, width))?
            .matmul(&weight)?
            .broadcast_add(&bias)?
            .reshape(dims)?;

        let scale = similarity.aggregation_weight()?;
        let features = (support * scale)?;
        Ok(GraphOutput {
            features,
            reinitialized,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// GRAPH FUSION
// ═══════════════════════════════════════════════════════════════════════════

/// Full graph path: transform, attend across agents, aggregate, remember,
/// and fuse with a temporal attention pass once the history is full
#[derive(Debug)]
pub struct GraphFusion {
    feature_transform: Linear,
    agent_attention: MultiHeadAttention,
    aggregator: GraphAggregator,
    history_attention: MultiHeadAttention,
    dim_reduction: Linear,
    history: AggregationHistory,
    hidden_dim: usize,
}

impl GraphFusion {
    pub fn new(config: &VrnnConfig, vb: VarBuilder) -> VrnnResult<Self> {
        let h = config.hidden_dim;
        Ok(Self {
            feature_transform: candle_nn::linear(STATE_DIM, h, vb.pp("feature_transform"))?,
            agent_attention: MultiHeadAttention::new(h, config.graph.heads, vb.pp("self_attn"))?,
            aggregator: GraphAggregator::new(h, vb.pp("gc"))?,
            history_attention: MultiHeadAttention::new(h, config.graph.heads, vb.pp("st_attn"))?,
            dim_reduction: candle_nn::linear(3 * h, h, vb.pp("dim_reduction"))?,
            history: AggregationHistory::new(config.graph.history_capacity),
            hidden_dim: h,
        })
    }

    pub fn history(&self) -> &AggregationHistory {
        &self.history
    }

    pub fn aggregator(&self) -> &GraphAggregator {
        &self.aggregator
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Run the graph path on `state: T x N x C`.
    ///
    /// Returns the fused `N x H` summary once the history is full, `None`
    /// while it is still filling up.
    pub fn fuse(&mut self, state: &Tensor, similarity: &Similarity) -> VrnnResult<Option<Tensor>> {
        let state = pad_state(state)?;
        let features = forward_flat(&self.feature_transform, &state)?;
        // batch = time, sequence = agents
        let attended = self.agent_attention.forward(&features)?;

        let output = self.aggregator.aggregate(&attended, similarity)?;
        self.history.push(&output.features);
        if !self.history.is_full() {
            return Ok(None);
        }

        let stacked = self.history.stack_with_live(&output.features, 2)?;
        let (t, n, k, h) = stacked.dims4()?;
        let temporal = self
            .history_attention
            .forward(&stacked.reshape((t * n, k, h))?)?
            .reshape((t, n, k, h))?
            .mean(2)?;
        let history_mean = stacked.mean(2)?;

        let combined = Tensor::cat(&[&attended, &history_mean, &temporal], D::Minus1)?;
        let reduced = forward_flat(&self.dim_reduction, &combined)?;
        debug_assert_eq!(reduced.dim(D::Minus1)?, self.hidden_dim);
        Ok(Some(reduced.mean(0)?))
    }
}

/// Zero-pad (or cut) the state channels to `STATE_DIM`
fn pad_state(state: &Tensor) -> VrnnResult<Tensor> {
    let (t, n, c) = state.dims3()?;
    let state = state.to_dtype(DType::F32)?;
    if c >= STATE_DIM {
        return Ok(state.narrow(2, 0, STATE_DIM)?);
    }
    let pad = Tensor::zeros((t, n, STATE_DIM - c), DType::F32, state.device())?;
    Ok(Tensor::cat(&[&state, &pad], 2)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn test_similarity_reduction() {
        let device = Device::Cpu;
        assert_eq!(Similarity::default().aggregation_weight().unwrap(), 1.0);
        assert_eq!(Similarity::Values(vec![0.25]).aggregation_weight().unwrap(), 0.75);
        assert_eq!(Similarity::Values(vec![]).aggregation_weight().unwrap(), 1.0);
        let t = Tensor::new(&[0.2f32, 0.4], &device).unwrap();
        let w = Similarity::Tensor(t).aggregation_weight().unwrap();
        assert!((w - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let device = Device::Cpu;
        let mut history = AggregationHistory::new(2);
        for i in 0..3 {
            let t = Tensor::full(i as f32, (1, 2), &device).unwrap();
            let evicted = history.push(&t);
            assert_eq!(evicted.is_some(), i == 2);
        }
        assert!(history.is_full());
        assert_eq!(history.len(), 2);
        let live = Tensor::full(9f32, (1, 2), &device).unwrap();
        let stacked: Vec<f32> = history
            .stack_with_live(&live, 0)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(stacked, vec![1.0, 1.0, 9.0, 9.0]);
    }

    #[test]
    fn test_history_resets_on_shape_change() {
        let device = Device::Cpu;
        let mut history = AggregationHistory::new(3);
        history.push(&Tensor::zeros((2, 4), DType::F32, &device).unwrap());
        history.push(&Tensor::zeros((2, 4), DType::F32, &device).unwrap());
        history.push(&Tensor::zeros((3, 4), DType::F32, &device).unwrap());
        assert_eq!(history.len(), 1);
        assert_eq!(history.entry_dims(), Some(&[3usize, 4][..]));
    }

    #[test]
    fn test_full_similarity_zeroes_output() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let mut gc = GraphAggregator::new(8, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 2, 8), &device).unwrap();
        let out = gc.aggregate(&x, &Similarity::Scalar(1.0)).unwrap();
        let vals: Vec<f32> = out.features.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| *v == 0.0));
        assert!(out.reinitialized.is_none());
    }

    #[test]
    fn test_narrow_input_creates_bias_variant_once() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let mut gc = GraphAggregator::new(8, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 2, 5), &device).unwrap();

        let first = gc.aggregate(&x, &Similarity::default()).unwrap();
        assert_eq!(first.reinitialized, Some(5));
        assert_eq!(first.features.dims(), &[3, 2, 5]);

        let second = gc.aggregate(&x, &Similarity::default()).unwrap();
        assert_eq!(second.reinitialized, None);
        assert_eq!(gc.bias_variants().len(), 1);
    }

    #[test]
    fn test_wider_input_is_rejected() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let mut gc = GraphAggregator::new(4, vb).unwrap();
        let x = Tensor::zeros((2, 6), DType::F32, &device).unwrap();
        let err = gc.aggregate(&x, &Similarity::default()).unwrap_err();
        assert!(matches!(err, VrnnError::GraphWidth { width: 6, max: 4 }));
    }

    #[test]
    fn test_fusion_waits_for_full_history() {
        let device = Device::Cpu;
        let config = VrnnConfig::tiny();
        let (_varmap, vb) = vb(&device);
        let mut fusion = GraphFusion::new(&config, vb).unwrap();
        let state = Tensor::randn(0f32, 1.0, (5, 3, 6), &device).unwrap();

        for _ in 0..config.graph.history_capacity - 1 {
            assert!(fusion.fuse(&state, &Similarity::default()).unwrap().is_none());
        }
        let fused = fusion.fuse(&state, &Similarity::default()).unwrap().unwrap();
        assert_eq!(fused.dims(), &[3, config.hidden_dim]);
        assert!(fusion.history().is_full());

        fusion.reset();
        assert!(fusion.history().is_empty());
    }

    #[test]
    fn test_pad_state_to_six_channels() {
        let device = Device::Cpu;
        let state = Tensor::ones((2, 3, 2), DType::F32, &device).unwrap();
        assert_eq!(pad_state(&state).unwrap().dims(), &[2, 3, STATE_DIM]);
    }
}
