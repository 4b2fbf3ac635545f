//! Gated recurrent unit
//!
//! Single-layer GRU cell with the usual reset/update/candidate gates:
//!
//! ```text
//! r  = σ(W_ir x + W_hr h)
//! z  = σ(W_iz x + W_hz h)
//! n  = tanh(W_in x + r ⊙ (W_hn h))
//! h' = (1 - z) ⊙ n + z ⊙ h
//! ```
//!
//! The three input projections and the three hidden projections are each
//! fused into one linear layer and split afterwards.

use crate::VrnnResult;
use candle_core::{DType, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

#[derive(Debug, Clone)]
pub struct GruCell {
    input_proj: Linear,
    hidden_proj: Linear,
    input_dim: usize,
    hidden_dim: usize,
}

impl GruCell {
    pub fn new(input_dim: usize, hidden_dim: usize, vb: VarBuilder) -> VrnnResult<Self> {
        Ok(Self {
            input_proj: candle_nn::linear(input_dim, 3 * hidden_dim, vb.pp("input"))?,
            hidden_proj: candle_nn::linear(hidden_dim, 3 * hidden_dim, vb.pp("hidden"))?,
            input_dim,
            hidden_dim,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Zero hidden state for `batch` rows
    pub fn zero_state(&self, batch: usize, device: &candle_core::Device) -> VrnnResult<Tensor> {
        Ok(Tensor::zeros((batch, self.hidden_dim), DType::F32, device)?)
    }

    /// One step: `x: B x I`, `h: B x H` → `B x H`
    pub fn step(&self, x: &Tensor, h: &Tensor) -> VrnnResult<Tensor> {
        let gi = self.input_proj.forward(x)?;
        let gh = self.hidden_proj.forward(h)?;
        let hd = self.hidden_dim;

        let r = candle_nn::ops::sigmoid(&(gi.narrow(D::Minus1, 0, hd)? + gh.narrow(D::Minus1, 0, hd)?)?)?;
        let z = candle_nn::ops::sigmoid(&(gi.narrow(D::Minus1, hd, hd)? + gh.narrow(D::Minus1, hd, hd)?)?)?;
        let n = (gi.narrow(D::Minus1, 2 * hd, hd)? + (r * gh.narrow(D::Minus1, 2 * hd, hd)?)?)?.tanh()?;

        Ok((&n + (z * (h - &n)?)?)?)
    }

    /// Unroll over `inputs: T x B x I` starting from `h0`.
    ///
    /// With `reverse` the sequence is consumed last step first; the outputs
    /// are returned in the original time order either way (`T x B x H`).
    pub fn run(&self, inputs: &Tensor, h0: &Tensor, reverse: bool) -> VrnnResult<Tensor> {
        let steps = inputs.dim(0)?;
        let mut outputs: Vec<Tensor> = Vec::with_capacity(steps);
        let mut h = h0.clone();
        let order: Box<dyn Iterator<Item = usize>> = if reverse {
            Box::new((0..steps).rev())
        } else {
            Box::new(0..steps)
        };
        for t in order {
            h = self.step(&inputs.get(t)?, &h)?;
            outputs.push(h.clone());
        }
        if reverse {
            outputs.reverse();
        }
        if outputs.is_empty() {
            let batch = h0.dim(0)?;
            return Ok(Tensor::zeros((0, batch, self.hidden_dim), DType::F32, h0.device())?);
        }
        Ok(Tensor::stack(&outputs, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_step_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let gru = GruCell::new(5, 7, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 5), &device).unwrap();
        let h = gru.zero_state(3, &device).unwrap();
        assert_eq!(gru.step(&x, &h).unwrap().dims(), &[3, 7]);
    }

    #[test]
    fn test_zero_weights_halve_hidden_state() {
        // all gates at σ(0) = 0.5, candidate tanh(0) = 0: h' = h / 2
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let gru = GruCell::new(2, 3, vb).unwrap();
        let x = Tensor::ones((1, 2), DType::F32, &device).unwrap();
        let h = Tensor::new(&[[2.0f32, -4.0, 1.0]], &device).unwrap();
        let next: Vec<Vec<f32>> = gru.step(&x, &h).unwrap().to_vec2().unwrap();
        assert_eq!(next, vec![vec![1.0, -2.0, 0.5]]);
    }

    #[test]
    fn test_reverse_run_keeps_time_order() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let gru = GruCell::new(2, 4, vb).unwrap();
        let inputs = Tensor::randn(0f32, 1.0, (5, 3, 2), &device).unwrap();
        let h0 = gru.zero_state(3, &device).unwrap();

        let backward = gru.run(&inputs, &h0, true).unwrap();
        assert_eq!(backward.dims(), &[5, 3, 4]);

        // the last time step is the first one the reversed pass sees
        let last_only = gru.step(&inputs.get(4).unwrap(), &h0).unwrap();
        let diff = (backward.get(4).unwrap() - last_only)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_empty_sequence() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let gru = GruCell::new(2, 4, vb).unwrap();
        let inputs = Tensor::zeros((0, 3, 2), DType::F32, &device).unwrap();
        let h0 = gru.zero_state(3, &device).unwrap();
        assert_eq!(gru.run(&inputs, &h0, false).unwrap().dims(), &[0, 3, 4]);
    }
}
