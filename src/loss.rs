//! Training objective
//!
//! `loss = mean(err) + mean(kl)` where `err` is the squared displacement
//! error per step and `kl` the per-step `log q(z) - log p(z)` at the
//! posterior sample.

use crate::VrnnResult;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Differentiable loss terms
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    pub loss: Tensor,
    pub rec: Tensor,
    pub kl: Tensor,
}

/// Scalar snapshot of a [`LossBreakdown`] for logging and reports
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossSummary {
    pub loss: f32,
    pub rec: f32,
    pub kl: f32,
}

impl LossBreakdown {
    pub fn summary(&self) -> VrnnResult<LossSummary> {
        Ok(LossSummary {
            loss: self.loss.to_scalar::<f32>()?,
            rec: self.rec.to_scalar::<f32>()?,
            kl: self.kl.to_scalar::<f32>()?,
        })
    }
}

impl std::fmt::Display for LossSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "loss {:.6} (rec {:.6}, kl {:.6})", self.loss, self.rec, self.kl)
    }
}

/// Combine reconstruction error and KL terms of any shape
pub fn loss(err: &Tensor, kl: &Tensor) -> VrnnResult<LossBreakdown> {
    let rec = err.mean_all()?;
    let kl = kl.mean_all()?;
    let loss = (&rec + &kl)?;
    Ok(LossBreakdown { loss, rec, kl })
}
