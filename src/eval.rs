//! Forecast metrics
//!
//! Average and final displacement error (ADE / FDE). Sampled forecasts are
//! scored best-of-N: the closest sample per agent, then averaged over agents.

use crate::config::DISPLACEMENT_DIM;
use crate::error::VrnnError;
use crate::model::Prediction;
use crate::ops::norm_last;
use crate::VrnnResult;
use candle_core::{DType, IndexOp, Tensor, D};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplacementErrors {
    /// Mean Euclidean error over all steps
    pub ade: f32,
    /// Euclidean error at the last step
    pub fde: f32,
}

impl std::fmt::Display for DisplacementErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ADE {:.4}  FDE {:.4}", self.ade, self.fde)
    }
}

/// Score `pred` (`T x N x 2` or `n x T x N x 2`) against `y` (`>= T x N x 2`)
pub fn displacement_errors(pred: &Tensor, y: &Tensor) -> VrnnResult<DisplacementErrors> {
    let pred = pred.to_dtype(DType::F32)?;
    let pred = if pred.rank() == 3 { pred.unsqueeze(0)? } else { pred };
    let (_, steps, n_agents, _) = pred.dims4()?;
    if steps == 0 {
        return Err(VrnnError::ShapeMismatch {
            what: "prediction steps",
            expected: ">= 1".to_string(),
            got: "0".to_string(),
        });
    }

    let (y_steps, y_agents, _) = y.dims3()?;
    if y_steps < steps || y_agents != n_agents {
        return Err(VrnnError::ShapeMismatch {
            what: "ground truth",
            expected: format!(">= {} x {}", steps, n_agents),
            got: format!("{} x {}", y_steps, y_agents),
        });
    }
    let y = y
        .to_dtype(DType::F32)?
        .narrow(0, 0, steps)?
        .narrow(D::Minus1, 0, DISPLACEMENT_DIM)?;

    // n x T x N
    let dist = norm_last(&pred.broadcast_sub(&y.unsqueeze(0)?)?)?;
    let ade = dist.mean(1)?.min(0)?.mean_all()?.to_scalar::<f32>()?;
    let fde = dist
        .i((.., steps - 1, ..))?
        .min(0)?
        .mean_all()?
        .to_scalar::<f32>()?;
    Ok(DisplacementErrors { ade, fde })
}

/// Score a [`Prediction`] against the scene's future.
///
/// `y` may cover more agents than the forecast when the capacity limit
/// truncated it; only the forecast agents are scored. Single-agent
/// predictions accept `T x 2` or `T x 1 x 2` ground truth.
pub fn score_prediction(prediction: &Prediction, y: &Tensor) -> VrnnResult<DisplacementErrors> {
    let mut trajectory = prediction.trajectory.clone();
    let single_rank = if prediction.is_stochastic() { 3 } else { 2 };
    if trajectory.rank() == single_rank {
        trajectory = trajectory.unsqueeze(single_rank - 1)?;
    }
    let mut y = if y.rank() == 2 { y.unsqueeze(1)? } else { y.clone() };

    let available = y.dim(1)?;
    if available > prediction.n_agents {
        log::warn!(
            "forecast covers the first {} of {} agents; scoring those only",
            prediction.n_agents,
            available
        );
        y = y.narrow(1, 0, prediction.n_agents)?;
    }
    displacement_errors(&trajectory, &y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_perfect_prediction() {
        let device = Device::Cpu;
        let y = Tensor::randn(0f32, 1.0, (4, 3, 2), &device).unwrap();
        let e = displacement_errors(&y, &y).unwrap();
        assert_eq!(e.ade, 0.0);
        assert_eq!(e.fde, 0.0);
    }

    #[test]
    fn test_constant_offset() {
        let device = Device::Cpu;
        let y = Tensor::zeros((3, 1, 2), DType::F32, &device).unwrap();
        // off by (3, 4) at the last step only
        let pred = Tensor::new(
            &[[[0f32, 0.0]], [[0.0, 0.0]], [[3.0, 4.0]]],
            &device,
        )
        .unwrap();
        let e = displacement_errors(&pred, &y).unwrap();
        assert!((e.fde - 5.0).abs() < 1e-6);
        assert!((e.ade - 5.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_best_of_n_picks_closest_sample() {
        let device = Device::Cpu;
        let y = Tensor::zeros((2, 1, 2), DType::F32, &device).unwrap();
        let far = Tensor::full(10f32, (2, 1, 2), &device).unwrap();
        let exact = Tensor::zeros((2, 1, 2), DType::F32, &device).unwrap();
        let pred = Tensor::stack(&[&far, &exact], 0).unwrap();
        let e = displacement_errors(&pred, &y).unwrap();
        assert_eq!(e.ade, 0.0);
        assert_eq!(e.fde, 0.0);
    }

    #[test]
    fn test_short_ground_truth_is_rejected() {
        let device = Device::Cpu;
        let pred = Tensor::zeros((4, 2, 2), DType::F32, &device).unwrap();
        let y = Tensor::zeros((3, 2, 2), DType::F32, &device).unwrap();
        assert!(displacement_errors(&pred, &y).is_err());
    }

    #[test]
    fn test_score_truncated_prediction() {
        let device = Device::Cpu;
        let y = Tensor::randn(0f32, 1.0, (3, 5, 2), &device).unwrap();
        let head = y.narrow(1, 0, 2).unwrap();
        let prediction = Prediction {
            trajectory: Tensor::stack(&[head.clone(), head.clone(), head.clone(), head], 0).unwrap(),
            displacements: Tensor::zeros((4, 3, 2, 2), DType::F32, &device).unwrap(),
            n_predictions: 4,
            n_agents: 2,
        };
        // the raw metric refuses the extra agents, the prediction scorer drops them
        assert!(displacement_errors(&prediction.trajectory, &y).is_err());
        let e = score_prediction(&prediction, &y).unwrap();
        assert_eq!(e.ade, 0.0);
        assert_eq!(e.fde, 0.0);
    }

    #[test]
    fn test_score_single_agent_prediction() {
        let device = Device::Cpu;
        let y = Tensor::randn(0f32, 1.0, (3, 2), &device).unwrap();
        let prediction = Prediction {
            trajectory: y.clone(),
            displacements: y.zeros_like().unwrap(),
            n_predictions: 0,
            n_agents: 1,
        };
        let e = score_prediction(&prediction, &y).unwrap();
        assert_eq!(e.ade, 0.0);
    }
}
