//! Synthetic scenes
//!
//! Agents start evenly spaced on a circle and walk straight through its
//! centre at constant speed. Every other agent is a neighbor, so the
//! neighbor tensor is dense.

use crate::config::STATE_DIM;
use crate::error::VrnnError;
use crate::model::Scene;
use crate::VrnnResult;
use candle_core::{Device, Tensor};

/// Radius of the starting circle
const START_RADIUS: f32 = 3.0;

#[derive(Debug, Clone)]
pub struct SyntheticScene {
    /// Observed states `ob_horizon x N x 6`
    pub x: Tensor,
    /// Future positions `horizon x N x 2`
    pub y: Tensor,
    /// Neighbor states `(ob_horizon + horizon) x N x (N-1) x 4`
    pub neighbor: Tensor,
}

impl SyntheticScene {
    /// Agents crossing a circle of radius 3, reaching the far side at the end
    pub fn crossing(
        n_agents: usize,
        ob_horizon: usize,
        horizon: usize,
        device: &Device,
    ) -> VrnnResult<Self> {
        if n_agents == 0 {
            return Err(VrnnError::InvalidConfig("scene needs at least one agent".to_string()));
        }
        if ob_horizon < 2 {
            return Err(VrnnError::InsufficientHistory { got: ob_horizon });
        }
        let total = ob_horizon + horizon;

        let start: Vec<(f32, f32)> = (0..n_agents)
            .map(|i| {
                let angle = 2.0 * std::f32::consts::PI * i as f32 / n_agents as f32;
                (START_RADIUS * angle.cos(), START_RADIUS * angle.sin())
            })
            .collect();
        let velocity: Vec<(f32, f32)> = start
            .iter()
            .map(|(px, py)| (-2.0 * px / total as f32, -2.0 * py / total as f32))
            .collect();
        let position = |i: usize, t: usize| {
            let (px, py) = start[i];
            let (vx, vy) = velocity[i];
            (px + vx * t as f32, py + vy * t as f32)
        };

        let mut x = Vec::with_capacity(ob_horizon * n_agents * STATE_DIM);
        for t in 0..ob_horizon {
            for i in 0..n_agents {
                let (px, py) = position(i, t);
                let (vx, vy) = velocity[i];
                x.extend_from_slice(&[px, py, vx, vy, 0.0, 0.0]);
            }
        }

        let mut y = Vec::with_capacity(horizon * n_agents * 2);
        for t in ob_horizon..total {
            for i in 0..n_agents {
                let (px, py) = position(i, t);
                y.extend_from_slice(&[px, py]);
            }
        }

        let n_neighbors = n_agents - 1;
        let mut neighbor = Vec::with_capacity(total * n_agents * n_neighbors * 4);
        for t in 0..total {
            for i in 0..n_agents {
                for j in (0..n_agents).filter(|j| *j != i) {
                    let (px, py) = position(j, t);
                    let (vx, vy) = velocity[j];
                    neighbor.extend_from_slice(&[px, py, vx, vy]);
                }
            }
        }

        Ok(Self {
            x: Tensor::from_vec(x, (ob_horizon, n_agents, STATE_DIM), device)?,
            y: Tensor::from_vec(y, (horizon, n_agents, 2), device)?,
            neighbor: Tensor::from_vec(neighbor, (total, n_agents, n_neighbors, 4), device)?,
        })
    }

    pub fn n_agents(&self) -> usize {
        self.x.dims()[1]
    }

    /// Observed part as model input
    pub fn scene(&self) -> Scene {
        Scene::new(self.x.clone(), Some(self.neighbor.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;

    #[test]
    fn test_crossing_shapes() {
        let device = Device::Cpu;
        let s = SyntheticScene::crossing(4, 8, 12, &device).unwrap();
        assert_eq!(s.x.dims(), &[8, 4, 6]);
        assert_eq!(s.y.dims(), &[12, 4, 2]);
        assert_eq!(s.neighbor.dims(), &[20, 4, 3, 4]);
        assert_eq!(s.n_agents(), 4);
    }

    #[test]
    fn test_agents_move_at_constant_velocity() {
        let device = Device::Cpu;
        let s = SyntheticScene::crossing(2, 3, 3, &device).unwrap();
        let p0: Vec<f32> = s.x.i((0, 0)).unwrap().to_vec1().unwrap();
        let p1: Vec<f32> = s.x.i((1, 0)).unwrap().to_vec1().unwrap();
        assert!((p1[0] - p0[0] - p0[2]).abs() < 1e-6);
        // agent 0 starts at (3, 0) and heads to (-3, 0)
        assert!((p0[0] - 3.0).abs() < 1e-6);
        assert!(p0[2] < 0.0);
    }

    #[test]
    fn test_single_agent_has_no_neighbors() {
        let device = Device::Cpu;
        let s = SyntheticScene::crossing(1, 4, 2, &device).unwrap();
        assert_eq!(s.neighbor.dims(), &[6, 1, 0, 4]);
    }
}
