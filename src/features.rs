//! Social feature extraction
//!
//! Turns raw position sequences into the kinematic and social quantities the
//! encoder embeds. Nothing here is learned and nothing is differentiated:
//! every input is detached first.
//!
//! ```text
//! x (L1+1) x N x C ──┐
//! y  L2    x N x 2 ──┴─► p (L+1) x N x 2 ─► v, a          L x N x 2
//! neighbor (L+1) x N x Nn x 4 ──────────► dp, dv, mask   L x N x Nn
//!                                         dist, bearing, mpd
//! ```

use crate::config::VrnnConfig;
use crate::error::VrnnError;
use crate::ops::{norm_last, safe_div};
use crate::VrnnResult;
use candle_core::{DType, IndexOp, Tensor, D};

/// Everything the encoder needs from one scene
#[derive(Debug, Clone)]
pub struct SocialFeatures {
    /// Velocity per step, `L x N x 2`
    pub velocity: Tensor,
    /// Acceleration per step, `L x N x 2`
    pub acceleration: Tensor,
    /// Neighbor position relative to the agent, `L x N x Nn x 2`
    pub rel_position: Tensor,
    /// Neighbor velocity relative to the agent, `L x N x Nn x 2`
    pub rel_velocity: Tensor,
    /// `(dist, bearing, mpd)` per neighbor, `L x N x Nn x 3`
    pub social: Tensor,
    /// Visibility mask (`u8`), `L x N x Nn`
    pub mask: Tensor,
    /// Relative neighbor position at the first observed step, `N x Nn x 2`
    pub initial_offset: Tensor,
    /// Visibility at the first observed step (`u8`), `N x Nn`
    pub initial_mask: Tensor,
    /// Observed transitions `L1`
    pub observed_steps: usize,
    /// Future transitions `L2`
    pub future_steps: usize,
}

impl SocialFeatures {
    pub fn num_agents(&self) -> usize {
        self.velocity.dims()[1]
    }

    pub fn num_neighbors(&self) -> usize {
        self.mask.dims()[2]
    }

    /// Self kinematics `(v, a)`, `L x N x 4`
    pub fn kinematics(&self) -> VrnnResult<Tensor> {
        Ok(Tensor::cat(&[&self.velocity, &self.acceleration], D::Minus1)?)
    }

    /// Neighbor relative state `(dp, dv)`, `L x N x Nn x 4`
    pub fn relative_state(&self) -> VrnnResult<Tensor> {
        Ok(Tensor::cat(&[&self.rel_position, &self.rel_velocity], D::Minus1)?)
    }
}

/// Stateless extractor parameterised by the visibility radius
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    ob_radius: f64,
    tau_max: f64,
}

impl FeatureExtractor {
    pub fn new(ob_radius: f64, tau_max: f64) -> Self {
        Self { ob_radius, tau_max }
    }

    pub fn from_config(config: &VrnnConfig) -> Self {
        Self::new(config.ob_radius, config.tau_max)
    }

    pub fn ob_radius(&self) -> f64 {
        self.ob_radius
    }

    /// Extract features for the observed window and, when given, the future.
    ///
    /// `x` is `(L1+1) x N x C` with `C >= 2`; when `C >= 6`, `x[1, :, 4..6]`
    /// seeds the first acceleration, otherwise it is zero. `neighbor` must
    /// cover at least `L1 + L2 + 1` steps; extra steps are ignored.
    pub fn extract(
        &self,
        x: &Tensor,
        neighbor: &Tensor,
        y: Option<&Tensor>,
    ) -> VrnnResult<SocialFeatures> {
        let x = x.detach().to_dtype(DType::F32)?;
        let neighbor = neighbor.detach().to_dtype(DType::F32)?;
        let device = x.device().clone();

        let (obs_len, n_agents, channels) = x.dims3()?;
        if obs_len < 2 {
            return Err(VrnnError::InsufficientHistory { got: obs_len });
        }
        if channels < 2 {
            return Err(VrnnError::ShapeMismatch {
                what: "x channels",
                expected: ">= 2".to_string(),
                got: channels.to_string(),
            });
        }
        let l1 = obs_len - 1;

        let mut positions = x.narrow(2, 0, 2)?;
        let l2 = match y {
            Some(y) => {
                let y = y.detach().to_dtype(DType::F32)?;
                let (l2, y_agents, _) = y.dims3()?;
                if y_agents != n_agents {
                    return Err(VrnnError::ShapeMismatch {
                        what: "future agents",
                        expected: n_agents.to_string(),
                        got: y_agents.to_string(),
                    });
                }
                positions = Tensor::cat(&[&positions, &y.narrow(2, 0, 2)?], 0)?;
                l2
            }
            None => 0,
        };
        let l = l1 + l2;

        let (nb_len, nb_agents, n_neighbors, nb_channels) = neighbor.dims4()?;
        if nb_agents != n_agents {
            return Err(VrnnError::ShapeMismatch {
                what: "neighbor agents",
                expected: n_agents.to_string(),
                got: nb_agents.to_string(),
            });
        }
        if nb_len < l + 1 {
            return Err(VrnnError::ShapeMismatch {
                what: "neighbor steps",
                expected: format!(">= {}", l + 1),
                got: nb_len.to_string(),
            });
        }
        if nb_channels < 4 {
            return Err(VrnnError::ShapeMismatch {
                what: "neighbor channels",
                expected: ">= 4".to_string(),
                got: nb_channels.to_string(),
            });
        }

        let velocity = (positions.narrow(0, 1, l)? - positions.narrow(0, 0, l)?)?;
        let seed = if channels >= 6 {
            x.narrow(0, 1, 1)?.narrow(2, 4, 2)?
        } else {
            Tensor::zeros((1, n_agents, 2), DType::F32, &device)?
        };
        let acceleration = if l > 1 {
            let dv = (velocity.narrow(0, 1, l - 1)? - velocity.narrow(0, 0, l - 1)?)?;
            Tensor::cat(&[&seed, &dv], 0)?
        } else {
            seed
        };

        if n_neighbors == 0 {
            return Ok(SocialFeatures {
                velocity,
                acceleration,
                rel_position: Tensor::zeros((l, n_agents, 0, 2), DType::F32, &device)?,
                rel_velocity: Tensor::zeros((l, n_agents, 0, 2), DType::F32, &device)?,
                social: Tensor::zeros((l, n_agents, 0, 3), DType::F32, &device)?,
                mask: Tensor::zeros((l, n_agents, 0), DType::U8, &device)?,
                initial_offset: Tensor::zeros((n_agents, 0, 2), DType::F32, &device)?,
                initial_mask: Tensor::zeros((n_agents, 0), DType::U8, &device)?,
                observed_steps: l1,
                future_steps: l2,
            });
        }

        let neighbor = neighbor.narrow(0, 0, l + 1)?;
        let neighbor_pos = neighbor.narrow(3, 0, 2)?;
        let neighbor_vel = neighbor.narrow(0, 1, l)?.narrow(3, 2, 2)?;

        let dp_all = neighbor_pos.broadcast_sub(&positions.unsqueeze(2)?)?;
        let dv = neighbor_vel.broadcast_sub(&velocity.unsqueeze(2)?)?;
        let dist_all = norm_last(&dp_all)?;
        let mask_all = dist_all.le(self.ob_radius)?;

        let initial_offset = dp_all.i(0)?;
        let initial_mask = mask_all.i(0)?;
        let dp = dp_all.narrow(0, 1, l)?;
        let mask = mask_all.narrow(0, 1, l)?;
        let dist = dist_all.narrow(0, 1, l)?;

        // bearing: cosine between the neighbor offset and the own heading
        let speed = norm_last(&velocity)?.unsqueeze(2)?;
        let dot_dp_v = dp.broadcast_mul(&velocity.unsqueeze(2)?)?.sum(D::Minus1)?;
        let bearing = safe_div(&dot_dp_v, &dist.broadcast_mul(&speed)?)?;

        // time and distance of closest approach under constant velocity
        let dot_dp_dv = (&dp * &dv)?.sum(D::Minus1)?;
        let dv_sq = dv.sqr()?.sum(D::Minus1)?;
        let tau = safe_div(&dot_dp_dv.neg()?, &dv_sq)?.clamp(0f32, self.tau_max as f32)?;
        let closest = (&dp + dv.broadcast_mul(&tau.unsqueeze(3)?)?)?;
        let mpd = norm_last(&closest)?;

        let social = Tensor::stack(&[&dist, &bearing, &mpd], 3)?;

        Ok(SocialFeatures {
            velocity,
            acceleration,
            rel_position: dp,
            rel_velocity: dv,
            social,
            mask,
            initial_offset,
            initial_mask,
            observed_steps: l1,
            future_steps: l2,
        })
    }
}
