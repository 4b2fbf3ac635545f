//! Social VRNN forecaster
//!
//! Ties the encoder and the latent rollout together. Inference rolls the
//! prior forward (its mean, or `n_predictions` samples); training rolls the
//! posterior forward against a known future and reports the per-step
//! reconstruction error and KL terms.
//!
//! ```text
//!                 ┌──────────────── TemporalEncoder ────────────────┐
//! x, neighbor ──► │ features → embeddings → attention / graph → GRU │ ──► h
//!                 └─────────────────────────────────────────────────┘
//!                                      │ init
//!          ┌───────────────────────────▼───────────────────────────┐
//!          │ for t in 0..steps:                                    │
//!          │     z ~ p(z|h) or q(z|h,b)   d = dec(z, h)            │
//!          │     h = gru_fy(embed_zd(z, d), h)                     │
//!          └───────────────────────────┬───────────────────────────┘
//!                                      ▼
//!                     pred[t] = x_last + Σ d[0..=t]
//! ```
//!
//! The graph aggregation history lives inside the model, which is why both
//! entry points take `&mut self`.

use crate::config::{CapacityPolicy, VrnnConfig, DISPLACEMENT_DIM};
use crate::encoder::TemporalEncoder;
use crate::error::VrnnError;
use crate::graph::Similarity;
use crate::latent::{LatentNetworks, NoiseSource};
use crate::loss::{self, LossBreakdown};
use crate::VrnnResult;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};

// ═══════════════════════════════════════════════════════════════════════════
// INPUTS AND OUTPUTS
// ═══════════════════════════════════════════════════════════════════════════

/// Observed scene
#[derive(Debug, Clone)]
pub struct Scene {
    /// `(L1+1) x N x C` states, or `T x C` for a single agent
    pub x: Tensor,
    /// `T x N x Nn x 4` neighbor states (`T x Nn x 4` for a single agent);
    /// `None` means no neighbors
    pub neighbor: Option<Tensor>,
}

impl Scene {
    pub fn new(x: Tensor, neighbor: Option<Tensor>) -> Self {
        Self { x, neighbor }
    }

    /// Scene without neighbors
    pub fn observed(x: Tensor) -> Self {
        Self { x, neighbor: None }
    }
}

/// Inference options
#[derive(Debug, Clone, Default)]
pub struct PredictParams {
    /// `0` rolls out the prior mean; otherwise the number of samples
    pub n_predictions: usize,
    pub similarity: Similarity,
    /// Seed of the sampling noise; `None` draws from entropy
    pub seed: Option<u64>,
}

impl PredictParams {
    pub fn deterministic() -> Self {
        Self::default()
    }

    pub fn sampled(n_predictions: usize, seed: Option<u64>) -> Self {
        Self {
            n_predictions,
            seed,
            ..Self::default()
        }
    }

    pub fn with_similarity(mut self, similarity: Similarity) -> Self {
        self.similarity = similarity;
        self
    }
}

/// Training options
#[derive(Debug, Clone, Default)]
pub struct TrainParams {
    pub similarity: Similarity,
    /// Seed of the posterior sampling noise
    pub seed: Option<u64>,
}

/// Result of [`SocialVrnn::predict`]
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Absolute positions: `horizon x N x 2`, or `n x horizon x N x 2` when
    /// sampled. The agent axis is dropped for single-agent input.
    pub trajectory: Tensor,
    /// Per-step displacements, same layout as `trajectory`
    pub displacements: Tensor,
    /// Samples actually drawn (after the capacity limit); `0` when deterministic
    pub n_predictions: usize,
    /// Agents actually forecast (after the capacity limit)
    pub n_agents: usize,
}

impl Prediction {
    pub fn is_stochastic(&self) -> bool {
        self.n_predictions > 0
    }
}

/// Result of [`SocialVrnn::train_step`]. Tensors keep the agent axis even
/// for single-agent input.
#[derive(Debug, Clone)]
pub struct LearnOutput {
    /// Squared displacement error, `steps x N x 2`
    pub err: Tensor,
    /// `log q(z) - log p(z)` at the posterior sample, `steps x N x z_dim`
    pub kl: Tensor,
    /// Rolled-out steps, `min(horizon, future length)`
    pub steps: usize,
    /// Posterior reconstruction in absolute positions, `steps x N x 2`
    pub prediction: Tensor,
    /// Warning logged when the future length differed from the horizon
    pub horizon_warning: Option<String>,
}

/// Scene lifted to the batched layout
struct BatchedScene {
    x: Tensor,
    neighbor: Tensor,
    single: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// MODEL
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct SocialVrnn {
    config: VrnnConfig,
    encoder: TemporalEncoder,
    latent: LatentNetworks,
    device: Device,
}

impl SocialVrnn {
    pub fn new(config: VrnnConfig, vb: VarBuilder) -> VrnnResult<Self> {
        config.validate()?;
        let encoder = TemporalEncoder::new(&config, vb.clone())?;
        let latent = LatentNetworks::new(&config, vb.clone())?;
        Ok(Self {
            device: vb.device().clone(),
            config,
            encoder,
            latent,
        })
    }

    /// Freshly initialised model together with the `VarMap` holding its
    /// parameters
    pub fn new_random(config: VrnnConfig, device: &Device) -> VrnnResult<(Self, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(config, vb)?;
        Ok((model, varmap))
    }

    pub fn config(&self) -> &VrnnConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn encoder(&self) -> &TemporalEncoder {
        &self.encoder
    }

    /// Forget the graph aggregation history
    pub fn reset_history(&mut self) {
        self.encoder.reset_history();
    }

    /// Roll the prior forward for `horizon` steps
    pub fn predict(&mut self, scene: &Scene, params: &PredictParams) -> VrnnResult<Prediction> {
        let input = self.batch(scene, 0)?;
        let encoded = self
            .encoder
            .encode(&input.x, &input.neighbor, None, &params.similarity)?;

        let (agents, samples) = self.plan_capacity(input.x.dim(1)?, params.n_predictions)?;
        let stochastic = samples > 0;
        let origin = last_position(&input.x)?.narrow(0, 0, agents)?;

        let mut h = self.latent.init_hidden(&encoded.hidden.narrow(0, 0, agents)?)?;
        if stochastic {
            h = Tensor::cat(&vec![&h; samples], 0)?;
        }

        let horizon = self.config.horizon;
        let mut noise = NoiseSource::new(params.seed);
        let mut steps = Vec::with_capacity(horizon);
        for t in 0..horizon {
            let prior = self.latent.prior(&h)?;
            let z = if stochastic {
                noise.sample(&prior)?
            } else {
                prior.mean.clone()
            };
            let d = self.latent.decode(&z, &h)?;
            if t + 1 < horizon {
                h = self.latent.advance(&z, &d, &h)?;
            }
            steps.push(d);
        }

        let displacements = Tensor::stack(&steps, 0)?;
        let offsets = cumulative(&steps)?;
        let (mut displacements, mut trajectory, agent_axis) = if stochastic {
            // rows are sample-major: (sample, agent)
            let split = |t: Tensor| -> VrnnResult<Tensor> {
                Ok(t.reshape((horizon, samples, agents, DISPLACEMENT_DIM))?
                    .transpose(0, 1)?
                    .contiguous()?)
            };
            let trajectory = split(offsets)?.broadcast_add(&origin)?;
            (split(displacements)?, trajectory, 2)
        } else {
            let trajectory = offsets.broadcast_add(&origin)?;
            (displacements, trajectory, 1)
        };
        if input.single {
            displacements = displacements.squeeze(agent_axis)?;
            trajectory = trajectory.squeeze(agent_axis)?;
        }

        Ok(Prediction {
            trajectory,
            displacements,
            n_predictions: samples,
            n_agents: agents,
        })
    }

    /// Roll the posterior forward against `future` (`L2 x N x >=2`)
    pub fn train_step(
        &mut self,
        scene: &Scene,
        future: &Tensor,
        params: &TrainParams,
    ) -> VrnnResult<LearnOutput> {
        let future = future.to_dtype(DType::F32)?;
        let single = scene.x.rank() == 2;
        let future = if single && future.rank() == 2 {
            future.unsqueeze(1)?
        } else {
            future
        };
        let future_len = future.dim(0)?;
        if future_len == 0 {
            return Err(VrnnError::ShapeMismatch {
                what: "future steps",
                expected: ">= 1".to_string(),
                got: "0".to_string(),
            });
        }
        let (steps, horizon_warning) = self.rollout_steps(future_len)?;

        let input = self.batch(scene, future_len)?;
        let encoded = self.encoder.encode(
            &input.x,
            &input.neighbor,
            Some(&future),
            &params.similarity,
        )?;
        let backward = encoded.backward.ok_or_else(|| VrnnError::ShapeMismatch {
            what: "backward states",
            expected: format!("{} steps", future_len),
            got: "none".to_string(),
        })?;

        let (agents, _) = self.plan_capacity(input.x.dim(1)?, 0)?;
        let origin = last_position(&input.x)?.narrow(0, 0, agents)?;
        let backward = backward.narrow(1, 0, agents)?;
        let target = future
            .narrow(0, 0, steps)?
            .narrow(1, 0, agents)?
            .narrow(2, 0, DISPLACEMENT_DIM)?
            .detach()
            .broadcast_sub(&origin)?;

        let mut h = self.latent.init_hidden(&encoded.hidden.narrow(0, 0, agents)?)?;
        let mut noise = NoiseSource::new(params.seed);
        let mut displacements = Vec::with_capacity(steps);
        let mut kl = Vec::with_capacity(steps);
        for t in 0..steps {
            let prior = self.latent.prior(&h)?;
            let posterior = self.latent.posterior(&h, &backward.i(t)?)?;
            let z = noise.sample(&posterior)?;
            let d = self.latent.decode(&z, &h)?;
            kl.push((posterior.log_prob(&z)? - prior.log_prob(&z)?)?);
            if t + 1 < steps {
                h = self.latent.advance(&z, &d, &h)?;
            }
            displacements.push(d);
        }

        let offsets = cumulative(&displacements)?;
        let err = (&offsets - &target)?.sqr()?;
        let prediction = offsets.broadcast_add(&origin)?;
        Ok(LearnOutput {
            err,
            kl: Tensor::stack(&kl, 0)?,
            steps,
            prediction,
            horizon_warning,
        })
    }

    /// Positional inference entry point; returns the trajectory only
    pub fn forward(
        &mut self,
        x: &Tensor,
        neighbor: Option<&Tensor>,
        n_predictions: usize,
        similarity: Similarity,
    ) -> VrnnResult<Tensor> {
        let scene = Scene::new(x.clone(), neighbor.cloned());
        let params = PredictParams {
            n_predictions,
            similarity,
            seed: None,
        };
        Ok(self.predict(&scene, &params)?.trajectory)
    }

    /// Positional training entry point; returns `(err, kl)`
    pub fn learn(
        &mut self,
        x: &Tensor,
        y: &Tensor,
        neighbor: Option<&Tensor>,
        similarity: Similarity,
    ) -> VrnnResult<(Tensor, Tensor)> {
        let scene = Scene::new(x.clone(), neighbor.cloned());
        let params = TrainParams {
            similarity,
            seed: None,
        };
        let out = self.train_step(&scene, y, &params)?;
        Ok((out.err, out.kl))
    }

    pub fn loss(&self, output: &LearnOutput) -> VrnnResult<LossBreakdown> {
        loss::loss(&output.err, &output.kl)
    }

    // ───────────────────────────────────────────────────────────────────────

    /// Lift single-agent input, convert to f32 and synthesise an empty
    /// neighbor set when none is given
    fn batch(&self, scene: &Scene, future_len: usize) -> VrnnResult<BatchedScene> {
        let x = scene.x.to_dtype(DType::F32)?;
        let single = x.rank() == 2;
        let x = if single { x.unsqueeze(1)? } else { x };
        if x.rank() != 3 {
            return Err(VrnnError::ShapeMismatch {
                what: "x rank",
                expected: "2 or 3".to_string(),
                got: x.rank().to_string(),
            });
        }
        let (obs_len, n_agents, _) = x.dims3()?;

        let neighbor = match &scene.neighbor {
            Some(nb) => {
                let nb = nb.to_dtype(DType::F32)?;
                if single && nb.rank() == 3 {
                    nb.unsqueeze(1)?
                } else {
                    nb
                }
            }
            None => Tensor::zeros(
                (obs_len + future_len, n_agents, 0, 4),
                DType::F32,
                &self.device,
            )?,
        };
        Ok(BatchedScene { x, neighbor, single })
    }

    /// Steps to roll out for a future of `future_len`, with the warning
    /// logged when it differs from the horizon
    fn rollout_steps(&self, future_len: usize) -> VrnnResult<(usize, Option<String>)> {
        let horizon = self.config.horizon;
        if future_len == horizon {
            return Ok((horizon, None));
        }
        if self.config.strict_horizon {
            return Err(VrnnError::HorizonMismatch {
                expected: horizon,
                got: future_len,
            });
        }
        let steps = horizon.min(future_len);
        let warning = format!(
            "future length {} does not match horizon {}; rolling out {} steps",
            future_len, horizon, steps
        );
        log::warn!("{}", warning);
        Ok((steps, Some(warning)))
    }

    /// `(agents, samples)` the latent heads may consume.
    ///
    /// The rollout batch is `agents * max(samples, 1)` rows. Truncation keeps
    /// the leading agents and whole samples only.
    fn plan_capacity(&self, n_agents: usize, n_samples: usize) -> VrnnResult<(usize, usize)> {
        let limit = &self.config.capacity;
        let rows = n_agents * n_samples.max(1);
        if rows <= limit.max_batch {
            return Ok((n_agents, n_samples));
        }
        match limit.policy {
            CapacityPolicy::Reject => Err(VrnnError::CapacityExceeded {
                what: "rollout rows",
                limit: limit.max_batch,
                got: rows,
            }),
            CapacityPolicy::Truncate => {
                let agents = n_agents.min(limit.max_batch);
                let samples = if n_samples == 0 {
                    0
                } else {
                    (limit.max_batch / agents).clamp(1, n_samples)
                };
                log::warn!(
                    "rollout batch of {} rows exceeds {}; keeping {} agents x {} samples",
                    rows,
                    limit.max_batch,
                    agents,
                    samples.max(1)
                );
                Ok((agents, samples))
            }
        }
    }
}

/// Positions at the last observed step, `N x 2`
fn last_position(x: &Tensor) -> VrnnResult<Tensor> {
    let last = x.dim(0)? - 1;
    Ok(x.i(last)?.narrow(1, 0, DISPLACEMENT_DIM)?.detach())
}

/// Running sum over per-step displacements, stacked on a new leading axis
fn cumulative(steps: &[Tensor]) -> VrnnResult<Tensor> {
    let mut sums = Vec::with_capacity(steps.len());
    let mut acc: Option<Tensor> = None;
    for d in steps {
        let next = match &acc {
            Some(prev) => (prev + d)?,
            None => d.clone(),
        };
        sums.push(next.clone());
        acc = Some(next);
    }
    Ok(Tensor::stack(&sums, 0)?)
}
