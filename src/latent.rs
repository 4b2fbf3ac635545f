//! Latent prior, posterior and decoder
//!
//! Every rollout step draws a latent code from the prior (inference) or the
//! posterior (training), decodes it into a 2-D displacement and feeds both
//! back into the rollout GRU.
//!
//! ```text
//!   p(z | h)       = N(mu_p(h), std_p(h))
//!   q(z | h, b)    = N(mu_q(h, b), std_q(h, b))
//!   d              = dec(z, h)
//!   h'             = gru_fy(embed_zd(z, d), h)
//! ```
//!
//! The heads read at most `CapacityLimit::max_hidden` features of `h`.

use crate::config::{VrnnConfig, DISPLACEMENT_DIM};
use crate::embedding::Mlp;
use crate::ops::softplus;
use crate::recurrent::GruCell;
use crate::VrnnResult;
use candle_core::{Device, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::f64::consts::PI;

/// Smallest standard deviation a head can emit; keeps `ln std` and
/// `(z - mean) / std` finite when softplus underflows
pub const MIN_STD: f64 = 1e-20;

// ═══════════════════════════════════════════════════════════════════════════
// DISTRIBUTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Diagonal Gaussian over the latent code
#[derive(Debug, Clone)]
pub struct DiagonalGaussian {
    pub mean: Tensor,
    pub std: Tensor,
}

impl DiagonalGaussian {
    /// Elementwise log density at `z`
    pub fn log_prob(&self, z: &Tensor) -> VrnnResult<Tensor> {
        let quad = ((z - &self.mean)? / &self.std)?.sqr()?.affine(0.5, 0.0)?;
        let log_norm = self.std.log()?.affine(1.0, 0.5 * (2.0 * PI).ln())?;
        Ok((quad + log_norm)?.neg()?)
    }

    /// Reparameterised sample `mean + std * eps`
    pub fn rsample(&self, eps: &Tensor) -> VrnnResult<Tensor> {
        Ok((&self.mean + (&self.std * eps)?)?)
    }
}

/// Seeded standard-normal noise
#[derive(Debug)]
pub struct NoiseSource {
    rng: StdRng,
}

impl NoiseSource {
    /// Deterministic stream for `Some(seed)`, entropy-seeded otherwise
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn standard_normal(&mut self, dims: &[usize], device: &Device) -> VrnnResult<Tensor> {
        let count: usize = dims.iter().product();
        let data: Vec<f32> = (0..count)
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(data, dims, device)?)
    }

    /// Sample `dist` with fresh noise
    pub fn sample(&mut self, dist: &DiagonalGaussian) -> VrnnResult<Tensor> {
        let eps = self.standard_normal(dist.mean.dims(), dist.mean.device())?;
        dist.rsample(&eps)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HEADS
// ═══════════════════════════════════════════════════════════════════════════

/// Bounded embedding followed by mean and softplus-std projections
#[derive(Debug, Clone)]
pub struct GaussianHead {
    embed: Mlp,
    mu: Linear,
    std: Linear,
}

impl GaussianHead {
    pub fn new(input_dim: usize, embed_dim: usize, z_dim: usize, vb: VarBuilder) -> VrnnResult<Self> {
        Ok(Self {
            embed: Mlp::new(&[input_dim, embed_dim, embed_dim], true, vb.pp("embed"))?,
            mu: candle_nn::linear(embed_dim, z_dim, vb.pp("mu"))?,
            std: candle_nn::linear(embed_dim, z_dim, vb.pp("std"))?,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.embed.input_dim()
    }

    pub fn forward(&self, x: &Tensor) -> VrnnResult<DiagonalGaussian> {
        let e = self.embed.forward(x)?;
        Ok(DiagonalGaussian {
            mean: self.mu.forward(&e)?,
            std: softplus(&self.std.forward(&e)?)?.maximum(MIN_STD as f32)?,
        })
    }
}

/// `(z, h)` → displacement
#[derive(Debug, Clone)]
pub struct Decoder {
    embed: Mlp,
    mu: Linear,
}

impl Decoder {
    pub fn new(z_dim: usize, hidden_dim: usize, embed_dim: usize, vb: VarBuilder) -> VrnnResult<Self> {
        Ok(Self {
            embed: Mlp::new(&[z_dim + hidden_dim, embed_dim, embed_dim], true, vb.pp("embed"))?,
            mu: candle_nn::linear(embed_dim, DISPLACEMENT_DIM, vb.pp("mu"))?,
        })
    }

    pub fn forward(&self, z: &Tensor, h: &Tensor) -> VrnnResult<Tensor> {
        let e = self.embed.forward(&Tensor::cat(&[z, h], D::Minus1)?)?;
        Ok(self.mu.forward(&e)?)
    }
}

/// `(z, d)` → rollout GRU input
#[derive(Debug, Clone)]
pub struct LatentEmbedder {
    embed: Mlp,
}

impl LatentEmbedder {
    pub fn new(z_dim: usize, vb: VarBuilder) -> VrnnResult<Self> {
        Ok(Self {
            embed: Mlp::new(&[z_dim + DISPLACEMENT_DIM, z_dim, z_dim], false, vb.pp("embed_zd"))?,
        })
    }

    pub fn forward(&self, z: &Tensor, d: &Tensor) -> VrnnResult<Tensor> {
        self.embed.forward(&Tensor::cat(&[z, d], D::Minus1)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ROLLOUT NETWORKS
// ═══════════════════════════════════════════════════════════════════════════

/// Everything the per-step rollout touches
#[derive(Debug, Clone)]
pub struct LatentNetworks {
    prior: GaussianHead,
    posterior: GaussianHead,
    decoder: Decoder,
    embed_zd: LatentEmbedder,
    hidden_init: Mlp,
    gru_fy: GruCell,
    head_hidden_dim: usize,
}

impl LatentNetworks {
    pub fn new(config: &VrnnConfig, vb: VarBuilder) -> VrnnResult<Self> {
        let h = config.hidden_dim;
        let hh = config.head_hidden_dim();
        let z = config.z_dim;
        Ok(Self {
            prior: GaussianHead::new(hh, h, z, vb.pp("p_z"))?,
            posterior: GaussianHead::new(hh + config.backward_hidden_dim, h, z, vb.pp("q_z"))?,
            decoder: Decoder::new(z, hh, h, vb.pp("dec"))?,
            embed_zd: LatentEmbedder::new(z, vb.clone())?,
            hidden_init: Mlp::new(&[h, h, h], false, vb.pp("rnn_fy_init"))?,
            gru_fy: GruCell::new(z, h, vb.pp("rnn_fy"))?,
            head_hidden_dim: hh,
        })
    }

    pub fn head_hidden_dim(&self) -> usize {
        self.head_hidden_dim
    }

    /// Map the encoded state to the rollout GRU's initial state
    pub fn init_hidden(&self, encoded: &Tensor) -> VrnnResult<Tensor> {
        self.hidden_init.forward(encoded)
    }

    fn head_input(&self, h: &Tensor) -> VrnnResult<Tensor> {
        if h.dim(D::Minus1)? > self.head_hidden_dim {
            Ok(h.narrow(D::Minus1, 0, self.head_hidden_dim)?)
        } else {
            Ok(h.clone())
        }
    }

    pub fn prior(&self, h: &Tensor) -> VrnnResult<DiagonalGaussian> {
        self.prior.forward(&self.head_input(h)?)
    }

    pub fn posterior(&self, h: &Tensor, b: &Tensor) -> VrnnResult<DiagonalGaussian> {
        let input = Tensor::cat(&[&self.head_input(h)?, b], D::Minus1)?;
        self.posterior.forward(&input)
    }

    pub fn decode(&self, z: &Tensor, h: &Tensor) -> VrnnResult<Tensor> {
        self.decoder.forward(z, &self.head_input(h)?)
    }

    /// Advance the rollout GRU by one step
    pub fn advance(&self, z: &Tensor, d: &Tensor, h: &Tensor) -> VrnnResult<Tensor> {
        let zd = self.embed_zd.forward(z, d)?;
        self.gru_fy.step(&zd, h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    #[test]
    fn test_log_prob_standard_normal() {
        let device = Device::Cpu;
        let dist = DiagonalGaussian {
            mean: Tensor::zeros(2, DType::F32, &device).unwrap(),
            std: Tensor::ones(2, DType::F32, &device).unwrap(),
        };
        let z = Tensor::new(&[0.0f32, 1.0], &device).unwrap();
        let lp: Vec<f32> = dist.log_prob(&z).unwrap().to_vec1().unwrap();
        let c = -0.5 * (2.0 * std::f32::consts::PI).ln();
        assert!((lp[0] - c).abs() < 1e-5);
        assert!((lp[1] - (c - 0.5)).abs() < 1e-5);
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let device = Device::Cpu;
        let a: Vec<f32> = NoiseSource::new(Some(7))
            .standard_normal(&[3, 4], &device)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = NoiseSource::new(Some(7))
            .standard_normal(&[3, 4], &device)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let c: Vec<f32> = NoiseSource::new(Some(8))
            .standard_normal(&[3, 4], &device)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_head_std_is_positive() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = GaussianHead::new(6, 8, 3, vb).unwrap();
        let x = (Tensor::randn(0f32, 1.0, (10, 6), &device).unwrap() * 20.0).unwrap();
        let dist = head.forward(&x).unwrap();
        assert_eq!(dist.mean.dims(), &[10, 3]);
        let std: Vec<f32> = dist.std.flatten_all().unwrap().to_vec1().unwrap();
        assert!(std.iter().all(|s| *s > 0.0));
    }

    #[test]
    fn test_head_std_survives_strongly_negative_preactivation() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = GaussianHead::new(6, 8, 4, vb).unwrap();
        {
            let vars = varmap.data().lock().unwrap();
            vars["std.weight"]
                .set(&Tensor::zeros((4, 8), DType::F32, &device).unwrap())
                .unwrap();
            vars["std.bias"]
                .set(&Tensor::new(&[-17.0f32, -30.0, -60.0, -120.0], &device).unwrap())
                .unwrap();
        }

        let x = Tensor::randn(0f32, 1.0, (5, 6), &device).unwrap();
        let q = head.forward(&x).unwrap();
        let std: Vec<f32> = q.std.flatten_all().unwrap().to_vec1().unwrap();
        assert!(std.iter().all(|s| *s > 0.0));

        let p = DiagonalGaussian {
            mean: q.mean.zeros_like().unwrap(),
            std: q.std.ones_like().unwrap(),
        };
        let z = q.rsample(&(q.mean.ones_like().unwrap() * 0.3).unwrap()).unwrap();
        let kl = (q.log_prob(&z).unwrap() - p.log_prob(&z).unwrap()).unwrap();
        let kl: Vec<f32> = kl.flatten_all().unwrap().to_vec1().unwrap();
        assert!(kl.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_heads_read_capped_hidden_width() {
        let device = Device::Cpu;
        let mut config = VrnnConfig::tiny();
        config.hidden_dim = 24;
        config.capacity.max_hidden = 16;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let nets = LatentNetworks::new(&config, vb).unwrap();
        assert_eq!(nets.head_hidden_dim(), 16);

        let h = Tensor::randn(0f32, 1.0, (5, 24), &device).unwrap();
        let prior = nets.prior(&h).unwrap();
        assert_eq!(prior.mean.dims(), &[5, config.z_dim]);
        let d = nets.decode(&prior.mean, &h).unwrap();
        assert_eq!(d.dims(), &[5, DISPLACEMENT_DIM]);
        let h2 = nets.advance(&prior.mean, &d, &h).unwrap();
        assert_eq!(h2.dims(), &[5, 24]);
    }
}
