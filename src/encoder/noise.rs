//! Seeded Gaussian noise for the mixer input and discriminator prior

use crate::error::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Draws standard-normal tensors from a seeded generator so runs are reproducible on any device
pub struct NoiseSampler {
    rng: StdRng,
}

impl NoiseSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// `(batch, dim)` noise
    pub fn sample(&mut self, batch: usize, dim: usize, device: &Device) -> Result<Tensor> {
        self.sample_like(&[batch, dim], device)
    }

    /// Noise with an arbitrary shape, e.g. prior draws matching a code tensor
    pub fn sample_like(&mut self, shape: &[usize], device: &Device) -> Result<Tensor> {
        let numel: usize = shape.iter().product();
        let values: Vec<f32> = (0..numel).map(|_| self.rng.sample(StandardNormal)).collect();
        Ok(Tensor::from_vec(values, shape, device)?)
    }
}
