//! Latent mixer: turns a noise batch into one code per weight generator

mod noise;

pub use noise::NoiseSampler;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::debug;

use crate::config::{LatentConfig, MixerConfig};
use crate::error::{Error, Result};
use crate::hypernetwork::models::{perturb, Mlp, MlpConfig};
use crate::hypernetwork::Activation;

/// Per-generator latent codes for one batch of noise draws
#[derive(Debug, Clone)]
pub struct LatentCodes {
    codes: Vec<Tensor>,
}

impl LatentCodes {
    /// Wrap codes, each `(batch, code_dim)`, all with the same batch size
    pub fn new(codes: Vec<Tensor>) -> Result<Self> {
        let first = codes
            .first()
            .ok_or_else(|| Error::invalid_input("latent codes must not be empty"))?;
        let dims = first.dims().to_vec();
        for code in &codes {
            if code.dims() != dims.as_slice() {
                return Err(Error::shape_mismatch("latent code", &dims, code.dims()));
            }
        }
        Ok(Self { codes })
    }

    /// Number of codes, one per generator
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.codes[0].dims()[0]
    }

    pub fn code_dim(&self) -> usize {
        self.codes[0].dims()[1]
    }

    /// Code routed to generator `index`
    pub fn code(&self, index: usize) -> Result<&Tensor> {
        self.codes.get(index).ok_or_else(|| {
            Error::invalid_input(format!("code index {} out of range ({} codes)", index, self.codes.len()))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.codes.iter()
    }

    /// All codes stacked row-wise, `(num_codes * batch, code_dim)`; the discriminator's view
    pub fn stacked(&self) -> Result<Tensor> {
        Ok(Tensor::cat(&self.codes, 0)?)
    }

    /// Same codes cut off from the graph that produced them
    pub fn detach(&self) -> Self {
        Self {
            codes: self.codes.iter().map(Tensor::detach).collect(),
        }
    }
}

/// Mixer network: `noise (B, noise_dim) -> (B, num_codes * code_dim)`, split into codes
pub struct Mixer {
    mlp: Mlp,
    num_codes: usize,
    code_dim: usize,
    noise_dim: usize,
    input_noise_std: f64,
}

impl Mixer {
    pub fn new(latent: &LatentConfig, config: &MixerConfig, num_codes: usize, vb: VarBuilder) -> Result<Self> {
        if num_codes == 0 {
            return Err(Error::config("mixer needs at least one code"));
        }
        let mlp = Mlp::new(
            MlpConfig {
                input_dim: latent.noise_dim,
                hidden_dims: config.hidden_dims.clone(),
                output_dim: num_codes * latent.code_dim,
                activation: config.activation,
                output_activation: Activation::Identity,
                batch_norm: config.batch_norm,
                bias: config.bias,
            },
            vb,
        )?;
        debug!(
            "Mixer: {} -> {:?} -> {} codes x {}",
            latent.noise_dim, config.hidden_dims, num_codes, latent.code_dim
        );
        Ok(Self {
            mlp,
            num_codes,
            code_dim: latent.code_dim,
            noise_dim: latent.noise_dim,
            input_noise_std: config.input_noise_std,
        })
    }

    pub fn num_codes(&self) -> usize {
        self.num_codes
    }

    pub fn noise_dim(&self) -> usize {
        self.noise_dim
    }

    /// Input perturbation draws from `sampler`
    pub fn forward_t(&self, noise: &Tensor, train: bool, sampler: &mut NoiseSampler) -> Result<LatentCodes> {
        let (batch, width) = noise.dims2()?;
        if width != self.noise_dim {
            return Err(Error::shape_mismatch("mixer input", &[batch, self.noise_dim], &[batch, width]));
        }
        let x = perturb(noise, self.input_noise_std, sampler)?;
        let mixed = self.mlp.forward_train(&x, train)?;
        let mixed = mixed.reshape((batch, self.num_codes, self.code_dim))?;
        let codes = (0..self.num_codes)
            .map(|i| mixed.narrow(1, i, 1)?.squeeze(1)?.contiguous())
            .collect::<candle_core::Result<Vec<_>>>()?;
        LatentCodes::new(codes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn mixer(num_codes: usize) -> Mixer {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let latent = LatentConfig { noise_dim: 6, code_dim: 4 };
        let config = MixerConfig {
            hidden_dims: vec![16],
            activation: Activation::Relu,
            batch_norm: true,
            bias: false,
            input_noise_std: 0.01,
        };
        Mixer::new(&latent, &config, num_codes, vb).unwrap()
    }

    #[test]
    fn splits_output_into_one_code_per_generator() {
        let mixer = mixer(3);
        let mut sampler = NoiseSampler::new(0);
        let noise = sampler.sample(5, 6, &Device::Cpu).unwrap();
        let codes = mixer.forward_t(&noise, true, &mut sampler).unwrap();
        assert_eq!(codes.len(), 3);
        assert_eq!(codes.batch_size(), 5);
        assert_eq!(codes.code_dim(), 4);
        assert_eq!(codes.stacked().unwrap().dims(), &[15, 4]);
        assert!(codes.code(3).is_err());
    }

    #[test]
    fn rejects_wrong_noise_width() {
        let mixer = mixer(2);
        let noise = Tensor::zeros((4, 5), DType::F32, &Device::Cpu).unwrap();
        let err = mixer.forward_t(&noise, true, &mut NoiseSampler::new(0)).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn latent_codes_reject_mixed_shapes() {
        let a = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(LatentCodes::new(vec![a, b]).is_err());
        assert!(LatentCodes::new(vec![]).is_err());
    }
}
