//! Latent-space discriminator (or Wasserstein critic) that pulls the mixer codes towards a Gaussian prior

use candle_core::{Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::config::DiscriminatorConfig;
use crate::error::{Error, Result};
use crate::hypernetwork::models::{Mlp, MlpConfig};
use crate::hypernetwork::Activation;
use crate::training::loss::bce_with_logits;

/// Which adversarial term, if any, shapes the latent codes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LatentRegularizer {
    None,
    /// Standard GAN discriminator trained with binary cross entropy
    Gan,
    /// Critic with weights clamped to `[-clip, clip]` after every update
    Wasserstein { clip: f64 },
}

impl LatentRegularizer {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, LatentRegularizer::None)
    }
}

impl Default for LatentRegularizer {
    fn default() -> Self {
        LatentRegularizer::None
    }
}

pub struct LatentDiscriminator {
    mlp: Mlp,
    regularizer: LatentRegularizer,
    beta: f64,
    code_dim: usize,
}

impl LatentDiscriminator {
    pub fn new(code_dim: usize, config: &DiscriminatorConfig, vb: VarBuilder) -> Result<Self> {
        if !config.regularizer.is_enabled() {
            return Err(Error::config("latent discriminator requested with the regularizer disabled"));
        }
        let mlp = Mlp::new(
            MlpConfig {
                input_dim: code_dim,
                hidden_dims: config.hidden_dims.clone(),
                output_dim: 1,
                activation: config.activation,
                output_activation: Activation::Identity,
                batch_norm: false,
                bias: true,
            },
            vb,
        )?;
        Ok(Self {
            mlp,
            regularizer: config.regularizer,
            beta: config.beta,
            code_dim,
        })
    }

    pub fn regularizer(&self) -> LatentRegularizer {
        self.regularizer
    }

    /// Weight of the adversarial term in the hypernetwork objective
    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Raw logit (GAN) or critic value (Wasserstein), one per row of `(N, code_dim)`
    pub fn forward(&self, codes: &Tensor) -> Result<Tensor> {
        let (n, width) = codes.dims2()?;
        if width != self.code_dim {
            return Err(Error::shape_mismatch("discriminator input", &[n, self.code_dim], &[n, width]));
        }
        Ok(self.mlp.forward_train(codes, true)?.squeeze(D::Minus1)?)
    }

    /// Probability that each row was drawn from the prior
    pub fn probability(&self, codes: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::ops::sigmoid(&self.forward(codes)?)?)
    }

    /// Loss minimised by the discriminator; `codes` should already be detached from the mixer
    pub fn discriminator_loss(&self, prior: &Tensor, codes: &Tensor) -> Result<Tensor> {
        let on_prior = self.forward(prior)?;
        let on_codes = self.forward(codes)?;
        match self.regularizer {
            LatentRegularizer::Gan => {
                let real = bce_with_logits(&on_prior, 1.0)?;
                let fake = bce_with_logits(&on_codes, 0.0)?;
                Ok((real + fake)?)
            }
            LatentRegularizer::Wasserstein { .. } => Ok((on_codes.mean_all()? - on_prior.mean_all()?)?),
            LatentRegularizer::None => Err(Error::config("latent regularizer is disabled")),
        }
    }

    /// Term added to the hypernetwork loss so the codes look like prior draws
    pub fn adversarial_loss(&self, codes: &Tensor) -> Result<Tensor> {
        let on_codes = self.forward(codes)?;
        match self.regularizer {
            LatentRegularizer::Gan => bce_with_logits(&on_codes, 1.0),
            LatentRegularizer::Wasserstein { .. } => Ok(on_codes.mean_all()?.neg()?),
            LatentRegularizer::None => Err(Error::config("latent regularizer is disabled")),
        }
    }

    /// Clamp every critic variable; no-op unless this is a Wasserstein critic
    pub fn clip_weights(&self, vars: &VarMap) -> Result<()> {
        if let LatentRegularizer::Wasserstein { clip } = self.regularizer {
            for var in vars.all_vars() {
                let clamped = var.as_tensor().clamp(-clip, clip)?;
                var.set(&clamped)?;
            }
        }
        Ok(())
    }
}
