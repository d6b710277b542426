//! Trainable building blocks shared by the mixer, the generators and the discriminator

use super::Activation;
use crate::encoder::NoiseSampler;
use crate::error::Result;
use candle_core::{Module, ModuleT, Tensor, Var};
use candle_nn::{Init, Linear, VarBuilder};

const BN_MOMENTUM: f64 = 0.1;
const BN_EPS: f64 = 1e-5;

/// Batch normalisation over the feature axis of a `(batch, features)` tensor.
///
/// Running statistics are registered as variables so they travel with the
/// network's `VarMap` into checkpoints. They never receive gradients.
pub struct BatchNorm1d {
    weight: Tensor,
    bias: Option<Tensor>,
    running_mean: Var,
    running_var: Var,
    num_features: usize,
}

impl BatchNorm1d {
    /// `shift` controls whether a learnable bias follows the learnable scale
    pub fn new(num_features: usize, shift: bool, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(num_features, "weight", Init::Const(1.0))?;
        let bias = if shift {
            Some(vb.get_with_hints(num_features, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        let running_mean = Var::from_tensor(&vb.get_with_hints(num_features, "running_mean", Init::Const(0.0))?)?;
        let running_var = Var::from_tensor(&vb.get_with_hints(num_features, "running_var", Init::Const(1.0))?)?;
        Ok(Self { weight, bias, running_mean, running_var, num_features })
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn running_mean(&self) -> &Tensor {
        self.running_mean.as_tensor()
    }

    pub fn running_var(&self) -> &Tensor {
        self.running_var.as_tensor()
    }

    fn update_running_stats(&self, mean: &Tensor, var: &Tensor, batch: usize) -> Result<()> {
        let correction = if batch > 1 { batch as f64 / (batch - 1) as f64 } else { 1.0 };
        let mean = mean.detach().squeeze(0)?;
        let var = (var.detach().squeeze(0)? * correction)?;
        let new_mean = ((self.running_mean.as_tensor() * (1.0 - BN_MOMENTUM))? + (mean * BN_MOMENTUM)?)?;
        let new_var = ((self.running_var.as_tensor() * (1.0 - BN_MOMENTUM))? + (var * BN_MOMENTUM)?)?;
        self.running_mean.set(&new_mean)?;
        self.running_var.set(&new_var)?;
        Ok(())
    }

    fn normalize(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let normed = if train {
            let mean = xs.mean_keepdim(0)?;
            let centered = xs.broadcast_sub(&mean)?;
            let var = centered.sqr()?.mean_keepdim(0)?;
            self.update_running_stats(&mean, &var, xs.dim(0)?)?;
            centered.broadcast_div(&(var + BN_EPS)?.sqrt()?)?
        } else {
            let mean = self.running_mean.as_tensor().unsqueeze(0)?;
            let std = (self.running_var.as_tensor() + BN_EPS)?.sqrt()?.unsqueeze(0)?;
            xs.broadcast_sub(&mean)?.broadcast_div(&std)?
        };
        let scaled = normed.broadcast_mul(&self.weight.unsqueeze(0)?)?;
        match &self.bias {
            Some(bias) => Ok(scaled.broadcast_add(&bias.unsqueeze(0)?)?),
            None => Ok(scaled),
        }
    }
}

impl ModuleT for BatchNorm1d {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        self.normalize(xs, train)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}

/// Shape of an [`Mlp`]
#[derive(Debug, Clone, PartialEq)]
pub struct MlpConfig {
    pub input_dim: usize,
    pub hidden_dims: Vec<usize>,
    pub output_dim: usize,
    pub activation: Activation,
    pub output_activation: Activation,
    pub batch_norm: bool,
    pub bias: bool,
}

struct HiddenBlock {
    linear: Linear,
    norm: Option<BatchNorm1d>,
}

/// Fully connected stack: `[Linear -> BatchNorm1d? -> activation]* -> Linear -> output activation`
pub struct Mlp {
    hidden: Vec<HiddenBlock>,
    output: Linear,
    activation: Activation,
    output_activation: Activation,
    config: MlpConfig,
}

impl Mlp {
    pub fn new(config: MlpConfig, vb: VarBuilder) -> Result<Self> {
        let mut hidden = Vec::with_capacity(config.hidden_dims.len());
        let mut in_dim = config.input_dim;
        for (i, &width) in config.hidden_dims.iter().enumerate() {
            let block_vb = vb.pp(format!("hidden{}", i));
            let linear = linear(in_dim, width, config.bias, block_vb.pp("linear"))?;
            let norm = if config.batch_norm {
                Some(BatchNorm1d::new(width, config.bias, block_vb.pp("bn"))?)
            } else {
                None
            };
            hidden.push(HiddenBlock { linear, norm });
            in_dim = width;
        }
        let output = linear(in_dim, config.output_dim, config.bias, vb.pp("out"))?;

        Ok(Self {
            hidden,
            output,
            activation: config.activation,
            output_activation: config.output_activation,
            config,
        })
    }

    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    pub fn output_dim(&self) -> usize {
        self.config.output_dim
    }

    pub fn forward_train(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = xs.clone();
        for block in &self.hidden {
            x = block.linear.forward(&x)?;
            if let Some(norm) = &block.norm {
                x = norm.normalize(&x, train)?;
            }
            x = self.activation.apply(&x)?;
        }
        let x = self.output.forward(&x)?;
        self.output_activation.apply(&x)
    }
}

impl ModuleT for Mlp {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        self.forward_train(xs, train)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}

fn linear(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> Result<Linear> {
    let layer = if bias {
        candle_nn::linear(in_dim, out_dim, vb)?
    } else {
        candle_nn::linear_no_bias(in_dim, out_dim, vb)?
    };
    Ok(layer)
}

/// Adds `N(0, std)` noise drawn from `sampler` to `xs`; a zero `std` returns the input untouched
pub fn perturb(xs: &Tensor, std: f64, sampler: &mut NoiseSampler) -> Result<Tensor> {
    if std <= 0.0 {
        return Ok(xs.clone());
    }
    let noise = (sampler.sample_like(xs.dims(), xs.device())? * std)?;
    Ok((xs + noise)?)
}
