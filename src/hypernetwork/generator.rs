//! Weight generators: one small network per target layer

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::architectures::LayerSpec;
use super::models::{perturb, Mlp, MlpConfig};
use crate::config::GeneratorConfig;
use crate::encoder::NoiseSampler;
use crate::error::{Error, Result};

/// A batch of generated parameters for one target layer
#[derive(Debug, Clone)]
pub struct GeneratedLayer {
    /// `(batch, *weight_shape)`
    pub weight: Tensor,
    /// `(batch, out_units)` when the layer has a bias
    pub bias: Option<Tensor>,
}

impl GeneratedLayer {
    pub fn batch_size(&self) -> usize {
        self.weight.dims()[0]
    }
}

/// Maps a latent code to the exact weight (and bias) tensor of one layer
pub struct WeightGenerator {
    layer: LayerSpec,
    mlp: Mlp,
    code_dim: usize,
    input_noise_std: f64,
}

impl WeightGenerator {
    pub fn new(layer: &LayerSpec, code_dim: usize, config: &GeneratorConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_dims = layer
            .generator_hidden
            .clone()
            .unwrap_or_else(|| config.hidden_dims.clone());
        let mlp = Mlp::new(
            MlpConfig {
                input_dim: code_dim,
                hidden_dims,
                output_dim: layer.output_numel(),
                activation: config.activation,
                output_activation: layer.output_activation.unwrap_or(config.output_activation),
                batch_norm: config.batch_norm,
                bias: config.bias,
            },
            vb,
        )?;
        Ok(Self {
            layer: layer.clone(),
            mlp,
            code_dim,
            input_noise_std: config.input_noise_std,
        })
    }

    pub fn layer(&self) -> &LayerSpec {
        &self.layer
    }

    pub fn name(&self) -> &str {
        &self.layer.name
    }

    pub fn forward_t(&self, code: &Tensor, train: bool, sampler: &mut NoiseSampler) -> Result<GeneratedLayer> {
        let (batch, width) = code.dims2()?;
        if width != self.code_dim {
            return Err(Error::shape_mismatch(
                format!("generator '{}' input", self.layer.name),
                &[batch, self.code_dim],
                &[batch, width],
            ));
        }

        let x = perturb(code, self.input_noise_std, sampler)?;
        let raw = self.mlp.forward_train(&x, train)?;
        let produced = raw.dims2()?.1;
        if produced != self.layer.output_numel() {
            return Err(Error::shape_mismatch(
                format!("generator '{}' output", self.layer.name),
                &[batch, self.layer.output_numel()],
                &[batch, produced],
            ));
        }

        let weight_numel = self.layer.weight_numel();
        let mut weight_shape = vec![batch];
        weight_shape.extend(self.layer.weight_shape());
        let weight = raw.narrow(1, 0, weight_numel)?.contiguous()?.reshape(weight_shape)?;

        let bias = if self.layer.bias {
            let out = self.layer.out_units();
            Some(raw.narrow(1, weight_numel, out)?.contiguous()?)
        } else {
            None
        };

        Ok(GeneratedLayer { weight, bias })
    }
}
