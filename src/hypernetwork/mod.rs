//! Hypernetwork: mixer plus one weight generator per target layer

pub mod architectures;
pub mod forward;
pub mod generator;
pub mod models;

#[cfg(test)]
mod tests;

pub use architectures::{
    ArchitectureHandler, ConvNorm, InputShape, LayerKind, LayerSpec, TargetArchitecture, TargetLayout,
};
pub use forward::{FunctionalClassifier, LayerWeights};
pub use generator::{GeneratedLayer, WeightGenerator};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::config::Config;
use crate::encoder::{LatentCodes, Mixer, NoiseSampler};
use crate::error::{Error, Result};
use crate::utils::tensor::count_parameters;

/// Activation functions used inside the mixer, generators and discriminator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    /// Leaky ReLU with the given negative slope in `[0, 1)`
    LeakyRelu(f64),
    Identity,
}

impl Activation {
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Relu => Ok(xs.relu()?),
            Activation::LeakyRelu(slope) => Ok(xs.maximum(&(xs * *slope)?)?),
            Activation::Identity => Ok(xs.clone()),
        }
    }
}

/// Generated parameters for a whole population of sampled classifiers
#[derive(Debug, Clone)]
pub struct GeneratedWeights {
    names: Vec<String>,
    layers: Vec<GeneratedLayer>,
}

impl GeneratedWeights {
    pub fn new(names: Vec<String>, layers: Vec<GeneratedLayer>) -> Result<Self> {
        if names.len() != layers.len() || layers.is_empty() {
            return Err(Error::generator("generated layers and names must match and be non-empty"));
        }
        let samples = layers[0].batch_size();
        if layers.iter().any(|l| l.batch_size() != samples) {
            return Err(Error::generator("generators disagree on the number of samples"));
        }
        Ok(Self { names, layers })
    }

    /// Number of sampled classifiers
    pub fn num_samples(&self) -> usize {
        self.layers[0].batch_size()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> Option<&GeneratedLayer> {
        self.layers.get(index)
    }

    pub fn layer_names(&self) -> &[String] {
        &self.names
    }

    /// Weights of classifier `index`, still attached to the generator graph
    pub fn sample(&self, index: usize) -> Result<Vec<LayerWeights>> {
        if index >= self.num_samples() {
            return Err(Error::invalid_input(format!(
                "sample {} out of range ({} samples)",
                index,
                self.num_samples()
            )));
        }
        self.layers
            .iter()
            .map(|layer| {
                let weight = layer.weight.narrow(0, index, 1)?.squeeze(0)?.contiguous()?;
                let bias = match &layer.bias {
                    Some(b) => Some(b.narrow(0, index, 1)?.squeeze(0)?.contiguous()?),
                    None => None,
                };
                Ok(LayerWeights::new(weight, bias))
            })
            .collect()
    }

    /// Frobenius norm of every layer's weight for classifier `index`
    pub fn norms(&self, index: usize) -> Result<Vec<(String, f32)>> {
        let sample = self.sample(index)?;
        self.names
            .iter()
            .zip(sample.iter())
            .map(|(name, w)| Ok((name.clone(), w.weight_norm()?)))
            .collect()
    }
}

/// Mixer, generators and the functional classifier they feed
pub struct HyperNetwork {
    mixer: Mixer,
    generators: Vec<WeightGenerator>,
    classifier: FunctionalClassifier,
    mixer_vars: VarMap,
    generator_vars: Vec<VarMap>,
    sampler: NoiseSampler,
    device: Device,
}

impl HyperNetwork {
    /// Build every network from the configuration; each one owns a separate `VarMap`
    #[instrument(skip(config, device))]
    pub fn new(config: &Config, device: &Device) -> Result<Self> {
        let layout = ArchitectureHandler::new().resolve(&config.target)?;
        let num_codes = layout.num_layers();

        let mixer_vars = VarMap::new();
        let mixer = Mixer::new(
            &config.latent,
            &config.mixer,
            num_codes,
            VarBuilder::from_varmap(&mixer_vars, DType::F32, device),
        )?;

        let mut generators = Vec::with_capacity(num_codes);
        let mut generator_vars = Vec::with_capacity(num_codes);
        for layer in &layout.layers {
            let vars = VarMap::new();
            let generator = WeightGenerator::new(
                layer,
                config.latent.code_dim,
                &config.generator,
                VarBuilder::from_varmap(&vars, DType::F32, device),
            )?;
            generators.push(generator);
            generator_vars.push(vars);
        }

        let network = Self {
            mixer,
            generators,
            classifier: FunctionalClassifier::new(layout),
            mixer_vars,
            generator_vars,
            sampler: NoiseSampler::new(config.system.seed),
            device: device.clone(),
        };
        info!(
            "Hypernetwork for {} built: {} generators, {} trainable values, {} generated values per classifier",
            config.target.name(),
            network.generators.len(),
            network.parameter_count(),
            network.layout().total_parameters()
        );
        Ok(network)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn layout(&self) -> &TargetLayout {
        self.classifier.layout()
    }

    pub fn classifier(&self) -> &FunctionalClassifier {
        &self.classifier
    }

    pub fn mixer(&self) -> &Mixer {
        &self.mixer
    }

    pub fn generators(&self) -> &[WeightGenerator] {
        &self.generators
    }

    pub fn mixer_vars(&self) -> &VarMap {
        &self.mixer_vars
    }

    pub fn generator_vars(&self) -> &[VarMap] {
        &self.generator_vars
    }

    pub fn generator_names(&self) -> Vec<String> {
        self.generators.iter().map(|g| g.name().to_string()).collect()
    }

    /// Number of stored values across the mixer and all generators, running statistics included
    pub fn parameter_count(&self) -> usize {
        std::iter::once(&self.mixer_vars)
            .chain(self.generator_vars.iter())
            .map(count_parameters)
            .sum()
    }

    /// Draw `(batch, noise_dim)` mixer input from the seeded sampler
    pub fn sample_noise(&mut self, batch: usize) -> Result<Tensor> {
        let dim = self.mixer.noise_dim();
        self.sampler.sample(batch, dim, &self.device)
    }

    /// Prior draws shaped like `shape`, from the same seeded stream
    pub fn sample_prior(&mut self, shape: &[usize]) -> Result<Tensor> {
        self.sampler.sample_like(shape, &self.device)
    }

    /// Mixer pass only: noise -> one code per generator
    pub fn mix(&mut self, noise: &Tensor, train: bool) -> Result<LatentCodes> {
        self.mixer.forward_t(noise, train, &mut self.sampler)
    }

    /// Noise -> codes -> one weight set per noise row. Code `i` feeds generator `i`.
    pub fn generate(&mut self, noise: &Tensor, train: bool) -> Result<(LatentCodes, GeneratedWeights)> {
        let codes = self.mix(noise, train)?;
        let weights = self.generate_from_codes(&codes, train)?;
        Ok((codes, weights))
    }

    pub fn generate_from_codes(&mut self, codes: &LatentCodes, train: bool) -> Result<GeneratedWeights> {
        if codes.len() != self.generators.len() {
            return Err(Error::shape_mismatch(
                "latent code count",
                &[self.generators.len()],
                &[codes.len()],
            ));
        }
        let layers = self
            .generators
            .iter()
            .zip(codes.iter())
            .map(|(generator, code)| generator.forward_t(code, train, &mut self.sampler))
            .collect::<Result<Vec<_>>>()?;
        GeneratedWeights::new(self.generator_names(), layers)
    }

    /// Sample `count` classifiers in evaluation mode
    pub fn sample_classifiers(&mut self, count: usize) -> Result<Vec<Vec<LayerWeights>>> {
        let noise = self.sample_noise(count)?;
        let (_, weights) = self.generate(&noise, false)?;
        (0..weights.num_samples()).map(|i| weights.sample(i)).collect()
    }
}
