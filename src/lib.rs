//! HyperGAN - generative model over the weights of a small image classifier
//!
//! A seeded noise vector is mixed into one latent code per target layer; a
//! dedicated generator turns each code into that layer's weights. Every
//! noise draw therefore yields a complete, ready-to-run classifier, and the
//! whole hypernetwork is trained end to end through the classification loss
//! of the networks it produces, optionally regularised by a discriminator on
//! the latent codes.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod discriminator;
pub mod encoder;
pub mod error;
pub mod hypernetwork;
pub mod training;
pub mod utils;

// Re-exports
pub use config::{Config, DeviceType};
pub use discriminator::{LatentDiscriminator, LatentRegularizer};
pub use encoder::{LatentCodes, Mixer, NoiseSampler};
pub use error::{Error, Result};
pub use hypernetwork::{GeneratedWeights, HyperNetwork, LayerWeights, TargetArchitecture};
pub use training::{DataLoader, HyperGanTrainer, TrainingConfig};

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor, D};
use tracing::{debug, info, instrument};

use training::{evaluate_population, CheckpointManager, EvalReport};

/// Averaged output of several sampled classifiers on one image batch
#[derive(Debug, Clone)]
pub struct EnsemblePrediction {
    /// Softmax probabilities averaged over the sampled classifiers, `(N, classes)`
    pub mean_probs: Tensor,
    /// Arg-max of `mean_probs` per image
    pub predictions: Vec<u32>,
    /// Fraction of sampled classifiers whose own vote matches `predictions`
    pub agreement: Vec<f32>,
}

/// Inference-side entry point: a trained hypernetwork and its configuration
pub struct HyperGan {
    network: HyperNetwork,
    config: Config,
}

impl HyperGan {
    /// Build a freshly initialised hypernetwork on the configured device
    #[instrument(skip(config))]
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let device = utils::select_device(&config.system.device)?;
        let network = HyperNetwork::new(&config, &device)?;
        info!("HyperGAN ready: {} generators", network.generators().len());
        Ok(Self { network, config })
    }

    /// Build from `config` and restore the weights stored in checkpoint directory `path`
    #[instrument(skip(config))]
    pub fn from_checkpoint(config: Config, path: &Path) -> Result<Self> {
        let gan = Self::new(config)?;
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let manager = CheckpointManager::new(parent, gan.config.training.checkpoint.keep_last)?;
        let metadata = manager.load(path, &gan.network, None)?;
        debug!(
            "Loaded step {} (accuracy {:?}, loss {:?})",
            metadata.step, metadata.accuracy, metadata.loss
        );
        Ok(gan)
    }

    pub fn network(&self) -> &HyperNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut HyperNetwork {
        &mut self.network
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &Device {
        self.network.device()
    }

    /// Draw `n` complete classifiers from the generator (evaluation mode)
    pub fn sample_networks(&mut self, n: usize) -> Result<Vec<Vec<LayerWeights>>> {
        if n == 0 {
            return Err(Error::invalid_input("number of sampled networks must be > 0"));
        }
        self.network.sample_classifiers(n)
    }

    /// Average the softmax outputs of `n` sampled classifiers on `images`
    #[instrument(skip(self, images))]
    pub fn ensemble_predict(&mut self, images: &Tensor, n: usize) -> Result<EnsemblePrediction> {
        let samples = self.sample_networks(n)?;
        let mut probs = Vec::with_capacity(samples.len());
        let mut votes = Vec::with_capacity(samples.len());
        for weights in &samples {
            let logits = self.network.classifier().forward(weights, images)?;
            votes.push(logits.argmax(D::Minus1)?.to_vec1::<u32>()?);
            probs.push(candle_nn::ops::softmax_last_dim(&logits)?);
        }

        let mean_probs = Tensor::stack(&probs, 0)?.mean(0)?;
        let predictions = mean_probs.argmax(D::Minus1)?.to_vec1::<u32>()?;
        let agreement = predictions
            .iter()
            .enumerate()
            .map(|(image, &class)| {
                let matching = votes.iter().filter(|v| v[image] == class).count();
                matching as f32 / votes.len() as f32
            })
            .collect();

        Ok(EnsemblePrediction { mean_probs, predictions, agreement })
    }

    /// Score freshly sampled classifiers on every batch of `loader`
    pub fn evaluate(&mut self, loader: &DataLoader) -> Result<EvalReport> {
        let training = &self.config.training;
        let report = evaluate_population(
            &mut self.network,
            loader,
            training.sample_batch,
            training.max_eval_batches,
        )?;
        Ok(report)
    }

    /// Write `n` sampled classifiers to one safetensors file as `sample{i}.{layer}.weight|bias`
    #[instrument(skip(self, path))]
    pub fn export_samples(&mut self, n: usize, path: &Path) -> Result<()> {
        let names = self.network.generator_names();
        let samples = self.sample_networks(n)?;
        let mut tensors = HashMap::new();
        for (i, sample) in samples.into_iter().enumerate() {
            for (name, layer) in names.iter().zip(sample) {
                tensors.insert(format!("sample{}.{}.weight", i, name), layer.weight);
                if let Some(bias) = layer.bias {
                    tensors.insert(format!("sample{}.{}.bias", i, name), bias);
                }
            }
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        candle_core::safetensors::save(&tensors, path)?;
        info!("Exported {} classifiers ({} tensors) to {}", n, tensors.len(), path.display());
        Ok(())
    }
}
