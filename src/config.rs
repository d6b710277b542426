//! Configuration structures for the HyperGAN system

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::discriminator::LatentRegularizer;
use crate::error::{Error, Result};
use crate::hypernetwork::{Activation, ArchitectureHandler, TargetArchitecture};
use crate::training::{LossReduction, TrainingConfig};

/// Main configuration for a HyperGAN experiment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Latent space dimensions
    pub latent: LatentConfig,
    /// Mixer (noise encoder) configuration
    pub mixer: MixerConfig,
    /// Default configuration shared by every weight generator
    pub generator: GeneratorConfig,
    /// Latent discriminator / critic configuration
    pub discriminator: DiscriminatorConfig,
    /// Classifier whose weights are generated
    pub target: TargetArchitecture,
    /// Training loop settings
    pub training: TrainingConfig,
    /// System-wide settings
    pub system: SystemConfig,
}

impl Config {
    /// Load configuration from a JSON or YAML file (chosen by extension)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = if is_yaml(path) {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as JSON or YAML (chosen by extension)
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.latent.noise_dim == 0 || self.latent.code_dim == 0 {
            return Err(Error::config("Latent noise and code dimensions must be > 0"));
        }

        check_widths("mixer", &self.mixer.hidden_dims)?;
        check_widths("generator", &self.generator.hidden_dims)?;
        check_widths("discriminator", &self.discriminator.hidden_dims)?;

        if self.mixer.input_noise_std < 0.0 || self.generator.input_noise_std < 0.0 {
            return Err(Error::config("Input noise std must be >= 0"));
        }

        let layout = ArchitectureHandler::new().resolve(&self.target)?;
        for layer in &layout.layers {
            if let Some(hidden) = &layer.generator_hidden {
                check_widths(&format!("generator '{}'", layer.name), hidden)?;
            }
        }

        match self.discriminator.regularizer {
            LatentRegularizer::None => {}
            LatentRegularizer::Gan => self.check_discriminator_steps()?,
            LatentRegularizer::Wasserstein { clip } => {
                if !(clip > 0.0) {
                    return Err(Error::config("Wasserstein clip value must be > 0"));
                }
                self.check_discriminator_steps()?;
            }
        }
        if self.discriminator.beta < 0.0 {
            return Err(Error::config("Discriminator beta must be >= 0"));
        }

        let uses_batch_norm = self.mixer.batch_norm || self.generator.batch_norm;
        if uses_batch_norm && self.training.sample_batch < 2 {
            return Err(Error::config(
                "sample_batch must be >= 2 when the mixer or generators use batch norm",
            ));
        }

        self.training.validate()
    }

    fn check_discriminator_steps(&self) -> Result<()> {
        if self.discriminator.steps == 0 {
            return Err(Error::config("Discriminator steps must be >= 1 when a regularizer is enabled"));
        }
        Ok(())
    }

    /// Number of generators, one per target layer
    pub fn num_generators(&self) -> Result<usize> {
        Ok(ArchitectureHandler::new().resolve(&self.target)?.num_layers())
    }

    /// Five-generator setup for the MedNet classifier with a GAN latent regulariser
    pub fn mednet() -> Self {
        Self {
            latent: LatentConfig { noise_dim: 256, code_dim: 128 },
            mixer: MixerConfig {
                hidden_dims: vec![512, 512],
                activation: Activation::Relu,
                batch_norm: true,
                bias: false,
                input_noise_std: 0.01,
            },
            generator: GeneratorConfig {
                hidden_dims: vec![512, 512],
                activation: Activation::Relu,
                output_activation: Activation::Identity,
                batch_norm: true,
                bias: false,
                input_noise_std: 0.01,
            },
            discriminator: DiscriminatorConfig {
                regularizer: LatentRegularizer::Gan,
                beta: 1.0,
                hidden_dims: vec![512, 512],
                activation: Activation::Relu,
                steps: 1,
            },
            target: TargetArchitecture::MedNet,
            training: TrainingConfig::default(),
            system: SystemConfig::default(),
        }
    }

    /// Four-generator setup for the padded CIFAR classifier driven by a single-code encoder
    pub fn small_cifar() -> Self {
        let mut training = TrainingConfig::default();
        training.loss_scale = 1000.0;
        training.reduction = LossReduction::Sum;

        Self {
            latent: LatentConfig { noise_dim: 300, code_dim: 128 },
            mixer: MixerConfig {
                hidden_dims: vec![300, 300],
                activation: Activation::LeakyRelu(0.01),
                batch_norm: true,
                bias: true,
                input_noise_std: 0.0,
            },
            generator: GeneratorConfig {
                hidden_dims: vec![256, 256],
                activation: Activation::LeakyRelu(0.01),
                output_activation: Activation::Identity,
                batch_norm: true,
                bias: true,
                input_noise_std: 0.0,
            },
            discriminator: DiscriminatorConfig {
                regularizer: LatentRegularizer::None,
                beta: 0.0,
                hidden_dims: vec![256],
                activation: Activation::LeakyRelu(0.2),
                steps: 1,
            },
            target: TargetArchitecture::SmallCifar,
            training,
            system: SystemConfig::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::mednet()
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn check_widths(what: &str, widths: &[usize]) -> Result<()> {
    if widths.iter().any(|&w| w == 0) {
        return Err(Error::config(format!("{} hidden widths must be > 0", what)));
    }
    Ok(())
}

/// Latent space dimensions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatentConfig {
    /// Width of the noise vector fed to the mixer
    pub noise_dim: usize,
    /// Width of each per-generator code
    pub code_dim: usize,
}

/// Mixer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MixerConfig {
    pub hidden_dims: Vec<usize>,
    pub activation: Activation,
    pub batch_norm: bool,
    pub bias: bool,
    /// Std of the Gaussian perturbation added to the mixer input
    #[serde(default)]
    pub input_noise_std: f64,
}

/// Weight generator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratorConfig {
    pub hidden_dims: Vec<usize>,
    pub activation: Activation,
    #[serde(default = "identity")]
    pub output_activation: Activation,
    pub batch_norm: bool,
    pub bias: bool,
    /// Std of the Gaussian perturbation added to each generator's code
    #[serde(default)]
    pub input_noise_std: f64,
}

fn identity() -> Activation {
    Activation::Identity
}

/// Latent discriminator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscriminatorConfig {
    pub regularizer: LatentRegularizer,
    /// Weight of the adversarial term in the hypernetwork loss
    pub beta: f64,
    pub hidden_dims: Vec<usize>,
    pub activation: Activation,
    /// Discriminator updates per training step
    #[serde(default = "one")]
    pub steps: usize,
}

fn one() -> usize {
    1
}

/// System-wide settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemConfig {
    pub device: DeviceType,
    pub seed: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            device: DeviceType::Cpu,
            seed: 8734,
        }
    }
}

/// Compute device selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Cpu,
    Cuda(usize),
    Metal(usize),
}
