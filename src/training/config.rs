//! Training configuration: loop lengths, population size, loss scaling,
//! per-network optimizers and checkpointing thresholds.

use std::path::PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::training::loss::LossReduction;

/// Main training configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingConfig {
    /// Passes over the training set
    pub epochs: usize,

    /// Images per data batch
    pub batch_size: usize,

    /// Classifiers sampled from the hypernetwork per step
    pub sample_batch: usize,

    /// Multiplier applied to the combined classifier loss
    pub loss_scale: f64,

    /// How per-sample classifier losses are combined
    pub reduction: LossReduction,

    /// Steps between progress logs
    pub log_interval: usize,

    /// Steps between test-set evaluations
    pub eval_interval: usize,

    /// Stop after this many steps regardless of epochs
    #[serde(default)]
    pub max_steps: Option<usize>,

    /// Cap on test batches per evaluation
    #[serde(default)]
    pub max_eval_batches: Option<usize>,

    /// Shuffle the training set every epoch
    pub shuffle: bool,

    /// Optimizer settings per network
    pub optimizers: OptimizerSettings,

    /// Checkpointing configuration
    pub checkpoint: CheckpointConfig,

    /// Checkpoint directory to resume from
    #[serde(default)]
    pub resume_from: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 1000,
            batch_size: 32,
            sample_batch: 32,
            loss_scale: 1.0,
            reduction: LossReduction::Mean,
            log_interval: 50,
            eval_interval: 100,
            max_steps: None,
            max_eval_batches: None,
            shuffle: true,
            optimizers: OptimizerSettings::default(),
            checkpoint: CheckpointConfig::default(),
            resume_from: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::config("Number of epochs must be greater than 0"));
        }

        if self.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }

        if self.sample_batch == 0 {
            return Err(Error::config("Sample batch must be greater than 0"));
        }

        if !(self.loss_scale > 0.0) || !self.loss_scale.is_finite() {
            return Err(Error::config("Loss scale must be positive and finite"));
        }

        if self.log_interval == 0 || self.eval_interval == 0 {
            return Err(Error::config("Log and eval intervals must be greater than 0"));
        }

        if self.max_steps == Some(0) {
            return Err(Error::config("max_steps must be greater than 0 when set"));
        }

        self.optimizers.mixer.validate("mixer")?;
        self.optimizers.generator.validate("generator")?;
        self.optimizers.discriminator.validate("discriminator")?;

        if self.checkpoint.keep_last == 0 {
            return Err(Error::config("keep_last must be greater than 0"));
        }

        Ok(())
    }
}

/// One optimizer per network family
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerSettings {
    pub mixer: OptimizerConfig,
    /// Shared by every weight generator; each generator still gets its own instance
    pub generator: OptimizerConfig,
    pub discriminator: OptimizerConfig,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            mixer: OptimizerConfig::mixer_default(),
            generator: OptimizerConfig::generator_default(),
            discriminator: OptimizerConfig::discriminator_default(),
        }
    }
}

/// Optimizer types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Adam with L2 penalty folded into the gradient
    Adam,
    /// Adam with decoupled weight decay
    AdamW,
    Sgd,
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl OptimizerConfig {
    /// Adam with betas (0.5, 0.9) and weight decay 1e-4
    pub fn adam(learning_rate: f64) -> Self {
        Self {
            kind: OptimizerKind::Adam,
            learning_rate,
            beta1: 0.5,
            beta2: 0.9,
            epsilon: 1e-8,
            weight_decay: 1e-4,
        }
    }

    pub fn mixer_default() -> Self {
        Self::adam(3e-4)
    }

    pub fn generator_default() -> Self {
        Self::adam(5e-4)
    }

    pub fn discriminator_default() -> Self {
        Self::adam(1e-4)
    }

    fn validate(&self, network: &str) -> Result<()> {
        if !(self.learning_rate > 0.0) {
            return Err(Error::config(format!("{} learning rate must be positive", network)));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(Error::config(format!("{} betas must be in [0, 1)", network)));
        }
        if self.epsilon <= 0.0 || self.weight_decay < 0.0 {
            return Err(Error::config(format!(
                "{} epsilon must be positive and weight decay non-negative",
                network
            )));
        }
        Ok(())
    }
}

/// Checkpointing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointConfig {
    /// Directory checkpoints are written under
    pub output_dir: PathBuf,

    /// Prefix of every checkpoint directory name
    pub tag: String,

    /// Number of checkpoints kept on disk
    pub keep_last: usize,

    /// A checkpoint is written once test accuracy beats this
    pub save_threshold_accuracy: f64,

    /// ... or test loss drops below this
    pub save_threshold_loss: f64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("checkpoints"),
            tag: "hypergan".to_string(),
            keep_last: 5,
            save_threshold_accuracy: 0.95,
            save_threshold_loss: 0.001,
        }
    }
}
