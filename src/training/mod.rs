//! Training infrastructure for the HyperGAN system
//!
//! # Main Components
//!
//! - **Configuration**: loop lengths, population size, loss scaling, optimizers
//! - **Trainer**: joint hypernetwork / discriminator updates and evaluation
//! - **Data**: CIFAR-10, synthetic and in-memory datasets with a shuffling loader
//! - **Checkpoints**: safetensors per network plus JSON metadata
//! - **Metrics**: step metrics, evaluation reports and best-so-far tracking
//! - **Optimizers**: Adam with coupled weight decay, AdamW and SGD
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use hypergan::config::Config;
//! use hypergan::hypernetwork::InputShape;
//! use hypergan::training::{DataLoader, DataLoaderConfig, HyperGanTrainer, SyntheticDataset};
//! use candle_core::Device;
//! use std::sync::Arc;
//!
//! let config = Config::mednet();
//! let dataset = SyntheticDataset::new(512, InputShape::rgb32(), 10, 0.5, 0)?;
//! let loader = DataLoader::new(Arc::new(dataset), DataLoaderConfig::default(), Device::Cpu)?;
//!
//! let mut trainer = HyperGanTrainer::new(config, Device::Cpu, loader, None)?;
//! let result = trainer.train().await?;
//! ```

pub mod checkpoints;
pub mod config;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod optimizers;
pub mod trainer;

#[cfg(test)]
pub mod tests;

pub use config::{CheckpointConfig, OptimizerConfig, OptimizerKind, OptimizerSettings, TrainingConfig};

pub use trainer::{
    evaluate_population, HyperGanTrainer, TrainingEvent, TrainingResult, TrainingState, TrainingStatus,
};

pub use data::{
    Batch, Cifar10Dataset, DataLoader, DataLoaderConfig, Dataset, InMemoryDataset, SyntheticDataset,
};

pub use checkpoints::{CheckpointInfo, CheckpointManager, CheckpointMetadata};

pub use metrics::{BestStats, EvalReport, MetricsTracker, StepMetrics, WeightNorms};

pub use optimizers::{create_optimizer, Adam, NetworkOptimizer, OptimizerSet, ParamsAdam};

pub use loss::{bce_with_logits, classification_loss, correct_predictions, reduce_population, LossReduction};

/// Training result type alias
pub type Result<T> = anyhow::Result<T>;

/// Training error type alias
pub type Error = anyhow::Error;
