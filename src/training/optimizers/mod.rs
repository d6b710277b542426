//! Optimizers for the mixer, the weight generators and the discriminator
//!
//! Every network owns a separate `VarMap` and a separate optimizer. The
//! hypernetwork optimizers are stepped together from one gradient store so the
//! mixer and all generators see the same backward pass.

pub mod adam;

pub use adam::{Adam, ParamsAdam};

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap, SGD};
use tracing::debug;

use crate::hypernetwork::HyperNetwork;
use crate::training::config::{OptimizerConfig, OptimizerKind, OptimizerSettings};

/// Optimizer of one network
pub enum NetworkOptimizer {
    Adam(Adam),
    AdamW(AdamW),
    Sgd(SGD),
}

impl NetworkOptimizer {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkOptimizer::Adam(_) => "adam",
            NetworkOptimizer::AdamW(_) => "adamw",
            NetworkOptimizer::Sgd(_) => "sgd",
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            NetworkOptimizer::Adam(opt) => opt.step(grads)?,
            NetworkOptimizer::AdamW(opt) => opt.step(grads)?,
            NetworkOptimizer::Sgd(opt) => opt.step(grads)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            NetworkOptimizer::Adam(opt) => opt.learning_rate(),
            NetworkOptimizer::AdamW(opt) => opt.learning_rate(),
            NetworkOptimizer::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            NetworkOptimizer::Adam(opt) => opt.set_learning_rate(lr),
            NetworkOptimizer::AdamW(opt) => opt.set_learning_rate(lr),
            NetworkOptimizer::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

/// Create an optimizer from configuration over every variable of `var_map`
pub fn create_optimizer(config: &OptimizerConfig, var_map: &VarMap) -> Result<NetworkOptimizer> {
    let vars = var_map.all_vars();
    let optimizer = match config.kind {
        OptimizerKind::Adam => NetworkOptimizer::Adam(Adam::new(
            vars,
            ParamsAdam {
                lr: config.learning_rate,
                beta1: config.beta1,
                beta2: config.beta2,
                eps: config.epsilon,
                weight_decay: config.weight_decay,
            },
        )?),
        OptimizerKind::AdamW => NetworkOptimizer::AdamW(AdamW::new(
            vars,
            ParamsAdamW {
                lr: config.learning_rate,
                beta1: config.beta1,
                beta2: config.beta2,
                eps: config.epsilon,
                weight_decay: config.weight_decay,
            },
        )?),
        OptimizerKind::Sgd => NetworkOptimizer::Sgd(SGD::new(vars, config.learning_rate)?),
    };
    Ok(optimizer)
}

/// Optimizers of every network in the system
pub struct OptimizerSet {
    pub mixer: NetworkOptimizer,
    pub generators: Vec<NetworkOptimizer>,
    pub discriminator: Option<NetworkOptimizer>,
}

impl OptimizerSet {
    pub fn new(
        settings: &OptimizerSettings,
        network: &HyperNetwork,
        discriminator_vars: Option<&VarMap>,
    ) -> Result<Self> {
        let mixer = create_optimizer(&settings.mixer, network.mixer_vars()).context("mixer optimizer")?;
        let generators = network
            .generator_vars()
            .iter()
            .zip(network.generator_names())
            .map(|(vars, name)| {
                create_optimizer(&settings.generator, vars)
                    .with_context(|| format!("optimizer for generator '{}'", name))
            })
            .collect::<Result<Vec<_>>>()?;
        let discriminator = discriminator_vars
            .map(|vars| create_optimizer(&settings.discriminator, vars).context("discriminator optimizer"))
            .transpose()?;

        debug!(
            "Optimizers: mixer {}, {} x generator {:?}, discriminator {:?}",
            mixer.name(),
            generators.len(),
            settings.generator.kind,
            discriminator.as_ref().map(|d| d.name())
        );
        Ok(Self { mixer, generators, discriminator })
    }

    /// Step the mixer and every generator from the same gradients
    pub fn step_hypernetwork(&mut self, grads: &GradStore) -> Result<()> {
        self.mixer.step(grads)?;
        for optimizer in &mut self.generators {
            optimizer.step(grads)?;
        }
        Ok(())
    }

    pub fn step_discriminator(&mut self, grads: &GradStore) -> Result<()> {
        match &mut self.discriminator {
            Some(optimizer) => optimizer.step(grads),
            None => Err(anyhow::anyhow!("no discriminator optimizer configured")),
        }
    }

    /// Current learning rates as `(mixer, generators, discriminator)`
    pub fn learning_rates(&self) -> (f64, Vec<f64>, Option<f64>) {
        (
            self.mixer.learning_rate(),
            self.generators.iter().map(|g| g.learning_rate()).collect(),
            self.discriminator.as_ref().map(|d| d.learning_rate()),
        )
    }
}
