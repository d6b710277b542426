//! Joint training of the mixer, the weight generators and the latent discriminator
//!
//! One step samples a population of classifiers from the hypernetwork, scores
//! each of them on the same data batch and backpropagates the combined loss
//! through every generator and the mixer in a single backward pass.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::discriminator::LatentDiscriminator;
use crate::hypernetwork::HyperNetwork;
use crate::training::checkpoints::{CheckpointManager, CheckpointMetadata};
use crate::training::data::{Batch, DataLoader};
use crate::training::loss::{classification_loss, correct_predictions, is_finite, reduce_population};
use crate::training::metrics::{BestStats, EvalReport, MetricsTracker, StepMetrics, WeightNorms};
use crate::training::optimizers::OptimizerSet;

/// Main trainer for the HyperGAN system
pub struct HyperGanTrainer {
    /// Full experiment configuration
    config: Config,

    /// Mixer, generators and functional classifier
    network: HyperNetwork,

    /// Latent discriminator with its variables, when a regulariser is on
    discriminator: Option<(LatentDiscriminator, VarMap)>,

    /// One optimizer per network
    optimizers: OptimizerSet,

    /// Training data loader
    train_loader: Arc<DataLoader>,

    /// Test data loader
    test_loader: Option<Arc<DataLoader>>,

    /// Checkpoint manager
    checkpoint_manager: CheckpointManager,

    /// Metrics tracker
    metrics: MetricsTracker,

    /// Training state
    state: TrainingState,

    /// Device for training
    device: Device,

    /// Event channel for monitoring
    event_tx: Option<mpsc::UnboundedSender<TrainingEvent>>,
}

/// Training state tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch
    pub epoch: usize,

    /// Optimisation steps taken so far
    pub global_step: usize,

    /// Batches of the current epoch already trained
    pub batch_in_epoch: usize,

    /// Best evaluation results so far
    pub best: BestStats,

    /// Most recent evaluation
    pub last_eval: Option<EvalReport>,

    /// Step at which `last_eval` ran
    pub last_eval_step: Option<usize>,

    /// Most recent checkpoint written
    pub last_checkpoint: Option<PathBuf>,

    /// Training status
    pub status: TrainingStatus,

    /// Training start time
    pub start_time: DateTime<Utc>,
}

impl TrainingState {
    fn new(best: BestStats) -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            batch_in_epoch: 0,
            best,
            last_eval: None,
            last_eval_step: None,
            last_checkpoint: None,
            status: TrainingStatus::NotStarted,
            start_time: Utc::now(),
        }
    }
}

/// Training status enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TrainingStatus {
    NotStarted,
    Running,
    Completed,
    /// `max_steps` was reached before the last epoch finished
    StepLimitReached,
    Failed { error: String },
}

/// Training events for monitoring
#[derive(Debug, Clone)]
pub enum TrainingEvent {
    EpochStarted { epoch: usize },
    StepCompleted { step: usize, loss: f64, accuracy: f64 },
    EvaluationCompleted { step: usize, report: EvalReport },
    CheckpointSaved { path: PathBuf },
    EpochCompleted { epoch: usize, loss: f64, accuracy: f64 },
    TrainingCompleted { total_steps: usize },
    Error { error: String },
}

/// Training result information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    /// Training state at completion
    pub final_state: TrainingState,

    /// Last evaluation, if any ran
    pub final_eval: Option<EvalReport>,

    /// Training duration
    pub training_duration: Duration,

    /// Total training steps
    pub total_steps: usize,

    /// Whether training completed successfully
    pub success: bool,

    /// Error message if training failed
    pub error_message: Option<String>,
}

impl HyperGanTrainer {
    /// Create a new trainer instance
    #[instrument(skip_all)]
    pub fn new(
        config: Config,
        device: Device,
        train_loader: DataLoader,
        test_loader: Option<DataLoader>,
    ) -> Result<Self> {
        config.validate().context("Configuration validation failed")?;

        let network = HyperNetwork::new(&config, &device)?;
        check_loader(&network, &train_loader, "training")?;
        if let Some(loader) = &test_loader {
            check_loader(&network, loader, "test")?;
        }

        let discriminator = if config.discriminator.regularizer.is_enabled() {
            let vars = VarMap::new();
            let disc = LatentDiscriminator::new(
                config.latent.code_dim,
                &config.discriminator,
                VarBuilder::from_varmap(&vars, DType::F32, &device),
            )?;
            Some((disc, vars))
        } else {
            None
        };

        let optimizers = OptimizerSet::new(
            &config.training.optimizers,
            &network,
            discriminator.as_ref().map(|(_, vars)| vars),
        )?;

        let checkpoint = &config.training.checkpoint;
        let checkpoint_manager = CheckpointManager::new(&checkpoint.output_dir, checkpoint.keep_last)?;
        let state = TrainingState::new(BestStats::new(
            checkpoint.save_threshold_accuracy,
            checkpoint.save_threshold_loss,
        ));

        Ok(Self {
            config,
            network,
            discriminator,
            optimizers,
            train_loader: Arc::new(train_loader),
            test_loader: test_loader.map(Arc::new),
            checkpoint_manager,
            metrics: MetricsTracker::default(),
            state,
            device,
            event_tx: None,
        })
    }

    /// Set up event monitoring
    pub fn with_event_monitoring(mut self, tx: mpsc::UnboundedSender<TrainingEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn network(&self) -> &HyperNetwork {
        &self.network
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn metrics(&self) -> &MetricsTracker {
        &self.metrics
    }

    pub fn optimizers(&self) -> &OptimizerSet {
        &self.optimizers
    }

    pub fn discriminator(&self) -> Option<&LatentDiscriminator> {
        self.discriminator.as_ref().map(|(disc, _)| disc)
    }

    pub fn discriminator_vars(&self) -> Option<&VarMap> {
        self.discriminator.as_ref().map(|(_, vars)| vars)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// One joint update of the mixer and every generator on `batch`
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepMetrics> {
        let population = self.config.training.sample_batch;
        let noise = self.network.sample_noise(population)?;
        let codes = self.network.mix(&noise, true)?;

        let mut disc_loss = None;
        if let Some((disc, vars)) = &self.discriminator {
            let fake = codes.detach().stacked()?;
            for _ in 0..self.config.discriminator.steps {
                let prior = self.network.sample_prior(fake.dims())?;
                let loss = disc.discriminator_loss(&prior, &fake)?;
                let grads = loss.backward()?;
                self.optimizers.step_discriminator(&grads)?;
                disc.clip_weights(vars)?;
                disc_loss = Some(loss.to_scalar::<f32>()? as f64);
            }
        }

        let weights = self.network.generate_from_codes(&codes, true)?;
        let mut losses = Vec::with_capacity(population);
        let mut correct = 0;
        for i in 0..weights.num_samples() {
            let sample = weights.sample(i)?;
            let logits = self.network.classifier().forward(&sample, &batch.images)?;
            losses.push(classification_loss(&logits, &batch.labels)?);
            if i + 1 == weights.num_samples() {
                correct = correct_predictions(&logits, &batch.labels)?;
            }
        }

        let mean_loss = Tensor::stack(&losses, 0)?.mean_all()?.to_scalar::<f32>()? as f64;
        let mut total = reduce_population(&losses, self.config.training.reduction, self.config.training.loss_scale)?;

        let mut adversarial_loss = None;
        if let Some((disc, _)) = &self.discriminator {
            let adversarial = disc.adversarial_loss(&codes.stacked()?)?;
            adversarial_loss = Some(adversarial.to_scalar::<f32>()? as f64);
            total = (total + (adversarial * disc.beta())?)?;
        }

        if !mean_loss.is_finite() || !is_finite(&total)? {
            bail!("non-finite loss at step {}: {}", self.state.global_step, mean_loss);
        }

        let grads = total.backward()?;
        self.optimizers.step_hypernetwork(&grads)?;

        let layout = self.network.layout();
        let norms = weights
            .norms(0)?
            .into_iter()
            .zip(layout.layers.iter())
            .map(|((layer, norm), spec)| WeightNorms {
                layer,
                norm,
                is_conv: spec.is_conv(),
            })
            .collect();

        Ok(StepMetrics {
            step: self.state.global_step + 1,
            loss: mean_loss,
            accuracy: correct as f64 / batch.size as f64,
            disc_loss,
            adversarial_loss,
            norms,
        })
    }

    /// Evaluate sampled classifiers on the test loader
    #[instrument(skip(self))]
    pub fn evaluate(&mut self) -> Result<EvalReport> {
        let Some(loader) = self.test_loader.clone() else {
            bail!("no test loader configured");
        };
        evaluate_population(
            &mut self.network,
            &loader,
            self.config.training.sample_batch,
            self.config.training.max_eval_batches,
        )
    }

    /// Start training
    #[instrument(skip_all)]
    pub async fn train(&mut self) -> Result<TrainingResult> {
        info!(
            "Starting HyperGAN training: {} generators, population {}, {} batches per epoch",
            self.network.generators().len(),
            self.config.training.sample_batch,
            self.train_loader.num_batches()
        );

        self.initialize_training()?;
        let training_start = Instant::now();

        let result = match self.run_training_loop().await {
            Ok(status) => {
                self.state.status = status;
                TrainingResult {
                    final_state: self.state.clone(),
                    final_eval: self.state.last_eval.clone(),
                    training_duration: training_start.elapsed(),
                    total_steps: self.state.global_step,
                    success: true,
                    error_message: None,
                }
            }
            Err(e) => {
                let error_msg = format!("Training failed: {:#}", e);
                error!("{}", error_msg);
                self.state.status = TrainingStatus::Failed { error: error_msg.clone() };
                self.send_event(TrainingEvent::Error { error: error_msg.clone() });
                TrainingResult {
                    final_state: self.state.clone(),
                    final_eval: self.state.last_eval.clone(),
                    training_duration: training_start.elapsed(),
                    total_steps: self.state.global_step,
                    success: false,
                    error_message: Some(error_msg),
                }
            }
        };

        info!("Training finished in {:?} after {} steps", result.training_duration, result.total_steps);
        self.send_event(TrainingEvent::TrainingCompleted {
            total_steps: result.total_steps,
        });
        Ok(result)
    }

    fn initialize_training(&mut self) -> Result<()> {
        self.state.status = TrainingStatus::Running;
        self.state.start_time = Utc::now();

        if let Some(path) = self.config.training.resume_from.clone() {
            info!("Resuming from checkpoint: {}", path.display());
            let metadata = self.checkpoint_manager.load(
                &path,
                &self.network,
                self.discriminator.as_ref().map(|(_, vars)| vars),
            )?;
            self.state.global_step = metadata.step;
            self.state.epoch = metadata.epoch;
            self.state.batch_in_epoch = metadata.batch_in_epoch;
            if let (Some(accuracy), Some(loss)) = (metadata.accuracy, metadata.loss) {
                self.state.best = BestStats {
                    best_accuracy: self.state.best.best_accuracy.max(accuracy),
                    best_loss: self.state.best.best_loss.min(loss),
                };
            }
        }

        info!("Device: {:?}", self.device);
        info!("Hypernetwork values: {}", self.network.parameter_count());
        let (mixer_lr, generator_lrs, disc_lr) = self.optimizers.learning_rates();
        info!(
            "Learning rates: mixer {}, generators {:?}, discriminator {:?}",
            mixer_lr, generator_lrs, disc_lr
        );
        Ok(())
    }

    async fn run_training_loop(&mut self) -> Result<TrainingStatus> {
        let total_epochs = self.config.training.epochs;
        let log_interval = self.config.training.log_interval;
        let eval_interval = self.config.training.eval_interval;
        let loader = Arc::clone(&self.train_loader);

        for epoch in self.state.epoch..total_epochs {
            // a resumed checkpoint may sit part-way through its epoch
            let done = if epoch == self.state.epoch { self.state.batch_in_epoch } else { 0 };
            self.state.epoch = epoch;
            self.state.batch_in_epoch = done;
            if done >= loader.num_batches() {
                continue;
            }
            if done > 0 {
                info!("Resuming epoch {} after {} batches", epoch + 1, done);
            }
            debug!("Starting epoch {}/{}", epoch + 1, total_epochs);
            self.send_event(TrainingEvent::EpochStarted { epoch });

            for batch in loader.batches().skip(done) {
                let batch = batch?;
                let metrics = self.train_step(&batch)?;
                self.state.global_step += 1;
                self.state.batch_in_epoch += 1;
                let step = self.state.global_step;

                if step % log_interval == 0 {
                    log_step(&metrics);
                }
                self.send_event(TrainingEvent::StepCompleted {
                    step,
                    loss: metrics.loss,
                    accuracy: metrics.accuracy,
                });
                self.metrics.record_step(metrics);

                if step % eval_interval == 0 && self.test_loader.is_some() {
                    self.run_evaluation()?;
                }

                if let Some(max_steps) = self.config.training.max_steps {
                    if step >= max_steps {
                        info!("Maximum steps reached: {}", max_steps);
                        return Ok(TrainingStatus::StepLimitReached);
                    }
                }
                tokio::task::yield_now().await;
            }

            if let Some((loss, accuracy)) = self.metrics.finish_epoch() {
                info!(
                    "Epoch {}/{} completed - Loss: {:.4}, Accuracy: {:.4}, {:.2} steps/s",
                    epoch + 1,
                    total_epochs,
                    loss,
                    accuracy,
                    self.metrics.steps_per_second()
                );
                self.send_event(TrainingEvent::EpochCompleted { epoch, loss, accuracy });
            }
            let evaluated = self.state.last_eval_step == Some(self.state.global_step);
            if self.test_loader.is_some() && !evaluated {
                self.run_evaluation()?;
            }
        }
        self.state.epoch = total_epochs;
        self.state.batch_in_epoch = 0;
        Ok(TrainingStatus::Completed)
    }

    /// Evaluate, record, and checkpoint when the best stats improve
    fn run_evaluation(&mut self) -> Result<()> {
        let report = self.evaluate()?;
        info!(
            "Test Accuracy: {:.4}, Test Loss: {:.4}, best single-sample loss {:.4}",
            report.accuracy, report.loss, report.best_sample_loss
        );
        self.send_event(TrainingEvent::EvaluationCompleted {
            step: self.state.global_step,
            report: report.clone(),
        });

        let improved = self.state.best.update(&report);
        self.state.last_eval = Some(report.clone());
        self.state.last_eval_step = Some(self.state.global_step);
        self.metrics.record_evaluation(report.clone());
        if improved {
            info!("New best stats, saving");
            self.save_checkpoint(Some(&report))?;
        }
        Ok(())
    }

    /// Write a checkpoint of every network at the current step
    pub fn save_checkpoint(&mut self, report: Option<&EvalReport>) -> Result<PathBuf> {
        let mut metadata = CheckpointMetadata::new(self.state.global_step, self.state.epoch, &self.network, &self.config)
            .with_batch_offset(self.state.batch_in_epoch);
        if let Some(report) = report {
            metadata = metadata.with_eval(report.accuracy, report.loss);
        }
        let path = self.checkpoint_manager.save(
            &self.config.training.checkpoint.tag,
            &self.network,
            self.discriminator.as_ref().map(|(_, vars)| vars),
            &metadata,
        )?;
        self.state.last_checkpoint = Some(path.clone());
        self.send_event(TrainingEvent::CheckpointSaved { path: path.clone() });
        Ok(path)
    }

    fn send_event(&self, event: TrainingEvent) {
        if let Some(tx) = &self.event_tx {
            if tx.send(event).is_err() {
                warn!("Training event receiver dropped");
            }
        }
    }
}

/// Score `sample_batch` freshly drawn classifiers (evaluation mode) on every batch of `loader`
pub fn evaluate_population(
    network: &mut HyperNetwork,
    loader: &DataLoader,
    sample_batch: usize,
    max_batches: Option<usize>,
) -> Result<EvalReport> {
    let limit = max_batches.unwrap_or(usize::MAX);
    let mut correct = 0usize;
    let mut seen = 0usize;
    let mut loss_sum = 0f64;
    let mut evaluations = 0usize;
    let mut best_sample_loss = f64::INFINITY;
    let mut samples_evaluated = 0usize;

    for batch in loader.batches().take(limit) {
        let batch = batch?;
        let noise = network.sample_noise(sample_batch)?;
        let (_, weights) = network.generate(&noise, false)?;
        for i in 0..weights.num_samples() {
            let sample = weights.sample(i)?;
            let logits = network.classifier().forward(&sample, &batch.images)?;
            let loss = classification_loss(&logits, &batch.labels)?.to_scalar::<f32>()? as f64;
            correct += correct_predictions(&logits, &batch.labels)?;
            seen += batch.size;
            loss_sum += loss;
            evaluations += 1;
            best_sample_loss = best_sample_loss.min(loss);
        }
        samples_evaluated += weights.num_samples();
    }

    if evaluations == 0 {
        bail!("evaluation loader produced no batches");
    }
    Ok(EvalReport {
        accuracy: correct as f64 / seen as f64,
        loss: loss_sum / evaluations as f64,
        samples_evaluated,
        best_sample_loss,
    })
}

fn check_loader(network: &HyperNetwork, loader: &DataLoader, which: &str) -> Result<()> {
    let layout = network.layout();
    let dataset = loader.dataset();
    if dataset.image_shape() != layout.input {
        bail!(
            "{} images are {:?} but the classifier expects {:?}",
            which,
            dataset.image_shape(),
            layout.input
        );
    }
    if dataset.num_classes() != layout.num_classes {
        bail!(
            "{} data has {} classes but the classifier predicts {}",
            which,
            dataset.num_classes(),
            layout.num_classes
        );
    }
    Ok(())
}

fn log_step(metrics: &StepMetrics) {
    info!(
        step = metrics.step,
        loss = metrics.loss,
        accuracy = metrics.accuracy,
        filter_norm = metrics.filter_norm(),
        linear_norm = metrics.linear_norm(),
        disc_loss = metrics.disc_loss,
        "Acc: {:.4}, Loss: {:.4}",
        metrics.accuracy,
        metrics.loss
    );
}
