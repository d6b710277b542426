//! Step and evaluation metrics, best-so-far tracking and a bounded history

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Frobenius norm of one generated layer of one sampled classifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightNorms {
    pub layer: String,
    pub norm: f32,
    pub is_conv: bool,
}

/// Metrics of one training step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepMetrics {
    pub step: usize,
    /// Unscaled classifier loss averaged over the sampled population
    pub loss: f64,
    /// Accuracy of the last sampled classifier on the step's batch
    pub accuracy: f64,
    /// Discriminator loss of the last update, when a regulariser is on
    pub disc_loss: Option<f64>,
    /// Adversarial term added to the hypernetwork objective
    pub adversarial_loss: Option<f64>,
    /// Weight norms of the first sampled classifier
    pub norms: Vec<WeightNorms>,
}

impl StepMetrics {
    /// Norm of the first conv layer ("filter norm"), if any
    pub fn filter_norm(&self) -> Option<f32> {
        self.norms.iter().find(|n| n.is_conv).map(|n| n.norm)
    }

    /// Norm of the first linear layer ("linear norm"), if any
    pub fn linear_norm(&self) -> Option<f32> {
        self.norms.iter().find(|n| !n.is_conv).map(|n| n.norm)
    }
}

/// Test-set evaluation over sampled classifiers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalReport {
    /// Fraction of correct predictions over every (classifier, image) pair
    pub accuracy: f64,
    /// Mean loss per (classifier, batch) evaluation
    pub loss: f64,
    /// Classifiers drawn in total
    pub samples_evaluated: usize,
    /// Lowest loss any single classifier reached on a batch
    pub best_sample_loss: f64,
}

/// Best evaluation results so far; starts at the configured save thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BestStats {
    pub best_accuracy: f64,
    pub best_loss: f64,
}

impl BestStats {
    pub fn new(accuracy_threshold: f64, loss_threshold: f64) -> Self {
        Self {
            best_accuracy: accuracy_threshold,
            best_loss: loss_threshold,
        }
    }

    /// Records a report; true when its loss fell below or its accuracy rose above the best so far
    pub fn update(&mut self, report: &EvalReport) -> bool {
        let mut improved = false;
        if report.loss < self.best_loss {
            self.best_loss = report.loss;
            improved = true;
        }
        if report.accuracy > self.best_accuracy {
            self.best_accuracy = report.accuracy;
            improved = true;
        }
        improved
    }
}

/// Rolling per-step history and per-epoch accumulators
pub struct MetricsTracker {
    history: VecDeque<StepMetrics>,
    max_history: usize,
    epoch_loss: f64,
    epoch_accuracy: f64,
    epoch_steps: usize,
    evaluations: Vec<EvalReport>,
    steps_recorded: usize,
    start_time: Instant,
}

impl MetricsTracker {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(max_history.min(1024)),
            max_history: max_history.max(1),
            epoch_loss: 0.0,
            epoch_accuracy: 0.0,
            epoch_steps: 0,
            evaluations: Vec::new(),
            steps_recorded: 0,
            start_time: Instant::now(),
        }
    }

    pub fn record_step(&mut self, metrics: StepMetrics) {
        self.epoch_loss += metrics.loss;
        self.epoch_accuracy += metrics.accuracy;
        self.epoch_steps += 1;
        self.steps_recorded += 1;
        if self.history.len() == self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(metrics);
    }

    pub fn record_evaluation(&mut self, report: EvalReport) {
        self.evaluations.push(report);
    }

    pub fn latest(&self) -> Option<&StepMetrics> {
        self.history.back()
    }

    pub fn history(&self) -> impl Iterator<Item = &StepMetrics> {
        self.history.iter()
    }

    pub fn evaluations(&self) -> &[EvalReport] {
        &self.evaluations
    }

    /// Mean loss over the most recent `window` steps
    pub fn recent_loss(&self, window: usize) -> Option<f64> {
        let take = window.min(self.history.len());
        if take == 0 {
            return None;
        }
        let sum: f64 = self.history.iter().rev().take(take).map(|m| m.loss).sum();
        Some(sum / take as f64)
    }

    /// `(mean loss, mean accuracy)` of the current epoch
    pub fn epoch_averages(&self) -> Option<(f64, f64)> {
        if self.epoch_steps == 0 {
            return None;
        }
        let n = self.epoch_steps as f64;
        Some((self.epoch_loss / n, self.epoch_accuracy / n))
    }

    /// Returns the finished epoch's averages and resets the accumulators
    pub fn finish_epoch(&mut self) -> Option<(f64, f64)> {
        let averages = self.epoch_averages();
        self.epoch_loss = 0.0;
        self.epoch_accuracy = 0.0;
        self.epoch_steps = 0;
        averages
    }

    /// Steps recorded by this tracker per wall-clock second since it was created
    pub fn steps_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.steps_recorded as f64 / elapsed
        } else {
            0.0
        }
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new(1000)
    }
}
