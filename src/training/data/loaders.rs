//! Data loader: per-epoch shuffled index batches collated on demand

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use candle_core::Device;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::batching::{collate, Batch};
use super::Dataset;

/// Configuration for DataLoader
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataLoaderConfig {
    /// Batch size
    pub batch_size: usize,
    /// Whether to shuffle data
    pub shuffle: bool,
    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
    /// Base seed of the per-epoch shuffle
    pub seed: u64,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            drop_last: false,
            seed: 0,
        }
    }
}

pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    config: DataLoaderConfig,
    device: Device,
    epoch: AtomicUsize,
}

impl DataLoader {
    pub fn new(dataset: Arc<dyn Dataset>, config: DataLoaderConfig, device: Device) -> Result<Self> {
        if config.batch_size == 0 {
            anyhow::bail!("batch size must be greater than 0");
        }
        if dataset.is_empty() {
            anyhow::bail!("dataset is empty");
        }
        debug!(
            "Creating DataLoader with batch_size={}, shuffle={}, drop_last={} over {} samples",
            config.batch_size,
            config.shuffle,
            config.drop_last,
            dataset.len()
        );
        Ok(Self {
            dataset,
            config,
            device,
            epoch: AtomicUsize::new(0),
        })
    }

    /// Get the number of batches per epoch
    pub fn num_batches(&self) -> usize {
        let dataset_size = self.dataset.len();
        if self.config.drop_last {
            dataset_size / self.config.batch_size
        } else {
            (dataset_size + self.config.batch_size - 1) / self.config.batch_size
        }
    }

    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    pub fn dataset(&self) -> &dyn Dataset {
        self.dataset.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Epochs started so far
    pub fn epochs_started(&self) -> usize {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Batches of one epoch; every call starts a new epoch with a fresh shuffle
    pub fn batches(&self) -> BatchIter<'_> {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        BatchIter {
            loader: self,
            indices,
            position: 0,
        }
    }
}

/// Iterator over the batches of one epoch
pub struct BatchIter<'a> {
    loader: &'a DataLoader,
    indices: Vec<usize>,
    position: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch_size = self.loader.config.batch_size;
        let remaining = self.indices.len().saturating_sub(self.position);
        if remaining == 0 || (self.loader.config.drop_last && remaining < batch_size) {
            return None;
        }
        let end = self.position + remaining.min(batch_size);
        let chunk = &self.indices[self.position..end];
        self.position = end;
        Some(collate(self.loader.dataset.as_ref(), chunk, &self.loader.device))
    }
}
