//! Image classification data for training and evaluating sampled classifiers
//!
//! Datasets hand out single `(C, H, W)` images with their class index; the
//! loader shuffles indices per epoch and the collator stacks them into batches.

use anyhow::Result;
use candle_core::Tensor;

pub mod batching;
pub mod datasets;
pub mod loaders;

pub use batching::{collate, Batch};
pub use datasets::{Cifar10Dataset, InMemoryDataset, SyntheticDataset};
pub use loaders::{DataLoader, DataLoaderConfig};

use crate::hypernetwork::InputShape;

/// Common trait for all image datasets
pub trait Dataset: Send + Sync {
    /// Get the number of samples in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Image `(C, H, W)` and label of sample `index`
    fn get(&self, index: usize) -> Result<(Tensor, u32)>;

    fn image_shape(&self) -> InputShape;

    fn num_classes(&self) -> usize;
}

/// Error types for data loading
#[derive(thiserror::Error, Debug)]
pub enum DataError {
    #[error("Dataset not found: {path}")]
    DatasetNotFound { path: String },

    #[error("Invalid sample index: {index} >= {dataset_size}")]
    InvalidIndex { index: usize, dataset_size: usize },

    #[error("Malformed data in {source_name}: {reason}")]
    MalformedData { source_name: String, reason: String },

    #[error("Batch collation error: {reason}")]
    BatchCollationError { reason: String },
}
