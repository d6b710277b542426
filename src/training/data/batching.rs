//! Batch collation

use anyhow::Result;
use candle_core::{Device, Tensor};

use super::{DataError, Dataset};

/// A batch of images with their class indices
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(size, C, H, W)`
    pub images: Tensor,
    /// `(size,)` of `u32`
    pub labels: Tensor,
    pub size: usize,
}

/// Fetch `indices` from `dataset` and stack them onto `device`
pub fn collate(dataset: &dyn Dataset, indices: &[usize], device: &Device) -> Result<Batch> {
    if indices.is_empty() {
        return Err(DataError::BatchCollationError {
            reason: "empty batch".to_string(),
        }
        .into());
    }

    let mut images = Vec::with_capacity(indices.len());
    let mut labels = Vec::with_capacity(indices.len());
    for &index in indices {
        let (image, label) = dataset.get(index)?;
        images.push(image);
        labels.push(label);
    }

    let images = Tensor::stack(&images, 0)?.to_device(device)?;
    let labels = Tensor::new(labels, device)?;
    Ok(Batch {
        images,
        labels,
        size: indices.len(),
    })
}
