//! Dataset implementations: in-memory tensors, seeded synthetic data and CIFAR-10

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::{debug, info, instrument};

use super::{DataError, Dataset};
use crate::hypernetwork::InputShape;

/// Images held in one `(N, C, H, W)` tensor on the CPU
pub struct InMemoryDataset {
    images: Tensor,
    labels: Vec<u32>,
    shape: InputShape,
    num_classes: usize,
}

impl InMemoryDataset {
    pub fn new(images: Tensor, labels: Vec<u32>, num_classes: usize) -> Result<Self> {
        let (n, c, h, w) = images.dims4()?;
        if n != labels.len() {
            return Err(DataError::MalformedData {
                source_name: "in-memory dataset".to_string(),
                reason: format!("{} images but {} labels", n, labels.len()),
            }
            .into());
        }
        if let Some(bad) = labels.iter().find(|&&l| l as usize >= num_classes) {
            return Err(DataError::MalformedData {
                source_name: "in-memory dataset".to_string(),
                reason: format!("label {} outside {} classes", bad, num_classes),
            }
            .into());
        }
        Ok(Self {
            images: images.to_device(&Device::Cpu)?,
            labels,
            shape: InputShape::new(c, h, w),
            num_classes,
        })
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn get(&self, index: usize) -> Result<(Tensor, u32)> {
        if index >= self.len() {
            return Err(DataError::InvalidIndex {
                index,
                dataset_size: self.len(),
            }
            .into());
        }
        Ok((self.images.get(index)?, self.labels[index]))
    }

    fn image_shape(&self) -> InputShape {
        self.shape
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Class-conditional Gaussian images: every class has a fixed random template
/// and each sample is its template plus `noise_std` Gaussian noise
pub struct SyntheticDataset {
    inner: InMemoryDataset,
}

/// Offset separating the per-sample noise stream from the template stream in [`SyntheticDataset::new`]
const SAMPLE_STREAM: u64 = 0x9E37_79B9_7F4A_7C15;

impl SyntheticDataset {
    /// Templates and sample noise both derived from `seed`
    pub fn new(num_samples: usize, shape: InputShape, num_classes: usize, noise_std: f32, seed: u64) -> Result<Self> {
        Self::with_seeds(num_samples, shape, num_classes, noise_std, seed, seed ^ SAMPLE_STREAM)
    }

    /// Class templates come from `template_seed`, per-sample noise from `sample_seed`.
    /// Splits of one problem share `template_seed` and differ in `sample_seed`.
    pub fn with_seeds(
        num_samples: usize,
        shape: InputShape,
        num_classes: usize,
        noise_std: f32,
        template_seed: u64,
        sample_seed: u64,
    ) -> Result<Self> {
        if num_samples == 0 || num_classes == 0 {
            anyhow::bail!("synthetic dataset needs at least one sample and one class");
        }
        let mut template_rng = StdRng::seed_from_u64(template_seed);
        let mut rng = StdRng::seed_from_u64(sample_seed);
        let numel = shape.channels * shape.height * shape.width;

        let templates: Vec<Vec<f32>> = (0..num_classes)
            .map(|_| (0..numel).map(|_| template_rng.sample::<f32, _>(StandardNormal)).collect())
            .collect();

        let mut data = Vec::with_capacity(num_samples * numel);
        let mut labels = Vec::with_capacity(num_samples);
        for i in 0..num_samples {
            let label = i % num_classes;
            data.extend(
                templates[label]
                    .iter()
                    .map(|&t| t + noise_std * rng.sample::<f32, _>(StandardNormal)),
            );
            labels.push(label as u32);
        }

        let images = Tensor::from_vec(data, (num_samples, shape.channels, shape.height, shape.width), &Device::Cpu)?;
        debug!(
            "Synthetic dataset: {} samples, {} classes, template seed {}, sample seed {}",
            num_samples, num_classes, template_seed, sample_seed
        );
        Ok(Self {
            inner: InMemoryDataset::new(images, labels, num_classes)?,
        })
    }
}

impl Dataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, index: usize) -> Result<(Tensor, u32)> {
        self.inner.get(index)
    }

    fn image_shape(&self) -> InputShape {
        self.inner.image_shape()
    }

    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }
}

const CIFAR_SIDE: usize = 32;
const CIFAR_CHANNELS: usize = 3;
const CIFAR_IMAGE_BYTES: usize = CIFAR_CHANNELS * CIFAR_SIDE * CIFAR_SIDE;
const CIFAR_RECORD_BYTES: usize = 1 + CIFAR_IMAGE_BYTES;
const CIFAR_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
const CIFAR_STD: [f32; 3] = [0.2023, 0.1994, 0.2010];
const CIFAR_TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const CIFAR_TEST_FILE: &str = "test_batch.bin";

/// CIFAR-10 from the binary distribution (`cifar-10-batches-bin`)
pub struct Cifar10Dataset {
    inner: InMemoryDataset,
}

impl Cifar10Dataset {
    /// Load the five training batches or the test batch from `dir`
    #[instrument]
    pub fn load(dir: &Path, train: bool) -> Result<Self> {
        let files: Vec<&str> = if train {
            CIFAR_TRAIN_FILES.to_vec()
        } else {
            vec![CIFAR_TEST_FILE]
        };

        let mut bytes = Vec::new();
        for name in files {
            let path = dir.join(name);
            if !path.exists() {
                return Err(DataError::DatasetNotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
            let content = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            bytes.extend(content);
        }

        let dataset = Self::from_bytes(&bytes, &dir.display().to_string())?;
        info!(
            "Loaded CIFAR-10 {} split: {} images from {}",
            if train { "train" } else { "test" },
            dataset.len(),
            dir.display()
        );
        Ok(dataset)
    }

    /// Parse concatenated `label byte + 3072 pixel bytes` records, normalising each channel
    pub fn from_bytes(bytes: &[u8], source_name: &str) -> Result<Self> {
        if bytes.is_empty() || bytes.len() % CIFAR_RECORD_BYTES != 0 {
            return Err(DataError::MalformedData {
                source_name: source_name.to_string(),
                reason: format!("{} bytes is not a whole number of {}-byte records", bytes.len(), CIFAR_RECORD_BYTES),
            }
            .into());
        }

        let count = bytes.len() / CIFAR_RECORD_BYTES;
        let plane = CIFAR_SIDE * CIFAR_SIDE;
        let mut data = Vec::with_capacity(count * CIFAR_IMAGE_BYTES);
        let mut labels = Vec::with_capacity(count);
        for record in bytes.chunks_exact(CIFAR_RECORD_BYTES) {
            labels.push(record[0] as u32);
            for (i, &pixel) in record[1..].iter().enumerate() {
                let channel = i / plane;
                data.push((pixel as f32 / 255.0 - CIFAR_MEAN[channel]) / CIFAR_STD[channel]);
            }
        }

        let images = Tensor::from_vec(data, (count, CIFAR_CHANNELS, CIFAR_SIDE, CIFAR_SIDE), &Device::Cpu)?;
        Ok(Self {
            inner: InMemoryDataset::new(images, labels, 10)
                .with_context(|| format!("decoding CIFAR-10 records from {}", source_name))?,
        })
    }
}

impl Dataset for Cifar10Dataset {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, index: usize) -> Result<(Tensor, u32)> {
        self.inner.get(index)
    }

    fn image_shape(&self) -> InputShape {
        self.inner.image_shape()
    }

    fn num_classes(&self) -> usize {
        10
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::DType;
    use tempfile::TempDir;

    fn cifar_record(label: u8, pixel: u8) -> Vec<u8> {
        let mut record = vec![label];
        record.extend(std::iter::repeat(pixel).take(CIFAR_IMAGE_BYTES));
        record
    }

    #[test]
    fn test_in_memory_dataset_validates_labels() {
        let images = Tensor::zeros((2, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(InMemoryDataset::new(images.clone(), vec![0], 2).is_err());
        assert!(InMemoryDataset::new(images.clone(), vec![0, 5], 2).is_err());
        let dataset = InMemoryDataset::new(images, vec![0, 1], 2).unwrap();
        assert_eq!(dataset.len(), 2);
        assert!(dataset.get(2).is_err());
        assert_eq!(dataset.get(1).unwrap().0.dims(), &[1, 2, 2]);
    }

    #[test]
    fn test_synthetic_dataset_is_seeded() {
        let shape = InputShape::new(1, 4, 4);
        let a = SyntheticDataset::new(6, shape, 3, 0.1, 42).unwrap();
        let b = SyntheticDataset::new(6, shape, 3, 0.1, 42).unwrap();
        let (ia, la) = a.get(4).unwrap();
        let (ib, lb) = b.get(4).unwrap();
        assert_eq!(la, 1);
        assert_eq!(la, lb);
        assert_eq!(
            ia.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            ib.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
        assert_eq!(a.image_shape(), shape);
        assert_eq!(a.num_classes(), 3);
    }

    fn flat(dataset: &SyntheticDataset, index: usize) -> (Vec<f32>, u32) {
        let (image, label) = dataset.get(index).unwrap();
        (image.flatten_all().unwrap().to_vec1::<f32>().unwrap(), label)
    }

    #[test]
    fn test_synthetic_splits_share_class_templates() {
        let shape = InputShape::new(1, 8, 8);
        let classes = 10;
        let train = SyntheticDataset::with_seeds(20, shape, classes, 0.3, 8734, 1).unwrap();
        let test = SyntheticDataset::with_seeds(20, shape, classes, 0.3, 8734, 2).unwrap();
        assert_ne!(flat(&train, 0).0, flat(&test, 0).0);

        let numel = 64;
        let mut centroids = vec![vec![0f32; numel]; classes];
        let mut counts = vec![0f32; classes];
        for i in 0..train.len() {
            let (pixels, label) = flat(&train, i);
            for (c, p) in centroids[label as usize].iter_mut().zip(pixels) {
                *c += p;
            }
            counts[label as usize] += 1.0;
        }
        for (centroid, n) in centroids.iter_mut().zip(&counts) {
            centroid.iter_mut().for_each(|c| *c /= n);
        }

        for i in 0..test.len() {
            let (pixels, label) = flat(&test, i);
            let nearest = centroids
                .iter()
                .map(|c| c.iter().zip(&pixels).map(|(a, b)| (a - b).powi(2)).sum::<f32>())
                .enumerate()
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(class, _)| class as u32)
                .unwrap();
            assert_eq!(nearest, label, "test sample {} is closest to another class", i);
        }
    }

    #[test]
    fn test_cifar_records_are_normalised_per_channel() {
        let mut bytes = cifar_record(3, 255);
        bytes.extend(cifar_record(7, 0));
        let dataset = Cifar10Dataset::from_bytes(&bytes, "memory").unwrap();
        assert_eq!(dataset.len(), 2);

        let (image, label) = dataset.get(0).unwrap();
        assert_eq!(label, 3);
        assert_eq!(image.dims(), &[3, 32, 32]);
        let red = image.get(0).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_relative_eq!(red[0], (1.0 - 0.4914) / 0.2023, epsilon = 1e-5);

        let (dark, label) = dataset.get(1).unwrap();
        assert_eq!(label, 7);
        let blue = dark.get(2).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_relative_eq!(blue[10], -0.4465 / 0.2010, epsilon = 1e-5);
    }

    #[test]
    fn test_cifar_rejects_truncated_records() {
        let bytes = vec![0u8; CIFAR_RECORD_BYTES + 7];
        assert!(Cifar10Dataset::from_bytes(&bytes, "memory").is_err());
    }

    #[test]
    fn test_cifar_load_reads_test_batch_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CIFAR_TEST_FILE), cifar_record(1, 128)).unwrap();
        let dataset = Cifar10Dataset::load(dir.path(), false).unwrap();
        assert_eq!(dataset.len(), 1);
        // training batches are absent
        assert!(Cifar10Dataset::load(dir.path(), true).is_err());
    }
}
