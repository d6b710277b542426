//! Loss functions for the classifier population and the latent discriminator

use candle_core::{DType, Tensor, D};
use candle_nn as nn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the per-sample losses of a classifier population are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LossReduction {
    #[default]
    Mean,
    /// Gradients of every sampled classifier add up, as with repeated backward passes
    Sum,
}

/// Cross entropy averaged over the data batch; `targets` are `u32` class indices
pub fn classification_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (n, _) = logits.dims2()?;
    let t = targets.dims1()?;
    if n != t {
        return Err(Error::shape_mismatch("classification targets", &[n], &[t]));
    }
    Ok(nn::loss::cross_entropy(logits, targets)?)
}

/// Number of rows whose arg-max matches the target
pub fn correct_predictions(logits: &Tensor, targets: &Tensor) -> Result<usize> {
    let predictions = logits.argmax(D::Minus1)?;
    let correct = predictions
        .eq(&targets.to_dtype(DType::U32)?)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(correct as usize)
}

/// Binary cross entropy against a constant target, computed from logits as
/// `max(x, 0) - x * t + log(1 + exp(-|x|))` and averaged
pub fn bce_with_logits(logits: &Tensor, target: f64) -> Result<Tensor> {
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    let loss = ((logits.relu()? - (logits * target)?)? + softplus)?;
    Ok(loss.mean_all()?)
}

/// Combine scalar losses of the sampled classifiers into one objective
pub fn reduce_population(losses: &[Tensor], reduction: LossReduction, scale: f64) -> Result<Tensor> {
    if losses.is_empty() {
        return Err(Error::invalid_input("cannot reduce an empty population"));
    }
    let stacked = Tensor::stack(losses, 0)?;
    let combined = match reduction {
        LossReduction::Mean => stacked.mean_all()?,
        LossReduction::Sum => stacked.sum_all()?,
    };
    if scale == 1.0 {
        Ok(combined)
    } else {
        Ok((combined * scale)?)
    }
}

/// True when every element is finite
pub fn is_finite(tensor: &Tensor) -> Result<bool> {
    let values = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Ok(values.iter().all(|v| v.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    #[test]
    fn test_cross_entropy_of_uniform_logits() {
        let logits = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[0u32, 3], &Device::Cpu).unwrap();
        let loss = classification_loss(&logits, &targets).unwrap().to_scalar::<f32>().unwrap();
        assert_relative_eq!(loss, 4f32.ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_classification_loss_rejects_target_mismatch() {
        let logits = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[0u32, 1, 2], &Device::Cpu).unwrap();
        assert!(classification_loss(&logits, &targets).is_err());
    }

    #[test]
    fn test_correct_predictions() {
        let logits = Tensor::new(&[[0.1f32, 0.9], [0.8, 0.2], [0.3, 0.7]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1u32, 1, 1], &Device::Cpu).unwrap();
        assert_eq!(correct_predictions(&logits, &targets).unwrap(), 2);
    }

    #[test]
    fn test_bce_matches_closed_form() {
        let logits = Tensor::new(&[0f32, 2.0, -3.0], &Device::Cpu).unwrap();
        let loss = bce_with_logits(&logits, 1.0).unwrap().to_scalar::<f32>().unwrap();
        let expected = [0f32, 2.0, -3.0]
            .iter()
            .map(|x| -(1.0 / (1.0 + (-x).exp())).ln())
            .sum::<f32>()
            / 3.0;
        assert_relative_eq!(loss, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_bce_is_stable_for_large_logits() {
        let logits = Tensor::new(&[500f32, -500.0], &Device::Cpu).unwrap();
        let loss = bce_with_logits(&logits, 0.0).unwrap();
        assert!(is_finite(&loss).unwrap());
        assert_relative_eq!(loss.to_scalar::<f32>().unwrap(), 250.0, epsilon = 1e-3);
    }

    #[test]
    fn test_reduce_population() {
        let losses: Vec<Tensor> = [1f32, 2.0, 3.0]
            .iter()
            .map(|v| Tensor::new(*v, &Device::Cpu).unwrap())
            .collect();
        let mean = reduce_population(&losses, LossReduction::Mean, 1.0).unwrap();
        assert_relative_eq!(mean.to_scalar::<f32>().unwrap(), 2.0, epsilon = 1e-6);
        let sum = reduce_population(&losses, LossReduction::Sum, 1000.0).unwrap();
        assert_relative_eq!(sum.to_scalar::<f32>().unwrap(), 6000.0, epsilon = 1e-3);
        assert!(reduce_population(&[], LossReduction::Sum, 1.0).is_err());
    }

    #[test]
    fn test_is_finite_flags_nan() {
        let t = Tensor::new(&[1f32, f32::NAN], &Device::Cpu).unwrap();
        assert!(!is_finite(&t).unwrap());
    }
}
