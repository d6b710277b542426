//! Functional forward pass of the target classifier with externally supplied weights

use candle_core::{Tensor, D};

use super::architectures::{ConvNorm, LayerKind, TargetLayout};
use crate::error::{Error, Result};
use crate::utils::tensor::frobenius_norm;

const NORM_EPS: f64 = 1e-5;

/// Weights of one layer of one sampled classifier
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl LayerWeights {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self { weight, bias }
    }

    /// Frobenius norm of the weight tensor
    pub fn weight_norm(&self) -> Result<f32> {
        frobenius_norm(&self.weight)
    }
}

/// Hand-assembled classifier: conv stack, flatten, linear stack
#[derive(Debug, Clone)]
pub struct FunctionalClassifier {
    layout: TargetLayout,
}

impl FunctionalClassifier {
    pub fn new(layout: TargetLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &TargetLayout {
        &self.layout
    }

    /// Checks a weight set against the layout before it is used
    pub fn check_weights(&self, weights: &[LayerWeights]) -> Result<()> {
        if weights.len() != self.layout.layers.len() {
            return Err(Error::shape_mismatch(
                "classifier layer count",
                &[self.layout.layers.len()],
                &[weights.len()],
            ));
        }
        for (spec, w) in self.layout.layers.iter().zip(weights) {
            let expected = spec.weight_shape();
            if w.weight.dims() != expected.as_slice() {
                return Err(Error::shape_mismatch(format!("{}.weight", spec.name), &expected, w.weight.dims()));
            }
            match (spec.bias_shape(), &w.bias) {
                (Some(shape), Some(bias)) if bias.dims() != shape.as_slice() => {
                    return Err(Error::shape_mismatch(format!("{}.bias", spec.name), &shape, bias.dims()));
                }
                (Some(_), None) => {
                    return Err(Error::invalid_input(format!("layer '{}' requires a bias", spec.name)));
                }
                (None, Some(_)) => {
                    return Err(Error::invalid_input(format!("layer '{}' takes no bias", spec.name)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Logits `(N, num_classes)` for images `(N, C, H, W)` under the given weights
    pub fn forward(&self, weights: &[LayerWeights], images: &Tensor) -> Result<Tensor> {
        self.check_weights(weights)?;
        let input = self.layout.input;
        let (n, c, h, w) = images.dims4()?;
        if (c, h, w) != (input.channels, input.height, input.width) {
            return Err(Error::shape_mismatch(
                "classifier input",
                &[n, input.channels, input.height, input.width],
                &[n, c, h, w],
            ));
        }

        let last = self.layout.layers.len() - 1;
        let mut x = images.clone();
        for (i, (spec, params)) in self.layout.layers.iter().zip(weights).enumerate() {
            match spec.kind {
                LayerKind::Conv2d { out_channels, padding, stride, .. } => {
                    x = x.conv2d(&params.weight, padding, stride, 1, 1)?;
                    if let Some(bias) = &params.bias {
                        x = x.broadcast_add(&bias.reshape((1, out_channels, 1, 1))?)?;
                    }
                    if self.layout.conv_norm == ConvNorm::BatchStatistics {
                        x = batch_statistics_norm(&x)?;
                    }
                    x = x.relu()?.max_pool2d(self.layout.pool_size)?;
                }
                LayerKind::Linear { .. } => {
                    if x.rank() > 2 {
                        x = x.flatten_from(1)?;
                    }
                    x = x.matmul(&params.weight.t()?)?;
                    if let Some(bias) = &params.bias {
                        x = x.broadcast_add(bias)?;
                    }
                    if i != last {
                        x = x.relu()?;
                    }
                }
            }
        }
        Ok(x)
    }

    /// Predicted class index per image
    pub fn predict(&self, weights: &[LayerWeights], images: &Tensor) -> Result<Tensor> {
        Ok(self.forward(weights, images)?.argmax(D::Minus1)?)
    }
}

/// Per-channel normalisation with batch statistics that do not take part in backprop
fn batch_statistics_norm(x: &Tensor) -> Result<Tensor> {
    let detached = x.detach();
    let mean = detached.mean_keepdim(0)?.mean_keepdim(2)?.mean_keepdim(3)?;
    let var = detached
        .broadcast_sub(&mean)?
        .sqr()?
        .mean_keepdim(0)?
        .mean_keepdim(2)?
        .mean_keepdim(3)?;
    let std = (var + NORM_EPS)?.sqrt()?;
    Ok(x.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypernetwork::architectures::{ArchitectureHandler, InputShape, LayerSpec, TargetArchitecture};
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};

    fn tiny_layout(conv_norm: ConvNorm) -> TargetLayout {
        ArchitectureHandler::new()
            .resolve(&TargetArchitecture::Custom {
                input: InputShape::new(1, 4, 4),
                num_classes: 2,
                layers: vec![
                    LayerSpec::conv("c1", 2, 1, 3, 1, true),
                    LayerSpec::linear("l1", 2, 8, true),
                ],
                conv_norm,
                pool_size: 2,
            })
            .unwrap()
    }

    fn random_weights(layout: &TargetLayout) -> Vec<LayerWeights> {
        layout
            .layers
            .iter()
            .map(|spec| {
                let weight = Tensor::randn(0f32, 1f32, spec.weight_shape(), &Device::Cpu).unwrap();
                let bias = spec
                    .bias_shape()
                    .map(|s| Tensor::randn(0f32, 1f32, s, &Device::Cpu).unwrap());
                LayerWeights::new(weight, bias)
            })
            .collect()
    }

    #[test]
    fn produces_logits_per_image() {
        let layout = tiny_layout(ConvNorm::None);
        let classifier = FunctionalClassifier::new(layout.clone());
        let weights = random_weights(&layout);
        let images = Tensor::randn(0f32, 1f32, (3, 1, 4, 4), &Device::Cpu).unwrap();
        let logits = classifier.forward(&weights, &images).unwrap();
        assert_eq!(logits.dims(), &[3, 2]);
        let preds = classifier.predict(&weights, &images).unwrap();
        assert_eq!(preds.dims(), &[3]);
    }

    #[test]
    fn matches_hand_computed_linear_only_network() {
        let layout = ArchitectureHandler::new()
            .resolve(&TargetArchitecture::Custom {
                input: InputShape::new(1, 1, 2),
                num_classes: 2,
                layers: vec![
                    LayerSpec::linear("l1", 2, 2, true),
                    LayerSpec::linear("l2", 2, 2, false),
                ],
                conv_norm: ConvNorm::None,
                pool_size: 2,
            })
            .unwrap();
        let classifier = FunctionalClassifier::new(layout);
        let dev = Device::Cpu;
        let weights = vec![
            LayerWeights::new(
                Tensor::new(&[[1f32, 0.], [0., -1.]], &dev).unwrap(),
                Some(Tensor::new(&[0.5f32, 0.5], &dev).unwrap()),
            ),
            LayerWeights::new(Tensor::new(&[[1f32, 1.], [2., 0.]], &dev).unwrap(), None),
        ];
        let images = Tensor::new(&[1f32, 2.], &dev).unwrap().reshape((1, 1, 1, 2)).unwrap();
        let logits = classifier.forward(&weights, &images).unwrap().to_vec2::<f32>().unwrap();
        // hidden = relu([1.5, -1.5]) = [1.5, 0]; logits = [1.5, 3.0]
        assert_relative_eq!(logits[0][0], 1.5, epsilon = 1e-6);
        assert_relative_eq!(logits[0][1], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn batch_statistics_centre_each_channel() {
        let x = Tensor::randn(3f32, 2f32, (4, 2, 3, 3), &Device::Cpu).unwrap();
        let y = batch_statistics_norm(&x).unwrap();
        let per_channel = y
            .mean_keepdim(0)
            .unwrap()
            .mean_keepdim(2)
            .unwrap()
            .mean_keepdim(3)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for m in per_channel {
            assert_relative_eq!(m, 0.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn batch_norm_variant_runs() {
        let layout = tiny_layout(ConvNorm::BatchStatistics);
        let classifier = FunctionalClassifier::new(layout.clone());
        let weights = random_weights(&layout);
        let images = Tensor::randn(0f32, 1f32, (5, 1, 4, 4), &Device::Cpu).unwrap();
        assert_eq!(classifier.forward(&weights, &images).unwrap().dims(), &[5, 2]);
    }

    #[test]
    fn rejects_misshapen_weights_and_inputs() {
        let layout = tiny_layout(ConvNorm::None);
        let classifier = FunctionalClassifier::new(layout.clone());
        let mut weights = random_weights(&layout);
        let images = Tensor::zeros((1, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();

        let wrong_images = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(classifier.forward(&weights, &wrong_images).is_err());

        weights[1].bias = None;
        assert!(classifier.forward(&weights, &images).is_err());

        weights.pop();
        let err = classifier.forward(&weights, &images).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn weight_norm_is_frobenius() {
        let w = LayerWeights::new(Tensor::new(&[[3f32, 4.]], &Device::Cpu).unwrap(), None);
        assert_relative_eq!(w.weight_norm().unwrap(), 5.0, epsilon = 1e-6);
    }
}
