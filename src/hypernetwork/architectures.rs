//! Target classifier architectures and their resolved layouts

use super::Activation;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Image input shape of the target classifier (channels-first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl InputShape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self { channels, height, width }
    }

    /// CIFAR-style RGB 32x32 input
    pub fn rgb32() -> Self {
        Self::new(3, 32, 32)
    }
}

/// Kind of a generated layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Conv2d {
        out_channels: usize,
        in_channels: usize,
        kernel_size: usize,
        #[serde(default)]
        padding: usize,
        #[serde(default = "default_stride")]
        stride: usize,
    },
    Linear {
        out_features: usize,
        in_features: usize,
    },
}

fn default_stride() -> usize {
    1
}

/// One layer of the target classifier, produced by its own generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub kind: LayerKind,
    #[serde(default)]
    pub bias: bool,
    /// Hidden widths for this layer's generator, overriding the default stack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator_hidden: Option<Vec<usize>>,
    /// Activation applied to this generator's raw output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_activation: Option<Activation>,
}

impl LayerSpec {
    pub fn conv(
        name: impl Into<String>,
        out_channels: usize,
        in_channels: usize,
        kernel_size: usize,
        padding: usize,
        bias: bool,
    ) -> Self {
        Self {
            name: name.into(),
            kind: LayerKind::Conv2d {
                out_channels,
                in_channels,
                kernel_size,
                padding,
                stride: 1,
            },
            bias,
            generator_hidden: None,
            output_activation: None,
        }
    }

    pub fn linear(name: impl Into<String>, out_features: usize, in_features: usize, bias: bool) -> Self {
        Self {
            name: name.into(),
            kind: LayerKind::Linear { out_features, in_features },
            bias,
            generator_hidden: None,
            output_activation: None,
        }
    }

    pub fn with_generator_hidden(mut self, hidden: Vec<usize>) -> Self {
        self.generator_hidden = Some(hidden);
        self
    }

    pub fn with_output_activation(mut self, activation: Activation) -> Self {
        self.output_activation = Some(activation);
        self
    }

    /// Weight tensor shape, `(out, in, k, k)` for convolutions and `(out, in)` for linear layers
    pub fn weight_shape(&self) -> Vec<usize> {
        match self.kind {
            LayerKind::Conv2d { out_channels, in_channels, kernel_size, .. } => {
                vec![out_channels, in_channels, kernel_size, kernel_size]
            }
            LayerKind::Linear { out_features, in_features } => vec![out_features, in_features],
        }
    }

    /// Bias shape, present only when the layer carries a bias
    pub fn bias_shape(&self) -> Option<Vec<usize>> {
        self.bias.then(|| vec![self.out_units()])
    }

    pub fn out_units(&self) -> usize {
        match self.kind {
            LayerKind::Conv2d { out_channels, .. } => out_channels,
            LayerKind::Linear { out_features, .. } => out_features,
        }
    }

    pub fn weight_numel(&self) -> usize {
        self.weight_shape().iter().product()
    }

    /// Number of values a generator must emit for this layer
    pub fn output_numel(&self) -> usize {
        self.weight_numel() + if self.bias { self.out_units() } else { 0 }
    }

    pub fn is_conv(&self) -> bool {
        matches!(self.kind, LayerKind::Conv2d { .. })
    }
}

/// Normalisation applied after each generated convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConvNorm {
    #[default]
    None,
    /// Per-channel normalisation with detached batch statistics, no affine terms
    BatchStatistics,
}

/// Supported target classifier architectures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetArchitecture {
    /// Three 3x3 convolutions and two linear layers, all with biases
    MedNet,
    /// Two padded convolutions with batch-statistics normalisation and two linear layers
    SmallCifar,
    /// Arbitrary conv-then-linear stack
    Custom {
        input: InputShape,
        num_classes: usize,
        layers: Vec<LayerSpec>,
        #[serde(default)]
        conv_norm: ConvNorm,
        #[serde(default = "default_pool")]
        pool_size: usize,
    },
}

fn default_pool() -> usize {
    2
}

impl TargetArchitecture {
    pub fn name(&self) -> &str {
        match self {
            TargetArchitecture::MedNet => "MedNet",
            TargetArchitecture::SmallCifar => "SmallCifar",
            TargetArchitecture::Custom { .. } => "Custom",
        }
    }
}

/// Validated description of the classifier every other component works from
#[derive(Debug, Clone, PartialEq)]
pub struct TargetLayout {
    pub input: InputShape,
    pub num_classes: usize,
    pub layers: Vec<LayerSpec>,
    pub conv_norm: ConvNorm,
    pub pool_size: usize,
    /// `(channels, height, width)` of the feature map entering the first linear layer
    pub feature_map: (usize, usize, usize),
}

impl TargetLayout {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Total number of generated parameters per classifier sample
    pub fn total_parameters(&self) -> usize {
        self.layers.iter().map(LayerSpec::output_numel).sum()
    }

    pub fn feature_map_after_convs(&self) -> (usize, usize, usize) {
        self.feature_map
    }

    pub fn flattened_features(&self) -> usize {
        let (c, h, w) = self.feature_map;
        c * h * w
    }
}

/// Resolves architectures into validated layouts
#[derive(Debug, Default)]
pub struct ArchitectureHandler;

impl ArchitectureHandler {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, arch: &TargetArchitecture) -> Result<TargetLayout> {
        match arch {
            TargetArchitecture::MedNet => Self::validate(
                InputShape::rgb32(),
                10,
                mednet_layers(),
                ConvNorm::None,
                2,
            ),
            TargetArchitecture::SmallCifar => Self::validate(
                InputShape::rgb32(),
                10,
                small_cifar_layers(),
                ConvNorm::BatchStatistics,
                2,
            ),
            TargetArchitecture::Custom { input, num_classes, layers, conv_norm, pool_size } => {
                Self::validate(*input, *num_classes, layers.clone(), *conv_norm, *pool_size)
            }
        }
    }

    fn validate(
        input: InputShape,
        num_classes: usize,
        layers: Vec<LayerSpec>,
        conv_norm: ConvNorm,
        pool_size: usize,
    ) -> Result<TargetLayout> {
        if input.channels == 0 || input.height == 0 || input.width == 0 {
            return Err(Error::architecture("input shape must be non-zero"));
        }
        if num_classes == 0 {
            return Err(Error::architecture("num_classes must be > 0"));
        }
        if pool_size == 0 {
            return Err(Error::architecture("pool_size must be > 0"));
        }

        let mut names = HashSet::new();
        for layer in &layers {
            if !names.insert(layer.name.as_str()) {
                return Err(Error::architecture(format!("duplicate layer name '{}'", layer.name)));
            }
            if layer.weight_shape().contains(&0) {
                return Err(Error::architecture(format!("layer '{}' has a zero dimension", layer.name)));
            }
        }

        let (mut channels, mut height, mut width) = (input.channels, input.height, input.width);
        let mut seen_linear = false;
        let mut features: Option<usize> = None;

        for layer in &layers {
            match layer.kind {
                LayerKind::Conv2d { out_channels, in_channels, kernel_size, padding, stride } => {
                    if seen_linear {
                        return Err(Error::architecture(format!(
                            "conv layer '{}' follows a linear layer",
                            layer.name
                        )));
                    }
                    if in_channels != channels {
                        return Err(Error::architecture(format!(
                            "layer '{}' expects {} input channels, previous layer yields {}",
                            layer.name, in_channels, channels
                        )));
                    }
                    if stride == 0 {
                        return Err(Error::architecture(format!("layer '{}' has stride 0", layer.name)));
                    }
                    height = conv_output(height, kernel_size, padding, stride).ok_or_else(|| {
                        Error::architecture(format!("layer '{}' kernel exceeds its input height", layer.name))
                    })?;
                    width = conv_output(width, kernel_size, padding, stride).ok_or_else(|| {
                        Error::architecture(format!("layer '{}' kernel exceeds its input width", layer.name))
                    })?;
                    height /= pool_size;
                    width /= pool_size;
                    if height == 0 || width == 0 {
                        return Err(Error::architecture(format!(
                            "feature map vanishes after pooling layer '{}'",
                            layer.name
                        )));
                    }
                    channels = out_channels;
                }
                LayerKind::Linear { out_features, in_features } => {
                    let expected = match features {
                        Some(f) => f,
                        None => channels * height * width,
                    };
                    if in_features != expected {
                        return Err(Error::architecture(format!(
                            "layer '{}' expects {} input features, previous layer yields {}",
                            layer.name, in_features, expected
                        )));
                    }
                    seen_linear = true;
                    features = Some(out_features);
                }
            }
        }

        match features {
            None => Err(Error::architecture("target network needs at least one linear layer")),
            Some(out) if out != num_classes => Err(Error::architecture(format!(
                "last layer yields {} outputs, expected {} classes",
                out, num_classes
            ))),
            Some(_) => {
                let feature_map = feature_map_before_linear(input, &layers, pool_size);
                Ok(TargetLayout {
                    input,
                    num_classes,
                    layers,
                    conv_norm,
                    pool_size,
                    feature_map,
                })
            }
        }
    }
}

fn conv_output(size: usize, kernel: usize, padding: usize, stride: usize) -> Option<usize> {
    let padded = size + 2 * padding;
    if padded < kernel {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

fn feature_map_before_linear(input: InputShape, layers: &[LayerSpec], pool: usize) -> (usize, usize, usize) {
    let (mut c, mut h, mut w) = (input.channels, input.height, input.width);
    for layer in layers {
        if let LayerKind::Conv2d { out_channels, kernel_size, padding, stride, .. } = layer.kind {
            h = conv_output(h, kernel_size, padding, stride).unwrap_or(0) / pool;
            w = conv_output(w, kernel_size, padding, stride).unwrap_or(0) / pool;
            c = out_channels;
        }
    }
    (c, h, w)
}

fn mednet_layers() -> Vec<LayerSpec> {
    vec![
        LayerSpec::conv("conv1", 32, 3, 3, 0, true),
        LayerSpec::conv("conv2", 64, 32, 3, 0, true),
        LayerSpec::conv("conv3", 64, 64, 3, 0, true),
        LayerSpec::linear("linear1", 128, 256, true),
        LayerSpec::linear("linear2", 10, 128, true),
    ]
}

fn small_cifar_layers() -> Vec<LayerSpec> {
    vec![
        LayerSpec::conv("conv1", 64, 3, 3, 1, false)
            .with_output_activation(Activation::LeakyRelu(0.01)),
        LayerSpec::conv("conv2", 128, 64, 3, 1, false).with_generator_hidden(vec![256, 1600, 1600]),
        LayerSpec::linear("linear1", 128, 128 * 8 * 8, false),
        LayerSpec::linear("linear2", 10, 128, false),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mednet_resolves_to_256_flat_features() {
        let layout = ArchitectureHandler::new().resolve(&TargetArchitecture::MedNet).unwrap();
        assert_eq!(layout.feature_map_after_convs(), (64, 2, 2));
        assert_eq!(layout.flattened_features(), 256);
        assert_eq!(layout.num_layers(), 5);
        assert_eq!(layout.layers[0].output_numel(), 32 * 3 * 3 * 3 + 32);
        assert_eq!(layout.layers[3].output_numel(), 128 * 256 + 128);
    }

    #[test]
    fn small_cifar_resolves_without_biases() {
        let layout = ArchitectureHandler::new().resolve(&TargetArchitecture::SmallCifar).unwrap();
        assert_eq!(layout.feature_map_after_convs(), (128, 8, 8));
        assert_eq!(layout.conv_norm, ConvNorm::BatchStatistics);
        assert!(layout.layers.iter().all(|l| l.bias_shape().is_none()));
        assert_eq!(layout.layers[1].output_numel(), 73728);
        assert_eq!(layout.layers[2].output_numel(), 128 * 8192);
    }

    #[test]
    fn rejects_broken_channel_chain() {
        let arch = TargetArchitecture::Custom {
            input: InputShape::new(1, 8, 8),
            num_classes: 2,
            layers: vec![
                LayerSpec::conv("c1", 4, 1, 3, 1, true),
                LayerSpec::conv("c2", 4, 8, 3, 1, true),
                LayerSpec::linear("l1", 2, 16, true),
            ],
            conv_norm: ConvNorm::None,
            pool_size: 2,
        };
        let err = ArchitectureHandler::new().resolve(&arch).unwrap_err();
        assert!(err.to_string().contains("input channels"));
    }

    #[test]
    fn rejects_wrong_flat_features_and_class_count() {
        let bad_features = TargetArchitecture::Custom {
            input: InputShape::new(1, 8, 8),
            num_classes: 2,
            layers: vec![
                LayerSpec::conv("c1", 4, 1, 3, 1, true),
                LayerSpec::linear("l1", 2, 63, true),
            ],
            conv_norm: ConvNorm::None,
            pool_size: 2,
        };
        assert!(ArchitectureHandler::new().resolve(&bad_features).is_err());

        let bad_classes = TargetArchitecture::Custom {
            input: InputShape::new(1, 8, 8),
            num_classes: 3,
            layers: vec![
                LayerSpec::conv("c1", 4, 1, 3, 1, true),
                LayerSpec::linear("l1", 2, 64, true),
            ],
            conv_norm: ConvNorm::None,
            pool_size: 2,
        };
        let err = ArchitectureHandler::new().resolve(&bad_classes).unwrap_err();
        assert!(err.to_string().contains("classes"));
    }

    #[test]
    fn rejects_conv_after_linear_and_duplicate_names() {
        let order = TargetArchitecture::Custom {
            input: InputShape::new(1, 8, 8),
            num_classes: 2,
            layers: vec![
                LayerSpec::linear("l1", 64, 64, true),
                LayerSpec::conv("c1", 4, 1, 3, 1, true),
            ],
            conv_norm: ConvNorm::None,
            pool_size: 2,
        };
        assert!(ArchitectureHandler::new().resolve(&order).is_err());

        let dup = TargetArchitecture::Custom {
            input: InputShape::new(1, 4, 4),
            num_classes: 2,
            layers: vec![
                LayerSpec::linear("l", 8, 16, true),
                LayerSpec::linear("l", 2, 8, true),
            ],
            conv_norm: ConvNorm::None,
            pool_size: 2,
        };
        let err = ArchitectureHandler::new().resolve(&dup).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_vanishing_feature_map() {
        let arch = TargetArchitecture::Custom {
            input: InputShape::new(1, 3, 3),
            num_classes: 2,
            layers: vec![
                LayerSpec::conv("c1", 2, 1, 3, 0, false),
                LayerSpec::linear("l1", 2, 2, false),
            ],
            conv_norm: ConvNorm::None,
            pool_size: 2,
        };
        let err = ArchitectureHandler::new().resolve(&arch).unwrap_err();
        assert!(err.to_string().contains("vanishes"));
    }

    #[test]
    fn custom_architecture_round_trips_through_json() {
        let arch = TargetArchitecture::Custom {
            input: InputShape::new(1, 8, 8),
            num_classes: 3,
            layers: vec![
                LayerSpec::conv("c1", 4, 1, 3, 1, true).with_generator_hidden(vec![8]),
                LayerSpec::linear("l1", 3, 64, true),
            ],
            conv_norm: ConvNorm::BatchStatistics,
            pool_size: 2,
        };
        let json = serde_json::to_string(&arch).unwrap();
        let back: TargetArchitecture = serde_json::from_str(&json).unwrap();
        assert_eq!(arch, back);
    }
}
