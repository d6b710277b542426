#[cfg(test)]
mod tests {
    use crate::hypernetwork::*;
    use crate::config::Config;
    use crate::discriminator::LatentRegularizer;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device, Tensor};

    fn tiny_config() -> Config {
        let mut config = Config::mednet();
        config.latent.noise_dim = 8;
        config.latent.code_dim = 6;
        config.mixer.hidden_dims = vec![16];
        config.generator.hidden_dims = vec![12];
        config.mixer.input_noise_std = 0.0;
        config.generator.input_noise_std = 0.0;
        config.discriminator.regularizer = LatentRegularizer::None;
        config.target = TargetArchitecture::Custom {
            input: InputShape::new(1, 8, 8),
            num_classes: 3,
            layers: vec![
                LayerSpec::conv("conv1", 4, 1, 3, 1, true),
                LayerSpec::linear("fc1", 16, 64, true),
                LayerSpec::linear("fc2", 3, 16, true),
            ],
            conv_norm: ConvNorm::None,
            pool_size: 2,
        };
        config.training.sample_batch = 4;
        config
    }

    #[test]
    fn test_activation_functions() {
        let x = Tensor::new(&[-2f32, 0., 3.], &Device::Cpu).unwrap();
        assert_eq!(Activation::Relu.apply(&x).unwrap().to_vec1::<f32>().unwrap(), vec![0., 0., 3.]);
        assert_eq!(Activation::Identity.apply(&x).unwrap().to_vec1::<f32>().unwrap(), vec![-2., 0., 3.]);
        let leaky = Activation::LeakyRelu(0.1).apply(&x).unwrap().to_vec1::<f32>().unwrap();
        assert_relative_eq!(leaky[0], -0.2, epsilon = 1e-6);
        assert_relative_eq!(leaky[2], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_activation_serde_names() {
        let json = serde_json::to_string(&Activation::LeakyRelu(0.01)).unwrap();
        assert_eq!(json, r#"{"leaky_relu":0.01}"#);
        let parsed: Activation = serde_json::from_str(r#""relu""#).unwrap();
        assert_eq!(parsed, Activation::Relu);
    }

    #[test]
    fn test_hypernetwork_creation() {
        let config = tiny_config();
        let network = HyperNetwork::new(&config, &Device::Cpu).unwrap();
        assert_eq!(network.generators().len(), 3);
        assert_eq!(network.generator_vars().len(), 3);
        assert_eq!(network.generator_names(), vec!["conv1", "fc1", "fc2"]);
        assert_eq!(network.layout().total_parameters(), 4 * 9 + 4 + 16 * 64 + 16 + 3 * 16 + 3);
        assert!(network.parameter_count() > 0);
        assert!(!network.mixer_vars().all_vars().is_empty());
    }

    #[test]
    fn test_generate_routes_each_code_to_its_generator() {
        let config = tiny_config();
        let mut network = HyperNetwork::new(&config, &Device::Cpu).unwrap();
        let noise = network.sample_noise(4).unwrap();
        let (codes, weights) = network.generate(&noise, true).unwrap();

        assert_eq!(codes.len(), 3);
        assert_eq!(codes.batch_size(), 4);
        assert_eq!(weights.num_samples(), 4);
        assert_eq!(weights.num_layers(), 3);
        assert_eq!(weights.layer(0).unwrap().weight.dims(), &[4, 4, 1, 3, 3]);
        assert_eq!(weights.layer(1).unwrap().weight.dims(), &[4, 16, 64]);
        assert_eq!(weights.layer(2).unwrap().bias.as_ref().unwrap().dims(), &[4, 3]);

        // regenerating from the same codes in eval mode is deterministic
        let again = network.generate_from_codes(&codes, false).unwrap();
        let twice = network.generate_from_codes(&codes, false).unwrap();
        let a = again.layer(2).unwrap().weight.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = twice.layer(2).unwrap().weight.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sampled_weights_drive_the_classifier() {
        let config = tiny_config();
        let mut network = HyperNetwork::new(&config, &Device::Cpu).unwrap();
        let noise = network.sample_noise(4).unwrap();
        let (_, weights) = network.generate(&noise, true).unwrap();

        let images = Tensor::randn(0f32, 1f32, (2, 1, 8, 8), &Device::Cpu).unwrap();
        for i in 0..weights.num_samples() {
            let sample = weights.sample(i).unwrap();
            assert_eq!(sample[0].weight.dims(), &[4, 1, 3, 3]);
            let logits = network.classifier().forward(&sample, &images).unwrap();
            assert_eq!(logits.dims(), &[2, 3]);
        }
        assert!(weights.sample(4).is_err());
    }

    #[test]
    fn test_norms_are_reported_per_layer() {
        let config = tiny_config();
        let mut network = HyperNetwork::new(&config, &Device::Cpu).unwrap();
        let noise = network.sample_noise(4).unwrap();
        let (_, weights) = network.generate(&noise, true).unwrap();
        let norms = weights.norms(0).unwrap();
        assert_eq!(norms.len(), 3);
        assert_eq!(norms[1].0, "fc1");
        assert!(norms.iter().all(|(_, n)| n.is_finite() && *n > 0.0));
    }

    #[test]
    fn test_sample_classifiers_in_eval_mode() {
        let config = tiny_config();
        let mut network = HyperNetwork::new(&config, &Device::Cpu).unwrap();
        let classifiers = network.sample_classifiers(3).unwrap();
        assert_eq!(classifiers.len(), 3);
        assert!(classifiers.iter().all(|c| c.len() == 3));
    }

    #[test]
    fn test_rejects_code_count_mismatch() {
        let config = tiny_config();
        let mut network = HyperNetwork::new(&config, &Device::Cpu).unwrap();
        let code = Tensor::zeros((4, 6), DType::F32, &Device::Cpu).unwrap();
        let codes = crate::encoder::LatentCodes::new(vec![code]).unwrap();
        assert!(network.generate_from_codes(&codes, false).is_err());
    }

    #[test]
    fn test_noise_stream_is_seeded() {
        let config = tiny_config();
        let mut a = HyperNetwork::new(&config, &Device::Cpu).unwrap();
        let mut b = HyperNetwork::new(&config, &Device::Cpu).unwrap();
        let na = a.sample_noise(2).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let nb = b.sample_noise(2).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(na, nb);
    }
}
