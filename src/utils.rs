//! Utility functions shared across the HyperGAN crate

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use tracing::{debug, warn};

use crate::config::DeviceType;
use crate::error::{Error, Result};

/// Resolve the configured device. GPU devices need the matching candle feature.
pub fn select_device(device: &DeviceType) -> Result<Device> {
    let selected = match *device {
        DeviceType::Cpu => Device::Cpu,
        DeviceType::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|e| {
            warn!("CUDA device {} unavailable: {}", ordinal, e);
            Error::config(format!("CUDA device {} unavailable: {}", ordinal, e))
        })?,
        DeviceType::Metal(ordinal) => Device::new_metal(ordinal).map_err(|e| {
            warn!("Metal device {} unavailable: {}", ordinal, e);
            Error::config(format!("Metal device {} unavailable: {}", ordinal, e))
        })?,
    };
    debug!("Selected device {:?}", selected);
    Ok(selected)
}

/// Tensor helpers
pub mod tensor {
    use super::*;

    /// Frobenius norm of any tensor
    pub fn frobenius_norm(xs: &Tensor) -> Result<f32> {
        Ok(xs.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?)
    }

    /// Total element count of every variable in `vars`
    pub fn count_parameters(vars: &VarMap) -> usize {
        vars.all_vars().iter().map(|var| var.elem_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::tensor::*;
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::DType;
    use candle_nn::VarBuilder;

    #[test]
    fn cpu_is_always_available() {
        let device = select_device(&DeviceType::Cpu).unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn norm_of_known_tensor() {
        let t = Tensor::new(&[[1f32, 2.], [2., 4.]], &Device::Cpu).unwrap();
        assert_relative_eq!(frobenius_norm(&t).unwrap(), 5.0, epsilon = 1e-6);
    }

    #[test]
    fn counts_every_variable() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _ = candle_nn::linear(3, 4, vb.pp("a")).unwrap();
        let _ = candle_nn::linear_no_bias(4, 2, vb.pp("b")).unwrap();
        assert_eq!(count_parameters(&varmap), 3 * 4 + 4 + 4 * 2);
    }
}
