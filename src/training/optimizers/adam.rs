//! Adam with coupled (L2) weight decay
//!
//! The penalty `weight_decay * theta` is added to the gradient before the
//! moment estimates are updated, so it is rescaled by the adaptive step like
//! any other gradient term. `candle_nn::AdamW` decouples the two instead.

use candle_core::backprop::GradStore;
use candle_core::{Result, Var};
use candle_nn::Optimizer;

/// Hyperparameters of [`Adam`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

struct VarAdam {
    var: Var,
    /// First moment estimate
    first_moment: Var,
    /// Second moment estimate
    second_moment: Var,
}

pub struct Adam {
    vars: Vec<VarAdam>,
    step_t: usize,
    params: ParamsAdam,
}

impl Adam {
    pub fn params(&self) -> &ParamsAdam {
        &self.params
    }

    /// Updates applied so far
    pub fn step_count(&self) -> usize {
        self.step_t
    }

    /// Parameters tracked by this optimizer
    pub fn parameter_count(&self) -> usize {
        self.vars.len()
    }
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(VarAdam { var, first_moment, second_moment })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { vars, step_t: 0, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let ParamsAdam { lr, beta1, beta2, eps, weight_decay } = self.params;
        let scale_m = 1.0 / (1.0 - beta1.powi(self.step_t as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(self.step_t as i32));

        for state in &self.vars {
            let theta = &state.var;
            // variables without a gradient (e.g. running statistics) are left alone
            let Some(grad) = grads.get(theta) else {
                continue;
            };
            let grad = if weight_decay > 0.0 {
                (grad + (theta.as_tensor() * weight_decay)?)?
            } else {
                grad.clone()
            };

            let m = state.first_moment.as_tensor();
            let v = state.second_moment.as_tensor();
            let next_m = ((m * beta1)? + (&grad * (1.0 - beta1))?)?;
            let next_v = ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let next_theta = (theta.as_tensor() - (update * lr)?)?;

            state.first_moment.set(&next_m)?;
            state.second_moment.set(&next_v)?;
            theta.set(&next_theta)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let w = Var::new(&[1f32, -2.0], &Device::Cpu).unwrap();
        let mut opt = Adam::new(vec![w.clone()], ParamsAdam { lr: 0.1, ..Default::default() }).unwrap();
        let loss = (w.as_tensor() * 3.0).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();
        // bias-corrected first step is lr * sign(grad)
        let values = w.to_vec1::<f32>().unwrap();
        assert_relative_eq!(values[0], 0.9, epsilon = 1e-5);
        assert_relative_eq!(values[1], -2.1, epsilon = 1e-5);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_minimises_a_quadratic() {
        let w = Var::new(&[5f32], &Device::Cpu).unwrap();
        let mut opt = Adam::new(vec![w.clone()], ParamsAdam { lr: 0.1, ..Default::default() }).unwrap();
        for _ in 0..300 {
            let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
            opt.backward_step(&loss).unwrap();
        }
        assert!(w.to_vec1::<f32>().unwrap()[0].abs() < 0.1);
    }

    #[test]
    fn test_weight_decay_pulls_towards_zero_without_loss_gradient() {
        let w = Var::new(&[2f32], &Device::Cpu).unwrap();
        let other = Var::new(&[1f32], &Device::Cpu).unwrap();
        let params = ParamsAdam { lr: 0.01, weight_decay: 0.5, ..Default::default() };
        let mut opt = Adam::new(vec![w.clone()], params).unwrap();
        // w takes part in the graph with a zero coefficient so it has a (zero) gradient
        let loss = ((w.as_tensor() * 0.0).unwrap() + other.as_tensor()).unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();
        assert!(w.to_vec1::<f32>().unwrap()[0] < 2.0);
    }

    #[test]
    fn test_skips_variables_without_gradients() {
        let used = Var::new(&[1f32], &Device::Cpu).unwrap();
        let unused = Var::new(&[7f32], &Device::Cpu).unwrap();
        let mut opt = Adam::new(vec![used.clone(), unused.clone()], ParamsAdam::default()).unwrap();
        let loss = used.as_tensor().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();
        assert_eq!(unused.to_vec1::<f32>().unwrap(), vec![7.0]);
        assert_eq!(opt.parameter_count(), 2);
    }
}
