//! Optimizer(s) and learning rate schedulers

use crate::values::Value;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
    fn lr(&self) -> f32;
    fn set_lr(&mut self, lr: f32);
}

/// SGD with momentum and L2 weight decay
pub struct SGD {
    params: Vec<Value>,
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    // velocity per parameter
    velocity: Vec<f32>,
}

impl SGD {
    pub fn new(params: Vec<Value>, lr: f32, momentum: f32) -> Self {
        let velocity = vec![0.0; params.len()];
        Self {
            params,
            lr,
            momentum,
            weight_decay: 0.0,
            velocity,
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    #[cfg(test)]
    fn velocities(&self) -> &[f32] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        for (idx, param) in self.params.iter_mut().enumerate() {
            let grad = param.grad() + self.weight_decay * param.data();
            let velocity = self.momentum * self.velocity[idx] - self.lr * grad;
            let new_val = param.data() + velocity;
            self.velocity[idx] = velocity;
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Adam with bias correction and L2 weight decay added to the gradient
/// <https://pytorch.org/docs/stable/generated/torch.optim.Adam.html>
pub struct Adam {
    params: Vec<Value>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    // first and second moment estimates per parameter
    m: Vec<f32>,
    v: Vec<f32>,
    t: i32,
}

impl Adam {
    pub fn new(params: Vec<Value>, lr: f32) -> Self {
        let n = params.len();
        Self {
            params,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            m: vec![0.0; n],
            v: vec![0.0; n],
            t: 0,
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optim for Adam {
    fn step(&mut self) {
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t);
        let bias2 = 1.0 - self.beta2.powi(self.t);
        for (idx, param) in self.params.iter_mut().enumerate() {
            let grad = param.grad() + self.weight_decay * param.data();
            self.m[idx] = self.beta1 * self.m[idx] + (1.0 - self.beta1) * grad;
            self.v[idx] = self.beta2 * self.v[idx] + (1.0 - self.beta2) * grad * grad;
            let m_hat = self.m[idx] / bias1;
            let v_hat = self.v[idx] / bias2;
            let new_val = param.data() - self.lr * m_hat / (v_hat.sqrt() + self.eps);
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Adjusts an optimizer's learning rate once per epoch
pub trait LrScheduler {
    /// `metric` is the validation loss of the epoch that just finished
    fn step(&mut self, optim: &mut dyn Optim, metric: f32);
}

/// Reduces the learning rate by `factor` once the metric has not improved by a relative
/// `threshold` for more than `patience` epochs
pub struct ReduceLROnPlateau {
    factor: f32,
    patience: usize,
    threshold: f32,
    min_lr: f32,
    verbose: bool,
    best: f32,
    num_bad_epochs: usize,
}

impl ReduceLROnPlateau {
    pub fn new(factor: f32, patience: usize, threshold: f32, min_lr: f32, verbose: bool) -> Self {
        Self {
            factor,
            patience,
            threshold,
            min_lr,
            verbose,
            best: f32::INFINITY,
            num_bad_epochs: 0,
        }
    }
}

impl LrScheduler for ReduceLROnPlateau {
    fn step(&mut self, optim: &mut dyn Optim, metric: f32) {
        if metric < self.best * (1.0 - self.threshold) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.num_bad_epochs > self.patience {
            let old_lr = optim.lr();
            let new_lr = (old_lr * self.factor).max(self.min_lr);
            if old_lr - new_lr > f32::EPSILON * old_lr {
                optim.set_lr(new_lr);
                if self.verbose {
                    log::info!("Reducing learning rate from {:e} to {:e}", old_lr, new_lr);
                }
            }
            self.num_bad_epochs = 0;
        }
    }
}

/// Multiplies the learning rate by `gamma` after every epoch
pub struct ExponentialLR {
    gamma: f32,
    verbose: bool,
}

impl ExponentialLR {
    pub fn new(gamma: f32, verbose: bool) -> Self {
        Self { gamma, verbose }
    }
}

impl LrScheduler for ExponentialLR {
    fn step(&mut self, optim: &mut dyn Optim, _metric: f32) {
        let new_lr = optim.lr() * self.gamma;
        optim.set_lr(new_lr);
        if self.verbose {
            log::info!("Adjusting learning rate to {:e}", new_lr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_eq_float;

    #[test]
    fn test_sgd_no_momentum() {
        let a = Value::new(1.0);
        let b = Value::new(2.0);
        let c = &a + &b;
        c.backward();

        let mut optim = SGD::new(vec![a.clone(), b.clone(), c.clone()], 0.1, 0.0);
        optim.step();
        assert_eq!(a.grad(), 1.0);
        assert_eq!(b.grad(), 1.0);
        assert_eq!(c.grad(), 1.0);
        assert_eq!(a.data(), 0.9);
        assert_eq!(b.data(), 1.9);
        assert_eq!(c.data(), 2.9);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let a = Value::new(1.0);
        let b = Value::new(2.0);
        let c = &a + &b;
        c.backward();

        let mut optim = SGD::new(vec![a.clone(), b.clone(), c.clone()], 0.1, 0.9);
        optim.step();
        assert_eq!(a.data(), 0.9);
        assert_eq!(b.data(), 1.9);
        assert_eq!(c.data(), 2.9);
        assert_eq!(optim.velocities(), &[-0.1, -0.1, -0.1]);
        optim.step();
        assert_eq_float!(a.data(), 0.71);
        assert_eq_float!(b.data(), 1.71);
        assert_eq_float!(c.data(), 2.71);
        assert_eq_float!(optim.velocities()[0], -0.19);
    }

    #[test]
    fn test_sgd_weight_decay() {
        let a = Value::new(2.0);
        // no gradient, only the decay term pulls the weight towards zero
        let mut optim = SGD::new(vec![a.clone()], 0.1, 0.0).with_weight_decay(0.5);
        optim.step();
        assert_eq_float!(a.data(), 2.0 - 0.1 * 0.5 * 2.0);
    }

    #[test]
    fn test_adam_first_step_is_lr_sized() {
        let a = Value::new(1.0);
        let b = Value::new(3.0);
        let c = &a * &b;
        c.backward();

        // bias correction makes the first update lr * sign(grad)
        let mut optim = Adam::new(vec![a.clone(), b.clone()], 0.01);
        optim.step();
        assert_eq_float!(a.data(), 1.0 - 0.01);
        assert_eq_float!(b.data(), 3.0 - 0.01);
        optim.zero_grad();
        assert_eq!(a.grad(), 0.0);
    }

    #[test]
    fn test_adam_minimizes_quadratic() {
        let mut x = Value::new(5.0);
        let mut optim = Adam::new(vec![x.clone()], 0.1);
        for _ in 0..1000 {
            let loss = &x * &x;
            loss.backward();
            optim.step();
            x.zero_grad();
        }
        assert!(x.data().abs() < 0.1, "x = {}", x.data());
    }

    #[test]
    fn test_reduce_on_plateau() {
        let mut optim = SGD::new(vec![], 1.0, 0.0);
        let mut scheduler = ReduceLROnPlateau::new(0.5, 1, 0.01, 0.2, false);
        scheduler.step(&mut optim, 1.0);
        assert_eq!(optim.lr(), 1.0);
        // improvement smaller than the relative threshold counts as a bad epoch
        scheduler.step(&mut optim, 0.995);
        assert_eq!(optim.lr(), 1.0);
        scheduler.step(&mut optim, 0.999);
        assert_eq!(optim.lr(), 0.5);
        scheduler.step(&mut optim, 2.0);
        scheduler.step(&mut optim, 2.0);
        assert_eq!(optim.lr(), 0.25);
        scheduler.step(&mut optim, 2.0);
        scheduler.step(&mut optim, 2.0);
        // clamped at min_lr
        assert_eq!(optim.lr(), 0.2);
    }

    #[test]
    fn test_exponential_lr() {
        let mut optim = Adam::new(vec![], 0.1);
        let mut scheduler = ExponentialLR::new(0.5, false);
        scheduler.step(&mut optim, 0.0);
        scheduler.step(&mut optim, 0.0);
        assert_eq_float!(optim.lr(), 0.025);
    }
}
