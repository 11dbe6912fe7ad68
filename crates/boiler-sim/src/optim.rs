//! Optimizers, gradient clipping and the learning-rate schedule.
//!
//! Provides Adam (the default) and SGD with momentum, both operating on a
//! whole [`ModelParameters`] set at once.

use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::cell::ModelParameters;

/// Optimizer trait for parameter updates.
pub trait Optimizer: Send + Sync {
    /// Apply one update of `params` using `grads`.
    fn step(&mut self, params: &mut ModelParameters, grads: &ModelParameters);

    /// Set learning rate.
    fn set_learning_rate(&mut self, lr: f32);
}

/// Which optimizer the trainer builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// [`Adam`] with β1 0.9, β2 0.999, ε 1e-8.
    #[default]
    Adam,
    /// [`Sgd`] with momentum 0.9.
    Sgd,
}

impl OptimizerKind {
    /// Build the optimizer with initial learning rate `lr`.
    pub fn build(self, lr: f32) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::Adam => Box::new(Adam::new(lr)),
            OptimizerKind::Sgd => Box::new(Sgd::new(lr).with_momentum(0.9)),
        }
    }
}

// ---------------------------------------------------------------------------
// SGD
// ---------------------------------------------------------------------------

/// Stochastic gradient descent with momentum.
pub struct Sgd {
    lr: f32,
    momentum: f32,
    velocity: Option<ModelParameters>,
}

impl Sgd {
    /// Plain SGD.
    pub fn new(lr: f32) -> Self {
        Self { lr, momentum: 0.0, velocity: None }
    }

    /// Set the momentum coefficient.
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut ModelParameters, grads: &ModelParameters) {
        let (lr, mu) = (self.lr, self.momentum);
        let velocity = self.velocity.get_or_insert_with(|| grads.zeros_like());
        for ((mut p, g), mut v) in params
            .views_mut()
            .into_iter()
            .zip(grads.views())
            .zip(velocity.views_mut())
        {
            Zip::from(&mut p).and(&g).and(&mut v).for_each(|p, &g, v| {
                *v = mu * *v + g;
                *p -= lr * *v;
            });
        }
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}

// ---------------------------------------------------------------------------
// Adam
// ---------------------------------------------------------------------------

/// Adam optimizer with bias correction.
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    m: Option<ModelParameters>,
    v: Option<ModelParameters>,
    t: i32,
}

impl Adam {
    /// Adam with the usual defaults.
    pub fn new(lr: f32) -> Self {
        Self { lr, beta1: 0.9, beta2: 0.999, epsilon: 1e-8, m: None, v: None, t: 0 }
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut ModelParameters, grads: &ModelParameters) {
        self.t += 1;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);
        let bc1 = 1.0 - b1.powi(self.t);
        let bc2 = 1.0 - b2.powi(self.t);
        let lr = self.lr;

        let m = self.m.get_or_insert_with(|| grads.zeros_like());
        let v = self.v.get_or_insert_with(|| grads.zeros_like());
        for (((mut p, g), mut m), mut v) in params
            .views_mut()
            .into_iter()
            .zip(grads.views())
            .zip(m.views_mut())
            .zip(v.views_mut())
        {
            Zip::from(&mut p)
                .and(&g)
                .and(&mut m)
                .and(&mut v)
                .for_each(|p, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    let m_hat = *m / bc1;
                    let v_hat = *v / bc2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}

// ---------------------------------------------------------------------------
// Clipping / schedule
// ---------------------------------------------------------------------------

/// Scale `grads` so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping. A non-finite norm is left as is.
pub fn clip_by_global_norm(grads: &mut ModelParameters, max_norm: f32) -> f32 {
    let norm = grads.global_norm();
    if norm.is_finite() && norm > max_norm && norm > 0.0 {
        grads.scale(max_norm / norm);
    }
    norm
}

/// Learning rate `initial · decay^epoch`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialDecay {
    /// Rate at epoch 0.
    pub initial: f32,
    /// Multiplicative factor per epoch.
    pub decay: f32,
}

impl ExponentialDecay {
    /// Learning rate for `epoch` (zero-based).
    pub fn rate(&self, epoch: usize) -> f32 {
        self.initial * self.decay.powi(epoch as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellConfig, ModelParameters};
    use crate::partition::PartitionLayout;
    use approx::assert_abs_diff_eq;

    fn small() -> ModelParameters {
        let cfg = CellConfig {
            input_size: 7,
            layout: PartitionLayout {
                external: 1,
                coaler_state: 1,
                burner_state: 1,
                steamer_state: 1,
                coaler_action: 1,
                burner_action: 1,
                steamer_action: 1,
            },
            num_units: vec![2, 2, 2],
            ..CellConfig::default()
        };
        ModelParameters::zeros(&cfg)
    }

    #[test]
    fn clipping_caps_norm() {
        let mut g = small();
        g.coaler.kernel.fill(1.0);
        let before = clip_by_global_norm(&mut g, 1.0);
        assert!(before > 1.0);
        assert_abs_diff_eq!(g.global_norm(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn clipping_leaves_small_gradients() {
        let mut g = small();
        g.burner.bias[0] = 0.5;
        clip_by_global_norm(&mut g, 5.0);
        assert_eq!(g.burner.bias[0], 0.5);
    }

    #[test]
    fn adam_first_step_moves_by_lr() {
        let mut p = small();
        let mut g = p.zeros_like();
        g.steamer.kernel[[0, 0]] = 3.0;
        g.steamer.kernel[[0, 1]] = -0.01;
        let mut opt = Adam::new(0.1);
        opt.step(&mut p, &g);
        assert_abs_diff_eq!(p.steamer.kernel[[0, 0]], -0.1, epsilon = 1e-5);
        assert_abs_diff_eq!(p.steamer.kernel[[0, 1]], 0.1, epsilon = 1e-3);
        assert_eq!(p.coaler.kernel[[0, 0]], 0.0);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn sgd_descends() {
        let mut p = small();
        let mut g = p.zeros_like();
        g.coaler.head_bias[0] = 2.0;
        let mut opt = Sgd::new(0.5);
        opt.step(&mut p, &g);
        assert_abs_diff_eq!(p.coaler.head_bias[0], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn decay_schedule() {
        let s = ExponentialDecay { initial: 1e-3, decay: 0.95 };
        assert_abs_diff_eq!(s.rate(0), 1e-3, epsilon = 1e-9);
        assert_abs_diff_eq!(s.rate(2), 1e-3 * 0.9025, epsilon = 1e-9);
    }
}
