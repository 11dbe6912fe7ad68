//! Loss functions for simulator training.
//!
//! The training objective is
//!
//! ```text
//! L_total = MSE(prediction, target) + λ_l2 · Σ ½·w²
//! ```
//!
//! where the penalty runs over every non-bias weight: the three stage kernels
//! and the three output projections.

use ndarray::{ArrayD, ArrayViewD, Zip};

use crate::cell::ModelParameters;
use crate::partition::Stage;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Scalar components of one loss evaluation, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LossComponents {
    /// `mse + l2_weight * l2`.
    pub total: f32,
    /// Mean squared error over every target element.
    pub mse: f32,
    /// Unweighted `Σ ½·w²`.
    pub l2: f32,
}

impl LossComponents {
    /// Combine a reconstruction error with the weighted penalty.
    pub fn new(mse: f32, l2: f32, l2_weight: f32) -> Self {
        LossComponents { total: mse + l2_weight * l2, mse, l2 }
    }
}

// ---------------------------------------------------------------------------
// MSE
// ---------------------------------------------------------------------------

/// Mean squared error over all elements. Returns 0 for empty inputs.
pub fn mse(pred: ArrayViewD<'_, f32>, target: ArrayViewD<'_, f32>) -> f32 {
    let n = pred.len();
    if n == 0 {
        return 0.0;
    }
    let sum = Zip::from(&pred)
        .and(&target)
        .fold(0.0f32, |acc, &p, &t| acc + (p - t) * (p - t));
    sum / n as f32
}

/// Gradient of [`mse`] with respect to `pred`: `2 (pred - target) / n`.
pub fn mse_grad(pred: ArrayViewD<'_, f32>, target: ArrayViewD<'_, f32>) -> ArrayD<f32> {
    let scale = 2.0 / pred.len().max(1) as f32;
    Zip::from(&pred).and(&target).map_collect(|&p, &t| scale * (p - t))
}

/// Mean absolute error over all elements. Returns 0 for empty inputs.
pub fn mae(pred: ArrayViewD<'_, f32>, target: ArrayViewD<'_, f32>) -> f32 {
    let n = pred.len();
    if n == 0 {
        return 0.0;
    }
    let sum = Zip::from(&pred)
        .and(&target)
        .fold(0.0f32, |acc, &p, &t| acc + (p - t).abs());
    sum / n as f32
}

// ---------------------------------------------------------------------------
// L2 penalty
// ---------------------------------------------------------------------------

/// `Σ ½·w²` over stage kernels and projection weights (biases excluded).
pub fn l2_penalty(params: &ModelParameters) -> f32 {
    Stage::ALL
        .iter()
        .map(|&s| {
            let p = params.stage(s);
            0.5 * (p.kernel.iter().map(|w| w * w).sum::<f32>()
                + p.head_weight.iter().map(|w| w * w).sum::<f32>())
        })
        .sum()
}

/// Add `l2_weight · w` to the gradient of every penalised weight.
pub fn add_l2_gradient(params: &ModelParameters, grads: &mut ModelParameters, l2_weight: f32) {
    if l2_weight == 0.0 {
        return;
    }
    for s in Stage::ALL {
        let p = params.stage(s);
        let g = grads.stage_mut(s);
        g.kernel.scaled_add(l2_weight, &p.kernel);
        g.head_weight.scaled_add(l2_weight, &p.head_weight);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellConfig;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn mse_of_identical_is_zero() {
        let a = array![[0.1f32, 0.2], [0.3, 0.4]].into_dyn();
        assert_eq!(mse(a.view(), a.view()), 0.0);
    }

    #[test]
    fn mse_and_grad_values() {
        let p = array![1.0f32, 3.0].into_dyn();
        let t = array![0.0f32, 1.0].into_dyn();
        assert_abs_diff_eq!(mse(p.view(), t.view()), 2.5, epsilon = 1e-6);
        let g = mse_grad(p.view(), t.view());
        assert_abs_diff_eq!(g[[0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(g[[1]], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(mae(p.view(), t.view()), 1.5, epsilon = 1e-6);
    }

    #[test]
    fn l2_ignores_biases() {
        let cfg = CellConfig::default();
        let mut params = ModelParameters::zeros(&cfg);
        params.coaler.bias.fill(3.0);
        params.burner.head_bias.fill(3.0);
        assert_eq!(l2_penalty(&params), 0.0);
        params.steamer.kernel[[0, 0]] = 2.0;
        params.coaler.head_weight[[1, 1]] = -1.0;
        assert_abs_diff_eq!(l2_penalty(&params), 2.5, epsilon = 1e-6);
    }

    #[test]
    fn l2_gradient_matches_weights() {
        let cfg = CellConfig::default();
        let mut params = ModelParameters::zeros(&cfg);
        params.burner.kernel[[2, 5]] = 0.5;
        params.burner.bias[0] = 7.0;
        let mut grads = params.zeros_like();
        add_l2_gradient(&params, &mut grads, 0.1);
        assert_abs_diff_eq!(grads.burner.kernel[[2, 5]], 0.05, epsilon = 1e-7);
        assert_eq!(grads.burner.bias[0], 0.0);
    }
}
