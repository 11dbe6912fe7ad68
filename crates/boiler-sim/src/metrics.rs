//! Evaluation metrics for simulator validation.
//!
//! This module provides:
//!
//! - **MSE** over every predicted state element (the validation loss used by
//!   the checkpoint policy).
//! - **MAE** over the same elements, in the data's normalised units.
//! - **Per-stage MSE** for the coaler, burner and steamer slices of the
//!   state vector, so a regression in one subsystem is visible even when the
//!   overall loss barely moves.
//!
//! Results are accumulated over mini-batches via [`MetricsAccumulator`] and
//! finalized into an [`EvalReport`] at the end of a validation pass.

use ndarray::{ArrayViewD, Axis, Slice, Zip};

use crate::dataset::Targets;
use crate::partition::{PartitionLayout, Stage};

// ---------------------------------------------------------------------------
// EvalReport
// ---------------------------------------------------------------------------

/// Aggregated metrics of one validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EvalReport {
    /// Mean squared error over all state elements.
    pub mse: f32,
    /// Mean absolute error over all state elements.
    pub mae: f32,
    /// MSE restricted to each stage's state slice, in [`Stage::ALL`] order.
    pub stage_mse: [f32; 3],
    /// Number of windows evaluated.
    pub num_windows: usize,
}

impl EvalReport {
    /// A human-readable summary line suitable for logging.
    pub fn summary(&self) -> String {
        format!(
            "mse={:.6}  mae={:.6}  coaler={:.6}  burner={:.6}  steamer={:.6}  (n={})",
            self.mse, self.mae, self.stage_mse[0], self.stage_mse[1], self.stage_mse[2], self.num_windows
        )
    }
}

// ---------------------------------------------------------------------------
// MetricsAccumulator
// ---------------------------------------------------------------------------

/// Running sums for an [`EvalReport`].
#[derive(Debug, Clone)]
pub struct MetricsAccumulator {
    layout: PartitionLayout,
    sq_sum: f64,
    abs_sum: f64,
    count: usize,
    stage_sq: [f64; 3],
    stage_count: [usize; 3],
    num_windows: usize,
}

impl MetricsAccumulator {
    /// Empty accumulator for state vectors laid out by `layout`.
    pub fn new(layout: &PartitionLayout) -> Self {
        MetricsAccumulator {
            layout: layout.clone(),
            sq_sum: 0.0,
            abs_sum: 0.0,
            count: 0,
            stage_sq: [0.0; 3],
            stage_count: [0; 3],
            num_windows: 0,
        }
    }

    /// Add one batch of predictions and their targets (same policy and shape).
    pub fn update(&mut self, pred: &Targets, target: &Targets) {
        let (p, t) = (pred.view_dyn(), target.view_dyn());
        let last = Axis(p.ndim() - 1);

        let (sq, abs) = sums(&p, &t);
        self.sq_sum += sq;
        self.abs_sum += abs;
        self.count += p.len();

        for stage in Stage::ALL {
            let r = self.layout.stage_state_range(stage);
            let ps = p.slice_axis(last, Slice::from(r.clone()));
            let ts = t.slice_axis(last, Slice::from(r));
            let k = stage.index();
            self.stage_sq[k] += sums(&ps, &ts).0;
            self.stage_count[k] += ps.len();
        }
        self.num_windows += pred.len();
    }

    /// Final metrics, or `None` if nothing was accumulated.
    pub fn finalize(&self) -> Option<EvalReport> {
        if self.count == 0 {
            return None;
        }
        let mean = |s: f64, n: usize| if n == 0 { 0.0 } else { (s / n as f64) as f32 };
        Some(EvalReport {
            mse: mean(self.sq_sum, self.count),
            mae: mean(self.abs_sum, self.count),
            stage_mse: [
                mean(self.stage_sq[0], self.stage_count[0]),
                mean(self.stage_sq[1], self.stage_count[1]),
                mean(self.stage_sq[2], self.stage_count[2]),
            ],
            num_windows: self.num_windows,
        })
    }
}

fn sums(p: &ArrayViewD<'_, f32>, t: &ArrayViewD<'_, f32>) -> (f64, f64) {
    Zip::from(p).and(t).fold((0.0f64, 0.0f64), |(sq, abs), &a, &b| {
        let d = (a - b) as f64;
        (sq + d * d, abs + d.abs())
    })
}
