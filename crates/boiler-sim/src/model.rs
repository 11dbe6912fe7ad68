//! Sequence model around the coupled cell.
//!
//! # Architecture
//!
//! ```text
//! window [B, H, 202]
//!       │  for t in 0..H
//!       ▼
//! ┌──────────────────────────────┐
//! │  coaler → burner → steamer   │  cell::step, state carried across t
//! └──────────────────────────────┘
//!       │  h_coaler, h_burner, h_steamer
//!       ▼
//! ┌───────────┐ ┌───────────┐ ┌────────────┐
//! │ W_c h + b │ │ W_b h + b │ │ W_s h + b  │  per-stage projection
//! └───────────┘ └───────────┘ └────────────┘
//!       └──────── concat ─────────┘
//!                  │ sigmoid
//!                  ▼
//!          next state [B, 147]
//! ```
//!
//! With [`TargetPolicy::SingleStep`] only the last time step is projected;
//! with [`TargetPolicy::ShiftedSequence`] every step is.
//!
//! Gradients are computed by hand: the head, then backpropagation through
//! time over the recorded cell traces.

use ndarray::{s, Array1, Array2, Array3, ArrayD, ArrayView2, ArrayView3, Axis, Ix2};
use rand::Rng;

use crate::cell::{
    backward_step, check_step_shapes, initialize, sigmoid, step_traced, CellConfig, CellOutput,
    CellState, ModelParameters, StepMasks, StepTrace,
};
use crate::checkpoint::Checkpoint;
use crate::dataset::{TargetPolicy, Targets};
use crate::error::{ModelError, TrainResult};
use crate::losses::{add_l2_gradient, l2_penalty, mse, mse_grad, LossComponents};
use crate::partition::Stage;

/// The boiler simulator: cell configuration plus its parameters.
#[derive(Debug, Clone)]
pub struct SimulatorModel {
    cfg: CellConfig,
    params: ModelParameters,
}

impl SimulatorModel {
    /// Validate `cfg` and initialise fresh parameters.
    pub fn new<R: Rng + ?Sized>(cfg: CellConfig, rng: &mut R) -> TrainResult<Self> {
        let params = initialize(&cfg, rng)?;
        Ok(SimulatorModel { cfg, params })
    }

    /// Wrap existing parameters after checking them against `cfg`.
    pub fn from_parameters(cfg: CellConfig, params: ModelParameters) -> TrainResult<Self> {
        cfg.validate()?;
        params.check_shapes(&cfg)?;
        Ok(SimulatorModel { cfg, params })
    }

    /// Restore the model stored in a checkpoint.
    pub fn from_checkpoint(ckpt: &Checkpoint) -> TrainResult<Self> {
        SimulatorModel::from_parameters(ckpt.cell.clone(), ckpt.params.clone())
    }

    /// Cell configuration.
    pub fn config(&self) -> &CellConfig {
        &self.cfg
    }

    /// Current parameters.
    pub fn parameters(&self) -> &ModelParameters {
        &self.params
    }

    /// Mutable parameters, for the optimizer.
    pub fn parameters_mut(&mut self) -> &mut ModelParameters {
        &mut self.params
    }

    /// Width of the predicted state vector.
    pub fn state_width(&self) -> usize {
        self.cfg.layout.state_width()
    }

    fn check_inputs(&self, inputs: &ArrayView3<'_, f32>) -> Result<(), ModelError> {
        let (b, h, w) = inputs.dim();
        if h == 0 || w != self.cfg.input_size {
            return Err(ModelError::shape_mismatch(
                "inputs",
                vec![b, h.max(1), self.cfg.input_size],
                vec![b, h, w],
            ));
        }
        check_step_shapes(&self.cfg, inputs.index_axis(Axis(1), 0), &CellState::zeros(&self.cfg, b))
    }

    fn check_targets(&self, inputs: &ArrayView3<'_, f32>, targets: &Targets) -> Result<(), ModelError> {
        let (b, h, _) = inputs.dim();
        let sw = self.state_width();
        let expected = match targets.policy() {
            TargetPolicy::SingleStep => vec![b, sw],
            TargetPolicy::ShiftedSequence => vec![b, h, sw],
        };
        let actual = targets.view_dyn().shape().to_vec();
        if actual != expected {
            return Err(ModelError::shape_mismatch("targets", expected, actual));
        }
        Ok(())
    }

    /// Sigmoid of the concatenated per-stage projections, `[B, state_width]`.
    fn project(&self, out: &CellOutput) -> Array2<f32> {
        let b = out.stage(Stage::Coaler).nrows();
        let mut z = Array2::<f32>::zeros((b, self.state_width()));
        for stage in Stage::ALL {
            let p = self.params.stage(stage);
            let range = self.cfg.layout.stage_state_range(stage);
            let proj = out.stage(stage).dot(&p.head_weight) + &p.head_bias;
            z.slice_mut(s![.., range]).assign(&proj);
        }
        z.mapv_inplace(sigmoid);
        z
    }

    fn head_steps(policy: TargetPolicy, history: usize) -> Vec<usize> {
        match policy {
            TargetPolicy::SingleStep => vec![history - 1],
            TargetPolicy::ShiftedSequence => (0..history).collect(),
        }
    }

    fn assemble(policy: TargetPolicy, preds: &[Array2<f32>]) -> Targets {
        match policy {
            TargetPolicy::SingleStep => {
                Targets::SingleStep(preds.last().cloned().unwrap_or_else(|| Array2::zeros((0, 0))))
            }
            TargetPolicy::ShiftedSequence => {
                let (b, w) = preds.first().map_or((0, 0), |p| p.dim());
                let mut y = Array3::zeros((b, preds.len(), w));
                for (t, p) in preds.iter().enumerate() {
                    y.slice_mut(s![.., t, ..]).assign(p);
                }
                Targets::ShiftedSequence(y)
            }
        }
    }

    /// Unroll over `inputs` (`[B, H, input_size]`) without dropout.
    pub fn forward(
        &self,
        inputs: ArrayView3<'_, f32>,
        policy: TargetPolicy,
    ) -> Result<Targets, ModelError> {
        let zeros = CellState::zeros(&self.cfg, inputs.dim().0);
        self.forward_from(inputs, policy, &zeros)
    }

    /// Like [`Self::forward`], starting from `initial` instead of a fresh
    /// zero state.
    pub fn forward_from(
        &self,
        inputs: ArrayView3<'_, f32>,
        policy: TargetPolicy,
        initial: &CellState,
    ) -> Result<Targets, ModelError> {
        self.check_inputs(&inputs)?;
        let (_, h, _) = inputs.dim();
        check_step_shapes(&self.cfg, inputs.index_axis(Axis(1), 0), initial)?;
        let steps = Self::head_steps(policy, h);
        let mut state = initial.clone();
        let mut preds = Vec::with_capacity(steps.len());
        for t in 0..h {
            let (out, next, _) = step_traced(&self.cfg, &self.params, inputs.index_axis(Axis(1), t), &state, None);
            if steps.contains(&t) {
                preds.push(self.project(&out));
            }
            state = next;
        }
        Ok(Self::assemble(policy, &preds))
    }

    /// Predict the state row that follows one history window `[H, input_size]`.
    pub fn predict(&self, window: ArrayView2<'_, f32>) -> Result<Array1<f32>, ModelError> {
        let batch = window.insert_axis(Axis(0));
        match self.forward(batch, TargetPolicy::SingleStep)? {
            Targets::SingleStep(y) => Ok(y.index_axis(Axis(0), 0).to_owned()),
            Targets::ShiftedSequence(y) => Err(ModelError::shape_mismatch(
                "prediction",
                vec![1, self.state_width()],
                y.shape().to_vec(),
            )),
        }
    }

    /// Deterministic MSE of the predictions for `inputs` against `targets`.
    pub fn loss(&self, inputs: ArrayView3<'_, f32>, targets: &Targets) -> Result<f32, ModelError> {
        self.check_targets(&inputs, targets)?;
        let pred = self.forward(inputs, targets.policy())?;
        Ok(mse(pred.view_dyn(), targets.view_dyn()))
    }

    /// Loss and parameter gradients for one batch.
    ///
    /// Dropout masks are drawn from `rng` once per time step when
    /// `keep_prob < 1`. The returned gradients include the L2 term.
    pub fn loss_and_gradients<R: Rng + ?Sized>(
        &self,
        inputs: ArrayView3<'_, f32>,
        targets: &Targets,
        keep_prob: f32,
        l2_weight: f32,
        rng: &mut R,
    ) -> Result<(LossComponents, ModelParameters), ModelError> {
        self.check_inputs(&inputs)?;
        self.check_targets(&inputs, targets)?;
        let cfg = &self.cfg;
        let (b, h, _) = inputs.dim();
        let policy = targets.policy();

        let mut state = CellState::zeros(cfg, b);
        let mut outputs: Vec<CellOutput> = Vec::with_capacity(h);
        let mut traces: Vec<StepTrace> = Vec::with_capacity(h);
        for t in 0..h {
            let masks = StepMasks::sample(cfg, b, keep_prob, rng);
            let (out, next, trace) =
                step_traced(cfg, &self.params, inputs.index_axis(Axis(1), t), &state, masks.as_ref());
            outputs.push(out);
            traces.push(trace);
            state = next;
        }

        let steps = Self::head_steps(policy, h);
        let preds: Vec<Array2<f32>> = steps.iter().map(|&t| self.project(&outputs[t])).collect();
        let prediction = Self::assemble(policy, &preds);
        let mse_loss = mse(prediction.view_dyn(), targets.view_dyn());
        let dpred = mse_grad(prediction.view_dyn(), targets.view_dyn());

        let mut grads = self.params.zeros_like();
        let mut d = CellState::zeros(cfg, b);
        for t in (0..h).rev() {
            if let Some(k) = steps.iter().position(|&s| s == t) {
                let dp = pred_grad_at(&dpred, policy, k)?;
                let p = &preds[k];
                let dz = dp * &p.mapv(|y| y * (1.0 - y));
                for stage in Stage::ALL {
                    let dz_s = dz.slice(s![.., cfg.layout.stage_state_range(stage)]);
                    let hs = outputs[t].stage(stage);
                    let w = &self.params.stage(stage).head_weight;
                    let g = grads.stage_mut(stage);
                    g.head_weight += &hs.t().dot(&dz_s);
                    g.head_bias += &dz_s.sum_axis(Axis(0));
                    d.stage_mut(stage).hidden += &dz_s.dot(&w.t());
                }
            }
            d = backward_step(cfg, &self.params, &traces[t], d, &mut grads);
        }

        add_l2_gradient(&self.params, &mut grads, l2_weight);
        let l2 = l2_penalty(&self.params);
        Ok((LossComponents::new(mse_loss, l2, l2_weight), grads))
    }
}

/// Slice of the prediction gradient belonging to head output `k`.
fn pred_grad_at(dpred: &ArrayD<f32>, policy: TargetPolicy, k: usize) -> Result<Array2<f32>, ModelError> {
    let view = match policy {
        TargetPolicy::SingleStep => dpred.view(),
        TargetPolicy::ShiftedSequence => dpred.index_axis(Axis(1), k),
    };
    let shape = view.shape().to_vec();
    view.into_dimensionality::<Ix2>()
        .map(|v| v.to_owned())
        .map_err(|_| ModelError::shape_mismatch("prediction gradient", vec![shape.first().copied().unwrap_or(0), 0], shape))
}
