//! The coupled three-stage recurrent cell.
//!
//! One call to [`step`] advances all three stages by one time step, strictly
//! in the order coaler → burner → steamer:
//!
//! ```text
//!  row ──dropout──┬─ external ⧺ coaler_state ⧺ coaler_action ─┐
//!                 │                              h_coaler(t-1) ┴─▶ coaler ──▶ h_coaler(t)
//!                 │                                                              │ dropout
//!                 ├─ burner_state ⧺ burner_action ─────────────┐                 ▼
//!                 │                              h_burner(t-1) ┴──────────────▶ burner ──▶ h_burner(t)
//!                 │                                                                          │ dropout
//!                 └─ steamer_state ⧺ steamer_action ───────────┐                             ▼
//!                                               h_steamer(t-1) ┴──────────────────────────▶ steamer ──▶ h_steamer(t)
//! ```
//!
//! Each stage is a gated update over the concatenation
//! `[stage_input, own_prev_hidden, upstream_new_hidden]` with gate order
//! `(i, j, f, o)`:
//!
//! ```text
//! new_c = c_prev · σ(f + forget_bias) + σ(i) · act(j)
//! new_h = act(new_c) · σ(o)
//! ```
//!
//! The downstream stages see the upstream hidden vector computed in the
//! *same* time step.
//!
//! Parameters are a plain value ([`ModelParameters`]) built once by
//! [`initialize`] and passed explicitly into [`step`]; nothing is looked up
//! by name or built lazily.

use ndarray::{s, Array1, Array2, ArrayView2, ArrayViewD, ArrayViewMutD, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ModelError, TrainResult};
use crate::init::{glorot_uniform, orthogonal};
use crate::partition::{PartitionLayout, Stage};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Non-linearity used for the candidate and the cell output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Hyperbolic tangent.
    #[default]
    Tanh,
    /// Rectified linear unit.
    Relu,
}

impl Activation {
    /// Apply elementwise.
    pub fn apply(self, x: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Tanh => x.mapv(f32::tanh),
            Activation::Relu => x.mapv(|v| v.max(0.0)),
        }
    }

    /// Derivative with respect to the input, given the input `pre` and the
    /// output `post = apply(pre)`.
    fn derivative(self, pre: &Array2<f32>, post: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Tanh => post.mapv(|y| 1.0 - y * y),
            Activation::Relu => pre.mapv(|x| if x > 0.0 { 1.0 } else { 0.0 }),
        }
    }
}

/// Shape and behaviour of the coupled cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellConfig {
    /// Width of a canonical row. Default: **202**.
    pub input_size: usize,
    /// Region sizes of a canonical row.
    pub layout: PartitionLayout,
    /// Hidden width of coaler, burner and steamer. Default: **[128, 128, 64]**.
    pub num_units: Vec<usize>,
    /// Added to the forget gate before its sigmoid. Default: **1.0**.
    pub forget_bias: f32,
    /// Candidate / output non-linearity. Default: **tanh**.
    pub activation: Activation,
}

impl Default for CellConfig {
    fn default() -> Self {
        CellConfig {
            input_size: 202,
            layout: PartitionLayout::default(),
            num_units: vec![128, 128, 64],
            forget_bias: 1.0,
            activation: Activation::Tanh,
        }
    }
}

impl CellConfig {
    /// Check the layout against `input_size` and the arity of `num_units`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::PartitionWidth`] or [`ConfigError::InvalidValue`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_size == 0 {
            return Err(ConfigError::invalid_value("cell.input_size", "must be > 0"));
        }
        self.layout.validate(self.input_size)?;
        if self.num_units.len() != Stage::ALL.len() {
            return Err(ConfigError::invalid_value(
                "cell.num_units",
                format!("expected 3 entries (coaler, burner, steamer), got {}", self.num_units.len()),
            ));
        }
        if self.num_units.iter().any(|&u| u == 0) {
            return Err(ConfigError::invalid_value("cell.num_units", "every entry must be > 0"));
        }
        if !self.forget_bias.is_finite() {
            return Err(ConfigError::invalid_value("cell.forget_bias", "must be finite"));
        }
        Ok(())
    }

    /// Hidden width of `stage`.
    pub fn units(&self, stage: Stage) -> usize {
        self.num_units.get(stage.index()).copied().unwrap_or(0)
    }

    /// Hidden width of the stage feeding `stage`, or 0 for the coaler.
    pub fn upstream_units(&self, stage: Stage) -> usize {
        stage.upstream().map_or(0, |up| self.units(up))
    }

    /// Row count of `stage`'s kernel: input group, own hidden, upstream hidden.
    pub fn kernel_rows(&self, stage: Stage) -> usize {
        self.layout.stage_input_width(stage) + self.units(stage) + self.upstream_units(stage)
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Weights owned by one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageParams {
    /// `[kernel_rows, 4 * units]`, gate blocks in `(i, j, f, o)` order.
    pub kernel: Array2<f32>,
    /// `[4 * units]`.
    pub bias: Array1<f32>,
    /// Output projection `[units, stage_state_width]`.
    pub head_weight: Array2<f32>,
    /// `[stage_state_width]`.
    pub head_bias: Array1<f32>,
}

impl StageParams {
    fn zeros(rows: usize, units: usize, state_width: usize) -> Self {
        StageParams {
            kernel: Array2::zeros((rows, 4 * units)),
            bias: Array1::zeros(4 * units),
            head_weight: Array2::zeros((units, state_width)),
            head_bias: Array1::zeros(state_width),
        }
    }

    fn views(&self) -> [ArrayViewD<'_, f32>; 4] {
        [
            self.kernel.view().into_dyn(),
            self.bias.view().into_dyn(),
            self.head_weight.view().into_dyn(),
            self.head_bias.view().into_dyn(),
        ]
    }

    fn views_mut(&mut self) -> [ArrayViewMutD<'_, f32>; 4] {
        [
            self.kernel.view_mut().into_dyn(),
            self.bias.view_mut().into_dyn(),
            self.head_weight.view_mut().into_dyn(),
            self.head_bias.view_mut().into_dyn(),
        ]
    }
}

/// All trainable parameters of the simulator, one [`StageParams`] per stage.
///
/// The same type doubles as the gradient accumulator and as optimizer slot
/// storage (see [`ModelParameters::zeros_like`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Coaler weights.
    pub coaler: StageParams,
    /// Burner weights.
    pub burner: StageParams,
    /// Steamer weights.
    pub steamer: StageParams,
}

impl ModelParameters {
    /// All-zero parameters shaped for `cfg`.
    pub fn zeros(cfg: &CellConfig) -> Self {
        let make = |stage| {
            StageParams::zeros(
                cfg.kernel_rows(stage),
                cfg.units(stage),
                cfg.layout.stage_state_width(stage),
            )
        };
        ModelParameters {
            coaler: make(Stage::Coaler),
            burner: make(Stage::Burner),
            steamer: make(Stage::Steamer),
        }
    }

    /// All-zero parameters with the same shapes as `self`.
    pub fn zeros_like(&self) -> Self {
        let z = |p: &StageParams| StageParams {
            kernel: Array2::zeros(p.kernel.raw_dim()),
            bias: Array1::zeros(p.bias.raw_dim()),
            head_weight: Array2::zeros(p.head_weight.raw_dim()),
            head_bias: Array1::zeros(p.head_bias.raw_dim()),
        };
        ModelParameters { coaler: z(&self.coaler), burner: z(&self.burner), steamer: z(&self.steamer) }
    }

    /// Weights of `stage`.
    pub fn stage(&self, stage: Stage) -> &StageParams {
        match stage {
            Stage::Coaler => &self.coaler,
            Stage::Burner => &self.burner,
            Stage::Steamer => &self.steamer,
        }
    }

    /// Mutable weights of `stage`.
    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageParams {
        match stage {
            Stage::Coaler => &mut self.coaler,
            Stage::Burner => &mut self.burner,
            Stage::Steamer => &mut self.steamer,
        }
    }

    /// Every parameter array, in a fixed order shared with [`Self::views_mut`].
    pub fn views(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut out = Vec::with_capacity(12);
        out.extend(self.coaler.views());
        out.extend(self.burner.views());
        out.extend(self.steamer.views());
        out
    }

    /// Every parameter array, mutably.
    pub fn views_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut out = Vec::with_capacity(12);
        out.extend(self.coaler.views_mut());
        out.extend(self.burner.views_mut());
        out.extend(self.steamer.views_mut());
        out
    }

    /// Total number of scalars.
    pub fn num_parameters(&self) -> usize {
        self.views().iter().map(|v| v.len()).sum()
    }

    /// L2 norm over every scalar.
    pub fn global_norm(&self) -> f32 {
        self.views()
            .iter()
            .flat_map(|v| v.iter())
            .map(|&x| x * x)
            .sum::<f32>()
            .sqrt()
    }

    /// Multiply every scalar by `factor`.
    pub fn scale(&mut self, factor: f32) {
        for mut v in self.views_mut() {
            v.mapv_inplace(|x| x * factor);
        }
    }

    /// Check every array against the shapes `cfg` implies.
    pub fn check_shapes(&self, cfg: &CellConfig) -> Result<(), ModelError> {
        let expected = ModelParameters::zeros(cfg);
        let names = ["kernel", "bias", "head_weight", "head_bias"];
        for (k, (have, want)) in self.views().iter().zip(expected.views().iter()).enumerate() {
            if have.shape() != want.shape() {
                return Err(ModelError::shape_mismatch(
                    names[k % 4],
                    want.shape().to_vec(),
                    have.shape().to_vec(),
                ));
            }
        }
        Ok(())
    }
}

/// Build freshly initialised parameters for `cfg`.
///
/// Kernels are orthogonal, the output projection is Glorot-uniform and all
/// biases start at zero.
pub fn initialize<R: Rng + ?Sized>(cfg: &CellConfig, rng: &mut R) -> TrainResult<ModelParameters> {
    cfg.validate()?;
    let mut params = ModelParameters::zeros(cfg);
    for stage in Stage::ALL {
        let units = cfg.units(stage);
        let p = params.stage_mut(stage);
        p.kernel = orthogonal(cfg.kernel_rows(stage), 4 * units, rng)?;
        p.head_weight = glorot_uniform(units, cfg.layout.stage_state_width(stage), rng);
    }
    Ok(params)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// `(cell_memory, hidden)` of one stage, `[batch, units]` each.
#[derive(Debug, Clone, PartialEq)]
pub struct StageState {
    /// Cell memory `c`.
    pub cell: Array2<f32>,
    /// Hidden vector `h`.
    pub hidden: Array2<f32>,
}

impl StageState {
    fn zeros(batch: usize, units: usize) -> Self {
        StageState { cell: Array2::zeros((batch, units)), hidden: Array2::zeros((batch, units)) }
    }
}

/// Recurrent state of all three stages.
#[derive(Debug, Clone, PartialEq)]
pub struct CellState {
    /// Coaler state.
    pub coaler: StageState,
    /// Burner state.
    pub burner: StageState,
    /// Steamer state.
    pub steamer: StageState,
}

impl CellState {
    /// All-zero state for `batch` sequences.
    pub fn zeros(cfg: &CellConfig, batch: usize) -> Self {
        CellState {
            coaler: StageState::zeros(batch, cfg.units(Stage::Coaler)),
            burner: StageState::zeros(batch, cfg.units(Stage::Burner)),
            steamer: StageState::zeros(batch, cfg.units(Stage::Steamer)),
        }
    }

    /// State of `stage`.
    pub fn stage(&self, stage: Stage) -> &StageState {
        match stage {
            Stage::Coaler => &self.coaler,
            Stage::Burner => &self.burner,
            Stage::Steamer => &self.steamer,
        }
    }

    /// Mutable state of `stage`.
    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageState {
        match stage {
            Stage::Coaler => &mut self.coaler,
            Stage::Burner => &mut self.burner,
            Stage::Steamer => &mut self.steamer,
        }
    }

    /// Number of sequences.
    pub fn batch_size(&self) -> usize {
        self.coaler.hidden.nrows()
    }
}

/// New hidden vectors of the three stages after one step.
#[derive(Debug, Clone, PartialEq)]
pub struct CellOutput {
    /// `[coaler, burner, steamer]`, each `[batch, units]`.
    pub hidden: [Array2<f32>; 3],
}

impl CellOutput {
    /// Hidden output of `stage`.
    pub fn stage(&self, stage: Stage) -> &Array2<f32> {
        &self.hidden[stage.index()]
    }
}

/// Memoises the most recently requested zero state.
///
/// Keyed by batch size and the three hidden widths. Owned by the caller.
#[derive(Debug, Default)]
pub struct ZeroStateCache {
    last: Option<((usize, [usize; 3]), CellState)>,
}

impl ZeroStateCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero state for `batch` sequences, reusing the previous allocation when
    /// the key is unchanged.
    pub fn zero_state(&mut self, cfg: &CellConfig, batch: usize) -> &CellState {
        let key = (
            batch,
            [cfg.units(Stage::Coaler), cfg.units(Stage::Burner), cfg.units(Stage::Steamer)],
        );
        if matches!(&self.last, Some((k, _)) if *k != key) {
            self.last = None;
        }
        &self.last.get_or_insert_with(|| (key, CellState::zeros(cfg, batch))).1
    }
}

// ---------------------------------------------------------------------------
// Dropout
// ---------------------------------------------------------------------------

/// Inverted-dropout masks for one step: entries are `0` or `1 / keep_prob`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepMasks {
    /// `[batch, input_size]`, applied to the whole input row.
    pub input: Array2<f32>,
    /// Applied to the coaler's new hidden before it enters the burner
    /// (`[0]`) and to the burner's new hidden before it enters the steamer
    /// (`[1]`).
    pub upstream: [Array2<f32>; 2],
}

impl StepMasks {
    /// Draw masks for one step, or `None` when `keep_prob >= 1`.
    pub fn sample<R: Rng + ?Sized>(
        cfg: &CellConfig,
        batch: usize,
        keep_prob: f32,
        rng: &mut R,
    ) -> Option<StepMasks> {
        if keep_prob >= 1.0 {
            return None;
        }
        let scale = 1.0 / keep_prob;
        let mut draw = |cols: usize| {
            Array2::from_shape_fn((batch, cols), |_| {
                if rng.gen::<f32>() < keep_prob {
                    scale
                } else {
                    0.0
                }
            })
        };
        let input = draw(cfg.input_size);
        let to_burner = draw(cfg.units(Stage::Coaler));
        let to_steamer = draw(cfg.units(Stage::Burner));
        Some(StepMasks { input, upstream: [to_burner, to_steamer] })
    }

    fn for_upstream_of(&self, stage: Stage) -> Option<&Array2<f32>> {
        match stage {
            Stage::Coaler => None,
            Stage::Burner => Some(&self.upstream[0]),
            Stage::Steamer => Some(&self.upstream[1]),
        }
    }
}

// ---------------------------------------------------------------------------
// Forward
// ---------------------------------------------------------------------------

/// Advance all three stages by one time step.
///
/// `input` is `[batch, input_size]` in canonical column order. With
/// `masks = None` the step is a pure function of its arguments.
///
/// # Errors
///
/// [`ModelError::ShapeMismatch`] if `input`, `prev` or `params` do not match
/// `cfg`.
pub fn step(
    cfg: &CellConfig,
    params: &ModelParameters,
    input: ArrayView2<'_, f32>,
    prev: &CellState,
    masks: Option<&StepMasks>,
) -> Result<(CellOutput, CellState), ModelError> {
    check_step_shapes(cfg, input, prev)?;
    params.check_shapes(cfg)?;
    let (out, state, _) = step_traced(cfg, params, input, prev, masks);
    Ok((out, state))
}

pub(crate) fn check_step_shapes(
    cfg: &CellConfig,
    input: ArrayView2<'_, f32>,
    prev: &CellState,
) -> Result<(), ModelError> {
    let batch = input.nrows();
    if input.ncols() != cfg.input_size {
        return Err(ModelError::shape_mismatch(
            "input",
            vec![batch, cfg.input_size],
            input.shape().to_vec(),
        ));
    }
    for stage in Stage::ALL {
        let want = [batch, cfg.units(stage)];
        let s = prev.stage(stage);
        for arr in [&s.cell, &s.hidden] {
            if arr.shape() != want {
                return Err(ModelError::shape_mismatch("state", want.to_vec(), arr.shape().to_vec()));
            }
        }
    }
    Ok(())
}

/// Intermediate values of one stage update needed by the backward pass.
#[derive(Debug, Clone)]
pub(crate) struct StageTrace {
    /// Kernel input `[stage_input, h_prev, upstream]`.
    x: Array2<f32>,
    c_prev: Array2<f32>,
    i: Array2<f32>,
    j_pre: Array2<f32>,
    j: Array2<f32>,
    f: Array2<f32>,
    o: Array2<f32>,
    c: Array2<f32>,
    c_act: Array2<f32>,
}

/// Everything [`backward_step`] needs from one forward step.
#[derive(Debug, Clone)]
pub(crate) struct StepTrace {
    stages: [StageTrace; 3],
    masks: Option<StepMasks>,
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Concatenate along columns.
fn hstack(parts: &[ArrayView2<'_, f32>]) -> Array2<f32> {
    let rows = parts.first().map_or(0, |p| p.nrows());
    let width = parts.iter().map(|p| p.ncols()).sum();
    let mut out = Array2::zeros((rows, width));
    let mut col = 0;
    for p in parts {
        out.slice_mut(s![.., col..col + p.ncols()]).assign(p);
        col += p.ncols();
    }
    out
}

fn stage_input(cfg: &CellConfig, row: &Array2<f32>, stage: Stage) -> Array2<f32> {
    let parts: Vec<_> = stage
        .input_regions()
        .iter()
        .map(|&r| row.slice(s![.., cfg.layout.span(r)]))
        .collect();
    hstack(&parts)
}

fn stage_forward(
    cfg: &CellConfig,
    p: &StageParams,
    x: Array2<f32>,
    prev: &StageState,
) -> (StageState, StageTrace) {
    let u = p.bias.len() / 4;
    let gates = x.dot(&p.kernel) + &p.bias;
    let fb = cfg.forget_bias;

    let i = gates.slice(s![.., 0..u]).mapv(sigmoid);
    let j_pre = gates.slice(s![.., u..2 * u]).to_owned();
    let f = gates.slice(s![.., 2 * u..3 * u]).mapv(|v| sigmoid(v + fb));
    let o = gates.slice(s![.., 3 * u..4 * u]).mapv(sigmoid);
    let j = cfg.activation.apply(&j_pre);

    let c = &prev.cell * &f + &i * &j;
    let c_act = cfg.activation.apply(&c);
    let h = &c_act * &o;

    let state = StageState { cell: c.clone(), hidden: h };
    let trace = StageTrace { x, c_prev: prev.cell.clone(), i, j_pre, j, f, o, c, c_act };
    (state, trace)
}

/// Forward step that also records what the backward pass needs. Shapes are
/// assumed checked.
pub(crate) fn step_traced(
    cfg: &CellConfig,
    params: &ModelParameters,
    input: ArrayView2<'_, f32>,
    prev: &CellState,
    masks: Option<&StepMasks>,
) -> (CellOutput, CellState, StepTrace) {
    let row = match masks {
        Some(m) => &input * &m.input,
        None => input.to_owned(),
    };

    let mut next = prev.clone();
    let coaler = advance_stage(cfg, params, &row, prev, &mut next, masks, Stage::Coaler);
    let burner = advance_stage(cfg, params, &row, prev, &mut next, masks, Stage::Burner);
    let steamer = advance_stage(cfg, params, &row, prev, &mut next, masks, Stage::Steamer);

    let output = CellOutput {
        hidden: [
            next.coaler.hidden.clone(),
            next.burner.hidden.clone(),
            next.steamer.hidden.clone(),
        ],
    };
    let trace = StepTrace { stages: [coaler, burner, steamer], masks: masks.cloned() };
    (output, next, trace)
}

/// Update `stage` in `next`, reading the upstream hidden already written
/// there during this step.
fn advance_stage(
    cfg: &CellConfig,
    params: &ModelParameters,
    row: &Array2<f32>,
    prev: &CellState,
    next: &mut CellState,
    masks: Option<&StepMasks>,
    stage: Stage,
) -> StageTrace {
    let own = stage_input(cfg, row, stage);
    let h_prev = prev.stage(stage).hidden.view();
    let x = match stage.upstream() {
        None => hstack(&[own.view(), h_prev]),
        Some(up) => {
            let fresh = &next.stage(up).hidden;
            let coupled = match masks.and_then(|m| m.for_upstream_of(stage)) {
                Some(mask) => fresh * mask,
                None => fresh.clone(),
            };
            hstack(&[own.view(), h_prev, coupled.view()])
        }
    };
    let (state, trace) = stage_forward(cfg, params.stage(stage), x, prev.stage(stage));
    *next.stage_mut(stage) = state;
    trace
}

// ---------------------------------------------------------------------------
// Backward
// ---------------------------------------------------------------------------

/// Gradients flowing out of one stage update.
struct StageGrad {
    h_prev: Array2<f32>,
    c_prev: Array2<f32>,
    upstream: Option<Array2<f32>>,
}

fn stage_backward(
    cfg: &CellConfig,
    stage: Stage,
    p: &StageParams,
    t: &StageTrace,
    dh: &Array2<f32>,
    dc: &Array2<f32>,
    grad: &mut StageParams,
) -> StageGrad {
    let d_o = dh * &t.c_act;
    let dc_total = dc + &(dh * &t.o * cfg.activation.derivative(&t.c, &t.c_act));

    let di = &dc_total * &t.j;
    let dj = &dc_total * &t.i;
    let df = &dc_total * &t.c_prev;
    let dc_prev = &dc_total * &t.f;

    let di_pre = di * t.i.mapv(|s| s * (1.0 - s));
    let dj_pre = dj * cfg.activation.derivative(&t.j_pre, &t.j);
    let df_pre = df * t.f.mapv(|s| s * (1.0 - s));
    let do_pre = d_o * t.o.mapv(|s| s * (1.0 - s));
    let dgates = hstack(&[di_pre.view(), dj_pre.view(), df_pre.view(), do_pre.view()]);

    grad.kernel += &t.x.t().dot(&dgates);
    grad.bias += &dgates.sum_axis(Axis(0));

    let dx = dgates.dot(&p.kernel.t());
    let own = cfg.layout.stage_input_width(stage);
    let units = cfg.units(stage);
    let h_prev = dx.slice(s![.., own..own + units]).to_owned();
    let upstream = stage
        .upstream()
        .map(|_| dx.slice(s![.., own + units..]).to_owned());

    StageGrad { h_prev, c_prev: dc_prev, upstream }
}

/// Backpropagate one forward step.
///
/// `d_next` holds the gradients of the loss with respect to the new cell
/// memory and new hidden vector of every stage (`cell`/`hidden` fields).
/// Parameter gradients are accumulated into `grads`; the returned state holds
/// the gradients with respect to the previous step's state.
pub(crate) fn backward_step(
    cfg: &CellConfig,
    params: &ModelParameters,
    trace: &StepTrace,
    mut d_next: CellState,
    grads: &mut ModelParameters,
) -> CellState {
    let mut d_prev = d_next.clone();
    for stage in Stage::ALL.into_iter().rev() {
        let d = d_next.stage(stage);
        let g = stage_backward(
            cfg,
            stage,
            params.stage(stage),
            &trace.stages[stage.index()],
            &d.hidden,
            &d.cell,
            grads.stage_mut(stage),
        );
        if let (Some(up), Some(mut d_up)) = (stage.upstream(), g.upstream) {
            if let Some(mask) = trace.masks.as_ref().and_then(|m| m.for_upstream_of(stage)) {
                d_up *= mask;
            }
            d_next.stage_mut(up).hidden += &d_up;
        }
        *d_prev.stage_mut(stage) = StageState { cell: g.c_prev, hidden: g.h_prev };
    }
    d_prev
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
