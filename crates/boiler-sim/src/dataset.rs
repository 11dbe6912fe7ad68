//! Boiler tables and the window pipeline built on top of them.
//!
//! This module turns a flat, timestamp-indexed table into supervised
//! training sequences:
//!
//! - [`BoilerTable`]: timestamps, raw column names and an `[L, width]` value
//!   matrix, loaded from CSV with [`BoilerTable::from_csv`] or generated by
//!   [`SyntheticBoilerTable`].
//! - [`build_windows`]: slices `L` rows into `L - H` history windows plus
//!   targets chosen by a [`TargetPolicy`].
//! - [`split`]: chronological train/validation cut.
//! - [`epoch_batches`]: shuffled batch starts, fresh randomness per call,
//!   remainder dropped.
//! - [`BoilerDataset`]: all of the above wired together from a
//!   [`TrainingConfig`].
//!
//! # Example – synthetic dataset
//!
//! ```rust
//! use boiler_sim::dataset::{build_windows, SyntheticBoilerTable, TargetPolicy};
//!
//! let table = SyntheticBoilerTable::new(10, 6).build();
//! let windows = build_windows(table.values().view(), 3, 1..4, TargetPolicy::SingleStep).unwrap();
//!
//! assert_eq!(windows.len(), 7);
//! assert_eq!(windows.inputs.shape(), &[7, 3, 6]);
//! ```

use ndarray::{s, Array2, Array3, ArrayView2, ArrayViewD};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;
use tracing::{debug, info};

use crate::config::TrainingConfig;
use crate::error::{ConfigError, DatasetError, TrainResult};
use crate::partition::ColumnPartitioner;

// ---------------------------------------------------------------------------
// BoilerTable
// ---------------------------------------------------------------------------

/// A time-ordered table of boiler readings.
#[derive(Debug, Clone)]
pub struct BoilerTable {
    timestamps: Vec<String>,
    columns: Vec<String>,
    values: Array2<f32>,
}

impl BoilerTable {
    /// Assemble a table from its parts.
    ///
    /// # Errors
    ///
    /// [`DatasetError::HeaderWidthMismatch`] if `columns` does not name every
    /// value column; [`DatasetError::RowWidthMismatch`] if the number of
    /// timestamps differs from the number of rows.
    pub fn new(
        timestamps: Vec<String>,
        columns: Vec<String>,
        values: Array2<f32>,
    ) -> Result<Self, DatasetError> {
        if columns.len() != values.ncols() {
            return Err(DatasetError::HeaderWidthMismatch {
                found: columns.len(),
                expected: values.ncols(),
            });
        }
        if timestamps.len() != values.nrows() {
            return Err(DatasetError::RowWidthMismatch {
                row: timestamps.len().min(values.nrows()),
                found: timestamps.len(),
                expected: values.nrows(),
            });
        }
        Ok(BoilerTable { timestamps, columns, values })
    }

    /// Read a CSV file with a header row.
    ///
    /// The column named `timestamp_column` is the row index; every other
    /// column is a value column, kept in file order. `expected_width` is the
    /// declared number of value columns.
    ///
    /// # Errors
    ///
    /// Any [`DatasetError`] describing the first offending header or row.
    pub fn from_csv(
        path: &Path,
        timestamp_column: &str,
        expected_width: usize,
    ) -> Result<Self, DatasetError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| DatasetError::csv(path, e))?;

        let header: Vec<String> = reader
            .headers()
            .map_err(|e| DatasetError::csv(path, e))?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect();

        let ts_idx = header
            .iter()
            .position(|h| h == timestamp_column)
            .ok_or_else(|| DatasetError::MissingTimestamp {
                column: timestamp_column.to_string(),
                path: path.to_path_buf(),
            })?;

        let columns: Vec<String> = header
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != ts_idx)
            .map(|(_, h)| h.clone())
            .collect();
        if columns.len() != expected_width {
            return Err(DatasetError::HeaderWidthMismatch {
                found: columns.len(),
                expected: expected_width,
            });
        }

        let mut timestamps = Vec::new();
        let mut flat: Vec<f32> = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record.map_err(|e| DatasetError::csv(path, e))?;
            if record.len() != header.len() {
                return Err(DatasetError::RowWidthMismatch {
                    row,
                    found: record.len().saturating_sub(1),
                    expected: expected_width,
                });
            }
            for (i, field) in record.iter().enumerate() {
                if i == ts_idx {
                    timestamps.push(field.to_string());
                    continue;
                }
                let value: f32 = field.trim().parse().map_err(|_| DatasetError::InvalidValue {
                    row,
                    column: header[i].clone(),
                    value: field.to_string(),
                })?;
                flat.push(value);
            }
        }

        let values = Array2::from_shape_vec((timestamps.len(), expected_width), flat)
            .map_err(|_| DatasetError::HeaderWidthMismatch { found: columns.len(), expected: expected_width })?;

        debug!(path = %path.display(), rows = values.nrows(), width = expected_width, "loaded boiler table");
        Ok(BoilerTable { timestamps, columns, values })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    /// `true` if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of value columns.
    pub fn width(&self) -> usize {
        self.values.ncols()
    }

    /// Row timestamps, in file order.
    pub fn timestamps(&self) -> &[String] {
        &self.timestamps
    }

    /// Value column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// `[len, width]` value matrix.
    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    /// Return a copy of this table with its columns in canonical order.
    pub fn reorder(&self, partitioner: &ColumnPartitioner) -> Result<BoilerTable, DatasetError> {
        Ok(BoilerTable {
            timestamps: self.timestamps.clone(),
            columns: partitioner.reorder_names(&self.columns),
            values: partitioner.reorder_table(self.values.view())?,
        })
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// How the supervision target of a window is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPolicy {
    /// State columns of the row right after the window: `[N, width]`.
    #[default]
    SingleStep,
    /// State columns of each window row shifted one step ahead:
    /// `[N, H, width]`.
    ShiftedSequence,
}

/// Targets for a set of windows.
#[derive(Debug, Clone, PartialEq)]
pub enum Targets {
    /// `[N, width]`.
    SingleStep(Array2<f32>),
    /// `[N, H, width]`.
    ShiftedSequence(Array3<f32>),
}

impl Targets {
    /// Policy these targets were built with.
    pub fn policy(&self) -> TargetPolicy {
        match self {
            Targets::SingleStep(_) => TargetPolicy::SingleStep,
            Targets::ShiftedSequence(_) => TargetPolicy::ShiftedSequence,
        }
    }

    /// Number of windows.
    pub fn len(&self) -> usize {
        match self {
            Targets::SingleStep(y) => y.shape()[0],
            Targets::ShiftedSequence(y) => y.shape()[0],
        }
    }

    /// `true` if there are no targets.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Width of one target vector.
    pub fn width(&self) -> usize {
        match self {
            Targets::SingleStep(y) => y.shape()[1],
            Targets::ShiftedSequence(y) => y.shape()[2],
        }
    }

    /// Owned copy of the windows in `range`.
    pub fn slice(&self, range: Range<usize>) -> Targets {
        match self {
            Targets::SingleStep(y) => Targets::SingleStep(y.slice(s![range, ..]).to_owned()),
            Targets::ShiftedSequence(y) => {
                Targets::ShiftedSequence(y.slice(s![range, .., ..]).to_owned())
            }
        }
    }

    /// Dynamic-dimensional view, for code that treats both policies alike.
    pub fn view_dyn(&self) -> ArrayViewD<'_, f32> {
        match self {
            Targets::SingleStep(y) => y.view().into_dyn(),
            Targets::ShiftedSequence(y) => y.view().into_dyn(),
        }
    }
}

// ---------------------------------------------------------------------------
// WindowSet
// ---------------------------------------------------------------------------

/// History windows and their targets.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSet {
    /// `[N, H, row_width]`.
    pub inputs: Array3<f32>,
    /// Targets per window.
    pub targets: Targets,
    /// Table row at which window 0 starts. Window `i` covers rows
    /// `offset + i .. offset + i + H`.
    pub offset: usize,
}

impl WindowSet {
    /// Number of windows.
    pub fn len(&self) -> usize {
        self.inputs.shape()[0]
    }

    /// `true` if there are no windows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Window length `H`.
    pub fn history_length(&self) -> usize {
        self.inputs.shape()[1]
    }

    /// Row width.
    pub fn row_width(&self) -> usize {
        self.inputs.shape()[2]
    }

    /// Owned copy of the windows in `range`, keeping the row offset.
    pub fn slice(&self, range: Range<usize>) -> WindowSet {
        WindowSet {
            inputs: self.inputs.slice(s![range.clone(), .., ..]).to_owned(),
            targets: self.targets.slice(range.clone()),
            offset: self.offset + range.start,
        }
    }
}

/// Slice `rows` into history windows of length `history_length`.
///
/// Produces `N = rows - history_length` windows. Targets take the columns in
/// `target` from the row following the window (single step) or from each
/// window row shifted by one (shifted sequence).
///
/// # Errors
///
/// [`DatasetError::NotEnoughRows`] when no window fits and
/// [`DatasetError::TargetOutOfRange`] when `target` exceeds the row width.
pub fn build_windows(
    rows: ArrayView2<'_, f32>,
    history_length: usize,
    target: Range<usize>,
    policy: TargetPolicy,
) -> Result<WindowSet, DatasetError> {
    let (len, width) = rows.dim();
    if history_length == 0 || len <= history_length {
        return Err(DatasetError::NotEnoughRows { rows: len, history_length });
    }
    if target.start > target.end || target.end > width {
        return Err(DatasetError::TargetOutOfRange {
            start: target.start,
            end: target.end,
            width,
        });
    }

    let n = len - history_length;
    let mut inputs = Array3::<f32>::zeros((n, history_length, width));
    for i in 0..n {
        inputs
            .slice_mut(s![i, .., ..])
            .assign(&rows.slice(s![i..i + history_length, ..]));
    }

    let targets = match policy {
        TargetPolicy::SingleStep => Targets::SingleStep(
            rows.slice(s![history_length..len, target.clone()]).to_owned(),
        ),
        TargetPolicy::ShiftedSequence => {
            let mut y = Array3::<f32>::zeros((n, history_length, target.len()));
            for i in 0..n {
                y.slice_mut(s![i, .., ..])
                    .assign(&rows.slice(s![i + 1..i + history_length + 1, target.clone()]));
            }
            Targets::ShiftedSequence(y)
        }
    };

    Ok(WindowSet { inputs, targets, offset: 0 })
}

/// Chronological train/validation split.
///
/// The first `floor(N * (1 - val_ratio))` windows train, the rest validate.
///
/// # Errors
///
/// [`ConfigError::InvalidValue`] if `val_ratio` is outside `[0, 1)`;
/// [`DatasetError::EmptySplit`] if either side ends up empty.
pub fn split(windows: &WindowSet, val_ratio: f64) -> TrainResult<(WindowSet, WindowSet)> {
    if !(0.0..1.0).contains(&val_ratio) {
        return Err(ConfigError::invalid_value(
            "val_ratio",
            format!("must be in [0, 1), got {val_ratio}"),
        )
        .into());
    }
    let total = windows.len();
    let cut = ((total as f64) * (1.0 - val_ratio)).floor() as usize;
    if cut == 0 {
        return Err(DatasetError::EmptySplit { total, val_ratio, side: "training" }.into());
    }
    if cut >= total {
        return Err(DatasetError::EmptySplit { total, val_ratio, side: "validation" }.into());
    }
    Ok((windows.slice(0..cut), windows.slice(cut..total)))
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

/// A batch of consecutive windows.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Index of the first window of the batch in its [`WindowSet`].
    pub start: usize,
    /// `[batch, H, row_width]`.
    pub inputs: Array3<f32>,
    /// Targets for the batch.
    pub targets: Targets,
}

impl Batch {
    /// Number of windows in the batch.
    pub fn len(&self) -> usize {
        self.inputs.shape()[0]
    }

    /// `true` for an empty batch.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterator over the batches of one pass. Created by [`epoch_batches`] or
/// [`sequential_batches`].
#[derive(Debug)]
pub struct EpochBatches<'a> {
    windows: &'a WindowSet,
    batch_size: usize,
    starts: Vec<usize>,
    next: usize,
}

impl<'a> EpochBatches<'a> {
    fn new(windows: &'a WindowSet, batch_size: usize) -> Self {
        let count = if batch_size == 0 { 0 } else { windows.len() / batch_size };
        EpochBatches {
            windows,
            batch_size,
            starts: (0..count).map(|j| j * batch_size).collect(),
            next: 0,
        }
    }

    /// Batch start indices in the order they will be yielded.
    pub fn starts(&self) -> &[usize] {
        &self.starts
    }
}

impl Iterator for EpochBatches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let start = *self.starts.get(self.next)?;
        self.next += 1;
        let range = start..start + self.batch_size;
        Some(Batch {
            start,
            inputs: self.windows.inputs.slice(s![range.clone(), .., ..]).to_owned(),
            targets: self.windows.targets.slice(range),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.starts.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for EpochBatches<'_> {}

/// Batches for one training epoch.
///
/// Batch `j` covers windows `j*batch_size .. (j+1)*batch_size`; the order of
/// the batches is shuffled with `rng` on every call. The trailing remainder
/// shorter than `batch_size` is dropped, so exactly `N / batch_size` batches
/// are produced (zero if `batch_size > N`).
pub fn epoch_batches<'a, R: Rng + ?Sized>(
    windows: &'a WindowSet,
    batch_size: usize,
    rng: &mut R,
) -> EpochBatches<'a> {
    let mut batches = EpochBatches::new(windows, batch_size);
    batches.starts.shuffle(rng);
    batches
}

/// Batches in chronological order, remainder dropped. Used for validation.
pub fn sequential_batches(windows: &WindowSet, batch_size: usize) -> EpochBatches<'_> {
    EpochBatches::new(windows, batch_size)
}

// ---------------------------------------------------------------------------
// BoilerDataset
// ---------------------------------------------------------------------------

/// Train and validation windows ready for the trainer.
#[derive(Debug, Clone)]
pub struct BoilerDataset {
    /// Chronologically earlier windows.
    pub train: WindowSet,
    /// Chronologically later windows.
    pub valid: WindowSet,
    /// Value column names in canonical order.
    pub columns: Vec<String>,
}

impl BoilerDataset {
    /// Reorder `table` into canonical columns, window it and split it, as
    /// described by `config`.
    pub fn from_table(table: &BoilerTable, config: &TrainingConfig) -> TrainResult<Self> {
        let layout = &config.cell.layout;
        if table.width() != config.cell.input_size {
            return Err(DatasetError::HeaderWidthMismatch {
                found: table.width(),
                expected: config.cell.input_size,
            }
            .into());
        }
        let partitioner = ColumnPartitioner::new(&config.grouping, layout, config.cell.input_size)?;
        let canonical = table.reorder(&partitioner)?;

        let windows = build_windows(
            canonical.values().view(),
            config.history_length,
            layout.state_range(),
            config.target_policy,
        )?;
        let (train, valid) = split(&windows, config.val_ratio)?;

        info!(
            rows = table.len(),
            windows = windows.len(),
            train = train.len(),
            valid = valid.len(),
            policy = ?config.target_policy,
            "built boiler dataset"
        );

        Ok(BoilerDataset { train, valid, columns: canonical.columns().to_vec() })
    }

    /// Load a CSV file and build the dataset from it.
    pub fn load(path: &Path, config: &TrainingConfig) -> TrainResult<Self> {
        let table = BoilerTable::from_csv(path, &config.timestamp_column, config.cell.input_size)?;
        BoilerDataset::from_table(&table, config)
    }
}

// ---------------------------------------------------------------------------
// SyntheticBoilerTable
// ---------------------------------------------------------------------------

/// Deterministic sinusoidal boiler readings for dry runs and tests.
///
/// Column `k` oscillates in `[0.1, 0.9]` with period `7 + k % 13` rows and a
/// column-dependent phase. **Never uses random data.**
#[derive(Debug, Clone, Copy)]
pub struct SyntheticBoilerTable {
    /// Number of rows.
    pub rows: usize,
    /// Number of value columns.
    pub width: usize,
}

impl SyntheticBoilerTable {
    /// Describe a `rows × width` table.
    pub fn new(rows: usize, width: usize) -> Self {
        SyntheticBoilerTable { rows, width }
    }

    /// Value at row `t`, column `k`.
    pub fn value(&self, t: usize, k: usize) -> f32 {
        let period = (7 + k % 13) as f32;
        let phase = k as f32 * 0.37;
        0.5 + 0.4 * (std::f32::consts::TAU * t as f32 / period + phase).sin()
    }

    /// Materialise the table.
    pub fn build(&self) -> BoilerTable {
        BoilerTable {
            timestamps: (0..self.rows).map(|t| format!("t{t:06}")).collect(),
            columns: (0..self.width).map(|k| format!("c{k:03}")).collect(),
            values: Array2::from_shape_fn((self.rows, self.width), |(t, k)| self.value(t, k)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
