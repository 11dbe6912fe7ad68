//! Error types for the boiler simulator.
//!
//! This module is the single source of truth for all error types in the
//! crate. Every module that produces an error imports its error type from
//! here rather than defining it inline, keeping the error hierarchy
//! centralised and consistent.
//!
//! ## Hierarchy
//!
//! ```text
//! TrainError (top-level)
//! ├── ConfigError   (config validation / column grouping / file loading)
//! ├── DatasetError  (CSV ingestion, windowing, splitting, batching)
//! └── ModelError    (shape checks at step time, initialisation)
//! ```
//!
//! Configuration errors are fatal at startup. Dataset errors are fatal at the
//! point the offending row (or degenerate split) is first seen. Nothing in
//! this crate retries.

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// TrainResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by orchestration-level functions.
pub type TrainResult<T> = Result<T, TrainError>;

// ---------------------------------------------------------------------------
// TrainError — top-level aggregator
// ---------------------------------------------------------------------------

/// Top-level error type for the simulator training pipeline.
///
/// Orchestration-level functions (e.g. [`crate::trainer::Trainer`] methods)
/// return `TrainResult<T>`. Lower-level functions in [`crate::config`],
/// [`crate::dataset`] and [`crate::cell`] return their own module-specific
/// error types which are automatically coerced into `TrainError` via [`From`].
#[derive(Debug, Error)]
pub enum TrainError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A dataset loading or windowing error.
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// A model shape or initialisation error.
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A checkpoint could not be saved or loaded.
    #[error("Checkpoint error: {message} (path: {path:?})")]
    Checkpoint {
        /// Human-readable description.
        message: String,
        /// Path that was being accessed.
        path: PathBuf,
    },

    /// The metric history could not be written as CSV.
    #[error("Cannot write metrics to `{path}`: {source}")]
    MetricsWrite {
        /// Target CSV path.
        path: PathBuf,
        /// Underlying CSV error.
        #[source]
        source: csv::Error,
    },
}

impl TrainError {
    /// Construct a [`TrainError::Checkpoint`].
    pub fn checkpoint<S: Into<String>>(msg: S, path: impl Into<PathBuf>) -> Self {
        TrainError::Checkpoint { message: msg.into(), path: path.into() }
    }

    /// Construct a [`TrainError::MetricsWrite`].
    pub fn metrics_write(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        TrainError::MetricsWrite { path: path.into(), source }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating configuration.
///
/// Every variant is a startup precondition violation; none is recoverable.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// The partition sizes do not add up to the declared row width.
    #[error("Partition sizes sum to {actual} but the declared row width is {expected}")]
    PartitionWidth {
        /// Declared row width.
        expected: usize,
        /// Sum of the region sizes.
        actual: usize,
    },

    /// A region of the column grouping selects the wrong number of columns.
    #[error("Region `{region}` groups {actual} raw columns but the layout declares {expected}")]
    RegionSize {
        /// Region name.
        region: &'static str,
        /// Size declared by the partition layout.
        expected: usize,
        /// Number of raw columns the grouping selects.
        actual: usize,
    },

    /// A raw column index is selected by more than one range.
    #[error("Raw column {index} appears more than once in the column grouping")]
    DuplicateColumn {
        /// The duplicated raw index.
        index: usize,
    },

    /// A raw column index is not selected by any range.
    #[error("Raw column {index} is missing from the column grouping")]
    MissingColumn {
        /// The unselected raw index.
        index: usize,
    },

    /// A raw column index is outside the raw table.
    #[error("Raw column {index} is out of range for a table of width {width}")]
    ColumnOutOfRange {
        /// The offending raw index.
        index: usize,
        /// Raw table width.
        width: usize,
    },

    /// A configuration file could not be read from disk.
    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// DatasetError
// ---------------------------------------------------------------------------

/// Errors produced while loading, windowing or batching boiler data.
///
/// Training code MUST NOT silently suppress these errors: an empty split or
/// an epoch with zero batches would otherwise train or validate on nothing.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The CSV reader rejected the file.
    #[error("CSV error in `{path}`: {source}")]
    Csv {
        /// Path of the CSV file.
        path: PathBuf,
        /// Underlying CSV error.
        #[source]
        source: csv::Error,
    },

    /// The timestamp index column is not present in the header.
    #[error("Timestamp column `{column}` not found in `{path}`")]
    MissingTimestamp {
        /// Expected column name.
        column: String,
        /// Path of the CSV file.
        path: PathBuf,
    },

    /// The header names a different number of value columns than declared.
    #[error("Header has {found} value columns, expected {expected}")]
    HeaderWidthMismatch {
        /// Width found.
        found: usize,
        /// Width declared by the configuration.
        expected: usize,
    },

    /// A row has a different number of value columns than declared.
    #[error("Row {row} has {found} value columns, expected {expected}")]
    RowWidthMismatch {
        /// Zero-based data row (header excluded).
        row: usize,
        /// Width found.
        found: usize,
        /// Width declared by the configuration.
        expected: usize,
    },

    /// A cell could not be parsed as a number.
    #[error("Row {row}, column `{column}`: cannot parse `{value}` as a number")]
    InvalidValue {
        /// Zero-based data row.
        row: usize,
        /// Column name.
        column: String,
        /// Raw cell text.
        value: String,
    },

    /// There are not enough rows to build even one window.
    #[error("{rows} rows cannot produce a window of history length {history_length}")]
    NotEnoughRows {
        /// Number of rows available.
        rows: usize,
        /// Requested history length.
        history_length: usize,
    },

    /// The target column range does not fit inside the row.
    #[error("Target columns {start}..{end} exceed row width {width}")]
    TargetOutOfRange {
        /// First target column.
        start: usize,
        /// One past the last target column.
        end: usize,
        /// Row width.
        width: usize,
    },

    /// A chronological split left one side without windows.
    #[error("Split of {total} windows at val_ratio={val_ratio} leaves the {side} set empty")]
    EmptySplit {
        /// Total number of windows before the split.
        total: usize,
        /// Requested validation ratio.
        val_ratio: f64,
        /// `"training"` or `"validation"`.
        side: &'static str,
    },

    /// An epoch would yield no batches at all.
    #[error("{set} set of {len} windows yields no batches of size {batch_size}")]
    NoBatches {
        /// `"training"` or `"validation"`.
        set: &'static str,
        /// Number of windows in the set.
        len: usize,
        /// Requested batch size.
        batch_size: usize,
    },
}

impl DatasetError {
    /// Construct a [`DatasetError::Csv`].
    pub fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        DatasetError::Csv { path: path.into(), source }
    }
}

// ---------------------------------------------------------------------------
// ModelError
// ---------------------------------------------------------------------------

/// Errors produced by the recurrent cell and the model around it.
#[derive(Debug, Error)]
pub enum ModelError {
    /// An input array does not have the width the cell was built for.
    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// What was being checked.
        what: &'static str,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// A weight shape with a zero dimension was requested.
    #[error("Cannot initialise a weight of shape ({rows}, {cols})")]
    EmptyShape {
        /// Requested rows.
        rows: usize,
        /// Requested columns.
        cols: usize,
    },

    /// The singular-value decomposition did not produce the requested factor.
    #[error("SVD did not produce an orthogonal factor for shape ({rows}, {cols})")]
    Decomposition {
        /// Requested rows.
        rows: usize,
        /// Requested columns.
        cols: usize,
    },
}

impl ModelError {
    /// Construct a [`ModelError::ShapeMismatch`].
    pub fn shape_mismatch(what: &'static str, expected: Vec<usize>, actual: Vec<usize>) -> Self {
        ModelError::ShapeMismatch { what, expected, actual }
    }
}
