//! Training configuration for the boiler simulator.
//!
//! [`TrainingConfig`] is the single source of truth for all hyper-parameters,
//! the column layout and infrastructure settings used throughout the
//! training pipeline. It is serializable via [`serde`] so it can be stored
//! to / restored from JSON files; missing fields take their defaults.
//!
//! # Example
//!
//! ```rust
//! use boiler_sim::config::TrainingConfig;
//!
//! let cfg = TrainingConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.history_length, 10);
//! assert_eq!(cfg.cell.input_size, 202);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cell::CellConfig;
use crate::dataset::TargetPolicy;
use crate::error::ConfigError;
use crate::optim::OptimizerKind;
use crate::partition::{ColumnGrouping, ColumnPartitioner};

// ---------------------------------------------------------------------------
// TrainingConfig
// ---------------------------------------------------------------------------

/// Complete configuration for a simulator training run.
///
/// Use [`TrainingConfig::default()`] as a starting point, then override
/// individual fields as needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // -----------------------------------------------------------------------
    // Data
    // -----------------------------------------------------------------------
    /// Name of the timestamp index column in the input CSV. Default: **"时间戳"**.
    pub timestamp_column: String,

    /// Raw column indices of each canonical region.
    ///
    /// Default: the plant historian's 202-column export.
    pub grouping: ColumnGrouping,

    /// Number of consecutive rows per window. Default: **10**.
    pub history_length: usize,

    /// How window targets are built. Default: **single_step**.
    pub target_policy: TargetPolicy,

    /// Fraction of chronologically-latest windows held out for validation.
    /// Default: **0.2**.
    pub val_ratio: f64,

    // -----------------------------------------------------------------------
    // Model
    // -----------------------------------------------------------------------
    /// Shape of the coupled cell.
    pub cell: CellConfig,

    /// Keep probability shared by the input and upstream dropout. `1.0`
    /// disables dropout. Default: **1.0**.
    pub keep_prob: f64,

    // -----------------------------------------------------------------------
    // Optimisation
    // -----------------------------------------------------------------------
    /// Windows per gradient step. Default: **1**.
    pub batch_size: usize,

    /// Number of passes over the training windows. Default: **50**.
    pub max_epoch: usize,

    /// Optimizer. Default: **adam**.
    pub optimizer: OptimizerKind,

    /// Initial learning rate. Default: **1e-3**.
    pub learning_rate: f64,

    /// Learning rate multiplier applied once per epoch. Default: **0.95**.
    pub learning_rate_decay: f64,

    /// Global-norm gradient clipping threshold. Default: **5.0**.
    pub grad_clip: f64,

    /// Coefficient of the L2 penalty over non-bias weights. Default: **0.0**.
    pub l2_weight: f64,

    // -----------------------------------------------------------------------
    // Logging, validation and checkpointing
    // -----------------------------------------------------------------------
    /// Log the training loss every N iterations. Default: **100**.
    pub save_log_iter: usize,

    /// Evaluate on the validation set every N iterations. Default: **200**.
    pub display_iter: usize,

    /// Directory where checkpoints and `metrics.csv` are written.
    pub checkpoint_dir: PathBuf,

    // -----------------------------------------------------------------------
    // Reproducibility
    // -----------------------------------------------------------------------
    /// Seed for weight initialisation, batch shuffling and dropout.
    /// Default: **2022**.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            // Data
            timestamp_column: "时间戳".to_string(),
            grouping: ColumnGrouping::boiler_default(),
            history_length: 10,
            target_policy: TargetPolicy::SingleStep,
            val_ratio: 0.2,
            // Model
            cell: CellConfig::default(),
            keep_prob: 1.0,
            // Optimisation
            batch_size: 1,
            max_epoch: 50,
            optimizer: OptimizerKind::Adam,
            learning_rate: 1e-3,
            learning_rate_decay: 0.95,
            grad_clip: 5.0,
            l2_weight: 0.0,
            // Logging / checkpointing
            save_log_iter: 100,
            display_iter: 200,
            checkpoint_dir: PathBuf::from("checkpoints"),
            // Reproducibility
            seed: 2022,
        }
    }
}

impl TrainingConfig {
    /// Load a [`TrainingConfig`] from a JSON file at `path` and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed, and any error of
    /// [`TrainingConfig::validate`].
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: TrainingConfig = serde_json::from_str(&contents).map_err(|source| {
            ConfigError::ParseError { path: path.to_path_buf(), source }
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON and write it to
    /// `path`, creating parent directories if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the directory cannot be created or
    /// the file cannot be written.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Validate all fields and return an error describing the first problem
    /// found, or `Ok(())` if the configuration is coherent.
    ///
    /// # Validated invariants
    ///
    /// - The cell configuration is valid (layout sums to `input_size`,
    ///   `num_units` has three non-zero entries).
    /// - `grouping` is a bijection onto `input_size` raw columns matching the
    ///   layout region by region.
    /// - `history_length`, `batch_size`, `max_epoch`, `save_log_iter` and
    ///   `display_iter` are at least 1.
    /// - `val_ratio` is in `(0, 1)`, `keep_prob` in `(0, 1]`.
    /// - `learning_rate` and `grad_clip` are strictly positive,
    ///   `learning_rate_decay` is in `(0, 1]`, `l2_weight` is non-negative.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Model shape and column grouping
        self.cell.validate()?;
        ColumnPartitioner::new(&self.grouping, &self.cell.layout, self.cell.input_size)?;

        if self.timestamp_column.is_empty() {
            return Err(ConfigError::invalid_value("timestamp_column", "must not be empty"));
        }

        // Windows
        if self.history_length == 0 {
            return Err(ConfigError::invalid_value("history_length", "must be > 0"));
        }
        if !(self.val_ratio > 0.0 && self.val_ratio < 1.0) {
            return Err(ConfigError::invalid_value(
                "val_ratio",
                format!("must be in (0.0, 1.0), got {}", self.val_ratio),
            ));
        }

        // Dropout
        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            return Err(ConfigError::invalid_value("keep_prob", "must be in (0.0, 1.0]"));
        }

        // Optimisation
        if self.batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be > 0"));
        }
        if self.max_epoch == 0 {
            return Err(ConfigError::invalid_value("max_epoch", "must be > 0"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(ConfigError::invalid_value("learning_rate", "must be > 0.0"));
        }
        if !(self.learning_rate_decay > 0.0 && self.learning_rate_decay <= 1.0) {
            return Err(ConfigError::invalid_value(
                "learning_rate_decay",
                "must be in (0.0, 1.0]",
            ));
        }
        if !(self.grad_clip > 0.0) {
            return Err(ConfigError::invalid_value("grad_clip", "must be > 0.0"));
        }
        if !(self.l2_weight >= 0.0) {
            return Err(ConfigError::invalid_value("l2_weight", "must be >= 0.0"));
        }

        // Cadence
        if self.save_log_iter == 0 {
            return Err(ConfigError::invalid_value("save_log_iter", "must be > 0"));
        }
        if self.display_iter == 0 {
            return Err(ConfigError::invalid_value("display_iter", "must be > 0"));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
