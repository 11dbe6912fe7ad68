//! Checkpoint persistence and the save-on-improvement policy.
//!
//! A checkpoint is written only when a validation loss is strictly lower
//! than every validation loss recorded before it. The record starts at
//! `+∞`, so the first validation pass always saves.
//!
//! Files written by [`CheckpointWriter`]:
//!
//! ```text
//! <checkpoint_dir>/
//!   model_<iteration>.json   # one per improvement
//!   final_model.json         # copy of the best so far
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cell::{CellConfig, ModelParameters};
use crate::error::{TrainError, TrainResult};

/// Serializable snapshot of a trained simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Global iteration (batches seen) at save time.
    pub iteration: usize,
    /// Zero-based epoch at save time.
    pub epoch: usize,
    /// Validation loss that triggered the save.
    pub valid_loss: f32,
    /// Cell configuration the parameters belong to.
    pub cell: CellConfig,
    /// All model parameters.
    pub params: ModelParameters,
}

impl Checkpoint {
    /// Write as pretty-printed JSON.
    pub fn save_to_file(&self, path: &Path) -> TrainResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| TrainError::checkpoint(format!("cannot write checkpoint: {e}"), path))
    }

    /// Read a checkpoint written by [`Checkpoint::save_to_file`].
    pub fn load_from_file(path: &Path) -> TrainResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| TrainError::checkpoint(format!("cannot read checkpoint: {e}"), path))?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Keeps the lowest validation loss and reports strict improvements.
///
/// A NaN loss is never an improvement and never replaces the best.
#[derive(Debug, Clone, Copy)]
pub struct BestLossTracker {
    best: f32,
    observed: usize,
}

impl Default for BestLossTracker {
    fn default() -> Self {
        BestLossTracker { best: f32::INFINITY, observed: 0 }
    }
}

impl BestLossTracker {
    /// Tracker seeded with `+∞`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `loss`; returns `true` if it is strictly below the best loss
    /// seen so far.
    pub fn observe(&mut self, loss: f32) -> bool {
        self.observed += 1;
        if loss < self.best {
            self.best = loss;
            true
        } else {
            false
        }
    }

    /// Lowest loss recorded (`+∞` before the first observation).
    pub fn best(&self) -> f32 {
        self.best
    }

    /// Number of losses observed, NaN included.
    pub fn observed(&self) -> usize {
        self.observed
    }
}

/// Writes checkpoint files into one directory.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    dir: PathBuf,
}

impl CheckpointWriter {
    /// Writer rooted at `dir` (created on first write).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CheckpointWriter { dir: dir.into() }
    }

    /// Path of the per-iteration file.
    pub fn iteration_path(&self, iteration: usize) -> PathBuf {
        self.dir.join(format!("model_{iteration}.json"))
    }

    /// Path of the best-so-far file.
    pub fn final_path(&self) -> PathBuf {
        self.dir.join("final_model.json")
    }

    /// Write `ckpt` to `model_<iteration>.json` and `final_model.json`.
    pub fn write(&self, ckpt: &Checkpoint) -> TrainResult<PathBuf> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            TrainError::checkpoint(format!("cannot create checkpoint directory: {e}"), &self.dir)
        })?;
        let path = self.iteration_path(ckpt.iteration);
        ckpt.save_to_file(&path)?;
        ckpt.save_to_file(&self.final_path())?;
        debug!(path = %path.display(), "checkpoint files written");
        info!(iteration = ckpt.iteration, valid_loss = ckpt.valid_loss, "saved checkpoint");
        Ok(path)
    }
}
