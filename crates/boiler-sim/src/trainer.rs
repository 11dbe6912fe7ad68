//! Training loop orchestrator.
//!
//! [`Trainer::run`] drives `max_epoch` passes over the training windows:
//!
//! 1. The learning rate for epoch `e` is `learning_rate · decay^e`.
//! 2. Each batch is unrolled through the cell, the loss (MSE + L2) and its
//!    gradients are computed, gradients are clipped by global norm and the
//!    optimizer applies them.
//! 3. Every `save_log_iter` iterations the training loss is logged.
//! 4. Every `display_iter` iterations the validation set is evaluated; a
//!    checkpoint is written when the validation loss is strictly lower than
//!    every validation loss seen before.
//!
//! All randomness (initialisation, shuffling, dropout) comes from one
//! ChaCha8 generator seeded from the configuration.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cell::ZeroStateCache;
use crate::checkpoint::{BestLossTracker, Checkpoint, CheckpointWriter};
use crate::config::TrainingConfig;
use crate::dataset::{epoch_batches, sequential_batches, Batch, BoilerDataset, WindowSet};
use crate::error::{DatasetError, TrainError, TrainResult};
use crate::losses::LossComponents;
use crate::metrics::{EvalReport, MetricsAccumulator};
use crate::model::SimulatorModel;
use crate::optim::{clip_by_global_norm, ExponentialDecay, Optimizer};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One logged point of the training history.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    /// Global iteration (1-based count of batches processed).
    pub iteration: usize,
    /// Zero-based epoch.
    pub epoch: usize,
    /// Learning rate in effect.
    pub learning_rate: f32,
    /// Loss of the batch that completed this iteration.
    pub train: LossComponents,
    /// Gradient norm before clipping.
    pub grad_norm: f32,
    /// Validation metrics, on `display_iter` iterations.
    pub valid: Option<EvalReport>,
    /// Whether a checkpoint was written at this iteration.
    pub saved: bool,
}

#[derive(Serialize)]
struct MetricRow {
    iteration: usize,
    epoch: usize,
    learning_rate: f32,
    train_loss: f32,
    train_mse: f32,
    grad_norm: f32,
    valid_mse: Option<f32>,
    valid_mae: Option<f32>,
    coaler_mse: Option<f32>,
    burner_mse: Option<f32>,
    steamer_mse: Option<f32>,
    saved: bool,
}

impl From<&MetricRecord> for MetricRow {
    fn from(r: &MetricRecord) -> Self {
        MetricRow {
            iteration: r.iteration,
            epoch: r.epoch,
            learning_rate: r.learning_rate,
            train_loss: r.train.total,
            train_mse: r.train.mse,
            grad_norm: r.grad_norm,
            valid_mse: r.valid.map(|v| v.mse),
            valid_mae: r.valid.map(|v| v.mae),
            coaler_mse: r.valid.map(|v| v.stage_mse[0]),
            burner_mse: r.valid.map(|v| v.stage_mse[1]),
            steamer_mse: r.valid.map(|v| v.stage_mse[2]),
            saved: r.saved,
        }
    }
}

/// Outcome of [`Trainer::run`].
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    /// Iterations performed.
    pub iterations: usize,
    /// Epochs completed.
    pub epochs: usize,
    /// Lowest validation loss seen (`+∞` if validation never ran).
    pub best_valid_loss: f32,
    /// Path of the most recent checkpoint, if any was written.
    pub best_checkpoint: Option<PathBuf>,
    /// Logged history.
    pub history: Vec<MetricRecord>,
}

impl TrainingSummary {
    /// Write the history as CSV, one row per record.
    pub fn write_metrics_csv(&self, path: &Path) -> TrainResult<()> {
        let mut wtr = csv::Writer::from_path(path).map_err(|e| TrainError::metrics_write(path, e))?;
        for record in &self.history {
            wtr.serialize(MetricRow::from(record))
                .map_err(|e| TrainError::metrics_write(path, e))?;
        }
        wtr.flush()
            .map_err(|e| TrainError::metrics_write(path, csv::Error::from(e)))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Orchestrates the full training loop: batching, forward and backward
/// pass, clipping, optimisation, validation and checkpointing.
pub struct Trainer {
    config: TrainingConfig,
    model: SimulatorModel,
    optimizer: Box<dyn Optimizer>,
    schedule: ExponentialDecay,
    rng: ChaCha8Rng,
    tracker: BestLossTracker,
    writer: CheckpointWriter,
    zero_states: ZeroStateCache,
    iteration: usize,
}

impl Trainer {
    /// Validate `config` and build a freshly initialised model.
    pub fn new(config: TrainingConfig) -> TrainResult<Self> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let model = SimulatorModel::new(config.cell.clone(), &mut rng)?;
        let lr = config.learning_rate as f32;
        info!(
            parameters = model.parameters().num_parameters(),
            units = ?config.cell.num_units,
            optimizer = ?config.optimizer,
            "initialised simulator"
        );
        Ok(Trainer {
            optimizer: config.optimizer.build(lr),
            schedule: ExponentialDecay { initial: lr, decay: config.learning_rate_decay as f32 },
            writer: CheckpointWriter::new(config.checkpoint_dir.clone()),
            tracker: BestLossTracker::new(),
            zero_states: ZeroStateCache::new(),
            iteration: 0,
            model,
            rng,
            config,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Model being trained.
    pub fn model(&self) -> &SimulatorModel {
        &self.model
    }

    /// Iterations performed so far.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Validation-loss record.
    pub fn tracker(&self) -> &BestLossTracker {
        &self.tracker
    }

    /// One optimisation step on `batch`. Returns the batch loss and the
    /// gradient norm before clipping.
    pub fn train_batch(&mut self, batch: &Batch) -> TrainResult<(LossComponents, f32)> {
        let (loss, mut grads) = self.model.loss_and_gradients(
            batch.inputs.view(),
            &batch.targets,
            self.config.keep_prob as f32,
            self.config.l2_weight as f32,
            &mut self.rng,
        )?;
        let norm = clip_by_global_norm(&mut grads, self.config.grad_clip as f32);
        self.optimizer.step(self.model.parameters_mut(), &grads);
        self.iteration += 1;
        Ok((loss, norm))
    }

    /// Evaluate the model on `windows` in chronological batches, without
    /// dropout.
    ///
    /// # Errors
    ///
    /// [`DatasetError::NoBatches`] if `windows` holds fewer windows than one
    /// batch.
    pub fn evaluate(&mut self, windows: &WindowSet) -> TrainResult<EvalReport> {
        let bs = self.config.batch_size;
        let mut acc = MetricsAccumulator::new(&self.config.cell.layout);
        for batch in sequential_batches(windows, bs) {
            let initial = self.zero_states.zero_state(&self.config.cell, bs);
            let pred = self.model.forward_from(batch.inputs.view(), batch.targets.policy(), initial)?;
            acc.update(&pred, &batch.targets);
        }
        acc.finalize().ok_or_else(|| {
            DatasetError::NoBatches { set: "validation", len: windows.len(), batch_size: bs }.into()
        })
    }

    /// Train on `dataset` for `max_epoch` epochs.
    ///
    /// # Errors
    ///
    /// [`DatasetError::NoBatches`] if either split is smaller than one batch;
    /// any model or checkpoint error encountered along the way.
    pub fn run(&mut self, dataset: &BoilerDataset) -> TrainResult<TrainingSummary> {
        let bs = self.config.batch_size;
        let per_epoch = dataset.train.len() / bs;
        if per_epoch == 0 {
            return Err(DatasetError::NoBatches { set: "training", len: dataset.train.len(), batch_size: bs }.into());
        }
        if dataset.valid.len() < bs {
            return Err(DatasetError::NoBatches { set: "validation", len: dataset.valid.len(), batch_size: bs }.into());
        }
        let total = per_epoch * self.config.max_epoch;
        if self.config.display_iter > total {
            warn!(
                display_iter = self.config.display_iter,
                total_iterations = total,
                "validation cadence exceeds the run length; no checkpoint will be written"
            );
        }
        info!(
            epochs = self.config.max_epoch,
            batches_per_epoch = per_epoch,
            train = dataset.train.len(),
            valid = dataset.valid.len(),
            "starting training"
        );

        let mut history = Vec::new();
        let mut best_checkpoint = None;
        for epoch in 0..self.config.max_epoch {
            let lr = self.schedule.rate(epoch);
            self.optimizer.set_learning_rate(lr);
            debug!(epoch, lr, "epoch start");

            for batch in epoch_batches(&dataset.train, bs, &mut self.rng) {
                let (loss, grad_norm) = self.train_batch(&batch)?;
                if !loss.total.is_finite() {
                    warn!(iteration = self.iteration, loss = loss.total, "non-finite training loss");
                }

                let log_now = self.iteration % self.config.save_log_iter == 0;
                let eval_now = self.iteration % self.config.display_iter == 0;
                if !log_now && !eval_now {
                    continue;
                }
                if log_now {
                    info!(iteration = self.iteration, epoch, lr, loss = loss.total, mse = loss.mse, grad_norm, "train");
                }

                let mut record = MetricRecord {
                    iteration: self.iteration,
                    epoch,
                    learning_rate: lr,
                    train: loss,
                    grad_norm,
                    valid: None,
                    saved: false,
                };
                if eval_now {
                    let report = self.evaluate(&dataset.valid)?;
                    record.saved = self.tracker.observe(report.mse);
                    if record.saved {
                        let ckpt = Checkpoint {
                            iteration: self.iteration,
                            epoch,
                            valid_loss: report.mse,
                            cell: self.config.cell.clone(),
                            params: self.model.parameters().clone(),
                        };
                        best_checkpoint = Some(self.writer.write(&ckpt)?);
                    }
                    info!(
                        iteration = self.iteration,
                        valid_loss = report.mse,
                        best = self.tracker.best(),
                        saved = record.saved,
                        "valid {}",
                        report.summary()
                    );
                    record.valid = Some(report);
                }
                history.push(record);
            }
        }

        info!(iterations = self.iteration, best_valid_loss = self.tracker.best(), "training finished");
        Ok(TrainingSummary {
            iterations: self.iteration,
            epochs: self.config.max_epoch,
            best_valid_loss: self.tracker.best(),
            best_checkpoint,
            history,
        })
    }
}
