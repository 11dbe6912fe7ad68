//! End-to-end tests for [`boiler_sim::trainer`] and [`boiler_sim::checkpoint`].
//!
//! Every run trains a tiny simulator on [`SyntheticBoilerTable`] data and
//! writes its checkpoints into a [`tempfile::TempDir`].

use boiler_sim::cell::CellConfig;
use boiler_sim::checkpoint::{BestLossTracker, Checkpoint};
use boiler_sim::config::TrainingConfig;
use boiler_sim::dataset::{BoilerDataset, SyntheticBoilerTable, TargetPolicy};
use boiler_sim::model::SimulatorModel;
use boiler_sim::partition::{ColumnGrouping, PartitionLayout};
use boiler_sim::trainer::{Trainer, TrainingSummary};
use ndarray::Axis;
use std::path::Path;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn tiny_config(dir: &Path) -> TrainingConfig {
    let layout = PartitionLayout {
        external: 2,
        coaler_state: 2,
        burner_state: 2,
        steamer_state: 2,
        coaler_action: 1,
        burner_action: 1,
        steamer_action: 1,
    };
    TrainingConfig {
        grouping: ColumnGrouping::identity(&layout),
        cell: CellConfig { input_size: 11, layout, num_units: vec![4, 4, 3], ..CellConfig::default() },
        history_length: 4,
        batch_size: 2,
        max_epoch: 3,
        learning_rate: 1e-2,
        save_log_iter: 1,
        display_iter: 3,
        checkpoint_dir: dir.to_path_buf(),
        ..TrainingConfig::default()
    }
}

fn train(cfg: TrainingConfig, rows: usize) -> (BoilerDataset, TrainingSummary) {
    let table = SyntheticBoilerTable::new(rows, cfg.cell.input_size).build();
    let ds = BoilerDataset::from_table(&table, &cfg).expect("dataset");
    let summary = Trainer::new(cfg).expect("trainer").run(&ds).expect("run");
    (ds, summary)
}

// ---------------------------------------------------------------------------
// Training loop
// ---------------------------------------------------------------------------

/// Iteration count is `max_epoch * (train / batch_size)` and validation runs
/// on every `display_iter`-th iteration.
#[test]
fn iteration_and_validation_cadence() {
    let tmp = TempDir::new().expect("tempdir");
    let (ds, summary) = train(tiny_config(tmp.path()), 44);

    let per_epoch = ds.train.len() / 2;
    assert_eq!(summary.iterations, 3 * per_epoch);
    assert_eq!(summary.history.len(), summary.iterations);
    for record in &summary.history {
        assert_eq!(record.valid.is_some(), record.iteration % 3 == 0, "iteration {}", record.iteration);
        assert_eq!(record.epoch, (record.iteration - 1) / per_epoch);
    }
}

/// A checkpoint is written exactly when the validation loss is strictly
/// lower than every loss before it, and the first validation always saves.
#[test]
fn checkpoints_follow_strict_improvement() {
    let tmp = TempDir::new().expect("tempdir");
    let (_, summary) = train(tiny_config(tmp.path()), 44);

    let mut best = f32::INFINITY;
    let mut first = true;
    for record in summary.history.iter().filter(|r| r.valid.is_some()) {
        let loss = record.valid.map(|v| v.mse).unwrap_or(f32::NAN);
        let file = tmp.path().join(format!("model_{}.json", record.iteration));
        if first {
            assert!(record.saved, "first validation must save");
            first = false;
        }
        assert_eq!(record.saved, loss < best);
        assert_eq!(file.exists(), record.saved);
        best = best.min(loss);
    }
    assert_eq!(summary.best_valid_loss, best);

    let last_saved = summary.history.iter().filter(|r| r.saved).last().expect("one save");
    let final_ckpt =
        Checkpoint::load_from_file(&tmp.path().join("final_model.json")).expect("final checkpoint");
    assert_eq!(final_ckpt.iteration, last_saved.iteration);
    let expected = tmp.path().join(format!("model_{}.json", last_saved.iteration));
    assert_eq!(summary.best_checkpoint.as_deref(), Some(expected.as_path()));
}

/// A validation cadence beyond the run length trains but never checkpoints.
#[test]
fn no_checkpoint_when_validation_never_runs() {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = TrainingConfig { display_iter: 10_000, ..tiny_config(tmp.path()) };
    let (_, summary) = train(cfg, 44);

    assert!(summary.history.iter().all(|r| r.valid.is_none() && !r.saved));
    assert!(summary.best_valid_loss.is_infinite());
    assert!(summary.best_checkpoint.is_none());
    assert!(!tmp.path().join("final_model.json").exists());
}

/// Same seed, same history.
#[test]
fn runs_are_reproducible() {
    let a = TempDir::new().expect("tempdir");
    let b = TempDir::new().expect("tempdir");
    let (_, first) = train(TrainingConfig { keep_prob: 0.8, ..tiny_config(a.path()) }, 40);
    let (_, second) = train(TrainingConfig { keep_prob: 0.8, ..tiny_config(b.path()) }, 40);
    assert_eq!(first.history, second.history);
}

/// Longer training lowers the validation loss below its first value.
#[test]
fn training_reduces_validation_loss() {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = TrainingConfig { max_epoch: 15, display_iter: 5, ..tiny_config(tmp.path()) };
    let (_, summary) = train(cfg, 60);

    let first = summary
        .history
        .iter()
        .find_map(|r| r.valid.map(|v| v.mse))
        .expect("validation ran");
    assert!(summary.best_valid_loss < first, "best {} vs first {first}", summary.best_valid_loss);
}

/// Shifted-sequence targets train end to end as well.
#[test]
fn shifted_sequence_policy_trains() {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = TrainingConfig { target_policy: TargetPolicy::ShiftedSequence, ..tiny_config(tmp.path()) };
    let (_, summary) = train(cfg, 44);
    assert!(summary.best_valid_loss.is_finite());
    assert!(summary.history.iter().all(|r| r.train.total.is_finite()));
}

// ---------------------------------------------------------------------------
// Restoring and predicting
// ---------------------------------------------------------------------------

/// The final checkpoint restores a model that reproduces the saved
/// validation loss and predicts one state row per window.
#[test]
fn checkpoint_restores_model() {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = tiny_config(tmp.path());
    let (ds, _) = train(cfg, 44);

    let ckpt = Checkpoint::load_from_file(&tmp.path().join("final_model.json")).expect("checkpoint");
    let model = SimulatorModel::from_checkpoint(&ckpt).expect("shapes match");

    let usable = ds.valid.len() / 2 * 2;
    let valid = ds.valid.slice(0..usable);
    let loss = model.loss(valid.inputs.view(), &valid.targets).expect("loss");
    approx::assert_abs_diff_eq!(loss, ckpt.valid_loss, epsilon = 1e-5);

    let next = model.predict(ds.valid.inputs.index_axis(Axis(0), 0)).expect("predict");
    assert_eq!(next.len(), 6);
    assert!(next.iter().all(|&v| v > 0.0 && v < 1.0));
}

/// `metrics.csv` has a header plus one row per record.
#[test]
fn metrics_csv_has_one_row_per_record() {
    let tmp = TempDir::new().expect("tempdir");
    let (_, summary) = train(tiny_config(tmp.path()), 44);
    let path = tmp.path().join("metrics.csv");
    summary.write_metrics_csv(&path).expect("write");

    let text = std::fs::read_to_string(&path).expect("read");
    let mut lines = text.lines();
    let header = lines.next().expect("header");
    assert!(header.starts_with("iteration,epoch,learning_rate,train_loss"));
    assert_eq!(lines.count(), summary.history.len());
}

// ---------------------------------------------------------------------------
// BestLossTracker
// ---------------------------------------------------------------------------

/// Ties and regressions do not count.
#[test]
fn tracker_requires_strict_improvement() {
    let mut t = BestLossTracker::new();
    assert!(t.observe(0.5));
    assert!(!t.observe(0.5));
    assert!(!t.observe(0.7));
    assert!(t.observe(0.4));
    assert_eq!(t.best(), 0.4);
    assert_eq!(t.observed(), 4);
}

/// A NaN validation loss is skipped: it neither saves nor stops a later,
/// lower loss from saving.
#[test]
fn tracker_recovers_after_nan_loss() {
    let mut t = BestLossTracker::new();
    assert!(t.observe(0.5));
    assert!(!t.observe(f32::NAN));
    assert_eq!(t.best(), 0.5);
    assert!(t.observe(0.1), "a finite improvement after NaN must save");
    assert!(!t.observe(0.3));
    assert_eq!(t.best(), 0.1);
}
