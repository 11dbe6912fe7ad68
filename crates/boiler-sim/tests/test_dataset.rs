//! Integration tests for [`boiler_sim::dataset`].
//!
//! Window tests use tables whose values encode their own row and column, so
//! contiguity and ordering can be read straight off the windows. Tests that
//! need files use [`tempfile::TempDir`].

use boiler_sim::cell::CellConfig;
use boiler_sim::config::TrainingConfig;
use boiler_sim::dataset::{
    build_windows, epoch_batches, sequential_batches, split, BoilerDataset, BoilerTable,
    SyntheticBoilerTable, TargetPolicy, Targets,
};
use boiler_sim::error::{ConfigError, DatasetError, TrainError};
use boiler_sim::partition::{ColumnGrouping, PartitionLayout};
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `value[t, k] = 1000 t + k`.
fn indexed(len: usize, width: usize) -> Array2<f32> {
    Array2::from_shape_fn((len, width), |(t, k)| (1000 * t + k) as f32)
}

fn row_of(v: f32) -> usize {
    (v / 1000.0).floor() as usize
}

fn tiny_layout() -> PartitionLayout {
    PartitionLayout {
        external: 1,
        coaler_state: 2,
        burner_state: 1,
        steamer_state: 1,
        coaler_action: 1,
        burner_action: 1,
        steamer_action: 1,
    }
}

fn tiny_config() -> TrainingConfig {
    let layout = tiny_layout();
    TrainingConfig {
        grouping: ColumnGrouping::identity(&layout),
        cell: CellConfig { input_size: 8, layout, num_units: vec![2, 2, 2], ..CellConfig::default() },
        history_length: 3,
        timestamp_column: "ts".to_string(),
        ..TrainingConfig::default()
    }
}

// ---------------------------------------------------------------------------
// build_windows
// ---------------------------------------------------------------------------

/// `L` rows and history `H` give `L - H` windows of shape `(H, width)`, each
/// covering consecutive rows in their original order.
#[test]
fn windows_are_contiguous_and_ordered() {
    for (len, h) in [(10usize, 3usize), (5, 1), (12, 11)] {
        let rows = indexed(len, 4);
        let w = build_windows(rows.view(), h, 0..2, TargetPolicy::SingleStep).expect("enough rows");
        assert_eq!(w.len(), len - h);
        assert_eq!(w.inputs.shape(), &[len - h, h, 4]);
        for i in 0..w.len() {
            for t in 0..h {
                assert_eq!(row_of(w.inputs[[i, t, 0]]), i + t, "window {i} step {t}");
            }
        }
    }
}

/// Single-step targets are the target columns of the row after each window.
#[test]
fn single_step_targets() {
    let rows = indexed(8, 5);
    let w = build_windows(rows.view(), 3, 1..4, TargetPolicy::SingleStep).expect("enough rows");
    let Targets::SingleStep(y) = &w.targets else { panic!("expected single-step targets") };
    assert_eq!(y.shape(), &[5, 3]);
    for i in 0..5 {
        assert_eq!(y.row(i).to_vec(), vec![
            (1000 * (i + 3) + 1) as f32,
            (1000 * (i + 3) + 2) as f32,
            (1000 * (i + 3) + 3) as f32,
        ]);
    }
}

/// Shifted targets supervise every window position with the next row.
#[test]
fn shifted_sequence_targets() {
    let rows = indexed(7, 3);
    let w = build_windows(rows.view(), 4, 0..3, TargetPolicy::ShiftedSequence).expect("enough rows");
    let Targets::ShiftedSequence(y) = &w.targets else { panic!("expected shifted targets") };
    assert_eq!(y.shape(), &[3, 4, 3]);
    for i in 0..3 {
        for t in 0..4 {
            assert_eq!(row_of(y[[i, t, 0]]), i + t + 1);
        }
    }
}

/// A target range beyond the row is reported rather than clipped.
#[test]
fn target_out_of_range_is_rejected() {
    let rows = indexed(6, 3);
    let err = build_windows(rows.view(), 2, 1..4, TargetPolicy::SingleStep).unwrap_err();
    assert!(matches!(err, DatasetError::TargetOutOfRange { start: 1, end: 4, width: 3 }));
}

// ---------------------------------------------------------------------------
// split
// ---------------------------------------------------------------------------

/// Scenario: 10 rows, history 3, val_ratio 0.2 → 7 windows, 5 train, 2 valid,
/// and 5 batches of one per epoch.
#[test]
fn scenario_ten_rows() {
    let rows = indexed(10, 4);
    let w = build_windows(rows.view(), 3, 0..4, TargetPolicy::SingleStep).expect("enough rows");
    assert_eq!(w.len(), 7);
    let (train, valid) = split(&w, 0.2).expect("both sides non-empty");
    assert_eq!(train.len(), 5);
    assert_eq!(valid.len(), 2);
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    assert_eq!(epoch_batches(&train, 1, &mut rng).count(), 5);
}

/// Validation windows strictly follow training windows in time.
#[test]
fn split_is_chronological() {
    let rows = indexed(40, 2);
    let w = build_windows(rows.view(), 5, 0..2, TargetPolicy::SingleStep).expect("enough rows");
    let (train, valid) = split(&w, 0.25).expect("split");
    assert_eq!(train.len(), (35.0f64 * 0.75).floor() as usize);
    assert_eq!(train.offset, 0);
    assert_eq!(valid.offset, train.len());
    let last_train_start = row_of(train.inputs[[train.len() - 1, 0, 0]]);
    let first_valid_start = row_of(valid.inputs[[0, 0, 0]]);
    assert!(first_valid_start > last_train_start);
}

/// Ratios outside `[0, 1)` are configuration errors; ratios that empty a side
/// are degenerate-dataset errors.
#[test]
fn split_failures() {
    let rows = indexed(6, 2);
    let w = build_windows(rows.view(), 2, 0..2, TargetPolicy::SingleStep).expect("enough rows");
    assert!(matches!(split(&w, 1.0), Err(TrainError::Config(ConfigError::InvalidValue { .. }))));
    assert!(matches!(split(&w, -0.5), Err(TrainError::Config(_))));
    assert!(matches!(
        split(&w, 0.0),
        Err(TrainError::Dataset(DatasetError::EmptySplit { side: "validation", .. }))
    ));
    assert!(matches!(
        split(&w, 0.9),
        Err(TrainError::Dataset(DatasetError::EmptySplit { side: "training", .. }))
    ));
}

// ---------------------------------------------------------------------------
// epoch_batches
// ---------------------------------------------------------------------------

/// `N / batch_size` batches per call; the covered windows are everything but
/// the dropped remainder, and batch contents stay in order.
#[test]
fn epoch_batches_cover_all_but_remainder() {
    let rows = indexed(26, 2);
    let w = build_windows(rows.view(), 3, 0..2, TargetPolicy::SingleStep).expect("enough rows");
    assert_eq!(w.len(), 23);
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let mut covered = BTreeSet::new();
    let mut count = 0;
    for batch in epoch_batches(&w, 4, &mut rng) {
        count += 1;
        assert_eq!(batch.len(), 4);
        for b in 0..4 {
            assert_eq!(row_of(batch.inputs[[b, 0, 0]]), batch.start + b);
            covered.insert(batch.start + b);
        }
    }
    assert_eq!(count, 23 / 4);
    assert_eq!(covered, (0..20).collect::<BTreeSet<_>>());
}

/// Each call reshuffles the batch order.
#[test]
fn epoch_batches_reshuffle_per_call() {
    let rows = indexed(60, 2);
    let w = build_windows(rows.view(), 2, 0..2, TargetPolicy::SingleStep).expect("enough rows");
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let first: Vec<usize> = epoch_batches(&w, 2, &mut rng).map(|b| b.start).collect();
    let second: Vec<usize> = epoch_batches(&w, 2, &mut rng).map(|b| b.start).collect();
    assert_ne!(first, second);
    let ordered: Vec<usize> = sequential_batches(&w, 2).map(|b| b.start).collect();
    assert_eq!(ordered, (0..29).map(|j| 2 * j).collect::<Vec<_>>());
}

/// A batch larger than the set yields nothing.
#[test]
fn oversized_batch_yields_zero_batches() {
    let rows = indexed(6, 2);
    let w = build_windows(rows.view(), 2, 0..2, TargetPolicy::SingleStep).expect("enough rows");
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    assert_eq!(epoch_batches(&w, 5, &mut rng).len(), 0);
}

// ---------------------------------------------------------------------------
// CSV ingestion
// ---------------------------------------------------------------------------

fn write_csv(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("boiler.csv");
    std::fs::write(&path, body).expect("write csv");
    path
}

/// The timestamp column may sit anywhere; the other columns keep file order.
#[test]
fn csv_loads_values_in_file_order() {
    let tmp = TempDir::new().expect("tempdir");
    let path = write_csv(&tmp, "a,ts,b\n1.5,2022-01-01 00:00:00,2\n3,2022-01-01 00:00:01,-4e-1\n");
    let table = BoilerTable::from_csv(&path, "ts", 2).expect("valid csv");
    assert_eq!(table.len(), 2);
    assert_eq!(table.columns(), &["a".to_string(), "b".to_string()]);
    assert_eq!(table.timestamps()[1], "2022-01-01 00:00:01");
    assert_eq!(table.values().row(1).to_vec(), vec![3.0, -0.4]);
}

/// A short row is reported with its row number.
#[test]
fn csv_row_width_mismatch() {
    let tmp = TempDir::new().expect("tempdir");
    let path = write_csv(&tmp, "ts,a,b\nt0,1,2\nt1,3\n");
    match BoilerTable::from_csv(&path, "ts", 2) {
        Err(DatasetError::RowWidthMismatch { row: 1, found: 1, expected: 2 }) => {}
        other => panic!("expected RowWidthMismatch, got {other:?}"),
    }
}

/// A header with the wrong number of value columns is rejected up front.
#[test]
fn csv_header_width_mismatch() {
    let tmp = TempDir::new().expect("tempdir");
    let path = write_csv(&tmp, "ts,a,b,c\nt0,1,2,3\n");
    assert!(matches!(
        BoilerTable::from_csv(&path, "ts", 2),
        Err(DatasetError::HeaderWidthMismatch { found: 3, expected: 2 })
    ));
}

/// Non-numeric cells and a missing timestamp column are errors.
#[test]
fn csv_bad_cell_and_missing_timestamp() {
    let tmp = TempDir::new().expect("tempdir");
    let path = write_csv(&tmp, "ts,a\nt0,abc\n");
    assert!(matches!(
        BoilerTable::from_csv(&path, "ts", 1),
        Err(DatasetError::InvalidValue { row: 0, .. })
    ));
    assert!(matches!(
        BoilerTable::from_csv(&path, "时间戳", 1),
        Err(DatasetError::MissingTimestamp { .. })
    ));
}

// ---------------------------------------------------------------------------
// BoilerDataset
// ---------------------------------------------------------------------------

/// End to end: CSV → canonical columns → windows → chronological split.
#[test]
fn dataset_from_csv() {
    let tmp = TempDir::new().expect("tempdir");
    let mut body = String::from("ts");
    for k in 0..8 {
        body.push_str(&format!(",c{k}"));
    }
    body.push('\n');
    for t in 0..12 {
        body.push_str(&format!("t{t}"));
        for k in 0..8 {
            body.push_str(&format!(",{}", 0.01 * (t * 8 + k) as f32));
        }
        body.push('\n');
    }
    let path = write_csv(&tmp, &body);

    let ds = BoilerDataset::load(&path, &tiny_config()).expect("dataset");
    assert_eq!(ds.train.len() + ds.valid.len(), 9);
    assert_eq!(ds.train.len(), 7);
    assert_eq!(ds.train.targets.width(), tiny_layout().state_width());
    assert_eq!(ds.train.targets.width(), 4);
    assert_eq!(ds.columns.len(), 8);
}

/// A table of the wrong width cannot be turned into a dataset.
#[test]
fn dataset_rejects_wrong_width() {
    let table = SyntheticBoilerTable::new(20, 9).build();
    assert!(matches!(
        BoilerDataset::from_table(&table, &tiny_config()),
        Err(TrainError::Dataset(DatasetError::HeaderWidthMismatch { found: 9, expected: 8 }))
    ));
}
