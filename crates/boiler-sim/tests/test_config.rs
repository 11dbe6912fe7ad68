//! Integration tests for [`boiler_sim::config`].
//!
//! Tests that touch the filesystem use [`tempfile::TempDir`].

use boiler_sim::cell::{Activation, CellConfig};
use boiler_sim::config::TrainingConfig;
use boiler_sim::dataset::TargetPolicy;
use boiler_sim::error::ConfigError;
use boiler_sim::optim::OptimizerKind;
use boiler_sim::partition::{ColumnGrouping, PartitionLayout, Region};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// The default configuration describes the 202-column boiler export.
#[test]
fn default_describes_boiler_export() {
    let cfg = TrainingConfig::default();
    cfg.validate().expect("default config must be valid");

    assert_eq!(cfg.cell.input_size, 202);
    assert_eq!(cfg.cell.layout.total_width(), 202);
    assert_eq!(cfg.cell.num_units, vec![128, 128, 64]);
    assert_eq!(cfg.cell.activation, Activation::Tanh);
    assert!((cfg.cell.forget_bias - 1.0).abs() < 1e-12);
    assert_eq!(cfg.optimizer, OptimizerKind::Adam);
    assert_eq!(cfg.target_policy, TargetPolicy::SingleStep);
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Region sizes that do not add up to the row width are a configuration error.
#[test]
fn partition_width_mismatch_is_rejected() {
    let mut cfg = TrainingConfig::default();
    cfg.cell.layout.external = 12;
    match cfg.validate() {
        Err(ConfigError::PartitionWidth { expected: 202, actual: 203 }) => {}
        other => panic!("expected PartitionWidth, got {other:?}"),
    }
}

/// `num_units` must name exactly three stages.
#[test]
fn num_units_must_have_three_entries() {
    for units in [vec![], vec![64], vec![64, 64], vec![64, 64, 64, 64]] {
        let mut cfg = TrainingConfig::default();
        cfg.cell.num_units = units.clone();
        assert!(
            matches!(cfg.validate(), Err(ConfigError::InvalidValue { field: "cell.num_units", .. })),
            "num_units={units:?} must be rejected"
        );
    }
}

/// A grouping that selects a raw column twice is rejected before training.
#[test]
fn duplicate_raw_column_is_rejected() {
    let mut cfg = TrainingConfig::default();
    let steamer_action = cfg
        .grouping
        .regions
        .iter_mut()
        .find(|rc| rc.region == Region::SteamerAction)
        .expect("default grouping lists every region");
    steamer_action.ranges = vec![192..195, 0..1];
    assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateColumn { index: 0 })));
}

/// Each numeric hyper-parameter is range-checked.
#[test]
fn numeric_ranges_are_checked() {
    let base = TrainingConfig::default();
    let bad = [
        TrainingConfig { history_length: 0, ..base.clone() },
        TrainingConfig { batch_size: 0, ..base.clone() },
        TrainingConfig { max_epoch: 0, ..base.clone() },
        TrainingConfig { grad_clip: 0.0, ..base.clone() },
        TrainingConfig { learning_rate: -1e-3, ..base.clone() },
        TrainingConfig { learning_rate_decay: 1.5, ..base.clone() },
        TrainingConfig { keep_prob: 1.2, ..base.clone() },
        TrainingConfig { l2_weight: -0.1, ..base.clone() },
        TrainingConfig { save_log_iter: 0, ..base.clone() },
        TrainingConfig { display_iter: 0, ..base.clone() },
        TrainingConfig { timestamp_column: String::new(), ..base.clone() },
    ];
    for (i, cfg) in bad.iter().enumerate() {
        assert!(cfg.validate().is_err(), "case {i} must be rejected");
    }
}

/// A small custom layout with an identity grouping is valid.
#[test]
fn custom_layout_with_identity_grouping() {
    let layout = PartitionLayout {
        external: 2,
        coaler_state: 3,
        burner_state: 3,
        steamer_state: 2,
        coaler_action: 1,
        burner_action: 1,
        steamer_action: 1,
    };
    let cfg = TrainingConfig {
        grouping: ColumnGrouping::identity(&layout),
        cell: CellConfig { input_size: 13, layout, num_units: vec![4, 4, 2], ..CellConfig::default() },
        ..TrainingConfig::default()
    };
    cfg.validate().expect("identity grouping over a matching layout is valid");
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// `to_json` followed by `from_json` reproduces the configuration exactly.
#[test]
fn json_round_trip_preserves_every_field() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("cfg").join("train.json");
    let mut original = TrainingConfig {
        target_policy: TargetPolicy::ShiftedSequence,
        optimizer: OptimizerKind::Sgd,
        keep_prob: 0.9,
        l2_weight: 1e-4,
        seed: 7,
        ..TrainingConfig::default()
    };
    original.cell.activation = Activation::Relu;

    original.to_json(&path).expect("write");
    let loaded = TrainingConfig::from_json(&path).expect("read");
    assert_eq!(loaded, original);
}

/// A file that parses but fails validation is rejected by `from_json`.
#[test]
fn from_json_validates() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("bad.json");
    std::fs::write(&path, r#"{ "val_ratio": 1.5 }"#).expect("write");
    assert!(matches!(
        TrainingConfig::from_json(&path),
        Err(ConfigError::InvalidValue { field: "val_ratio", .. })
    ));
}

/// A missing file reports the path it tried to read.
#[test]
fn missing_file_is_file_read_error() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("absent.json");
    match TrainingConfig::from_json(&path) {
        Err(ConfigError::FileRead { path: p, .. }) => assert_eq!(p, path),
        other => panic!("expected FileRead, got {other:?}"),
    }
}
