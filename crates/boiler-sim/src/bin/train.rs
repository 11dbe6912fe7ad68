//! `train` binary — entry point for the boiler simulator training pipeline.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin train -- --config config.json --data boiler.csv
//! cargo run --bin train -- --dry-run --dry-run-rows 400
//! ```

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use boiler_sim::config::TrainingConfig;
use boiler_sim::dataset::{BoilerDataset, BoilerTable, SyntheticBoilerTable};
use boiler_sim::trainer::Trainer;

/// Command-line arguments for the training binary.
#[derive(Parser, Debug)]
#[command(
    name = "train",
    version,
    about = "Boiler simulator training pipeline",
    long_about = None
)]
struct Args {
    /// Path to the JSON configuration file.
    ///
    /// If not provided, the default `TrainingConfig` is used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// CSV export of the boiler history (timestamp column plus raw columns).
    #[arg(long, value_name = "FILE")]
    data: Option<PathBuf>,

    /// Override the checkpoint directory from the config.
    #[arg(long, value_name = "DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Use the deterministic synthetic table instead of real data.
    ///
    /// This is intended for pipeline smoke-tests only, not production training.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Number of synthetic rows when `--dry-run` is active.
    #[arg(long, default_value_t = 400)]
    dry_run_rows: usize,

    /// Log filter used when `RUST_LOG` is unset (e.g. `info`, `debug`,
    /// `boiler_sim=trace`).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    // Initialise logging. RUST_LOG takes precedence over --log-level.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("Boiler Simulator Training Pipeline v{}", boiler_sim::VERSION);

    // Load or construct training configuration.
    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            match TrainingConfig::from_json(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("Failed to load configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("No configuration file provided, using defaults");
            TrainingConfig::default()
        }
    };

    // Apply CLI overrides.
    if let Some(dir) = args.checkpoint_dir {
        config.checkpoint_dir = dir;
    }

    // Validate the final configuration.
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }

    info!("Configuration validated successfully");
    info!("  row width     : {}", config.cell.input_size);
    info!("  num units     : {:?}", config.cell.num_units);
    info!("  history length: {}", config.history_length);
    info!("  target policy : {:?}", config.target_policy);
    info!("  batch size    : {}", config.batch_size);
    info!("  learning rate : {} (decay {})", config.learning_rate, config.learning_rate_decay);
    info!("  epochs        : {}", config.max_epoch);

    // Build the table.
    let table = if args.dry_run {
        info!("DRY RUN, using synthetic table ({} rows)", args.dry_run_rows);
        SyntheticBoilerTable::new(args.dry_run_rows, config.cell.input_size).build()
    } else {
        let Some(path) = args.data.as_deref() else {
            error!("No --data file given (use --dry-run for a synthetic smoke test)");
            std::process::exit(1);
        };
        info!("Loading boiler history from {}", path.display());
        match BoilerTable::from_csv(path, &config.timestamp_column, config.cell.input_size) {
            Ok(t) => t,
            Err(e) => {
                error!("Failed to load data: {e}");
                std::process::exit(1);
            }
        }
    };

    let dataset = match BoilerDataset::from_table(&table, &config) {
        Ok(ds) => ds,
        Err(e) => {
            error!("Failed to build dataset: {e}");
            std::process::exit(1);
        }
    };

    run_trainer(config, &dataset);
}

/// Run the training loop and write `metrics.csv` next to the checkpoints.
fn run_trainer(config: TrainingConfig, dataset: &BoilerDataset) {
    info!("Initialising trainer");
    let metrics_path = config.checkpoint_dir.join("metrics.csv");
    let config_path = config.checkpoint_dir.join("config.json");

    if let Err(e) = config.to_json(&config_path) {
        error!("Failed to write configuration: {e}");
        std::process::exit(1);
    }

    let mut trainer = match Trainer::new(config) {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to initialise trainer: {e}");
            std::process::exit(1);
        }
    };

    let summary = match trainer.run(dataset) {
        Ok(s) => s,
        Err(e) => {
            error!("Training failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = summary.write_metrics_csv(&metrics_path) {
        error!("Failed to write metrics: {e}");
        std::process::exit(1);
    }

    info!("Training complete: {} iterations", summary.iterations);
    info!("  best validation loss: {}", summary.best_valid_loss);
    match &summary.best_checkpoint {
        Some(path) => info!("  best checkpoint     : {}", path.display()),
        None => info!("  no checkpoint written"),
    }
    info!("  metrics             : {}", metrics_path.display());
}
