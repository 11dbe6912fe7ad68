//! # Boiler Simulator
//!
//! This crate learns the dynamics of an industrial boiler from historical
//! sensor and actuator readings. Three physically coupled subsystems (coal
//! pulverizing, combustion and steam circulation) are modelled by a single
//! recurrent cell whose stages feed each other within every time step.
//!
//! ## Architecture
//!
//! ```text
//! TrainingConfig ──► Trainer ──► SimulatorModel ──► cell::step (coaler → burner → steamer)
//!       │               │                │
//!       │         BoilerDataset      init::orthogonal
//!       │               │
//!       │        build_windows / split / epoch_batches
//!       │               │
//!       │        ColumnPartitioner (raw → canonical columns)
//!       │               │
//!       │        BoilerTable (CSV | SyntheticBoilerTable)
//!       │
//!       └──► losses / metrics / optim / checkpoint
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use boiler_sim::config::TrainingConfig;
//! use boiler_sim::dataset::{BoilerDataset, SyntheticBoilerTable};
//! use boiler_sim::trainer::Trainer;
//!
//! let config = TrainingConfig::default();
//! config.validate().expect("config is valid");
//!
//! // Deterministic stand-in for a plant export.
//! let table = SyntheticBoilerTable::new(500, config.cell.input_size).build();
//! let dataset = BoilerDataset::from_table(&table, &config).unwrap();
//!
//! let mut trainer = Trainer::new(config).unwrap();
//! let summary = trainer.run(&dataset).unwrap();
//! println!("best validation loss: {}", summary.best_valid_loss);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cell;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod init;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod partition;
pub mod trainer;

// Convenient re-exports at the crate root.
pub use cell::{CellConfig, CellState, ModelParameters};
pub use config::TrainingConfig;
pub use dataset::{BoilerDataset, BoilerTable, SyntheticBoilerTable, TargetPolicy};
pub use error::{ConfigError, DatasetError, ModelError, TrainError, TrainResult};
pub use model::SimulatorModel;
pub use partition::{ColumnGrouping, ColumnPartitioner, PartitionLayout, Region, Stage};
pub use trainer::{Trainer, TrainingSummary};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
