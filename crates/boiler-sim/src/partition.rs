//! Column partitioning for boiler rows.
//!
//! A raw boiler table arrives with its sensor and actuator columns in the
//! order the plant historian exported them. Every downstream component
//! expects the **canonical** order instead: seven contiguous regions
//!
//! ```text
//! ┌──────────┬──────────────┬──────────────┬───────────────┬───────────────┬───────────────┬────────────────┐
//! │ external │ coaler_state │ burner_state │ steamer_state │ coaler_action │ burner_action │ steamer_action │
//! │    11    │      68      │      62      │      17       │      21       │      19       │       4        │
//! └──────────┴──────────────┴──────────────┴───────────────┴───────────────┴───────────────┴────────────────┘
//! ```
//!
//! [`PartitionLayout`] declares the region sizes (and therefore offsets),
//! [`ColumnGrouping`] lists which raw column indices belong to each region,
//! and [`ColumnPartitioner`] checks once, at startup, that the grouping is a
//! bijection onto the declared width before producing the reordering.

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::{ConfigError, DatasetError};

// ---------------------------------------------------------------------------
// Region / Stage
// ---------------------------------------------------------------------------

/// One of the seven semantic column regions of a canonical row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    /// Ambient / external inputs shared by the whole plant.
    External,
    /// Coal pulverizing state.
    CoalerState,
    /// Combustion state.
    BurnerState,
    /// Steam circulation state.
    SteamerState,
    /// Coal pulverizing actuator settings.
    CoalerAction,
    /// Combustion actuator settings.
    BurnerAction,
    /// Steam circulation actuator settings.
    SteamerAction,
}

impl Region {
    /// All regions in canonical order.
    pub const ALL: [Region; 7] = [
        Region::External,
        Region::CoalerState,
        Region::BurnerState,
        Region::SteamerState,
        Region::CoalerAction,
        Region::BurnerAction,
        Region::SteamerAction,
    ];

    /// Snake-case name, as used in configuration files and error messages.
    pub fn name(self) -> &'static str {
        match self {
            Region::External => "external",
            Region::CoalerState => "coaler_state",
            Region::BurnerState => "burner_state",
            Region::SteamerState => "steamer_state",
            Region::CoalerAction => "coaler_action",
            Region::BurnerAction => "burner_action",
            Region::SteamerAction => "steamer_action",
        }
    }
}

/// One of the three physically coupled boiler subsystems.
///
/// Stages are evaluated in [`Stage::ALL`] order within every time step; each
/// stage after the first is conditioned on its upstream neighbour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Coal pulverizing.
    Coaler,
    /// Combustion.
    Burner,
    /// Steam circulation.
    Steamer,
}

impl Stage {
    /// All stages in evaluation order.
    pub const ALL: [Stage; 3] = [Stage::Coaler, Stage::Burner, Stage::Steamer];

    /// Position of this stage in [`Stage::ALL`].
    pub fn index(self) -> usize {
        match self {
            Stage::Coaler => 0,
            Stage::Burner => 1,
            Stage::Steamer => 2,
        }
    }

    /// Lower-case stage name.
    pub fn name(self) -> &'static str {
        match self {
            Stage::Coaler => "coaler",
            Stage::Burner => "burner",
            Stage::Steamer => "steamer",
        }
    }

    /// The stage whose fresh hidden vector feeds this one, if any.
    pub fn upstream(self) -> Option<Stage> {
        match self {
            Stage::Coaler => None,
            Stage::Burner => Some(Stage::Coaler),
            Stage::Steamer => Some(Stage::Burner),
        }
    }

    /// The state region this stage predicts.
    pub fn state_region(self) -> Region {
        match self {
            Stage::Coaler => Region::CoalerState,
            Stage::Burner => Region::BurnerState,
            Stage::Steamer => Region::SteamerState,
        }
    }

    /// Regions concatenated, in order, to form this stage's input group.
    ///
    /// The external inputs enter the plant at the coal mills, so only the
    /// coaler sees them directly.
    pub fn input_regions(self) -> &'static [Region] {
        match self {
            Stage::Coaler => &[Region::External, Region::CoalerState, Region::CoalerAction],
            Stage::Burner => &[Region::BurnerState, Region::BurnerAction],
            Stage::Steamer => &[Region::SteamerState, Region::SteamerAction],
        }
    }
}

// ---------------------------------------------------------------------------
// PartitionLayout
// ---------------------------------------------------------------------------

/// Sizes of the seven canonical regions.
///
/// Offsets follow from the sizes: each region starts where the previous one
/// (in [`Region::ALL`] order) ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLayout {
    /// External inputs. Default: **11**.
    pub external: usize,
    /// Coal pulverizing state. Default: **68**.
    pub coaler_state: usize,
    /// Combustion state. Default: **62**.
    pub burner_state: usize,
    /// Steam circulation state. Default: **17**.
    pub steamer_state: usize,
    /// Coal pulverizing actions. Default: **21**.
    pub coaler_action: usize,
    /// Combustion actions. Default: **19**.
    pub burner_action: usize,
    /// Steam circulation actions. Default: **4**.
    pub steamer_action: usize,
}

impl Default for PartitionLayout {
    fn default() -> Self {
        PartitionLayout {
            external: 11,
            coaler_state: 68,
            burner_state: 62,
            steamer_state: 17,
            coaler_action: 21,
            burner_action: 19,
            steamer_action: 4,
        }
    }
}

impl PartitionLayout {
    /// Number of columns in `region`.
    pub fn size(&self, region: Region) -> usize {
        match region {
            Region::External => self.external,
            Region::CoalerState => self.coaler_state,
            Region::BurnerState => self.burner_state,
            Region::SteamerState => self.steamer_state,
            Region::CoalerAction => self.coaler_action,
            Region::BurnerAction => self.burner_action,
            Region::SteamerAction => self.steamer_action,
        }
    }

    /// Column offset of `region` in a canonical row.
    pub fn offset(&self, region: Region) -> usize {
        Region::ALL
            .iter()
            .take_while(|&&r| r != region)
            .map(|&r| self.size(r))
            .sum()
    }

    /// Column range of `region` in a canonical row.
    pub fn span(&self, region: Region) -> Range<usize> {
        let start = self.offset(region);
        start..start + self.size(region)
    }

    /// Total canonical row width.
    pub fn total_width(&self) -> usize {
        Region::ALL.iter().map(|&r| self.size(r)).sum()
    }

    /// Range of the three state regions, which are contiguous in canonical
    /// order (coaler, burner, steamer).
    pub fn state_range(&self) -> Range<usize> {
        self.span(Region::CoalerState).start..self.span(Region::SteamerState).end
    }

    /// Width of the full state vector (the prediction target).
    pub fn state_width(&self) -> usize {
        self.state_range().len()
    }

    /// Width of the state region owned by `stage`.
    pub fn stage_state_width(&self, stage: Stage) -> usize {
        self.size(stage.state_region())
    }

    /// Column range of `stage`'s state within the state vector (not the row).
    pub fn stage_state_range(&self, stage: Stage) -> Range<usize> {
        let base = self.state_range().start;
        let span = self.span(stage.state_region());
        span.start - base..span.end - base
    }

    /// Width of `stage`'s input group.
    pub fn stage_input_width(&self, stage: Stage) -> usize {
        stage.input_regions().iter().map(|&r| self.size(r)).sum()
    }

    /// Check that the regions add up to `row_width` and that every state
    /// region is non-empty.
    ///
    /// # Errors
    ///
    /// [`ConfigError::PartitionWidth`] when the sizes do not sum to
    /// `row_width`; [`ConfigError::InvalidValue`] for an empty state region.
    pub fn validate(&self, row_width: usize) -> Result<(), ConfigError> {
        let total = self.total_width();
        if total != row_width {
            return Err(ConfigError::PartitionWidth { expected: row_width, actual: total });
        }
        for stage in Stage::ALL {
            if self.stage_state_width(stage) == 0 {
                return Err(ConfigError::invalid_value(
                    "layout",
                    format!("{} must be > 0", stage.state_region().name()),
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ColumnGrouping
// ---------------------------------------------------------------------------

/// Raw-column index ranges that make up one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionColumns {
    /// Target region.
    pub region: Region,
    /// Raw column ranges, concatenated in order.
    pub ranges: Vec<Range<usize>>,
}

/// Declares where each canonical region's columns live in the raw table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnGrouping {
    /// One entry per region. Regions may be listed in any order but at most
    /// once each.
    pub regions: Vec<RegionColumns>,
}

impl Default for ColumnGrouping {
    fn default() -> Self {
        ColumnGrouping::boiler_default()
    }
}

impl ColumnGrouping {
    /// Grouping of the plant historian's 202-column export.
    pub fn boiler_default() -> Self {
        let group = |region, ranges: &[Range<usize>]| RegionColumns { region, ranges: ranges.to_vec() };
        ColumnGrouping {
            regions: vec![
                group(Region::External, &[51..52, 53..59, 60..61, 62..63, 150..152]),
                group(Region::CoalerState, &[0..50, 52..53, 122..139]),
                group(
                    Region::BurnerState,
                    &[50..51, 59..60, 61..62, 63..101, 112..114, 118..122, 139..145, 146..149, 152..158],
                ),
                group(Region::SteamerState, &[101..112, 114..118, 145..146, 149..150]),
                group(Region::CoalerAction, &[158..173, 196..202]),
                group(Region::BurnerAction, &[173..192]),
                group(Region::SteamerAction, &[192..196]),
            ],
        }
    }

    /// Grouping for a table whose raw order already is canonical.
    pub fn identity(layout: &PartitionLayout) -> Self {
        ColumnGrouping {
            regions: Region::ALL
                .iter()
                .map(|&region| RegionColumns { region, ranges: vec![layout.span(region)] })
                .collect(),
        }
    }

    /// Raw indices selected for `region`, in order. Empty if the region is
    /// not listed.
    pub fn columns(&self, region: Region) -> Vec<usize> {
        self.regions
            .iter()
            .filter(|rc| rc.region == region)
            .flat_map(|rc| rc.ranges.iter().cloned().flatten())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ColumnPartitioner
// ---------------------------------------------------------------------------

/// Verified mapping from raw column order to canonical order.
///
/// `order()[k]` is the raw index of canonical column `k`.
#[derive(Debug, Clone)]
pub struct ColumnPartitioner {
    layout: PartitionLayout,
    order: Vec<usize>,
}

impl ColumnPartitioner {
    /// Build the reordering and prove it is a bijection onto `raw_width`
    /// columns that matches `layout` region by region.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::PartitionWidth`] if the layout does not sum to `raw_width`.
    /// - [`ConfigError::InvalidValue`] if a region is listed twice.
    /// - [`ConfigError::ColumnOutOfRange`] for an index `>= raw_width`.
    /// - [`ConfigError::DuplicateColumn`] / [`ConfigError::MissingColumn`] if
    ///   the grouping is not a bijection.
    /// - [`ConfigError::RegionSize`] if a region selects the wrong count.
    pub fn new(
        grouping: &ColumnGrouping,
        layout: &PartitionLayout,
        raw_width: usize,
    ) -> Result<Self, ConfigError> {
        layout.validate(raw_width)?;

        for (i, rc) in grouping.regions.iter().enumerate() {
            if grouping.regions[..i].iter().any(|prev| prev.region == rc.region) {
                return Err(ConfigError::invalid_value(
                    "grouping",
                    format!("region `{}` is listed more than once", rc.region.name()),
                ));
            }
        }

        let per_region: Vec<Vec<usize>> =
            Region::ALL.iter().map(|&r| grouping.columns(r)).collect();

        let mut seen = vec![false; raw_width];
        for &index in per_region.iter().flatten() {
            if index >= raw_width {
                return Err(ConfigError::ColumnOutOfRange { index, width: raw_width });
            }
            if seen[index] {
                return Err(ConfigError::DuplicateColumn { index });
            }
            seen[index] = true;
        }
        if let Some(index) = seen.iter().position(|&s| !s) {
            return Err(ConfigError::MissingColumn { index });
        }

        for (&region, cols) in Region::ALL.iter().zip(&per_region) {
            let expected = layout.size(region);
            if cols.len() != expected {
                return Err(ConfigError::RegionSize {
                    region: region.name(),
                    expected,
                    actual: cols.len(),
                });
            }
        }

        Ok(ColumnPartitioner { layout: layout.clone(), order: per_region.concat() })
    }

    /// The layout this partitioner was validated against.
    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    /// Raw index of each canonical column.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Row width (raw and canonical are equal).
    pub fn width(&self) -> usize {
        self.order.len()
    }

    /// Reorder a single raw row.
    pub fn reorder_row(&self, raw: &[f32]) -> Result<Vec<f32>, DatasetError> {
        if raw.len() != self.width() {
            return Err(DatasetError::RowWidthMismatch {
                row: 0,
                found: raw.len(),
                expected: self.width(),
            });
        }
        Ok(self.order.iter().map(|&i| raw[i]).collect())
    }

    /// Reorder every row of a raw table into canonical column order.
    pub fn reorder_table(&self, raw: ArrayView2<'_, f32>) -> Result<Array2<f32>, DatasetError> {
        if raw.ncols() != self.width() {
            return Err(DatasetError::RowWidthMismatch {
                row: 0,
                found: raw.ncols(),
                expected: self.width(),
            });
        }
        Ok(raw.select(Axis(1), &self.order))
    }

    /// Reorder column names the same way as the values.
    pub fn reorder_names<S: AsRef<str>>(&self, names: &[S]) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|&i| names.get(i).map(|n| n.as_ref().to_string()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
