//! Data types used by the labeling pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LabelError;

const MEDIAN: [f64; 1] = [0.5];
const TERTILES: [f64; 2] = [1.0 / 3.0, 2.0 / 3.0];

/// Number of density classes a run assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DensityClasses {
    /// 0 = low, 1 = high
    Two,
    /// 0 = low, 1 = medium, 2 = high
    Three,
}

impl DensityClasses {
    pub fn count(self) -> u8 {
        match self {
            DensityClasses::Two => 2,
            DensityClasses::Three => 3,
        }
    }

    /// Quantile levels whose values separate the classes.
    pub fn quantile_levels(self) -> &'static [f64] {
        match self {
            DensityClasses::Two => &MEDIAN,
            DensityClasses::Three => &TERTILES,
        }
    }

    /// Human-readable meaning of each label.
    pub fn label_names(self) -> &'static [&'static str] {
        match self {
            DensityClasses::Two => &["low", "high"],
            DensityClasses::Three => &["low", "medium", "high"],
        }
    }
}

impl TryFrom<u8> for DensityClasses {
    type Error = LabelError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            2 => Ok(DensityClasses::Two),
            3 => Ok(DensityClasses::Three),
            other => Err(LabelError::Config(other)),
        }
    }
}

impl fmt::Display for DensityClasses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.count())
    }
}

/// Ascending cut points between density classes.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds(pub(crate) Vec<f64>);

impl Thresholds {
    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One output row: `path,label,avg_vehicles`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledRow {
    pub path: String,
    pub label: u8,
    pub avg_vehicles: f64,
}

/// Result of labeling a directory.
#[derive(Debug, Clone)]
pub struct DensityLabels {
    pub classes: DensityClasses,
    pub thresholds: Thresholds,
    pub rows: Vec<LabeledRow>,
}

impl DensityLabels {
    /// Number of rows per label, indexed by label.
    pub fn class_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.classes.count() as usize];
        for row in &self.rows {
            sizes[row.label as usize] += 1;
        }
        sizes
    }
}
