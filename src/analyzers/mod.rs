//! Density labeling.
//!
//! This module reduces each dataset file to its average vehicle count per
//! timestep, derives quantile thresholds across the whole directory, and
//! assigns every file an ordinal density class.

pub mod classify;
pub mod density;
pub mod labeler;
pub mod types;
pub mod utility;
