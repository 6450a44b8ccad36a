use crate::analyzers::types::{DensityClasses, Thresholds};
use crate::analyzers::utility::quantile;

/// Computes the quantile thresholds that split `values` into roughly
/// balanced classes: the median for two classes, tertiles for three.
///
/// Returns `None` when `values` is empty.
pub fn make_thresholds(values: &[f64], classes: DensityClasses) -> Option<Thresholds> {
    classes
        .quantile_levels()
        .iter()
        .map(|q| quantile(values, *q))
        .collect::<Option<Vec<_>>>()
        .map(Thresholds)
}

/// Maps a density value to its class. Boundaries belong to the lower class.
///
/// | Thresholds | Value              | Class |
/// |------------|--------------------|-------|
/// | `[t]`      | `v <= t`           | 0     |
/// | `[t]`      | `v > t`            | 1     |
/// | `[t0, t1]` | `v <= t0`          | 0     |
/// | `[t0, t1]` | `t0 < v <= t1`     | 1     |
/// | `[t0, t1]` | `v > t1`           | 2     |
pub fn assign_class(value: f64, thresholds: &Thresholds) -> u8 {
    thresholds.values().iter().filter(|t| value > **t).count() as u8
}
