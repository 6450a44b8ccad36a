use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::analyzers::classify::{assign_class, make_thresholds};
use crate::analyzers::density::avg_vehicles;
use crate::analyzers::types::{DensityClasses, DensityLabels, LabeledRow};
use crate::config::LabelerConfig;
use crate::dataset::{SceneSource, TorchSceneSource, list_dataset_files};
use crate::error::{LabelError, Result};
use crate::output::write_labels;

/// Files between progress log lines.
const PROGRESS_EVERY: usize = 50;

/// Labels every `.pt` file in `dir` by vehicle density.
///
/// The class count is checked before the directory is touched.
pub fn label_directory(dir: &Path, class_count: u8) -> Result<DensityLabels> {
    let classes = DensityClasses::try_from(class_count)?;
    label_directory_with(&TorchSceneSource, dir, classes)
}

/// Labels every dataset file in `dir`, reading vehicle groups from `source`.
///
/// Runs in three phases: collect one statistic per file, derive the
/// thresholds from all statistics, then assign labels. Any file that fails
/// to load aborts the run.
#[tracing::instrument(skip_all, fields(dir = %dir.display(), classes = %classes))]
pub fn label_directory_with<S: SceneSource>(
    source: &S,
    dir: &Path,
    classes: DensityClasses,
) -> Result<DensityLabels> {
    let files = list_dataset_files(dir)?;
    info!(count = files.len(), "Found dataset files");

    let stats = collect_statistics(source, &files)?;
    label_statistics(stats, classes).ok_or_else(|| LabelError::NotFound(dir.to_path_buf()))
}

/// Computes the average vehicle count of each file, in order.
pub fn collect_statistics<S: SceneSource>(
    source: &S,
    files: &[PathBuf],
) -> Result<Vec<(PathBuf, f64)>> {
    let total = files.len();
    let mut stats = Vec::with_capacity(total);

    for (i, path) in files.iter().enumerate() {
        let group = source
            .vehicle_group(path)
            .map_err(|e| LabelError::load(path, e))?;

        if group.ptr.is_none() {
            warn!(
                path = %path.display(),
                num_nodes = group.num_nodes,
                "No per-timestep boundaries, using the total vehicle count"
            );
        }

        stats.push((path.clone(), avg_vehicles(&group)));

        let done = i + 1;
        if done % PROGRESS_EVERY == 0 || done == total {
            info!(done, total, "Processed dataset files");
        }
    }

    Ok(stats)
}

/// Derives thresholds from all statistics and labels each file.
///
/// Returns `None` when `stats` is empty.
pub fn label_statistics(
    stats: Vec<(PathBuf, f64)>,
    classes: DensityClasses,
) -> Option<DensityLabels> {
    let values: Vec<f64> = stats.iter().map(|(_, v)| *v).collect();
    let thresholds = make_thresholds(&values, classes)?;
    info!(thresholds = ?thresholds.values(), "Computed density thresholds");

    let rows = stats
        .into_iter()
        .map(|(path, avg)| LabeledRow {
            path: path.display().to_string(),
            label: assign_class(avg, &thresholds),
            avg_vehicles: avg,
        })
        .collect();

    Some(DensityLabels {
        classes,
        thresholds,
        rows,
    })
}

/// Labels the configured directory and writes the CSV.
///
/// Nothing is written unless every file was labeled.
#[tracing::instrument(skip_all, fields(
    data_directory = %config.data_directory.display(),
    output_path = %config.output_path.display(),
    classes = %config.class_count,
))]
pub fn run(config: &LabelerConfig) -> Result<DensityLabels> {
    let labels = label_directory_with(
        &TorchSceneSource,
        &config.data_directory,
        config.class_count,
    )?;

    write_labels(&config.output_path, &labels.rows)?;

    let names = config.class_count.label_names();
    for (label, size) in labels.class_sizes().into_iter().enumerate() {
        info!(label, meaning = names[label], files = size, "Class size");
    }
    info!(path = %config.output_path.display(), rows = labels.rows.len(), "Wrote label CSV");

    Ok(labels)
}
