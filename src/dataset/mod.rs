//! Access to the traffic-scene dataset.
//!
//! [`SceneSource`] is the seam between the labeler and the file format:
//! it yields a [`VehicleGroup`] per file. [`TorchSceneSource`] reads the
//! `torch.save` archives produced by the graph-building pipeline.

pub mod archive;
pub mod pickle;
pub mod scene;
pub mod tensor;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{DecodeError, LabelError, Result};
use scene::SceneGraph;

/// File extension of dataset files.
pub const DATASET_EXTENSION: &str = "pt";

/// Name of the node store holding vehicles.
pub const VEHICLE_STORE: &str = "vehicle";

/// The vehicle node store of one file, reduced to what density labeling needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleGroup {
    /// Total vehicles across all timesteps.
    pub num_nodes: usize,
    /// Per-timestep boundaries, `len = T + 1`, when the file is a batch.
    pub ptr: Option<Vec<i64>>,
}

impl VehicleGroup {
    /// Checks that `ptr` describes at least one timestep, starts at a
    /// non-negative index and never decreases.
    pub fn validate(&self) -> std::result::Result<(), DecodeError> {
        let Some(ptr) = &self.ptr else {
            return Ok(());
        };

        if ptr.len() < 2 {
            return Err(DecodeError::InvalidAttribute {
                key: "ptr".to_string(),
                reason: format!("{} entries describe no timestep", ptr.len()),
            });
        }

        if ptr[0] < 0 {
            return Err(DecodeError::InvalidAttribute {
                key: "ptr".to_string(),
                reason: format!("negative start index {}", ptr[0]),
            });
        }

        if let Some(t) = ptr.windows(2).position(|w| w[1] < w[0]) {
            return Err(DecodeError::InvalidAttribute {
                key: "ptr".to_string(),
                reason: format!("decreases at timestep {t}: {} -> {}", ptr[t], ptr[t + 1]),
            });
        }

        Ok(())
    }

    /// Vehicle count per timestep.
    pub fn segment_counts(&self) -> Option<Vec<i64>> {
        self.ptr
            .as_ref()
            .map(|ptr| ptr.windows(2).map(|w| w[1].saturating_sub(w[0])).collect())
    }
}

/// Anything that can produce the vehicle group of a dataset file.
pub trait SceneSource {
    fn vehicle_group(&self, path: &Path) -> std::result::Result<VehicleGroup, DecodeError>;
}

/// Reads vehicle groups from `torch.save` archives on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct TorchSceneSource;

impl SceneSource for TorchSceneSource {
    fn vehicle_group(&self, path: &Path) -> std::result::Result<VehicleGroup, DecodeError> {
        let scene = SceneGraph::open(path)?;
        vehicle_group(&scene)
    }
}

/// Extracts and validates the vehicle group of a decoded scene.
pub fn vehicle_group(scene: &SceneGraph) -> std::result::Result<VehicleGroup, DecodeError> {
    let store = scene.require_store(VEHICLE_STORE)?;

    let ptr = scene
        .store_tensor(store, "ptr")?
        .map(|t| t.to_i64_vec())
        .transpose()?;

    let num_nodes = match scene.num_nodes(store)? {
        Some(n) => n,
        // a batch without node features still knows its total from ptr
        None => match ptr.as_ref().and_then(|p| p.last()) {
            Some(last) => usize::try_from(*last).map_err(|_| DecodeError::InvalidAttribute {
                key: "ptr".to_string(),
                reason: format!("negative total {last}"),
            })?,
            None => {
                return Err(DecodeError::InvalidAttribute {
                    key: "num_nodes".to_string(),
                    reason: "cannot infer the vehicle count".to_string(),
                });
            }
        },
    };

    let group = VehicleGroup { num_nodes, ptr };
    group.validate()?;
    debug!(
        num_nodes = group.num_nodes,
        timesteps = group.ptr.as_ref().map(|p| p.len() - 1),
        "Vehicle group extracted"
    );
    Ok(group)
}

/// Lists the dataset files directly inside `dir`, sorted by path.
///
/// # Errors
///
/// Returns [`LabelError::NotFound`] when the directory is missing or holds
/// no dataset file.
pub fn list_dataset_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(LabelError::NotFound(dir.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file()
            && path.extension().and_then(|e| e.to_str()) == Some(DATASET_EXTENSION)
        {
            files.push(path);
        }
    }

    if files.is_empty() {
        return Err(LabelError::NotFound(dir.to_path_buf()));
    }

    files.sort();
    Ok(files)
}
