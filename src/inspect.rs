//! Read-only inspection of single dataset files.
//!
//! [`SceneSummary`] reports the overall structure of a scene: scenario,
//! timesteps, node counts, the first vehicle, ego vehicles and the vehicle
//! count per timestep. [`VehicleFeatures`] pulls selected columns out of the
//! vehicle feature matrix `x`.

use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::dataset::pickle::Value;
use crate::dataset::scene::{NodeStore, SceneGraph};
use crate::dataset::tensor::{DType, Tensor};
use crate::dataset::VEHICLE_STORE;
use crate::error::DecodeError;

pub const LANELET_STORE: &str = "lanelet";

/// Columns of `vehicle.x` holding the velocity components.
pub const VELOCITY_COLUMNS: [usize; 2] = [0, 1];
pub const LENGTH_COLUMN: usize = 7;
pub const WIDTH_COLUMN: usize = 8;

/// Attributes of the first vehicle row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirstVehicle {
    pub position: Option<[f64; 2]>,
    pub velocity: Option<[f64; 2]>,
    pub orientation: Option<f64>,
    pub timestep: Option<i64>,
}

/// Vehicle index range `[start, end)` of one timestep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimestepCount {
    pub timestep: usize,
    pub count: i64,
    pub start: i64,
    pub end: i64,
}

/// One attribute of a node store; tensors carry dtype and shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeLayout {
    pub key: String,
    pub dtype: Option<DType>,
    pub shape: Option<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreLayout {
    pub name: String,
    pub attributes: Vec<AttributeLayout>,
}

impl StoreLayout {
    pub fn of(store: &NodeStore) -> Self {
        let attributes = store
            .keys()
            .map(|key| {
                let tref = store.tensor_ref(key);
                AttributeLayout {
                    key: key.to_string(),
                    dtype: tref.map(|t| t.storage.dtype),
                    shape: tref.map(|t| t.shape.clone()),
                }
            })
            .collect();

        StoreLayout {
            name: store.name().to_string(),
            attributes,
        }
    }
}

impl fmt::Display for StoreLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attrs: Vec<String> = self
            .attributes
            .iter()
            .map(|a| match &a.shape {
                Some(shape) => format!("{}={:?}", a.key, shape),
                None => a.key.clone(),
            })
            .collect();
        write!(f, "{}={{ {} }}", self.name, attrs.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneSummary {
    pub path: String,
    pub node_types: Vec<String>,
    pub stores: Vec<StoreLayout>,
    pub scenario_id: Option<String>,
    pub timesteps: Option<usize>,
    pub total_vehicles: Option<usize>,
    pub total_lanelets: Option<usize>,
    pub first_vehicle: Option<FirstVehicle>,
    pub ego_vehicles: Option<usize>,
    pub first_ego_position: Option<[f64; 2]>,
    pub vehicles_per_timestep: Vec<TimestepCount>,
}

/// Opens `path` and summarizes it.
pub fn summarize(path: &Path) -> Result<SceneSummary, DecodeError> {
    let scene = SceneGraph::open(path)?;
    summarize_scene(path, &scene)
}

pub fn summarize_scene(path: &Path, scene: &SceneGraph) -> Result<SceneSummary, DecodeError> {
    let vehicles = scene.node_store(VEHICLE_STORE);

    let (scenario_id, scenario_len) = match scene.global("scenario_id") {
        Some(Value::Str(id)) => (Some(id.clone()), None),
        Some(value) => match value.as_seq() {
            Some(ids) => (
                ids.first().and_then(Value::as_str).map(str::to_string),
                Some(ids.len()),
            ),
            None => (None, None),
        },
        None => (None, None),
    };

    let vehicles_per_timestep = match vehicles {
        Some(store) => timestep_counts(scene, store)?,
        None => Vec::new(),
    };
    let timesteps = scenario_len.or_else(|| {
        vehicles
            .and_then(NodeStore::ptr)
            .map(|_| vehicles_per_timestep.len())
    });

    let total_vehicles = vehicles.map(|s| scene.num_nodes(s)).transpose()?.flatten();
    let total_lanelets = scene
        .node_store(LANELET_STORE)
        .map(|s| scene.num_nodes(s))
        .transpose()?
        .flatten();

    let (first_vehicle, ego_vehicles, first_ego_position) = match vehicles {
        Some(store) if total_vehicles.unwrap_or(0) > 0 => {
            let pos = scene.store_tensor(store, "pos")?;
            let first = FirstVehicle {
                position: pos.as_ref().and_then(|t| pair(t, 0)),
                velocity: scene.store_tensor(store, "x")?.and_then(|t| pair(&t, 0)),
                orientation: scene
                    .store_tensor(store, "orientation")?
                    .and_then(|t| first_f64(&t)),
                timestep: scene.store_tensor(store, "batch")?.and_then(|t| first_i64(&t)),
            };

            let ego = scene
                .store_tensor(store, "is_ego_mask")?
                .and_then(|t| t.squeeze().to_i64_vec().ok())
                .map(|mask| {
                    mask.iter()
                        .enumerate()
                        .filter(|(_, v)| **v != 0)
                        .map(|(i, _)| i)
                        .collect::<Vec<_>>()
                });
            let first_ego_position = ego
                .as_ref()
                .and_then(|idx| idx.first())
                .and_then(|i| pos.as_ref().and_then(|t| pair(t, *i)));

            (Some(first), ego.map(|idx| idx.len()), first_ego_position)
        }
        _ => (None, None, None),
    };

    Ok(SceneSummary {
        path: path.display().to_string(),
        node_types: scene.stores().iter().map(|s| s.name().to_string()).collect(),
        stores: scene.stores().iter().map(StoreLayout::of).collect(),
        scenario_id,
        timesteps,
        total_vehicles,
        total_lanelets,
        first_vehicle,
        ego_vehicles,
        first_ego_position,
        vehicles_per_timestep,
    })
}

fn timestep_counts(
    scene: &SceneGraph,
    store: &NodeStore,
) -> Result<Vec<TimestepCount>, DecodeError> {
    let Some(ptr) = scene.store_tensor(store, "ptr")? else {
        return Ok(Vec::new());
    };
    let ptr = ptr.to_i64_vec()?;

    Ok(ptr
        .windows(2)
        .enumerate()
        .map(|(timestep, w)| TimestepCount {
            timestep,
            count: w[1].saturating_sub(w[0]),
            start: w[0],
            end: w[1],
        })
        .collect())
}

/// First two columns of `row`, if the tensor is a matrix wide enough.
fn pair(tensor: &Tensor<'_>, row: usize) -> Option<[f64; 2]> {
    if tensor.ndim() != 2 {
        return None;
    }
    Some([
        tensor.get_f64(&[row, 0]).ok()?,
        tensor.get_f64(&[row, 1]).ok()?,
    ])
}

fn first_f64(tensor: &Tensor<'_>) -> Option<f64> {
    tensor.get_f64(&vec![0; tensor.ndim()]).ok()
}

fn first_i64(tensor: &Tensor<'_>) -> Option<i64> {
    tensor.get_i64(&vec![0; tensor.ndim()]).ok()
}

impl fmt::Display for SceneSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt<T: fmt::Display>(v: &Option<T>) -> String {
            v.as_ref()
                .map_or_else(|| "missing".to_string(), |v| v.to_string())
        }
        fn xy(v: &Option<[f64; 2]>) -> String {
            v.map_or_else(|| "missing".to_string(), |[a, b]| format!("({a:.2}, {b:.2})"))
        }

        let rule = "=".repeat(60);
        writeln!(f, "{rule}")?;
        writeln!(f, "File: {}", self.path)?;
        writeln!(f, "{rule}")?;
        writeln!(f, "Node types: {}", self.node_types.join(", "))?;
        for store in &self.stores {
            writeln!(f, "  {store}")?;
        }
        writeln!(f)?;
        writeln!(f, "Scenario ID: {}", opt(&self.scenario_id))?;
        writeln!(f, "Number of timesteps: {}", opt(&self.timesteps))?;
        writeln!(f, "Total vehicles: {}", opt(&self.total_vehicles))?;
        writeln!(f, "Total lanelets: {}", opt(&self.total_lanelets))?;

        if let Some(first) = &self.first_vehicle {
            writeln!(f)?;
            writeln!(f, "First vehicle:")?;
            writeln!(f, "  Position: {}", xy(&first.position))?;
            writeln!(f, "  Velocity: {}", xy(&first.velocity))?;
            match first.orientation {
                Some(o) => writeln!(f, "  Orientation: {o:.2} rad")?,
                None => writeln!(f, "  Orientation: missing")?,
            }
            writeln!(f, "  Batch/timestep: {}", opt(&first.timestep))?;
        }

        if let Some(count) = self.ego_vehicles {
            writeln!(f)?;
            writeln!(f, "Ego vehicles (one per timestep): {count}")?;
            if let Some(pos) = self.first_ego_position {
                writeln!(f, "  First ego position: {}", xy(&Some(pos)))?;
            }
        }

        if !self.vehicles_per_timestep.is_empty() {
            writeln!(f)?;
            writeln!(f, "Vehicles per timestep:")?;
            for t in &self.vehicles_per_timestep {
                if t.count > 0 {
                    writeln!(
                        f,
                        "  timestep {}: {} vehicles (indices {}-{})",
                        t.timestep,
                        t.count,
                        t.start,
                        t.end.saturating_sub(1)
                    )?;
                } else {
                    writeln!(f, "  timestep {}: 0 vehicles", t.timestep)?;
                }
            }
        }

        Ok(())
    }
}

/// Selected columns of one row of `vehicle.x`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleFeatures {
    pub path: String,
    pub vehicle: usize,
    pub features: Vec<f64>,
    pub velocity: [f64; 2],
    pub length: f64,
    pub width: f64,
    /// Length column across all vehicles.
    pub all_lengths: Vec<f64>,
}

/// Opens `path` and extracts the features of vehicle row `vehicle`.
pub fn vehicle_features(path: &Path, vehicle: usize) -> Result<VehicleFeatures, DecodeError> {
    let scene = SceneGraph::open(path)?;
    vehicle_features_of(path, &scene, vehicle)
}

pub fn vehicle_features_of(
    path: &Path,
    scene: &SceneGraph,
    vehicle: usize,
) -> Result<VehicleFeatures, DecodeError> {
    let store = scene.require_store(VEHICLE_STORE)?;
    let x = scene
        .store_tensor(store, "x")?
        .ok_or_else(|| DecodeError::InvalidAttribute {
            key: "x".to_string(),
            reason: "vehicle store has no feature matrix".to_string(),
        })?;

    let features = x.row(vehicle)?;
    if features.len() <= WIDTH_COLUMN {
        return Err(DecodeError::InvalidAttribute {
            key: "x".to_string(),
            reason: format!(
                "{} feature columns, need at least {}",
                features.len(),
                WIDTH_COLUMN + 1
            ),
        });
    }

    Ok(VehicleFeatures {
        path: path.display().to_string(),
        vehicle,
        velocity: [features[VELOCITY_COLUMNS[0]], features[VELOCITY_COLUMNS[1]]],
        length: features[LENGTH_COLUMN],
        width: features[WIDTH_COLUMN],
        all_lengths: x.column(LENGTH_COLUMN)?,
        features,
    })
}

impl fmt::Display for VehicleFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Vehicle {} features: {:?}", self.vehicle, self.features)?;
        writeln!(
            f,
            "Velocity (vx, vy): [{}, {}]",
            self.velocity[0], self.velocity[1]
        )?;
        writeln!(f, "Length: {}", self.length)?;
        writeln!(f, "Width: {}", self.width)?;
        writeln!(
            f,
            "All vehicle lengths ({} values): {:?}",
            self.all_lengths.len(),
            self.all_lengths
        )
    }
}
