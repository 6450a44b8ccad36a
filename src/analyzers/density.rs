use crate::analyzers::utility::mean;
use crate::dataset::VehicleGroup;

/// Average number of vehicles per timestep.
///
/// A group without `ptr` is a single unbatched graph, so its raw vehicle
/// count is returned as is.
pub fn avg_vehicles(group: &VehicleGroup) -> f64 {
    match group.segment_counts() {
        Some(counts) => {
            let counts: Vec<f64> = counts.into_iter().map(|c| c as f64).collect();
            mean(&counts)
        }
        None => group.num_nodes as f64,
    }
}
