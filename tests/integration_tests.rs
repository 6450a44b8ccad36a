mod common;

use std::fs;

use common::{Attr, SceneSpec, Store, batched_vehicles, ptr_for};
use scene_density_labeler::analyzers::labeler::{label_directory, run};
use scene_density_labeler::config::LabelerConfig;
use scene_density_labeler::dataset::scene::SceneGraph;
use scene_density_labeler::dataset::{SceneSource, TorchSceneSource, vehicle_group};
use scene_density_labeler::error::{DecodeError, LabelError};
use scene_density_labeler::inspect::{summarize, vehicle_features};

fn batched_scene(counts: &[i64]) -> SceneSpec {
    SceneSpec::new()
        .store(batched_vehicles(counts))
        .store(Store::new("lanelet").with("x", Attr::Matrix(vec![vec![1.0; 4]; 5])))
}

#[test]
fn test_full_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("graph_dataset");
    fs::create_dir(&data).unwrap();

    batched_scene(&[8, 8]).write(&data.join("data-0003-0000.pt"));
    batched_scene(&[1, 3]).write(&data.join("data-0001-0000.pt"));
    batched_scene(&[5, 5, 5]).write(&data.join("data-0002-0000.pt"));

    let output = dir.path().join("labels.csv");
    let config = LabelerConfig::new(&data, &output, 3).unwrap();
    let labels = run(&config).unwrap();

    let got: Vec<u8> = labels.rows.iter().map(|r| r.label).collect();
    assert_eq!(got, vec![0, 1, 2]);

    let content = fs::read_to_string(&output).unwrap();
    let lines: Vec<_> = content.lines().collect();
    assert_eq!(lines[0], "path,label,avg_vehicles");
    assert_eq!(lines.len(), 4);
    assert!(lines[1].ends_with("data-0001-0000.pt,0,2.0"));
    assert!(lines[2].ends_with("data-0002-0000.pt,1,5.0"));
    assert!(lines[3].ends_with("data-0003-0000.pt,2,8.0"));
}

#[test]
fn test_rerun_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    for (i, counts) in [[3i64, 4], [10, 2], [6, 6], [1, 1]].iter().enumerate() {
        batched_scene(counts).write(&dir.path().join(format!("scene-{i}.pt")));
    }
    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("labels.csv");
    let config = LabelerConfig::new(dir.path(), &output, 2).unwrap();

    run(&config).unwrap();
    let first = fs::read(&output).unwrap();
    run(&config).unwrap();
    let second = fs::read(&output).unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_unbatched_scene_uses_node_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("single.pt");
    SceneSpec::new()
        .store(Store::new("vehicle").with("x", Attr::Matrix(vec![vec![0.0; 11]; 7])))
        .write(&path);

    let group = TorchSceneSource.vehicle_group(&path).unwrap();
    assert_eq!(group.num_nodes, 7);
    assert_eq!(group.ptr, None);

    let labels = label_directory(dir.path(), 2).unwrap();
    assert_eq!(labels.rows[0].avg_vehicles, 7.0);
    assert_eq!(labels.rows[0].label, 0);
}

#[test]
fn test_explicit_num_nodes_wins() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("explicit.pt");
    SceneSpec::new()
        .store(
            Store::new("vehicle")
                .with("num_nodes", Attr::Int(300))
                .with("x", Attr::Matrix(vec![vec![0.0; 2]; 3])),
        )
        .write(&path);

    let group = TorchSceneSource.vehicle_group(&path).unwrap();
    assert_eq!(group.num_nodes, 300);
}

#[test]
fn test_vehicle_group_from_batched_archive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("b.pt");
    batched_scene(&[2, 0, 4]).write(&path);

    let scene = SceneGraph::open(&path).unwrap();
    let group = vehicle_group(&scene).unwrap();

    assert_eq!(group.num_nodes, 6);
    assert_eq!(group.ptr, Some(ptr_for(&[2, 0, 4])));
    assert_eq!(group.segment_counts().unwrap(), vec![2, 0, 4]);
}

#[test]
fn test_corrupt_file_aborts_without_output() {
    let dir = tempfile::tempdir().unwrap();
    batched_scene(&[2, 2]).write(&dir.path().join("a.pt"));
    fs::write(dir.path().join("b.pt"), b"not a zip archive").unwrap();
    let output = dir.path().join("labels.csv");

    let config = LabelerConfig::new(dir.path(), &output, 3).unwrap();
    let err = run(&config).unwrap_err();

    match err {
        LabelError::Load { path, source } => {
            assert!(path.ends_with("b.pt"));
            assert!(matches!(source, DecodeError::Archive(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!output.exists());
}

#[test]
fn test_decreasing_ptr_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    SceneSpec::new()
        .store(Store::new("vehicle").with("ptr", Attr::Long(vec![0, 5, 3])))
        .write(&dir.path().join("bad.pt"));

    let err = label_directory(dir.path(), 2).unwrap_err();
    assert!(matches!(
        err,
        LabelError::Load {
            source: DecodeError::InvalidAttribute { .. },
            ..
        }
    ));
}

#[test]
fn test_oversized_tensor_view_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    SceneSpec::new()
        .store(Store::new("vehicle").with(
            "ptr",
            Attr::LongView {
                values: vec![0, 1],
                shape: vec![1 << 62, 8],
                stride: vec![8, 1],
            },
        ))
        .write(&dir.path().join("huge.pt"));

    let err = label_directory(dir.path(), 2).unwrap_err();
    assert!(matches!(
        err,
        LabelError::Load {
            source: DecodeError::TensorBounds(_),
            ..
        }
    ));
}

#[test]
fn test_broadcast_view_over_small_storage_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    SceneSpec::new()
        .store(Store::new("vehicle").with(
            "ptr",
            Attr::LongView {
                values: vec![0],
                shape: vec![1 << 40],
                stride: vec![0],
            },
        ))
        .write(&dir.path().join("broadcast.pt"));

    assert!(matches!(
        label_directory(dir.path(), 3),
        Err(LabelError::Load { .. })
    ));
}

#[test]
fn test_extreme_ptr_bounds_are_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    SceneSpec::new()
        .store(Store::new("vehicle").with("ptr", Attr::Long(vec![i64::MIN, i64::MAX])))
        .write(&dir.path().join("extreme.pt"));

    let err = label_directory(dir.path(), 2).unwrap_err();
    assert!(matches!(
        err,
        LabelError::Load {
            source: DecodeError::InvalidAttribute { .. },
            ..
        }
    ));
}

#[test]
fn test_missing_vehicle_store_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    SceneSpec::new()
        .store(Store::new("lanelet").with("x", Attr::Matrix(vec![vec![1.0; 2]; 2])))
        .write(&dir.path().join("lanes.pt"));

    let err = label_directory(dir.path(), 3).unwrap_err();
    assert!(matches!(
        err,
        LabelError::Load {
            source: DecodeError::MissingNodeStore(_),
            ..
        }
    ));
}

#[test]
fn test_empty_directory_leaves_output_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("empty");
    fs::create_dir(&data).unwrap();
    let output = dir.path().join("labels.csv");
    fs::write(&output, "previous run\n").unwrap();

    let config = LabelerConfig::new(&data, &output, 3).unwrap();
    let err = run(&config).unwrap_err();

    assert!(matches!(err, LabelError::NotFound(_)));
    assert_eq!(fs::read_to_string(&output).unwrap(), "previous run\n");
}

#[test]
fn test_unsupported_class_count() {
    let dir = tempfile::tempdir().unwrap();
    batched_scene(&[1]).write(&dir.path().join("a.pt"));

    assert!(matches!(
        LabelerConfig::new(dir.path(), dir.path().join("out.csv"), 4),
        Err(LabelError::Config(4))
    ));
    assert!(matches!(
        label_directory(dir.path(), 4),
        Err(LabelError::Config(4))
    ));
}

#[test]
fn test_inspect_summary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scene.pt");
    let mut x = vec![vec![0.0f32; 11]; 3];
    x[0][0] = 1.5;
    x[0][1] = -0.5;

    SceneSpec::new()
        .global(
            "scenario_id",
            Attr::StrList(vec!["USA_Boston-1".to_string(), "USA_Boston-1".to_string()]),
        )
        .store(
            Store::new("vehicle")
                .with("x", Attr::Matrix(x))
                .with(
                    "pos",
                    Attr::Matrix(vec![vec![10.0, 20.0], vec![11.0, 21.0], vec![12.0, 22.0]]),
                )
                .with("orientation", Attr::Matrix(vec![vec![0.5], vec![0.25], vec![0.0]]))
                .with("is_ego_mask", Attr::BoolColumn(vec![false, true, true]))
                .with("batch", Attr::Long(vec![0, 0, 1]))
                .with("ptr", Attr::Long(vec![0, 2, 3])),
        )
        .store(Store::new("lanelet").with("x", Attr::Matrix(vec![vec![0.0; 4]; 8])))
        .write(&path);

    let summary = summarize(&path).unwrap();

    assert_eq!(summary.node_types, vec!["vehicle", "lanelet"]);
    let vehicle_keys: Vec<&str> = summary.stores[0]
        .attributes
        .iter()
        .map(|a| a.key.as_str())
        .collect();
    assert_eq!(
        vehicle_keys,
        vec!["x", "pos", "orientation", "is_ego_mask", "batch", "ptr"]
    );
    assert_eq!(summary.stores[1].attributes[0].shape, Some(vec![8, 4]));
    assert_eq!(summary.scenario_id.as_deref(), Some("USA_Boston-1"));
    assert_eq!(summary.timesteps, Some(2));
    assert_eq!(summary.total_vehicles, Some(3));
    assert_eq!(summary.total_lanelets, Some(8));

    let first = summary.first_vehicle.as_ref().unwrap();
    assert_eq!(first.position, Some([10.0, 20.0]));
    assert_eq!(first.velocity, Some([1.5, -0.5]));
    assert_eq!(first.orientation, Some(0.5));
    assert_eq!(first.timestep, Some(0));

    assert_eq!(summary.ego_vehicles, Some(2));
    assert_eq!(summary.first_ego_position, Some([11.0, 21.0]));

    let counts: Vec<i64> = summary.vehicles_per_timestep.iter().map(|t| t.count).collect();
    assert_eq!(counts, vec![2, 1]);

    let text = summary.to_string();
    assert!(text.contains("timestep 1: 1 vehicles (indices 2-2)"));
}

#[test]
fn test_vehicle_features() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scene.pt");
    let rows: Vec<Vec<f32>> = (0..3)
        .map(|i| {
            let mut row = vec![0.0; 11];
            row[0] = i as f32;
            row[1] = 2.0 * i as f32;
            row[7] = 4.0 + i as f32;
            row[8] = 1.75;
            row
        })
        .collect();
    SceneSpec::new()
        .store(Store::new("vehicle").with("x", Attr::Matrix(rows)))
        .write(&path);

    let features = vehicle_features(&path, 2).unwrap();

    assert_eq!(features.features.len(), 11);
    assert_eq!(features.velocity, [2.0, 4.0]);
    assert_eq!(features.length, 6.0);
    assert_eq!(features.width, 1.75);
    assert_eq!(features.all_lengths, vec![4.0, 5.0, 6.0]);

    assert!(vehicle_features(&path, 3).is_err());
}

#[test]
fn test_vehicle_features_need_enough_columns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("narrow.pt");
    SceneSpec::new()
        .store(Store::new("vehicle").with("x", Attr::Matrix(vec![vec![0.0; 4]; 2])))
        .write(&path);

    let err = vehicle_features(&path, 0).unwrap_err();
    assert!(matches!(err, DecodeError::InvalidAttribute { .. }));
}
