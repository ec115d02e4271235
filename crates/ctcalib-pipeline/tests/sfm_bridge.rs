//! Importing a COLMAP text model back into the calibrator.

use std::collections::BTreeMap;
use std::fs;

use approx::assert_relative_eq;
use ctcalib_core::{
    CalibConfig, CalibParamManager, CameraFrame, CameraTopicConfig, DataFormat, ImuFrame,
    ImuTopicConfig, Iso3, PinholeIntrinsics, Vec3,
};
use ctcalib_pipeline::sfm::{downsample_veta, perform_transform_for_veta, try_load_sfm_data, ImagesInfo};
use ctcalib_pipeline::{CalibDataManager, SensorStreams};
use nalgebra::{Translation3, UnitQuaternion};
use rand::rngs::StdRng;
use rand::SeedableRng;

const IMU: &str = "/imu";
const CAM: &str = "/cam";

fn setup(output: &std::path::Path) -> (CalibConfig, CalibDataManager, CalibParamManager) {
    let mut config = CalibConfig::default();
    config.data_stream.output_path = output.to_path_buf();
    config.data_stream.reference_imu = IMU.to_string();
    config.data_stream.imu_topics.insert(
        IMU.to_string(),
        ImuTopicConfig {
            model: "SENSOR_IMU".to_string(),
            acce_weight: 1.0,
            gyro_weight: 1.0,
        },
    );
    config.data_stream.camera_topics.insert(
        CAM.to_string(),
        CameraTopicConfig {
            model: "SENSOR_IMAGE_GS".to_string(),
            weight: 1.0,
            reproj_weight: 1.0,
        },
    );
    config.prior.camera_intrinsics.insert(
        CAM.to_string(),
        PinholeIntrinsics {
            width: 4,
            height: 4,
            fx: 2.0,
            fy: 2.0,
            cx: 2.0,
            cy: 2.0,
            dist: Default::default(),
        },
    );
    config.prior.time_offset_padding = 0.1;

    let mut streams = SensorStreams::default();
    streams.imu.insert(
        IMU.to_string(),
        (0..=60)
            .map(|i| ImuFrame::new(i as f64 * 0.1, Vec3::zeros(), Vec3::new(0.0, 0.0, 9.8)))
            .collect(),
    );
    // Raw window [2, 4]; frames 1 and 5 fall inside the trimmed margins.
    streams.camera.insert(
        CAM.to_string(),
        (1..=5)
            .map(|id| CameraFrame {
                id,
                timestamp: 1.5 + 0.5 * id as f64,
                image: image::DynamicImage::new_luma8(4, 4),
            })
            .collect(),
    );
    let data = CalibDataManager::from_streams(&config, streams).unwrap();
    let params = CalibParamManager::from_config(&config).unwrap();
    (config, data, params)
}

fn write_model(config: &CalibConfig) {
    let info = ImagesInfo {
        topic: CAM.to_string(),
        root_path: config.image_store_dir(CAM),
        images: (1..=5).map(|id| (id, format!("{id}.jpg"))).collect::<BTreeMap<_, _>>(),
    };
    let info_file = config.image_info_file(CAM);
    fs::create_dir_all(info_file.parent().unwrap()).unwrap();
    DataFormat::Json.save(&info, &info_file).unwrap();

    let ws = config.sfm_workspace_dir(CAM);
    fs::create_dir_all(&ws).unwrap();
    fs::write(
        ws.join("cameras.txt"),
        "# Camera list\n1 PINHOLE 4 4 2.0 2.0 2.0 2.0\n",
    )
    .unwrap();
    fs::write(
        ws.join("images.txt"),
        "# Image list\n\
         10 1 0 0 0 0 0 -1 1 2.jpg\n\
         1 1 1 2 2 2 3 3 3\n\
         11 1 0 0 0 0.5 0 -1 1 3.jpg\n\
         1 1 1 2 2 2 3 3 3\n\
         12 1 0 0 0 1.0 0 -1 1 4.jpg\n\
         1 1 1 2 2 2\n\
         13 1 0 0 0 1.5 0 -1 1 1.jpg\n\
         1 1 1\n",
    )
    .unwrap();
    fs::write(
        ws.join("points3D.txt"),
        "# 3D point list\n\
         1 0.0 0.0 5.0 10 20 30 0.5 10 0 11 0 12 0 13 0\n\
         2 1.0 0.0 5.0 10 20 30 5.0 10 1 11 1 12 1\n\
         3 0.0 1.0 5.0 10 20 30 0.2 10 2 11 2\n\
         4 1.0 1.0 5.0 10 20 30 0.1 10 0 11 2 12 1\n",
    )
    .unwrap();
}

#[test]
fn missing_model_is_soft() {
    let dir = tempfile::tempdir().unwrap();
    let (config, data, params) = setup(dir.path());
    let loaded = try_load_sfm_data(&config, &data, &params, CAM, 2.0, 3).unwrap();
    assert!(loaded.is_none());
}

#[test]
fn import_filters_views_and_landmarks() {
    let dir = tempfile::tempdir().unwrap();
    let (config, data, params) = setup(dir.path());
    write_model(&config);

    let veta = try_load_sfm_data(&config, &data, &params, CAM, 2.0, 3)
        .unwrap()
        .expect("model present");

    // Frame 1 was trimmed, so image 13 is not a view.
    assert_eq!(veta.views.keys().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    assert_relative_eq!(veta.views[&2].timestamp, 0.5, epsilon = 1e-9);
    assert_eq!(veta.views[&2].width, 4);

    // Camera center of a world-to-camera translation (0.5, 0, -1).
    let pose = veta.view_pose(3).unwrap();
    assert_relative_eq!(pose.translation.vector, Vec3::new(-0.5, 0.0, 1.0), epsilon = 1e-12);

    // Point 2 exceeds the error threshold, point 3 is too short, point 4
    // only has conflicting track entries.
    assert_eq!(veta.landmarks.keys().copied().collect::<Vec<_>>(), vec![1]);
    let lm = &veta.landmarks[&1];
    assert_eq!(lm.obs.len(), 3);
    assert_eq!(lm.color, [10, 20, 30]);
    assert_relative_eq!(lm.obs[&4].uv.x, 1.0);
}

#[test]
fn imported_model_can_be_aligned_and_downsampled() {
    let dir = tempfile::tempdir().unwrap();
    let (config, data, params) = setup(dir.path());
    write_model(&config);
    let mut veta = try_load_sfm_data(&config, &data, &params, CAM, 10.0, 2)
        .unwrap()
        .unwrap();
    // Only point 4 is dropped with the relaxed thresholds.
    assert_eq!(veta.landmark_count(), 3);

    let shift = Iso3::from_parts(Translation3::new(1.0, 0.0, 0.0), UnitQuaternion::identity());
    perform_transform_for_veta(&mut veta, &shift, 2.0);
    assert_relative_eq!(
        veta.landmarks[&1].position,
        Vec3::new(1.0, 0.0, 10.0),
        epsilon = 1e-12
    );

    let mut rng = StdRng::seed_from_u64(3);
    downsample_veta(&mut veta, 1, 2, &mut rng);
    assert_eq!(veta.landmark_count(), 1);
    assert!(veta.landmarks.values().all(|lm| lm.obs.len() <= 2));
}
