//! Loading, trimming and aligning message logs end to end.

use std::path::Path;

use approx::assert_relative_eq;
use ctcalib_core::{
    find_calib_error, CalibConfig, CalibError, CameraTopicConfig, ImuFrame, ImuTopicConfig,
    LidarFrame, LidarPoint, LidarTopicConfig, PinholeIntrinsics, RadarTarget, RadarTargetArray,
    RadarTopicConfig, Real, ScaleSplineType, Vec3,
};
use ctcalib_pipeline::data::{write_message_log, LogRecord};
use ctcalib_pipeline::{CalibDataManager, SensorStreams};
use serde_json::json;

const IMU: &str = "/imu";
const CAM: &str = "/cam";
const LIDAR: &str = "/lidar";
const RADAR: &str = "/radar";

fn imu_records(start: f64, end: f64, rate: f64) -> Vec<LogRecord> {
    let n = ((end - start) * rate).round() as usize;
    (0..=n)
        .map(|i| {
            LogRecord::new(
                IMU,
                start + i as f64 / rate,
                json!({"angular_velocity": [0.0, 0.0, 0.1], "linear_acceleration": [0.0, 0.0, 9.8]}),
            )
        })
        .collect()
}

fn camera_records(start: f64, end: f64, rate: f64) -> Vec<LogRecord> {
    let n = ((end - start) * rate).round() as usize;
    (0..=n)
        .map(|i| {
            LogRecord::new(
                CAM,
                start + i as f64 / rate,
                json!({"width": 2, "height": 2, "encoding": "mono8", "data": [0, 64, 128, 255]}),
            )
        })
        .collect()
}

fn config(log: &Path, output: &Path) -> CalibConfig {
    let mut config = CalibConfig::default();
    config.data_stream.log_path = log.to_path_buf();
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
    config.prior.time_offset_padding = 0.1;
    config
}

fn with_camera(mut config: CalibConfig) -> CalibConfig {
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
            width: 2,
            height: 2,
            fx: 1.0,
            fy: 1.0,
            cx: 1.0,
            cy: 1.0,
            dist: Default::default(),
        },
    );
    config
}

fn scale_type(config: &CalibConfig) -> ScaleSplineType {
    ScaleSplineType::from_integration(
        config.is_lidar_integrated(),
        config.is_camera_integrated(),
        config.is_radar_integrated(),
    )
}

#[test]
fn inertial_only_window() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log.jsonl");
    write_message_log(&log, &imu_records(0.0, 100.0, 10.0)).unwrap();
    let config = config(&log, &dir.path().join("out"));
    config.validate().unwrap();

    let data = CalibDataManager::load(&config).unwrap();
    assert_eq!(data.aligned_start_time(), 0.0);
    assert_relative_eq!(data.aligned_end_time(), 100.0, epsilon = 1e-9);
    assert_relative_eq!(data.calib_start_time(), 0.1, epsilon = 1e-12);
    assert_relative_eq!(data.calib_end_time(), 99.9, epsilon = 1e-9);
    assert_eq!(scale_type(&config), ScaleSplineType::LinAcce);

    let imu = data.imu_topic(IMU).unwrap();
    assert_eq!(imu.len(), 1001);
    assert_eq!(imu[0].timestamp, 0.0);
    assert_relative_eq!(data.frequency(IMU).unwrap(), 10.0, epsilon = 1e-6);
}

#[test]
fn camera_window_drives_alignment() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log.jsonl");
    let mut records = imu_records(0.0, 100.0, 10.0);
    records.extend(camera_records(5.0, 90.0, 2.0));
    records.sort_by(|a, b| a.stamp.total_cmp(&b.stamp));
    write_message_log(&log, &records).unwrap();
    let config = with_camera(config(&log, &dir.path().join("out")));
    config.validate().unwrap();

    let data = CalibDataManager::load(&config).unwrap();
    assert_relative_eq!(data.raw_start_time(), 5.0, epsilon = 1e-9);
    assert_relative_eq!(data.raw_end_time(), 90.0, epsilon = 1e-9);
    assert_eq!(data.aligned_start_time(), 0.0);
    assert_relative_eq!(data.aligned_end_time(), 85.0, epsilon = 1e-9);
    assert_eq!(scale_type(&config), ScaleSplineType::LinPos);

    // IMU keeps the window boundaries, the camera loses 2 * padding per side.
    let imu = data.imu_topic(IMU).unwrap();
    assert_relative_eq!(imu[0].timestamp, 0.0, epsilon = 1e-9);
    let cam = data.camera_topic(CAM).unwrap();
    assert!(cam.first().unwrap().timestamp > 0.2);
    assert!(cam.last().unwrap().timestamp < 85.0 - 0.2);
    assert_eq!(cam[0].image.width(), 2);
}

#[test]
fn begin_time_and_duration_select_a_subwindow() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log.jsonl");
    write_message_log(&log, &imu_records(0.0, 100.0, 10.0)).unwrap();
    let mut config = config(&log, &dir.path().join("out"));
    config.data_stream.begin_time = 10.0;
    config.data_stream.duration = 20.0;

    let data = CalibDataManager::load(&config).unwrap();
    assert_relative_eq!(data.raw_start_time(), 10.0, epsilon = 1e-9);
    assert_relative_eq!(data.raw_end_time(), 30.0, epsilon = 1e-9);
    assert_relative_eq!(data.aligned_end_time(), 20.0, epsilon = 1e-9);
}

#[test]
fn missing_log_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().join("absent.jsonl"), dir.path());
    let err = CalibDataManager::load(&config).unwrap_err();
    assert!(matches!(
        find_calib_error(&err),
        Some(CalibError::MissingLog(_))
    ));
}

#[test]
fn unconfigured_topic_data_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log.jsonl");
    write_message_log(&log, &imu_records(0.0, 10.0, 10.0)).unwrap();
    let mut config = config(&log, dir.path());
    config.data_stream.imu_topics.insert(
        "/imu_absent".to_string(),
        ImuTopicConfig {
            model: "SENSOR_IMU".to_string(),
            acce_weight: 1.0,
            gyro_weight: 1.0,
        },
    );
    let err = CalibDataManager::load(&config).unwrap_err();
    assert!(matches!(
        find_calib_error(&err),
        Some(CalibError::MissingTopicData { topic }) if topic == "/imu_absent"
    ));
}

// ── streams built in memory ──

/// Quarter-second grids keep window bounds exactly representable.
fn grid(start: Real, end: Real) -> Vec<Real> {
    let n = ((end - start) * 4.0).round() as usize;
    (0..=n).map(|i| start + i as Real * 0.25).collect()
}

fn imu_stream(times: &[Real]) -> Vec<ImuFrame> {
    times
        .iter()
        .map(|&t| ImuFrame::new(t, Vec3::new(0.0, 0.0, 0.1), Vec3::new(0.0, 0.0, 9.8)))
        .collect()
}

fn lidar_stream(times: &[Real]) -> Vec<LidarFrame> {
    times
        .iter()
        .map(|&t| LidarFrame {
            timestamp: t,
            points: (0..3)
                .map(|k| LidarPoint {
                    timestamp: t + 0.01 * k as Real,
                    position: Vec3::new(1.0 + k as Real, 0.0, 0.0),
                    intensity: 1.0,
                })
                .collect(),
        })
        .collect()
}

fn radar_stream(times: &[Real]) -> Vec<RadarTargetArray> {
    times
        .iter()
        .map(|&t| {
            RadarTargetArray::from_targets(vec![
                RadarTarget::from_position(t - 0.125, &Vec3::new(3.0, 0.0, 0.0), 0.5),
                RadarTarget::from_position(t + 0.125, &Vec3::new(0.0, 4.0, 0.0), -0.5),
            ])
        })
        .collect()
}

fn multi_sensor_config(padding: Real) -> CalibConfig {
    let mut config = CalibConfig::default();
    config.data_stream.reference_imu = IMU.to_string();
    config.data_stream.imu_topics.insert(
        IMU.to_string(),
        ImuTopicConfig {
            model: "SENSOR_IMU".to_string(),
            acce_weight: 1.0,
            gyro_weight: 1.0,
        },
    );
    config.data_stream.lidar_topics.insert(
        LIDAR.to_string(),
        LidarTopicConfig {
            model: "OUSTER_LIDAR".to_string(),
            weight: 1.0,
        },
    );
    config.data_stream.radar_topics.insert(
        RADAR.to_string(),
        RadarTopicConfig {
            model: "AINSTEIN_RADAR".to_string(),
            weight: 1.0,
        },
    );
    config.prior.time_offset_padding = padding;
    config
}

fn streams(imu: &[Real], lidar: &[Real], radar: &[Real]) -> SensorStreams {
    let mut streams = SensorStreams::default();
    streams.imu.insert(IMU.to_string(), imu_stream(imu));
    streams.lidar.insert(LIDAR.to_string(), lidar_stream(lidar));
    streams.radar.insert(RADAR.to_string(), radar_stream(radar));
    streams
}

#[test]
fn inertial_keeps_window_bounds_others_lose_twice_the_padding() {
    let config = multi_sensor_config(0.25);
    let times = grid(0.0, 10.0);
    let data = CalibDataManager::from_streams(&config, streams(&times, &times, &times)).unwrap();
    assert_eq!(data.raw_start_time(), 0.0);
    assert_eq!(data.raw_end_time(), 10.0);

    // IMU: closed interval [raw_start, raw_end]
    let imu = data.imu_topic(IMU).unwrap();
    assert_eq!(imu.len(), times.len());
    assert_eq!(imu.first().unwrap().timestamp, 0.0);
    assert_eq!(imu.last().unwrap().timestamp, 10.0);

    // others: open interval (raw_start + 0.5, raw_end - 0.5), so 0.5 and 9.5 are dropped
    let lidar = data.lidar_topic(LIDAR).unwrap();
    assert_eq!(lidar.first().unwrap().timestamp, 0.75);
    assert_eq!(lidar.last().unwrap().timestamp, 9.25);
    assert_eq!(lidar.len(), times.len() - 6);
    let radar = data.radar_topic(RADAR).unwrap();
    assert_eq!(radar.first().unwrap().timestamp, 0.75);
    assert_eq!(radar.last().unwrap().timestamp, 9.25);
}

#[test]
fn alignment_rebases_lidar_points_and_radar_targets() {
    let config = multi_sensor_config(0.25);
    let times = grid(100.0, 110.0);
    let data = CalibDataManager::from_streams(&config, streams(&times, &times, &times)).unwrap();
    assert_eq!(data.raw_start_time(), 100.0);
    assert_eq!(data.aligned_start_time(), 0.0);
    assert_eq!(data.aligned_end_time(), 10.0);
    assert_relative_eq!(data.calib_start_time(), 0.25);
    assert_relative_eq!(data.calib_end_time(), 9.75);

    assert_eq!(data.imu_topic(IMU).unwrap()[0].timestamp, 0.0);

    let lidar = data.lidar_topic(LIDAR).unwrap();
    let frame = lidar.iter().find(|f| f.timestamp == 5.0).unwrap();
    for (k, p) in frame.points.iter().enumerate() {
        assert_relative_eq!(p.timestamp, 5.0 + 0.01 * k as Real, epsilon = 1e-9);
    }
    assert!(lidar
        .iter()
        .flat_map(|f| &f.points)
        .all(|p| p.timestamp >= 0.0 && p.timestamp < 10.0));

    let radar = data.radar_topic(RADAR).unwrap();
    let array = radar.iter().find(|a| a.timestamp == 5.0).unwrap();
    assert_eq!(array.targets[0].timestamp, 4.875);
    assert_eq!(array.targets[1].timestamp, 5.125);
    // positions are untouched
    assert_relative_eq!(array.targets[1].range, 4.0, epsilon = 1e-12);
}

#[test]
fn stream_emptied_by_trimming_is_reported() {
    let config = multi_sensor_config(0.25);
    let imu = grid(0.0, 10.0);
    // the LiDAR only has samples inside the 2 * padding margins
    let lidar = [0.0, 0.25, 9.75, 10.0];
    let err = CalibDataManager::from_streams(&config, streams(&imu, &lidar, &imu)).unwrap_err();
    assert!(matches!(
        find_calib_error(&err),
        Some(CalibError::EmptyStream { topic, .. }) if topic == LIDAR
    ));
}

#[test]
fn disjoint_streams_have_no_intersection() {
    let config = multi_sensor_config(0.25);
    let early = grid(0.0, 10.0);
    let late = grid(20.0, 30.0);
    let err = CalibDataManager::from_streams(&config, streams(&early, &late, &late)).unwrap_err();
    match find_calib_error(&err) {
        Some(CalibError::NoIntersection { start, end, .. }) => {
            assert_eq!(*start, 20.0);
            assert_eq!(*end, 10.0);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn window_shorter_than_padding_is_rejected() {
    let mut config = multi_sensor_config(0.25);
    let times = [0.0, 0.25, 0.3, 0.4];
    let mut s = SensorStreams::default();
    s.imu.insert(IMU.to_string(), imu_stream(&times));
    config.data_stream.lidar_topics.clear();
    config.data_stream.radar_topics.clear();
    let err = CalibDataManager::from_streams(&config, s).unwrap_err();
    assert!(matches!(
        find_calib_error(&err),
        Some(CalibError::NoIntersection { .. })
    ));
}
