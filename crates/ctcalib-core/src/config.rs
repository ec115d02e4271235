//! Run configuration.
//!
//! A [`CalibConfig`] is loaded once by the CLI, validated, and then passed by
//! reference to every component. Nothing reads configuration from global
//! state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::CalibError;
use crate::format::DataFormat;
use crate::models::{CameraModel, ImuModel, LidarModel, PinholeIntrinsics, RadarModel};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibConfig {
    pub data_stream: DataStreamConfig,
    pub prior: PriorConfig,
    pub preference: PreferenceConfig,
}

// ─────────────────────────────────────────────────────────────────────────────
// Data stream
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataStreamConfig {
    /// JSON-lines message log.
    pub log_path: PathBuf,
    /// Root directory of every output file.
    pub output_path: PathBuf,
    /// IMU whose frame is the body frame.
    pub reference_imu: String,
    /// Seconds skipped from the beginning of the log (ignored when <= 0).
    pub begin_time: f64,
    /// Seconds of log used after the begin time (ignored when <= 0).
    pub duration: f64,
    pub imu_topics: BTreeMap<String, ImuTopicConfig>,
    pub radar_topics: BTreeMap<String, RadarTopicConfig>,
    pub lidar_topics: BTreeMap<String, LidarTopicConfig>,
    pub camera_topics: BTreeMap<String, CameraTopicConfig>,
}

impl Default for DataStreamConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("data.jsonl"),
            output_path: PathBuf::from("output"),
            reference_imu: String::new(),
            begin_time: -1.0,
            duration: -1.0,
            imu_topics: BTreeMap::new(),
            radar_topics: BTreeMap::new(),
            lidar_topics: BTreeMap::new(),
            camera_topics: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuTopicConfig {
    #[serde(rename = "type")]
    pub model: String,
    #[serde(default = "default_weight")]
    pub acce_weight: f64,
    #[serde(default = "default_weight")]
    pub gyro_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadarTopicConfig {
    #[serde(rename = "type")]
    pub model: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LidarTopicConfig {
    #[serde(rename = "type")]
    pub model: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraTopicConfig {
    #[serde(rename = "type")]
    pub model: String,
    /// Weight of the SfM camera-pose residuals.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Weight of the landmark reprojection residuals.
    #[serde(default = "default_weight")]
    pub reproj_weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

// ─────────────────────────────────────────────────────────────────────────────
// Priors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorConfig {
    pub gravity_norm: f64,
    /// Bound of every time offset; also the margin kept around the window.
    pub time_offset_padding: f64,
    pub optimize_time_offsets: bool,
    /// Length of the window used to estimate the initial gravity, seconds.
    pub gravity_init_window: f64,
    pub knot_time_dist: KnotTimeDist,
    pub sfm: SfmConfig,
    pub lidar_map: LidarMapConfig,
    /// Initial intrinsics of every camera topic.
    pub camera_intrinsics: BTreeMap<String, PinholeIntrinsics>,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            gravity_norm: 9.797,
            time_offset_padding: 0.1,
            optimize_time_offsets: true,
            gravity_init_window: 1.0,
            knot_time_dist: KnotTimeDist::default(),
            sfm: SfmConfig::default(),
            lidar_map: LidarMapConfig::default(),
            camera_intrinsics: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnotTimeDist {
    pub so3_spline: f64,
    pub scale_spline: f64,
}

impl Default for KnotTimeDist {
    fn default() -> Self {
        Self {
            so3_spline: 0.05,
            scale_spline: 0.05,
        }
    }
}

/// Thresholds of the SfM bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SfmConfig {
    /// Landmarks with a larger mean reprojection error are dropped, pixels.
    pub reproj_error_thd: f64,
    /// Landmarks observed by fewer images are dropped.
    pub track_len_thd: usize,
    /// Landmarks kept after downsampling.
    pub landmark_num_thd: usize,
    /// Observations kept per landmark after downsampling.
    pub obs_num_thd: usize,
    /// Each frame is matched against this many following frames.
    pub match_window: usize,
    /// Maximum relative rotation of a verified match pair, degrees.
    pub match_max_angle_deg: f64,
}

impl Default for SfmConfig {
    fn default() -> Self {
        Self {
            reproj_error_thd: 2.0,
            track_len_thd: 3,
            landmark_num_thd: 5000,
            obs_num_thd: 20,
            match_window: 5,
            match_max_angle_deg: 30.0,
        }
    }
}

/// Surfel map of the LiDAR point-to-plane factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LidarMapConfig {
    /// Edge length of a map voxel, meters.
    pub voxel_size: f64,
    /// Voxels with fewer points carry no surfel.
    pub min_points: usize,
    /// Largest ratio of the smallest to the middle covariance eigenvalue of
    /// a planar voxel.
    pub planarity_thd: f64,
    /// Points farther from their voxel's plane get no factor, meters.
    pub association_dist: f64,
    /// Every `point_stride`-th point of a scan is used.
    pub point_stride: usize,
    /// Cauchy scale of the point-to-plane residuals.
    pub robust_scale: f64,
}

impl Default for LidarMapConfig {
    fn default() -> Self {
        Self {
            voxel_size: 1.0,
            min_points: 10,
            planarity_thd: 0.05,
            association_dist: 0.3,
            point_stride: 5,
            robust_scale: 0.1,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Preferences
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputOption {
    /// Save the parameters after every solver iteration.
    ParamInEachIter,
    /// Save a sampled body trajectory after the final stage.
    Trajectory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewerMode {
    #[default]
    Headless,
    /// Terminal spinner showing iteration and cost.
    Progress,
    /// JSON-lines snapshots under `<output>/viewer/`.
    Record,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceConfig {
    pub output_data_format: DataFormat,
    pub outputs: Vec<OutputOption>,
    /// Worker threads of the solver; 0 uses every core.
    pub available_threads: usize,
    pub viewer: ViewerMode,
    /// Iteration cap of every solver stage.
    pub max_iters: usize,
    /// Seed of the landmark downsampling; `None` draws from entropy.
    pub seed: Option<u64>,
    /// Trajectory sampling period of the trajectory output, seconds.
    pub trajectory_sample_dt: f64,
}

impl Default for PreferenceConfig {
    fn default() -> Self {
        Self {
            output_data_format: DataFormat::Json,
            outputs: Vec::new(),
            available_threads: 0,
            viewer: ViewerMode::Headless,
            max_iters: 50,
            seed: None,
            trajectory_sample_dt: 0.01,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading, validation and queries
// ─────────────────────────────────────────────────────────────────────────────

impl CalibConfig {
    /// Read and validate a configuration file; the format follows the
    /// extension.
    pub fn load(path: &Path) -> Result<Self> {
        let format = DataFormat::from_path(path)?;
        let config: CalibConfig = format
            .load(path)
            .with_context(|| format!("loading configuration '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CalibError> {
        let ds = &self.data_stream;
        if ds.imu_topics.is_empty() {
            return Err(invalid("at least one IMU topic is required"));
        }
        if !ds.imu_topics.contains_key(&ds.reference_imu) {
            return Err(invalid(format!(
                "reference IMU '{}' is not one of the IMU topics",
                ds.reference_imu
            )));
        }
        let knots = &self.prior.knot_time_dist;
        if knots.so3_spline <= 0.0 || knots.scale_spline <= 0.0 {
            return Err(invalid("knot distances must be positive"));
        }
        if self.prior.time_offset_padding < 0.0 {
            return Err(invalid("time offset padding must be non-negative"));
        }
        if self.prior.gravity_norm <= 0.0 {
            return Err(invalid("gravity norm must be positive"));
        }
        if self.prior.sfm.match_window == 0 {
            return Err(invalid("SfM match window must be at least one frame"));
        }
        let map = &self.prior.lidar_map;
        if map.voxel_size <= 0.0 || map.association_dist <= 0.0 || map.robust_scale <= 0.0 {
            return Err(invalid(
                "LiDAR voxel size, association distance and robust scale must be positive",
            ));
        }
        if map.point_stride == 0 || map.min_points < 3 {
            return Err(invalid(
                "LiDAR point stride must be positive and surfels need three points",
            ));
        }
        for topic in ds.imu_topics.keys() {
            self.imu_model(topic)?;
        }
        for topic in ds.radar_topics.keys() {
            self.radar_model(topic)?;
        }
        for topic in ds.lidar_topics.keys() {
            self.lidar_model(topic)?;
        }
        for topic in ds.camera_topics.keys() {
            self.camera_model(topic)?;
            if !self.prior.camera_intrinsics.contains_key(topic) {
                return Err(invalid(format!(
                    "camera topic '{topic}' has no initial intrinsics"
                )));
            }
        }
        Ok(())
    }

    pub fn is_radar_integrated(&self) -> bool {
        !self.data_stream.radar_topics.is_empty()
    }

    pub fn is_lidar_integrated(&self) -> bool {
        !self.data_stream.lidar_topics.is_empty()
    }

    pub fn is_camera_integrated(&self) -> bool {
        !self.data_stream.camera_topics.is_empty()
    }

    pub fn output_enabled(&self, option: OutputOption) -> bool {
        self.preference.outputs.contains(&option)
    }

    /// Every configured topic, in kind order.
    pub fn all_topics(&self) -> Vec<String> {
        let ds = &self.data_stream;
        ds.imu_topics
            .keys()
            .chain(ds.radar_topics.keys())
            .chain(ds.lidar_topics.keys())
            .chain(ds.camera_topics.keys())
            .cloned()
            .collect()
    }

    pub fn imu_model(&self, topic: &str) -> Result<ImuModel, CalibError> {
        let cfg = self
            .data_stream
            .imu_topics
            .get(topic)
            .ok_or_else(|| invalid(format!("'{topic}' is not an IMU topic")))?;
        cfg.model.parse()
    }

    pub fn radar_model(&self, topic: &str) -> Result<RadarModel, CalibError> {
        let cfg = self
            .data_stream
            .radar_topics
            .get(topic)
            .ok_or_else(|| invalid(format!("'{topic}' is not a radar topic")))?;
        cfg.model.parse()
    }

    pub fn lidar_model(&self, topic: &str) -> Result<LidarModel, CalibError> {
        let cfg = self
            .data_stream
            .lidar_topics
            .get(topic)
            .ok_or_else(|| invalid(format!("'{topic}' is not a LiDAR topic")))?;
        cfg.model.parse()
    }

    pub fn camera_model(&self, topic: &str) -> Result<CameraModel, CalibError> {
        let cfg = self
            .data_stream
            .camera_topics
            .get(topic)
            .ok_or_else(|| invalid(format!("'{topic}' is not a camera topic")))?;
        cfg.model.parse()
    }

    // ── output layout ──

    pub fn output_dir(&self) -> &Path {
        &self.data_stream.output_path
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.output_dir().join("iteration").join("stage")
    }

    pub fn epoch_dir(&self) -> PathBuf {
        self.output_dir().join("iteration").join("epoch")
    }

    pub fn viewer_dir(&self) -> PathBuf {
        self.output_dir().join("viewer")
    }

    pub fn image_store_dir(&self, topic: &str) -> PathBuf {
        self.output_dir().join("images").join(topic_slug(topic))
    }

    pub fn image_info_file(&self, topic: &str) -> PathBuf {
        self.image_store_dir(topic)
            .join(format!("info.{}", self.preference.output_data_format.extension()))
    }

    pub fn sfm_workspace_dir(&self, topic: &str) -> PathBuf {
        self.output_dir().join("sfm_ws").join(topic_slug(topic))
    }

    pub fn final_param_file(&self) -> PathBuf {
        self.output_dir().join(format!(
            "ctcalib_param.{}",
            self.preference.output_data_format.extension()
        ))
    }

    pub fn trajectory_file(&self) -> PathBuf {
        self.output_dir().join("trajectory.csv")
    }
}

/// File-system friendly form of a topic name: `/cam/left` becomes
/// `cam_left`.
pub fn topic_slug(topic: &str) -> String {
    let slug = topic.trim_matches('/').replace('/', "_");
    if slug.is_empty() {
        "topic".to_string()
    } else {
        slug
    }
}

fn invalid(msg: impl Into<String>) -> CalibError {
    CalibError::InvalidConfig(msg.into())
}
