//! Sensor data ingestion and time alignment.
//!
//! [`CalibDataManager::load`] reads the configured topics from the message
//! log, then reconciles the streams onto one bounded time axis:
//!
//! 1. raw window: the intersection of all integrated sensors' time ranges,
//! 2. trimming: IMU streams keep `[raw_start, raw_end]`, other sensors keep
//!    `(raw_start + 2 pad, raw_end - 2 pad)` so offset-shifted samples stay
//!    inside the spline,
//! 3. re-basing: every time (frames, points, targets) is shifted by
//!    `-raw_start`, so the aligned window starts at exactly 0.0,
//! 4. calibration window: the aligned window shrunk by `pad` on both ends.

pub mod loaders;
mod message_log;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use ctcalib_core::{
    CalibConfig, CalibError, CameraFrame, ImuFrame, LidarFrame, RadarTarget, RadarTargetArray,
    Real, SensorKind, TimedFrame,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};

pub use message_log::{write_message_log, LogRecord, MessageLog};
use crate::sfm::Veta;

/// Readings of single-target radars closer than this to the first member of
/// a group are merged into one array.
pub const RADAR_MERGE_WINDOW: Real = 0.1;

pub(crate) fn progress_bar(length: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(length);
    if let Ok(style) = ProgressStyle::default_bar().template("{msg} [{bar:40}] {percent}% ({eta})") {
        pb.set_style(style.progress_chars("#-"));
    }
    pb.set_message(message.to_string());
    pb
}

/// Decoded streams keyed by topic.
#[derive(Debug, Clone, Default)]
pub struct SensorStreams {
    pub imu: BTreeMap<String, Vec<ImuFrame>>,
    pub radar: BTreeMap<String, Vec<RadarTargetArray>>,
    pub lidar: BTreeMap<String, Vec<LidarFrame>>,
    pub camera: BTreeMap<String, Vec<CameraFrame>>,
}

impl SensorStreams {
    fn sort(&mut self) {
        fn by_time<F: TimedFrame>(frames: &mut [F]) {
            frames.sort_by(|a, b| a.timestamp().total_cmp(&b.timestamp()));
        }
        self.imu.values_mut().for_each(|f| by_time(f));
        self.radar.values_mut().for_each(|f| by_time(f));
        self.lidar.values_mut().for_each(|f| by_time(f));
        self.camera.values_mut().for_each(|f| by_time(f));
    }
}

/// Re-group one-target arrays of a single-target radar.
///
/// A reading joins the open group while it is within
/// [`RADAR_MERGE_WINDOW`] of the group's first reading; the group is stamped
/// with the mean of its members' stamps.
pub fn merge_radar_targets(arrays: Vec<RadarTargetArray>) -> Vec<RadarTargetArray> {
    let mut targets: Vec<RadarTarget> = arrays.into_iter().flat_map(|a| a.targets).collect();
    targets.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

    let mut merged = Vec::new();
    let mut group: Vec<RadarTarget> = Vec::new();
    for target in targets {
        if let Some(first) = group.first() {
            if (target.timestamp - first.timestamp).abs() >= RADAR_MERGE_WINDOW {
                merged.push(RadarTargetArray::from_targets(std::mem::take(&mut group)));
            }
        }
        group.push(target);
    }
    if !group.is_empty() {
        merged.push(RadarTargetArray::from_targets(group));
    }
    merged
}

fn time_span<F: TimedFrame>(frames: &[F]) -> Option<(Real, Real)> {
    Some((frames.first()?.timestamp(), frames.last()?.timestamp()))
}

fn avg_frequency<F: TimedFrame>(streams: &BTreeMap<String, Vec<F>>) -> Real {
    if streams.is_empty() {
        return -1.0;
    }
    let sum: Real = streams.values().map(|f| stream_frequency(f)).sum();
    sum / streams.len() as Real
}

fn stream_frequency<F: TimedFrame>(frames: &[F]) -> Real {
    match time_span(frames) {
        Some((first, last)) if last > first => frames.len() as Real / (last - first),
        _ => 0.0,
    }
}

/// Aligned sensor streams and their time windows.
#[derive(Debug, Clone)]
pub struct CalibDataManager {
    streams: SensorStreams,
    sfm: BTreeMap<String, Veta>,
    padding: Real,
    raw_start: Real,
    raw_end: Real,
    aligned_start: Real,
    aligned_end: Real,
    calib_start: Real,
    calib_end: Real,
}

impl CalibDataManager {
    /// Read, trim and align every configured topic of the message log.
    pub fn load(config: &CalibConfig) -> Result<Self> {
        info!("loading calibration data...");
        let ds = &config.data_stream;
        let log = MessageLog::open(&ds.log_path)?;
        let topics = config.all_topics();

        let (log_begin, log_end) = log.time_range(&topics).ok_or_else(|| {
            CalibError::MissingTopicData {
                topic: topics.join(", "),
            }
        })?;
        info!("source data duration: from '{log_begin:.5}' to '{log_end:.5}'");

        let mut begin = log_begin;
        let mut end = log_end;
        if ds.begin_time > 0.0 {
            begin += ds.begin_time;
            if begin >= log_end {
                warn!(
                    "begin time {:.3} s is beyond the log end, using the log begin instead",
                    ds.begin_time
                );
                begin = log_begin;
            }
        }
        if ds.duration > 0.0 {
            end = begin + ds.duration;
            if end > log_end {
                warn!(
                    "duration {:.3} s is beyond the log end, using the log end instead",
                    ds.duration
                );
                end = log_end;
            }
        }
        info!("expect data duration: from '{begin:.5}' to '{end:.5}'");

        let streams = Self::unpack_log(config, &log, &topics, begin, end)?;
        Self::from_streams(config, streams)
    }

    fn unpack_log(
        config: &CalibConfig,
        log: &MessageLog,
        topics: &[String],
        begin: Real,
        end: Real,
    ) -> Result<SensorStreams> {
        let ds = &config.data_stream;
        let gravity_norm = config.prior.gravity_norm;
        let mut streams = SensorStreams::default();
        for topic in ds.imu_topics.keys() {
            streams.imu.insert(topic.clone(), Vec::new());
        }
        for topic in ds.radar_topics.keys() {
            streams.radar.insert(topic.clone(), Vec::new());
        }
        for topic in ds.lidar_topics.keys() {
            streams.lidar.insert(topic.clone(), Vec::new());
        }
        for topic in ds.camera_topics.keys() {
            streams.camera.insert(topic.clone(), Vec::new());
        }

        let records: Vec<&LogRecord> = log.query(topics, begin, end).collect();
        let pb = progress_bar(records.len() as u64, "unpacking messages");
        let mut rejected: BTreeMap<&str, usize> = BTreeMap::new();
        for record in records {
            pb.inc(1);
            let topic = record.topic.as_str();
            let accepted = if let Some(frames) = streams.imu.get_mut(topic) {
                loaders::unpack_imu(config.imu_model(topic)?, record, gravity_norm)
                    .map(|f| frames.push(f))
            } else if let Some(frames) = streams.radar.get_mut(topic) {
                loaders::unpack_radar(config.radar_model(topic)?, record).map(|f| frames.push(f))
            } else if let Some(frames) = streams.lidar.get_mut(topic) {
                loaders::unpack_lidar(config.lidar_model(topic)?, record).map(|f| frames.push(f))
            } else if let Some(frames) = streams.camera.get_mut(topic) {
                loaders::unpack_camera(config.camera_model(topic)?, record).map(|f| frames.push(f))
            } else {
                continue;
            };
            if accepted.is_none() {
                let count = rejected.entry(topic).or_default();
                if *count == 0 {
                    warn!("message of '{topic}' at {:.5} does not match its sensor model, skipping", record.stamp);
                } else {
                    debug!("skipping message of '{topic}' at {:.5}", record.stamp);
                }
                *count += 1;
            }
        }
        pb.finish_and_clear();
        for (topic, count) in rejected {
            warn!("{count} message(s) of '{topic}' were skipped");
        }

        for (topic, arrays) in streams.radar.iter_mut() {
            if config.radar_model(topic)?.needs_target_merge() {
                let raw = std::mem::take(arrays);
                let n = raw.len();
                *arrays = merge_radar_targets(raw);
                debug!("'{topic}': merged {n} radar readings into {} arrays", arrays.len());
            }
        }
        Ok(streams)
    }

    /// Trim and align already decoded streams.
    ///
    /// Every configured topic must be present and non-empty.
    pub fn from_streams(config: &CalibConfig, mut streams: SensorStreams) -> Result<Self> {
        fn check<F>(topics: impl Iterator<Item = String>, map: &BTreeMap<String, Vec<F>>) -> Result<(), CalibError> {
            for topic in topics {
                if map.get(&topic).map_or(true, |f| f.is_empty()) {
                    return Err(CalibError::MissingTopicData { topic });
                }
            }
            Ok(())
        }
        let ds = &config.data_stream;
        check(ds.imu_topics.keys().cloned(), &streams.imu)?;
        check(ds.radar_topics.keys().cloned(), &streams.radar)?;
        check(ds.lidar_topics.keys().cloned(), &streams.lidar)?;
        check(ds.camera_topics.keys().cloned(), &streams.camera)?;
        streams.sort();

        let mut manager = Self {
            streams,
            sfm: BTreeMap::new(),
            padding: config.prior.time_offset_padding,
            raw_start: 0.0,
            raw_end: 0.0,
            aligned_start: 0.0,
            aligned_end: 0.0,
            calib_start: 0.0,
            calib_end: 0.0,
        };
        manager.output_data_status("loaded");
        manager.adjust_calib_data_sequence(config)?;
        manager.output_data_status("trimmed");
        manager.align_timestamp()?;
        manager.output_data_status("aligned");
        Ok(manager)
    }

    /// Intersect the stream ranges and trim every stream to it.
    fn adjust_calib_data_sequence(&mut self, config: &CalibConfig) -> Result<()> {
        info!("adjust calibration data sequence...");
        let mut start = (Real::NEG_INFINITY, String::new());
        let mut end = (Real::INFINITY, String::new());
        let mut tighten = |topic: &str, span: Option<(Real, Real)>| {
            if let Some((first, last)) = span {
                if first > start.0 {
                    start = (first, topic.to_string());
                }
                if last < end.0 {
                    end = (last, topic.to_string());
                }
            }
        };
        for (topic, frames) in &self.streams.imu {
            tighten(topic, time_span(frames));
        }
        if config.is_radar_integrated() {
            for (topic, frames) in &self.streams.radar {
                tighten(topic, time_span(frames));
            }
        }
        if config.is_lidar_integrated() {
            for (topic, frames) in &self.streams.lidar {
                tighten(topic, time_span(frames));
            }
        }
        if config.is_camera_integrated() {
            for (topic, frames) in &self.streams.camera {
                tighten(topic, time_span(frames));
            }
        }

        let ((raw_start, start_topic), (raw_end, end_topic)) = (start, end);
        if !(raw_start < raw_end) {
            return Err(CalibError::NoIntersection {
                first: start_topic,
                second: end_topic,
                start: raw_start,
                end: raw_end,
            }
            .into());
        }
        self.raw_start = raw_start;
        self.raw_end = raw_end;

        let pad2 = 2.0 * self.padding;
        let inertial = |t: Real| t >= raw_start && t <= raw_end;
        let other = |t: Real| t > raw_start + pad2 && t < raw_end - pad2;
        let stage = format!("trimming to [{raw_start:.5}, {raw_end:.5}]");
        let pair = |topic: &str| {
            if topic == start_topic && topic == end_topic {
                format!("'{topic}'")
            } else {
                format!("'{topic}' and the window set by '{start_topic}'/'{end_topic}'")
            }
        };

        trim_streams(&mut self.streams.imu, SensorKind::Imu, inertial, &stage, pair)?;
        trim_streams(&mut self.streams.radar, SensorKind::Radar, other, &stage, pair)?;
        trim_streams(&mut self.streams.lidar, SensorKind::Lidar, other, &stage, pair)?;
        trim_streams(&mut self.streams.camera, SensorKind::Camera, other, &stage, pair)?;
        Ok(())
    }

    /// Shift every time by `-raw_start` and derive the calibration window.
    fn align_timestamp(&mut self) -> Result<()> {
        info!("align calibration data timestamp...");
        let delta = -self.raw_start;
        fn shift<F: TimedFrame>(streams: &mut BTreeMap<String, Vec<F>>, delta: Real) {
            for frames in streams.values_mut() {
                frames.iter_mut().for_each(|f| f.shift_time(delta));
            }
        }
        shift(&mut self.streams.imu, delta);
        shift(&mut self.streams.radar, delta);
        shift(&mut self.streams.lidar, delta);
        shift(&mut self.streams.camera, delta);

        self.aligned_start = 0.0;
        self.aligned_end = self.raw_end - self.raw_start;
        self.calib_start = self.aligned_start + self.padding;
        self.calib_end = self.aligned_end - self.padding;
        if self.calib_start >= self.calib_end {
            return Err(CalibError::NoIntersection {
                first: "aligned window".to_string(),
                second: "time offset padding".to_string(),
                start: self.calib_start,
                end: self.calib_end,
            })
            .context("the data window is shorter than twice the time offset padding");
        }
        Ok(())
    }

    /// Log per-topic counts and spans, then the three windows.
    pub fn output_data_status(&self, stage: &str) {
        info!("calibration data info ({stage}):");
        fn report<F: TimedFrame>(kind: SensorKind, streams: &BTreeMap<String, Vec<F>>) {
            for (topic, frames) in streams {
                let (first, last) = time_span(frames).unwrap_or((Real::NAN, Real::NAN));
                info!(
                    "{kind} topic: '{topic}', data size: '{:06}', time span: from '{first:+010.5}' to '{last:+010.5}' (s)",
                    frames.len()
                );
            }
        }
        report(SensorKind::Imu, &self.streams.imu);
        report(SensorKind::Radar, &self.streams.radar);
        report(SensorKind::Lidar, &self.streams.lidar);
        report(SensorKind::Camera, &self.streams.camera);
        info!(
            "raw start time: '{:+010.5}' (s), raw end time: '{:+010.5}' (s)",
            self.raw_start, self.raw_end
        );
        info!(
            "aligned start time: '{:+010.5}' (s), aligned end time: '{:+010.5}' (s)",
            self.aligned_start, self.aligned_end
        );
        info!(
            "calib start time: '{:+010.5}' (s), calib end time: '{:+010.5}' (s)",
            self.calib_start, self.calib_end
        );
    }

    // ── windows ──

    pub fn raw_start_time(&self) -> Real {
        self.raw_start
    }

    pub fn raw_end_time(&self) -> Real {
        self.raw_end
    }

    pub fn aligned_start_time(&self) -> Real {
        self.aligned_start
    }

    pub fn aligned_end_time(&self) -> Real {
        self.aligned_end
    }

    pub fn aligned_time_range(&self) -> Real {
        self.aligned_end - self.aligned_start
    }

    pub fn calib_start_time(&self) -> Real {
        self.calib_start
    }

    pub fn calib_end_time(&self) -> Real {
        self.calib_end
    }

    pub fn calib_time_range(&self) -> Real {
        self.calib_end - self.calib_start
    }

    // ── streams ──

    pub fn imu_measurements(&self) -> &BTreeMap<String, Vec<ImuFrame>> {
        &self.streams.imu
    }

    pub fn radar_measurements(&self) -> &BTreeMap<String, Vec<RadarTargetArray>> {
        &self.streams.radar
    }

    pub fn lidar_measurements(&self) -> &BTreeMap<String, Vec<LidarFrame>> {
        &self.streams.lidar
    }

    pub fn camera_measurements(&self) -> &BTreeMap<String, Vec<CameraFrame>> {
        &self.streams.camera
    }

    pub fn imu_topic(&self, topic: &str) -> Result<&[ImuFrame]> {
        topic_frames(&self.streams.imu, topic)
    }

    pub fn radar_topic(&self, topic: &str) -> Result<&[RadarTargetArray]> {
        topic_frames(&self.streams.radar, topic)
    }

    pub fn lidar_topic(&self, topic: &str) -> Result<&[LidarFrame]> {
        topic_frames(&self.streams.lidar, topic)
    }

    pub fn camera_topic(&self, topic: &str) -> Result<&[CameraFrame]> {
        topic_frames(&self.streams.camera, topic)
    }

    /// Mean of `len / (last - first)` over LiDAR topics, -1.0 without any.
    pub fn lidar_avg_frequency(&self) -> Real {
        avg_frequency(&self.streams.lidar)
    }

    /// Mean of `len / (last - first)` over camera topics, -1.0 without any.
    pub fn camera_avg_frequency(&self) -> Real {
        avg_frequency(&self.streams.camera)
    }

    /// `len / (last - first)` of any topic.
    pub fn frequency(&self, topic: &str) -> Option<Real> {
        let s = &self.streams;
        s.imu
            .get(topic)
            .map(|f| stream_frequency(f))
            .or_else(|| s.radar.get(topic).map(|f| stream_frequency(f)))
            .or_else(|| s.lidar.get(topic).map(|f| stream_frequency(f)))
            .or_else(|| s.camera.get(topic).map(|f| stream_frequency(f)))
    }

    // ── SfM slot ──

    pub fn sfm_data(&self, topic: &str) -> Option<&Veta> {
        self.sfm.get(topic)
    }

    pub fn sfm_data_mut(&mut self, topic: &str) -> Option<&mut Veta> {
        self.sfm.get_mut(topic)
    }

    pub fn set_sfm_data(&mut self, topic: impl Into<String>, veta: Veta) {
        self.sfm.insert(topic.into(), veta);
    }

    pub(crate) fn sfm_map_mut(&mut self) -> &mut BTreeMap<String, Veta> {
        &mut self.sfm
    }
}

fn topic_frames<'a, F>(streams: &'a BTreeMap<String, Vec<F>>, topic: &str) -> Result<&'a [F]> {
    streams
        .get(topic)
        .map(Vec::as_slice)
        .ok_or_else(|| CalibError::MissingTopicData {
            topic: topic.to_string(),
        })
        .with_context(|| format!("no stream loaded for topic '{topic}'"))
}

fn trim_streams<F: TimedFrame>(
    streams: &mut BTreeMap<String, Vec<F>>,
    kind: SensorKind,
    keep: impl Fn(Real) -> bool,
    stage: &str,
    pair: impl Fn(&str) -> String,
) -> Result<(), CalibError> {
    for (topic, frames) in streams.iter_mut() {
        let before = frames.len();
        frames.retain(|f| keep(f.timestamp()));
        debug!("'{topic}': kept {} of {before} frames", frames.len());
        if frames.is_empty() {
            return Err(CalibError::EmptyStream {
                kind: kind.as_str(),
                topic: topic.clone(),
                stage: format!("{stage}, check the time intersection of {}", pair(topic)),
            });
        }
    }
    Ok(())
}
