//! Step functions of the staged calibration.
//!
//! Each step operates on a [`CalibSolver`], appends a session entry and
//! writes a stage checkpoint. [`run_calibration`] runs them in order.

use anyhow::{anyhow, Context, Result};
use ctcalib_core::{
    rotation_angle_between, CalibConfig, CalibError, CalibParamManager, OutputOption, Quat,
    ScaleSplineType, Vec3,
};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::data::CalibDataManager;
use crate::lidar::SurfelMap;
use crate::sfm::{
    downsample_veta, handeye_rotation, match_candidates, perform_transform_for_veta,
    store_images_for_sfm, try_load_sfm_data, umeyama, Veta,
};

use super::problem::{ProblemBuilder, SensorFreedom};
use super::CalibSolver;

// ─────────────────────────────────────────────────────────────────────────────
// Helper Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Minimum relative body rotation of a view pair used for the camera
/// rotation estimate, degrees.
const MIN_PAIR_ROTATION_DEG: f64 = 1.0;

impl CalibSolver<'_> {
    /// Estimated blocks of a sensor that is not the reference IMU.
    fn sensor_freedom(&self, topic: &str, position: bool) -> SensorFreedom {
        if topic == self.config.data_stream.reference_imu {
            return SensorFreedom::FIXED;
        }
        SensorFreedom {
            rotation: true,
            position,
            time_offset: self.config.prior.optimize_time_offsets,
        }
    }

    fn builder(&self, free_scale: bool, free_gravity: bool) -> ProblemBuilder<'_> {
        ProblemBuilder::new(
            &self.bundle,
            &self.params,
            self.config.prior.time_offset_padding,
            free_scale,
            free_gravity,
        )
    }
}

/// Add gyroscope factors of every IMU; returns the number added.
fn add_gyro_factors(solver: &CalibSolver<'_>, builder: &mut ProblemBuilder<'_>) -> usize {
    let mut added = 0;
    for (topic, frames) in solver.data.imu_measurements() {
        let Some(cfg) = solver.config.data_stream.imu_topics.get(topic) else {
            continue;
        };
        let freedom = solver.sensor_freedom(topic, false);
        for frame in frames {
            if builder.add_gyro(topic, frame, cfg.gyro_weight, freedom, true) {
                added += 1;
            }
        }
    }
    added
}

fn add_acce_factors(solver: &CalibSolver<'_>, builder: &mut ProblemBuilder<'_>) -> usize {
    let mut added = 0;
    for (topic, frames) in solver.data.imu_measurements() {
        let Some(cfg) = solver.config.data_stream.imu_topics.get(topic) else {
            continue;
        };
        let freedom = solver.sensor_freedom(topic, true);
        for frame in frames {
            if builder.add_acce(topic, frame, cfg.acce_weight, freedom, true) {
                added += 1;
            }
        }
    }
    added
}

fn add_radar_factors(solver: &CalibSolver<'_>, builder: &mut ProblemBuilder<'_>) -> usize {
    let mut added = 0;
    for (topic, arrays) in solver.data.radar_measurements() {
        let Some(cfg) = solver.config.data_stream.radar_topics.get(topic) else {
            continue;
        };
        let freedom = solver.sensor_freedom(topic, true);
        for target in arrays.iter().flat_map(|a| &a.targets) {
            if builder.add_radar(topic, target, cfg.weight, freedom) {
                added += 1;
            }
        }
    }
    added
}

/// Point-to-plane factors of every LiDAR against a surfel map of its own
/// scans under the current estimate. Returns the surfel and factor counts.
fn add_lidar_factors(
    solver: &CalibSolver<'_>,
    builder: &mut ProblemBuilder<'_>,
) -> Result<(usize, usize)> {
    let map_cfg = &solver.config.prior.lidar_map;
    let (mut surfels, mut added) = (0, 0);
    for (topic, frames) in solver.data.lidar_measurements() {
        let Some(cfg) = solver.config.data_stream.lidar_topics.get(topic) else {
            continue;
        };
        let mut samples = Vec::new();
        for point in frames
            .iter()
            .flat_map(|f| f.points.iter().step_by(map_cfg.point_stride))
        {
            if let Some(pose) = solver.cur_sensor_to_world(point.timestamp, topic)? {
                let p_w = pose.transform_point(&point.position.into()).coords;
                samples.push((point.timestamp, point.position, p_w));
            }
        }

        let map = SurfelMap::build(samples.iter().map(|(_, _, p_w)| p_w), map_cfg);
        if map.is_empty() {
            warn!("LiDAR '{topic}': no planar voxel among {} points", samples.len());
            continue;
        }
        let freedom = solver.sensor_freedom(topic, true);
        let before = added;
        for (t, p_l, p_w) in &samples {
            let Some(surfel) = map.associate(p_w) else {
                continue;
            };
            if builder.add_lidar_point(
                topic,
                *t,
                p_l,
                surfel.plane(),
                cfg.weight,
                freedom,
                map_cfg.robust_scale,
            ) {
                added += 1;
            }
        }
        info!(
            "LiDAR '{topic}': {} surfels, {} of {} points associated",
            map.len(),
            added - before,
            samples.len()
        );
        surfels += map.len();
    }
    Ok((surfels, added))
}

/// Camera-pose and reprojection factors of every reconstructed camera.
fn add_visual_factors(
    solver: &CalibSolver<'_>,
    builder: &mut ProblemBuilder<'_>,
) -> Result<(usize, usize)> {
    let (mut poses, mut reprojections) = (0, 0);
    for (topic, cfg) in &solver.config.data_stream.camera_topics {
        let Some(veta) = solver.data.sfm_data(topic) else {
            continue;
        };
        let freedom = solver.sensor_freedom(topic, true);
        for (t, pose) in veta.timed_poses() {
            if builder.add_camera_pose(
                topic,
                t,
                &pose.rotation,
                &pose.translation.vector,
                cfg.weight,
                freedom,
            ) {
                poses += 1;
            }
        }

        let intri = solver.params.camera_intrinsics(topic)?;
        let k = [intri.fx, intri.fy, intri.cx, intri.cy];
        for (lm_id, lm) in &veta.landmarks {
            for (view_id, obs) in &lm.obs {
                let Some(view) = veta.views.get(view_id) else {
                    continue;
                };
                if builder.add_reprojection(
                    topic,
                    view.timestamp,
                    *lm_id,
                    &lm.position,
                    obs,
                    k,
                    cfg.reproj_weight,
                    freedom,
                ) {
                    reprojections += 1;
                }
            }
        }
    }
    Ok((poses, reprojections))
}

/// Body-to-camera rotation from the relative rotations of consecutive views.
fn estimate_camera_rotation(
    solver: &CalibSolver<'_>,
    topic: &str,
    veta: &Veta,
) -> Result<Option<Quat>> {
    let offset = solver.params.time_offset(topic)?;
    let so3 = &solver.bundle.so3;
    let timed: Vec<_> = veta
        .timed_poses()
        .into_iter()
        .filter_map(|(t, pose)| so3.evaluate(t + offset).map(|body| (body, pose.rotation)))
        .collect();

    let pairs: Vec<_> = timed
        .windows(2)
        .filter_map(|w| {
            let (body_i, cam_i) = w[0];
            let (body_j, cam_j) = w[1];
            let a = body_i.inverse() * body_j;
            let b = cam_i.inverse() * cam_j;
            (a.angle().to_degrees() >= MIN_PAIR_ROTATION_DEG).then_some((a, b))
        })
        .collect();
    if pairs.len() < 2 {
        warn!(
            "camera '{topic}': {} usable view pairs, keeping the current rotation",
            pairs.len()
        );
        return Ok(None);
    }
    handeye_rotation(&pairs)
        .map(Some)
        .with_context(|| format!("estimating the rotation of camera '{topic}'"))
}

/// Bring one reconstruction into the spline's world frame.
fn align_reconstruction(solver: &mut CalibSolver<'_>, topic: &str, mut veta: Veta) -> Result<Veta> {
    if let Some(rot) = estimate_camera_rotation(solver, topic, &veta)? {
        if let Some(ext) = solver.params.extri.get_mut(topic) {
            info!(
                "camera '{topic}': initial rotation changed by {:.3} deg",
                rotation_angle_between(&ext.so3, &rot).to_degrees()
            );
            ext.so3 = rot;
        }
    }

    let (mut src, mut dst) = (Vec::new(), Vec::new());
    for (t, pose) in veta.timed_poses() {
        if let Some(predicted) = solver.cur_sensor_to_world(t, topic)? {
            src.push(pose.translation.vector);
            dst.push(predicted.translation.vector);
        }
    }
    let (sfm_to_world, scale) = umeyama(&src, &dst)
        .with_context(|| format!("aligning the reconstruction of camera '{topic}'"))?;
    info!(
        "camera '{topic}': similarity from {} views, scale {scale:.6}",
        src.len()
    );
    perform_transform_for_veta(&mut veta, &sfm_to_world, scale);
    Ok(veta)
}

/// Gravity from the reference IMU's mean specific force over the first
/// `window` seconds of the calibration window.
fn initial_gravity(solver: &CalibSolver<'_>, window: f64) -> Result<Vec3> {
    let topic = &solver.config.data_stream.reference_imu;
    let frames = solver.data.imu_topic(topic)?;
    let bias = solver.params.imu_intrinsics(topic)?.acce_bias;
    let start = solver.data.calib_start_time();

    let (mut sum, mut count) = (Vec3::zeros(), 0usize);
    for frame in frames
        .iter()
        .skip_while(|f| f.timestamp < start)
        .take_while(|f| f.timestamp <= start + window)
    {
        if let Some(rot) = solver.bundle.so3.evaluate(frame.timestamp) {
            sum -= rot * (frame.acce - bias);
            count += 1;
        }
    }
    if count == 0 {
        return Err(CalibError::MissingTopicData {
            topic: topic.clone(),
        })
        .context("no reference IMU frame inside the gravity window");
    }
    let mean = sum / count as f64;
    mean.try_normalize(1e-9)
        .map(|dir| dir * solver.config.prior.gravity_norm)
        .ok_or_else(|| anyhow!("the mean specific force over the gravity window vanishes"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Step Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Recover the orientation spline from the gyroscopes.
pub fn step_so3_init(solver: &mut CalibSolver<'_>) -> Result<()> {
    let (ir, initial, gyro) = {
        let mut builder = solver.builder(false, false);
        let gyro = add_gyro_factors(solver, &mut builder);
        let (ir, initial) = builder.finish();
        (ir, initial, gyro)
    };
    if gyro == 0 {
        solver.log_failure("so3_init", "no gyroscope frame inside the trajectory");
        return Err(anyhow!("no gyroscope frame inside the trajectory"));
    }

    let solution = solver.solve("so3_init", ir, initial)?;
    solver.params.log_status();
    solver.log_success_with_notes(
        "so3_init",
        format!("{gyro} gyroscope factors, {} iterations", solution.iterations),
        Some(solution.final_cost),
    );
    solver.save_stage_calib_param("stage_1_so3_init")?;
    Ok(())
}

/// Initial gravity in the world frame of the orientation spline.
pub fn step_gravity_init(solver: &mut CalibSolver<'_>) -> Result<()> {
    let window = solver.config.prior.gravity_init_window;
    let gravity = match initial_gravity(solver, window) {
        Ok(g) => g,
        Err(e) => {
            solver.log_failure("gravity_init", format!("{e:#}"));
            return Err(e);
        }
    };
    info!(
        "initial gravity [{:+.6}, {:+.6}, {:+.6}]",
        gravity.x, gravity.y, gravity.z
    );
    solver.params.gravity = gravity;
    solver.log_success_with_notes("gravity_init", format!("window {window:.3} s"), None);
    solver.save_stage_calib_param("stage_2_gravity_init")?;
    Ok(())
}

/// Fit the scale spline, gravity and lever arms to the accelerometers and
/// radars.
pub fn step_inertial_align(solver: &mut CalibSolver<'_>) -> Result<()> {
    let (ir, initial, notes) = {
        let mut builder = solver.builder(true, true);
        let gyro = add_gyro_factors(solver, &mut builder);
        let acce = add_acce_factors(solver, &mut builder);
        let radar = if solver.config.is_radar_integrated() {
            add_radar_factors(solver, &mut builder)
        } else {
            0
        };
        let (ir, initial) = builder.finish();
        (ir, initial, format!("{gyro} gyro, {acce} acce, {radar} radar factors"))
    };

    let solution = solver.solve("inertial_align", ir, initial)?;
    solver.params.log_status();
    solver.log_success_with_notes("inertial_align", notes, Some(solution.final_cost));
    solver.save_stage_calib_param("stage_3_inertial_align")?;
    Ok(())
}

/// Import the reconstruction of every camera and align it with the
/// trajectory. A camera without one gets an exported workspace, and the run
/// stops with [`CalibError::SfmReconstructionRequired`].
pub fn step_visual_init(solver: &mut CalibSolver<'_>) -> Result<()> {
    let config = solver.config;
    if !config.is_camera_integrated() {
        return Ok(());
    }
    let sfm = &config.prior.sfm;
    let mut rng = match config.preference.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    };

    let mut notes = Vec::new();
    for topic in config.data_stream.camera_topics.keys() {
        let loaded = try_load_sfm_data(
            config,
            &solver.data,
            &solver.params,
            topic,
            sfm.reproj_error_thd,
            sfm.track_len_thd,
        )?;
        let Some(veta) = loaded else {
            let frames = solver.data.camera_topic(topic)?;
            let pairs = match_candidates(
                frames,
                &solver.bundle.so3,
                solver.params.extrinsic(topic)?,
                solver.params.time_offset(topic)?,
                sfm.match_window,
                sfm.match_max_angle_deg,
            );
            let command_file = store_images_for_sfm(config, &solver.data, &solver.params, topic, &pairs)?;
            solver.log_failure("visual_init", format!("camera '{topic}' needs a reconstruction"));
            return Err(CalibError::SfmReconstructionRequired {
                topic: topic.clone(),
                command_file,
            }
            .into());
        };

        let mut veta = align_reconstruction(solver, topic, veta)?;
        downsample_veta(&mut veta, sfm.landmark_num_thd, sfm.obs_num_thd, &mut rng);
        notes.push(format!(
            "'{topic}': {} views, {} landmarks",
            veta.views.len(),
            veta.landmark_count()
        ));
        solver.data.set_sfm_data(topic.clone(), veta);
    }

    solver.log_success_with_notes("visual_init", notes.join("; "), None);
    solver.save_stage_calib_param("stage_4_visual_init")?;
    Ok(())
}

/// Refine everything against every factor.
pub fn step_joint_refine(solver: &mut CalibSolver<'_>) -> Result<()> {
    let (ir, initial, notes) = {
        let mut builder = solver.builder(true, true);
        let gyro = add_gyro_factors(solver, &mut builder);
        let acce = add_acce_factors(solver, &mut builder);
        let radar = add_radar_factors(solver, &mut builder);
        let (poses, reproj) = add_visual_factors(solver, &mut builder)?;
        let (surfels, lidar) = add_lidar_factors(solver, &mut builder)?;
        let (ir, initial) = builder.finish();
        let notes = format!(
            "{gyro} gyro, {acce} acce, {radar} radar, {poses} camera pose, \
             {reproj} reprojection, {lidar} point-to-plane factors on {surfels} surfels"
        );
        (ir, initial, notes)
    };

    let solution = solver.solve("joint_refine", ir, initial)?;
    solver.params.log_status();
    solver.log_success_with_notes("joint_refine", notes, Some(solution.final_cost));
    solver.save_stage_calib_param("stage_5_joint_refine")?;
    Ok(())
}

/// Align the world with gravity and write the final outputs.
pub fn step_gravity_align(solver: &mut CalibSolver<'_>) -> Result<()> {
    let rot = solver.perform_gravity_alignment();
    solver.save_stage_calib_param("stage_6_gravity_align")?;

    let config = solver.config;
    let format = config.preference.output_data_format;
    let final_file = config.final_param_file();
    solver
        .params
        .save(&final_file, format)
        .context("saving the final parameters")?;
    info!("final parameters written to '{}'", final_file.display());

    if config.output_enabled(OutputOption::Trajectory) {
        if solver.bundle.scale_type == ScaleSplineType::LinPos {
            solver.save_trajectory(&config.trajectory_file())?;
        } else {
            warn!(
                "the trajectory output needs a position spline, the scale spline is {}",
                solver.bundle.scale_type.as_str()
            );
        }
    }

    solver.log_success_with_notes(
        "gravity_align",
        format!("world rotated by {:.4} deg", rot.angle().to_degrees()),
        None,
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline Function
// ─────────────────────────────────────────────────────────────────────────────

/// Run every stage in order.
pub fn run_steps(solver: &mut CalibSolver<'_>) -> Result<()> {
    step_so3_init(solver)?;
    step_gravity_init(solver)?;
    step_inertial_align(solver)?;
    step_visual_init(solver)?;
    step_joint_refine(solver)?;
    step_gravity_align(solver)?;
    Ok(())
}

/// Load the data, solve and write the outputs of one configuration.
///
/// The session log is written even when a stage fails.
pub fn run_calibration(config: &CalibConfig) -> Result<CalibParamManager> {
    let data = CalibDataManager::load(config)?;
    let params = CalibParamManager::from_config(config)?;
    let mut solver = CalibSolver::new(config, data, params)?;

    let result = run_steps(&mut solver);
    if let Err(e) = solver.finish() {
        warn!("{e:#}");
    }
    result?;
    Ok(solver.params().clone())
}
