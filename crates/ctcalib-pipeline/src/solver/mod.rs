//! Staged continuous-time calibration solver.
//!
//! [`CalibSolver`] owns the aligned data, the spline bundle and the
//! parameter manager. The stages in [`steps`] build a problem, solve it with
//! the sparse backend and write the result back. Between iterations the
//! backend reports to the viewer and the per-iteration debug writer.

pub mod callbacks;
mod problem;
pub mod steps;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ctcalib_core::{
    gravity_aligned_ref_to_world, quat_to_array, CalibConfig, CalibError, CalibParamManager,
    Iso3, OutputOption, Quat, Real, ScaleSplineType, SplineBundle,
};
use ctcalib_optim::{
    BackendSolution, BackendSolveOptions, IterationCallback, OptimBackend, ProblemIR,
    SparseLmBackend,
};
use log::{debug, info, warn};
use nalgebra::{DVector, Translation3};

use crate::data::CalibDataManager;
use crate::session::{LogEntry, SessionLog, SessionMetadata};
use crate::sfm::perform_transform_for_veta;
use crate::viewer::{Viewer, ViewerFrame};

use callbacks::{DebugCallback, ViewerCallback};
use problem::{apply_to_bundle, apply_to_landmarks, apply_to_params};

pub use steps::{
    run_calibration, run_steps, step_gravity_align, step_gravity_init, step_inertial_align,
    step_joint_refine, step_so3_init, step_visual_init,
};

pub struct CalibSolver<'a> {
    config: &'a CalibConfig,
    data: CalibDataManager,
    params: CalibParamManager,
    bundle: SplineBundle,
    viewer: Option<Viewer>,
    debug: Option<DebugCallback>,
    session: SessionLog,
    backend: SparseLmBackend,
    solve_opts: BackendSolveOptions,
    /// Iterations run so far, across stages.
    iterations: usize,
}

impl<'a> CalibSolver<'a> {
    /// Create the trajectory over the calibration window and start the
    /// optional viewer and per-iteration output.
    pub fn new(
        config: &'a CalibConfig,
        data: CalibDataManager,
        params: CalibParamManager,
    ) -> Result<Self> {
        let scale_type = ScaleSplineType::from_integration(
            config.is_lidar_integrated(),
            config.is_camera_integrated(),
            config.is_radar_integrated(),
        );
        let knots = &config.prior.knot_time_dist;
        let bundle = SplineBundle::new(
            data.calib_start_time(),
            data.calib_end_time(),
            knots.so3_spline,
            knots.scale_spline,
            scale_type,
        );

        let viewer = match Viewer::spawn(config.preference.viewer, &config.viewer_dir()) {
            Ok(viewer) => viewer,
            Err(e) => {
                warn!("running without viewer: {e:#}");
                None
            }
        };
        let debug = config
            .output_enabled(OutputOption::ParamInEachIter)
            .then(|| DebugCallback::create(config.epoch_dir(), config.preference.output_data_format));

        let session = SessionLog::new(SessionMetadata::new(
            scale_type.as_str(),
            config.all_topics(),
        ));
        let solve_opts = BackendSolveOptions {
            max_iters: config.preference.max_iters,
            ..BackendSolveOptions::default()
        };

        Ok(Self {
            config,
            data,
            params,
            bundle,
            viewer,
            debug,
            session,
            backend: SparseLmBackend::new(config.preference.available_threads),
            solve_opts,
            iterations: 0,
        })
    }

    pub fn config(&self) -> &CalibConfig {
        self.config
    }

    pub fn data(&self) -> &CalibDataManager {
        &self.data
    }

    pub fn params(&self) -> &CalibParamManager {
        &self.params
    }

    pub fn bundle(&self) -> &SplineBundle {
        &self.bundle
    }

    pub fn session(&self) -> &SessionLog {
        &self.session
    }

    pub(crate) fn log_success_with_notes(
        &mut self,
        operation: &str,
        notes: impl Into<String>,
        cost: Option<f64>,
    ) {
        let entry = LogEntry::success_with_notes(operation, notes);
        self.session.push(match cost {
            Some(cost) => entry.with_cost(cost),
            None => entry,
        });
    }

    pub(crate) fn log_failure(&mut self, operation: &str, error: impl Into<String>) {
        self.session.push(LogEntry::failure(operation, error));
    }

    // ── pose queries ──

    /// Body-to-world pose at body time `t`; `Ok(None)` outside the
    /// trajectory.
    pub fn cur_body_to_world(&self, t: Real) -> Result<Option<Iso3>> {
        self.bundle.ensure_position("cur_body_to_world")?;
        Ok(self.bundle.body_to_world(t))
    }

    /// Sensor-to-world pose of `topic` at its local time `t`.
    pub fn cur_sensor_to_world(&self, t: Real, topic: &str) -> Result<Option<Iso3>> {
        self.bundle.ensure_position("cur_sensor_to_world")?;
        let to = self.params.time_offset(topic)?;
        let ext = self.params.extrinsic(topic)?.to_iso3();
        Ok(self.bundle.body_to_world(t + to).map(|pose| pose * ext))
    }

    // ── solving ──

    /// Solve `ir` with the registered callbacks and write the result back.
    pub(crate) fn solve(
        &mut self,
        stage: &str,
        ir: ProblemIR,
        initial: HashMap<String, DVector<f64>>,
    ) -> Result<BackendSolution> {
        info!(
            "stage '{stage}': {} parameter blocks, residuals {:?}",
            ir.params.len(),
            ir.factor_histogram()
        );

        let mut viewer_cb = self
            .viewer
            .as_ref()
            .map(|v| ViewerCallback::new(v, &self.bundle, &self.params, self.iterations));
        let mut debug_cb = self.debug.as_mut().map(|d| d.stage(&self.params));
        let mut callbacks: Vec<&mut dyn IterationCallback> = Vec::new();
        if let Some(cb) = viewer_cb.as_mut() {
            callbacks.push(cb);
        }
        if let Some(cb) = debug_cb.as_mut() {
            callbacks.push(cb);
        }

        let solution = self
            .backend
            .solve(&ir, &initial, &self.solve_opts, &mut callbacks)
            .with_context(|| format!("solving stage '{stage}'"))?;
        drop(callbacks);
        drop(viewer_cb);
        drop(debug_cb);

        self.iterations += solution.iterations;
        let get = |name: &str| solution.params.get(name);
        apply_to_bundle(get, &mut self.bundle);
        apply_to_params(get, &mut self.params);
        apply_to_landmarks(get, self.data.sfm_map_mut());

        if let Some(viewer) = &self.viewer {
            viewer.send(ViewerFrame::snapshot(
                self.iterations,
                solution.final_cost,
                &self.bundle,
                &self.params,
            ));
        }
        info!(
            "stage '{stage}': cost {:.6e} -> {:.6e} in {} iterations",
            solution.initial_cost, solution.final_cost, solution.iterations
        );
        Ok(solution)
    }

    // ── gravity ──

    /// Rotate the world so that gravity points along `-z`, keeping the
    /// heading of the first body frame. Returns the applied rotation.
    pub fn perform_gravity_alignment(&mut self) -> Quat {
        let so3 = &self.bundle.so3;
        let b0 = so3.evaluate(so3.min_time()).unwrap_or_else(Quat::identity);
        let ref_to_w = gravity_aligned_ref_to_world(&b0, &self.params.gravity);

        self.params.gravity = ref_to_w * self.params.gravity;
        self.bundle.rotate_world(&ref_to_w);
        let rotation = Iso3::from_parts(Translation3::identity(), ref_to_w);
        for veta in self.data.sfm_map_mut().values_mut() {
            perform_transform_for_veta(veta, &rotation, 1.0);
        }

        info!(
            "gravity aligned by {:.4} deg, gravity [{:+.6}, {:+.6}, {:+.6}]",
            ref_to_w.angle().to_degrees(),
            self.params.gravity.x,
            self.params.gravity.y,
            self.params.gravity.z
        );
        ref_to_w
    }

    // ── outputs ──

    /// Write the parameters to `<output>/iteration/stage/<desc>.<ext>`.
    pub fn save_stage_calib_param(&self, desc: &str) -> Result<PathBuf> {
        let dir = self.config.stage_dir();
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("cannot create the stage directory '{}': {e}", dir.display());
        }
        let format = self.config.preference.output_data_format;
        let path = dir.join(format!("{desc}.{}", format.extension()));
        self.params
            .save(&path, format)
            .with_context(|| format!("saving the '{desc}' checkpoint"))?;
        debug!("checkpoint '{desc}' written to '{}'", path.display());
        Ok(path)
    }

    /// Body trajectory sampled every `dt` seconds as
    /// `t,qx,qy,qz,qw,px,py,pz`.
    pub fn trajectory_csv(&self, dt: Real) -> Result<String> {
        self.bundle.ensure_position("trajectory_csv")?;
        anyhow::ensure!(dt > 0.0, "trajectory sample period must be positive, got {dt}");

        let (start, end) = (self.bundle.so3.min_time(), self.bundle.so3.max_time());
        let mut csv = String::from("t,qx,qy,qz,qw,px,py,pz\n");
        let count = ((end - start) / dt).floor() as usize;
        for k in 0..=count {
            let t = start + k as Real * dt;
            let Some(pose) = self.bundle.body_to_world(t) else {
                continue;
            };
            let [qx, qy, qz, qw] = quat_to_array(&pose.rotation);
            let p = pose.translation.vector;
            let _ = writeln!(
                csv,
                "{t:.6},{qx:.9},{qy:.9},{qz:.9},{qw:.9},{:.6},{:.6},{:.6}",
                p.x, p.y, p.z
            );
        }
        Ok(csv)
    }

    pub fn save_trajectory(&self, path: &Path) -> Result<()> {
        let csv = self.trajectory_csv(self.config.preference.trajectory_sample_dt)?;
        fs::write(path, csv).map_err(|e| CalibError::io(path, e))?;
        info!("trajectory written to '{}'", path.display());
        Ok(())
    }

    fn session_file(&self) -> PathBuf {
        let format = self.config.preference.output_data_format;
        self.config
            .output_dir()
            .join(format!("session_log.{}", format.extension()))
    }

    /// Stop the viewer and write the session log.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(viewer) = self.viewer.as_mut() {
            viewer.shutdown();
        }
        let path = self.session_file();
        if let Some(dir) = path.parent() {
            if let Err(e) = fs::create_dir_all(dir) {
                warn!("cannot create the output directory '{}': {e}", dir.display());
            }
        }
        self.session
            .save(&path, self.config.preference.output_data_format)
            .context("saving the session log")
    }
}

impl Drop for CalibSolver<'_> {
    fn drop(&mut self) {
        if let Some(viewer) = self.viewer.as_mut() {
            viewer.shutdown();
        }
    }
}
