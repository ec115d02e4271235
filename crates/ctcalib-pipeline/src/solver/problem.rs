//! IR construction for the solver stages.
//!
//! Parameter blocks are created lazily, the first time a factor references
//! them, under stable names. The same names are used to write solutions and
//! iteration snapshots back into the spline bundle and parameter manager.

use std::collections::{BTreeMap, HashMap};

use ctcalib_core::{
    quat_from_slice, quat_to_array, topic_slug, CalibParamManager, ImuFrame, Quat, RadarTarget,
    Real, ScaleSplineType, SplineBundle, Vec3,
};
use ctcalib_optim::{
    Bound, FactorKind, FixedMask, ManifoldKind, ParamId, ProblemIR, ResidualBlock, RobustLoss,
    SegmentTime,
};
use nalgebra::DVector;

use crate::sfm::{Observation, Veta};

// ─────────────────────────────────────────────────────────────────────────────
// Block names
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn so3_knot_name(i: usize) -> String {
    format!("so3_knot_{i}")
}

pub(crate) fn scale_knot_name(j: usize) -> String {
    format!("scale_knot_{j}")
}

pub(crate) fn so3_name(topic: &str) -> String {
    format!("so3_{topic}")
}

pub(crate) fn pos_name(topic: &str) -> String {
    format!("pos_{topic}")
}

pub(crate) fn time_offset_name(topic: &str) -> String {
    format!("to_{topic}")
}

pub(crate) fn gyro_bias_name(topic: &str) -> String {
    format!("gyro_bias_{topic}")
}

pub(crate) fn acce_bias_name(topic: &str) -> String {
    format!("acce_bias_{topic}")
}

pub(crate) const GRAVITY: &str = "gravity";

pub(crate) fn landmark_name(topic: &str, id: u64) -> String {
    format!("landmark_{}_{id}", topic_slug(topic))
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Which sensor-side blocks of a topic are estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SensorFreedom {
    pub rotation: bool,
    pub position: bool,
    pub time_offset: bool,
}

impl SensorFreedom {
    pub const FIXED: Self = Self {
        rotation: false,
        position: false,
        time_offset: false,
    };
}

/// Incremental builder of one stage's problem.
pub(crate) struct ProblemBuilder<'a> {
    bundle: &'a SplineBundle,
    params: &'a CalibParamManager,
    padding: Real,
    free_scale: bool,
    free_gravity: bool,
    ir: ProblemIR,
    initial: HashMap<String, DVector<f64>>,
    ids: HashMap<String, ParamId>,
}

impl<'a> ProblemBuilder<'a> {
    /// `free_scale` and `free_gravity` select whether the scale knots and
    /// gravity are estimated. The gauge is fixed regardless: the first
    /// orientation knot, the first two position knots, and gravity on an
    /// acceleration spline.
    pub fn new(
        bundle: &'a SplineBundle,
        params: &'a CalibParamManager,
        padding: Real,
        free_scale: bool,
        free_gravity: bool,
    ) -> Self {
        Self {
            bundle,
            params,
            padding,
            free_scale,
            free_gravity: free_gravity && bundle.scale_type != ScaleSplineType::LinAcce,
            ir: ProblemIR::new(),
            initial: HashMap::new(),
            ids: HashMap::new(),
        }
    }

    fn block(
        &mut self,
        name: String,
        manifold: ManifoldKind,
        value: &[f64],
        fixed: bool,
        bounds: Option<Vec<Bound>>,
    ) -> ParamId {
        if let Some(id) = self.ids.get(&name) {
            return *id;
        }
        let dim = value.len();
        let id = self.ir.add_param_block(
            name.clone(),
            dim,
            manifold,
            FixedMask::fixed_if(fixed, dim),
            if fixed { None } else { bounds },
        );
        self.initial
            .insert(name.clone(), DVector::from_column_slice(value));
        self.ids.insert(name, id);
        id
    }

    fn so3_knots(&mut self, first: usize) -> Vec<ParamId> {
        (first..first + 4)
            .map(|i| {
                let value = quat_to_array(&self.bundle.so3.knots()[i]);
                self.block(so3_knot_name(i), ManifoldKind::SO3, &value, i == 0, None)
            })
            .collect()
    }

    fn scale_knots(&mut self, first: usize) -> Vec<ParamId> {
        let pinned = if self.bundle.scale_type == ScaleSplineType::LinPos {
            2
        } else {
            0
        };
        (first..first + 4)
            .map(|j| {
                let value = self.bundle.scale.knots()[j];
                let fixed = !self.free_scale || j < pinned;
                self.block(
                    scale_knot_name(j),
                    ManifoldKind::Euclidean,
                    value.as_slice(),
                    fixed,
                    None,
                )
            })
            .collect()
    }

    fn sensor_blocks(&mut self, topic: &str, freedom: SensorFreedom, with_pos: bool) -> Vec<ParamId> {
        let ext = self.params.extri.get(topic).copied().unwrap_or_default();
        let to = self.params.temporal.get(topic).copied().unwrap_or(0.0);
        let mut ids = vec![self.block(
            so3_name(topic),
            ManifoldKind::SO3,
            &quat_to_array(&ext.so3),
            !freedom.rotation,
            None,
        )];
        if with_pos {
            ids.push(self.block(
                pos_name(topic),
                ManifoldKind::Euclidean,
                ext.pos.as_slice(),
                !freedom.position,
                None,
            ));
        }
        let pad = self.padding;
        ids.push(self.block(
            time_offset_name(topic),
            ManifoldKind::Euclidean,
            &[to],
            !freedom.time_offset,
            Some(vec![Bound {
                idx: 0,
                lower: -pad,
                upper: pad,
            }]),
        ));
        ids
    }

    fn gravity(&mut self) -> ParamId {
        let g = self.params.gravity;
        let fixed = !self.free_gravity;
        self.block(GRAVITY.to_string(), ManifoldKind::S2, g.as_slice(), fixed, None)
    }

    /// Body time of a sensor sample under the current offset.
    fn body_time(&self, topic: &str, t: Real) -> Real {
        t + self.params.temporal.get(topic).copied().unwrap_or(0.0)
    }

    fn so3_segment(&self, t_body: Real) -> Option<(usize, SegmentTime)> {
        let spline = &self.bundle.so3;
        let (idx, _) = spline.segment(t_body)?;
        Some((
            idx,
            SegmentTime {
                t0: spline.grid().segment_start(idx),
                dt: spline.dt(),
            },
        ))
    }

    fn scale_segment(&self, t_body: Real) -> Option<(usize, SegmentTime)> {
        let spline = &self.bundle.scale;
        let (idx, _) = spline.segment(t_body)?;
        Some((
            idx,
            SegmentTime {
                t0: spline.grid().segment_start(idx),
                dt: spline.dt(),
            },
        ))
    }

    fn add(&mut self, factor: FactorKind, params: Vec<ParamId>, loss: RobustLoss) {
        self.ir
            .add_residual_block(ResidualBlock::new(factor, params, loss));
    }

    /// Returns `false` when the sample lies outside the trajectory.
    pub fn add_gyro(
        &mut self,
        topic: &str,
        frame: &ImuFrame,
        weight: f64,
        freedom: SensorFreedom,
        free_bias: bool,
    ) -> bool {
        let Some((i, so3_seg)) = self.so3_segment(self.body_time(topic, frame.timestamp)) else {
            return false;
        };
        let mut ids = self.so3_knots(i);
        ids.extend(self.sensor_blocks(topic, freedom, false));
        let bias = self
            .params
            .imu_intri
            .get(topic)
            .map(|b| b.gyro_bias)
            .unwrap_or_else(Vec3::zeros);
        ids.push(self.block(
            gyro_bias_name(topic),
            ManifoldKind::Euclidean,
            bias.as_slice(),
            !free_bias,
            None,
        ));
        self.add(
            FactorKind::ImuGyro {
                t: frame.timestamp,
                gyro: frame.gyro.into(),
                so3_seg,
                w: weight,
            },
            ids,
            RobustLoss::None,
        );
        true
    }

    pub fn add_acce(
        &mut self,
        topic: &str,
        frame: &ImuFrame,
        weight: f64,
        freedom: SensorFreedom,
        free_bias: bool,
    ) -> bool {
        let t_body = self.body_time(topic, frame.timestamp);
        let (Some((i, so3_seg)), Some((j, scale_seg))) =
            (self.so3_segment(t_body), self.scale_segment(t_body))
        else {
            return false;
        };
        let mut ids = self.so3_knots(i);
        ids.extend(self.scale_knots(j));
        ids.extend(self.sensor_blocks(topic, freedom, true));
        let bias = self
            .params
            .imu_intri
            .get(topic)
            .map(|b| b.acce_bias)
            .unwrap_or_else(Vec3::zeros);
        ids.push(self.block(
            acce_bias_name(topic),
            ManifoldKind::Euclidean,
            bias.as_slice(),
            !free_bias,
            None,
        ));
        ids.push(self.gravity());
        self.add(
            FactorKind::ImuAcce {
                t: frame.timestamp,
                acce: frame.acce.into(),
                so3_seg,
                scale_seg,
                scale_type: self.bundle.scale_type,
                w: weight,
            },
            ids,
            RobustLoss::None,
        );
        true
    }

    pub fn add_radar(
        &mut self,
        topic: &str,
        target: &RadarTarget,
        weight: f64,
        freedom: SensorFreedom,
    ) -> bool {
        // An acceleration spline carries no velocity.
        if self.bundle.scale_type == ScaleSplineType::LinAcce {
            return false;
        }
        let t_body = self.body_time(topic, target.timestamp);
        let (Some((i, so3_seg)), Some((j, scale_seg))) =
            (self.so3_segment(t_body), self.scale_segment(t_body))
        else {
            return false;
        };
        let mut ids = self.so3_knots(i);
        ids.extend(self.scale_knots(j));
        ids.extend(self.sensor_blocks(topic, freedom, true));
        self.add(
            FactorKind::RadarDoppler {
                t: target.timestamp,
                dir: target.direction().into(),
                radial_vel: target.radial_vel,
                so3_seg,
                scale_seg,
                scale_type: self.bundle.scale_type,
                w: weight,
            },
            ids,
            RobustLoss::Huber { scale: 1.0 },
        );
        true
    }

    /// Camera-to-world pose of a reconstructed view at camera time `t`.
    pub fn add_camera_pose(
        &mut self,
        topic: &str,
        t: Real,
        rotation: &Quat,
        position: &Vec3,
        weight: f64,
        freedom: SensorFreedom,
    ) -> bool {
        let t_body = self.body_time(topic, t);
        let (Some((i, so3_seg)), Some((j, scale_seg))) =
            (self.so3_segment(t_body), self.scale_segment(t_body))
        else {
            return false;
        };
        let mut ids = self.so3_knots(i);
        ids.extend(self.scale_knots(j));
        ids.extend(self.sensor_blocks(topic, freedom, true));
        self.add(
            FactorKind::CameraPose {
                t,
                so3_cam_to_world: quat_to_array(rotation),
                pos_cam_in_world: (*position).into(),
                so3_seg,
                scale_seg,
                w_rot: weight,
                w_pos: weight,
            },
            ids,
            RobustLoss::None,
        );
        true
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_reprojection(
        &mut self,
        topic: &str,
        t: Real,
        landmark_id: u64,
        landmark: &Vec3,
        obs: &Observation,
        intrinsics: [f64; 4],
        weight: f64,
        freedom: SensorFreedom,
    ) -> bool {
        let t_body = self.body_time(topic, t);
        let (Some((i, so3_seg)), Some((j, scale_seg))) =
            (self.so3_segment(t_body), self.scale_segment(t_body))
        else {
            return false;
        };
        let mut ids = self.so3_knots(i);
        ids.extend(self.scale_knots(j));
        ids.extend(self.sensor_blocks(topic, freedom, true));
        ids.push(self.block(
            landmark_name(topic, landmark_id),
            ManifoldKind::Euclidean,
            landmark.as_slice(),
            false,
            None,
        ));
        self.add(
            FactorKind::Reprojection {
                t,
                uv: obs.uv.into(),
                intrinsics,
                so3_seg,
                scale_seg,
                w: weight,
            },
            ids,
            RobustLoss::Huber { scale: 2.0 },
        );
        true
    }

    /// Scan point `point` of LiDAR `topic`, sampled at `t`, lies on `plane`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_lidar_point(
        &mut self,
        topic: &str,
        t: Real,
        point: &Vec3,
        plane: [f64; 4],
        weight: f64,
        freedom: SensorFreedom,
        robust_scale: f64,
    ) -> bool {
        let t_body = self.body_time(topic, t);
        let (Some((i, so3_seg)), Some((j, scale_seg))) =
            (self.so3_segment(t_body), self.scale_segment(t_body))
        else {
            return false;
        };
        let mut ids = self.so3_knots(i);
        ids.extend(self.scale_knots(j));
        ids.extend(self.sensor_blocks(topic, freedom, true));
        self.add(
            FactorKind::LidarPointToPlane {
                t,
                point: (*point).into(),
                plane,
                so3_seg,
                scale_seg,
                w: weight,
            },
            ids,
            RobustLoss::Cauchy {
                scale: robust_scale,
            },
        );
        true
    }

    pub fn residual_count(&self) -> usize {
        self.ir.residuals.len()
    }

    pub fn finish(self) -> (ProblemIR, HashMap<String, DVector<f64>>) {
        (self.ir, self.initial)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write-back
// ─────────────────────────────────────────────────────────────────────────────

fn vec3_of(v: &DVector<f64>) -> Vec3 {
    Vec3::new(v[0], v[1], v[2])
}

/// Copy named block values into the spline bundle.
pub(crate) fn apply_to_bundle<'v>(
    get: impl Fn(&str) -> Option<&'v DVector<f64>>,
    bundle: &mut SplineBundle,
) {
    for (i, knot) in bundle.so3.knots_mut().iter_mut().enumerate() {
        if let Some(v) = get(&so3_knot_name(i)) {
            *knot = quat_from_slice(v.as_slice());
        }
    }
    for (j, knot) in bundle.scale.knots_mut().iter_mut().enumerate() {
        if let Some(v) = get(&scale_knot_name(j)) {
            *knot = vec3_of(v);
        }
    }
}

/// Copy named block values into the parameter manager.
pub(crate) fn apply_to_params<'v>(
    get: impl Fn(&str) -> Option<&'v DVector<f64>>,
    params: &mut CalibParamManager,
) {
    if let Some(g) = get(GRAVITY) {
        params.gravity = vec3_of(g);
    }
    for (topic, ext) in params.extri.iter_mut() {
        if let Some(q) = get(&so3_name(topic)) {
            ext.so3 = quat_from_slice(q.as_slice());
        }
        if let Some(p) = get(&pos_name(topic)) {
            ext.pos = vec3_of(p);
        }
    }
    for (topic, to) in params.temporal.iter_mut() {
        if let Some(v) = get(&time_offset_name(topic)) {
            *to = v[0];
        }
    }
    for (topic, intri) in params.imu_intri.iter_mut() {
        if let Some(b) = get(&gyro_bias_name(topic)) {
            intri.gyro_bias = vec3_of(b);
        }
        if let Some(b) = get(&acce_bias_name(topic)) {
            intri.acce_bias = vec3_of(b);
        }
    }
}

/// Copy landmark positions back into the reconstructions.
pub(crate) fn apply_to_landmarks<'v>(
    get: impl Fn(&str) -> Option<&'v DVector<f64>>,
    sfm: &mut BTreeMap<String, Veta>,
) {
    for (topic, veta) in sfm.iter_mut() {
        for (id, lm) in veta.landmarks.iter_mut() {
            if let Some(v) = get(&landmark_name(topic, *id)) {
                lm.position = vec3_of(v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctcalib_core::{so3_exp, ImuIntrinsics};

    fn params_for(topics: &[&str]) -> CalibParamManager {
        let mut params = CalibParamManager {
            gravity: Vec3::new(0.0, 0.0, -9.8),
            extri: BTreeMap::new(),
            temporal: BTreeMap::new(),
            imu_intri: BTreeMap::new(),
            camera_intri: BTreeMap::new(),
        };
        for t in topics {
            params.extri.insert(t.to_string(), Default::default());
            params.temporal.insert(t.to_string(), 0.0);
            params.imu_intri.insert(t.to_string(), ImuIntrinsics::default());
        }
        params
    }

    #[test]
    fn gauge_blocks_are_fixed() {
        let bundle = SplineBundle::new(0.0, 1.0, 0.1, 0.1, ScaleSplineType::LinPos);
        let params = params_for(&["/imu"]);
        let mut builder = ProblemBuilder::new(&bundle, &params, 0.05, true, true);
        let frame = ImuFrame::new(0.01, Vec3::zeros(), Vec3::new(0.0, 0.0, 9.8));
        let free = SensorFreedom {
            rotation: true,
            position: true,
            time_offset: true,
        };
        assert!(builder.add_acce("/imu", &frame, 1.0, free, true));
        let late = ImuFrame::new(5.0, Vec3::zeros(), Vec3::zeros());
        assert!(!builder.add_acce("/imu", &late, 1.0, free, true));
        let (ir, init) = builder.finish();
        ir.validate().unwrap();

        let fixed = |name: &str| {
            let id = ir.param_by_name(name).unwrap();
            let block = &ir.params[id.0];
            block.fixed.is_all_fixed(block.dim)
        };
        assert!(fixed("so3_knot_0"));
        assert!(!fixed("so3_knot_1"));
        assert!(fixed("scale_knot_0") && fixed("scale_knot_1"));
        assert!(!fixed("scale_knot_2"));
        assert!(!fixed(GRAVITY));
        let to = &ir.params[ir.param_by_name("to_/imu").unwrap().0];
        assert_eq!(to.bounds.as_ref().unwrap()[0].upper, 0.05);
        assert_eq!(init.len(), ir.params.len());
    }

    #[test]
    fn gravity_is_fixed_on_acceleration_spline() {
        let bundle = SplineBundle::new(0.0, 1.0, 0.1, 0.1, ScaleSplineType::LinAcce);
        let params = params_for(&["/imu"]);
        let mut builder = ProblemBuilder::new(&bundle, &params, 0.05, true, true);
        let frame = ImuFrame::new(0.5, Vec3::zeros(), Vec3::new(0.0, 0.0, 9.8));
        builder.add_acce("/imu", &frame, 1.0, SensorFreedom::FIXED, false);
        let (ir, _) = builder.finish();
        let g = &ir.params[ir.param_by_name(GRAVITY).unwrap().0];
        assert!(g.fixed.is_all_fixed(3));
        // no position gauge on an acceleration spline
        let k0 = &ir.params[ir.param_by_name("scale_knot_0").unwrap().0];
        assert!(k0.fixed.is_empty());
    }

    #[test]
    fn write_back_by_name() {
        let mut bundle = SplineBundle::new(0.0, 1.0, 0.1, 0.1, ScaleSplineType::LinPos);
        let mut params = params_for(&["/imu"]);
        let q = so3_exp(&Vec3::new(0.1, 0.2, 0.3));
        let mut values = HashMap::new();
        values.insert(so3_knot_name(2), DVector::from_column_slice(&quat_to_array(&q)));
        values.insert(scale_knot_name(1), DVector::from_column_slice(&[1.0, 2.0, 3.0]));
        values.insert(time_offset_name("/imu"), DVector::from_element(1, 0.01));
        values.insert(GRAVITY.to_string(), DVector::from_column_slice(&[0.0, 9.8, 0.0]));

        apply_to_bundle(|n| values.get(n), &mut bundle);
        apply_to_params(|n| values.get(n), &mut params);

        assert!(bundle.so3.knots()[2].angle_to(&q) < 1e-12);
        assert_eq!(bundle.scale.knots()[1], Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(params.temporal["/imu"], 0.01);
        assert_eq!(params.gravity, Vec3::new(0.0, 9.8, 0.0));
        assert!(bundle.so3.knots()[1].angle() < 1e-12);
    }
}
