use anyhow::{ensure, Result};
use std::collections::HashSet;

use ctcalib_core::{real, ScaleSplineType};
use nalgebra::RealField;

/// Identifier for a parameter block in the IR.
///
/// This is stable within a `ProblemIR` instance and is used by residual blocks
/// to reference their parameter dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(pub usize);

/// Supported manifold types for parameter blocks.
///
/// Each variant implies an expected ambient parameter dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifoldKind {
    /// Standard Euclidean vector space.
    Euclidean,
    /// SO(3) rotation stored as quaternion `[qx, qy, qz, qw]`.
    SO3,
    /// Sphere of fixed radius stored as `[x, y, z]`; the norm is preserved.
    S2,
}

impl ManifoldKind {
    /// Returns `true` if the given ambient dimension matches the manifold storage.
    pub fn compatible_dim(self, dim: usize) -> bool {
        match self {
            ManifoldKind::Euclidean => dim > 0,
            ManifoldKind::SO3 => dim == 4,
            ManifoldKind::S2 => dim == 3,
        }
    }

    /// Dimension of the local parametrization.
    pub fn tangent_dim(self, dim: usize) -> usize {
        match self {
            ManifoldKind::Euclidean => dim,
            ManifoldKind::SO3 => 3,
            ManifoldKind::S2 => 2,
        }
    }
}

/// Bounds for a single parameter index.
///
/// Bounds are clamped after each accepted or trial update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    pub idx: usize,
    pub lower: f64,
    pub upper: f64,
}

/// Fixed parameter mask for a block.
///
/// Euclidean blocks support per-index fixing; manifold blocks are either
/// entirely fixed or entirely free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedMask {
    fixed_indices: HashSet<usize>,
}

impl FixedMask {
    /// Creates a mask with no fixed indices.
    pub fn all_free() -> Self {
        Self {
            fixed_indices: HashSet::new(),
        }
    }

    /// Creates a mask with all indices fixed.
    pub fn all_fixed(dim: usize) -> Self {
        Self {
            fixed_indices: (0..dim).collect(),
        }
    }

    /// Creates a mask from an explicit list of indices.
    pub fn fix_indices(indices: &[usize]) -> Self {
        Self {
            fixed_indices: indices.iter().copied().collect(),
        }
    }

    /// Fully fixed when `fixed` holds, otherwise fully free.
    pub fn fixed_if(fixed: bool, dim: usize) -> Self {
        if fixed {
            Self::all_fixed(dim)
        } else {
            Self::all_free()
        }
    }

    /// Returns `true` if the index is fixed.
    pub fn is_fixed(&self, idx: usize) -> bool {
        self.fixed_indices.contains(&idx)
    }

    /// Returns `true` if all indices `[0, dim)` are fixed.
    pub fn is_all_fixed(&self, dim: usize) -> bool {
        (0..dim).all(|i| self.fixed_indices.contains(&i))
    }

    /// Iterates over fixed indices.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.fixed_indices.iter().copied()
    }

    /// Returns `true` if no indices are fixed.
    pub fn is_empty(&self) -> bool {
        self.fixed_indices.is_empty()
    }
}

/// Robust loss applied to a residual block.
///
/// Each residual block has its own loss; per-measurement robustification is
/// achieved by using one residual block per measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RobustLoss {
    #[default]
    None,
    Huber {
        scale: f64,
    },
    Cauchy {
        scale: f64,
    },
}

/// Timing of the spline segment a factor evaluates.
///
/// The segment (and therefore the knot blocks referenced by the residual) is
/// chosen when the factor is built; the normalized segment time is then
/// recomputed from the current time offset at every evaluation.
///
/// When the optimized offset moves `t + to` out of the chosen segment, the
/// factor keeps evaluating the same four knots with `s` outside `[0, 1]`,
/// i.e. it extrapolates that segment's cubic instead of switching knots.
/// Each stage rebuilds its factors, which moves them onto the right segment
/// for the next stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentTime {
    /// Time of the segment start.
    pub t0: f64,
    /// Knot spacing.
    pub dt: f64,
}

impl SegmentTime {
    /// Normalized time of `t` inside the segment; may leave `[0, 1]`.
    pub fn normalized<T: RealField>(&self, t: T) -> T {
        (t - real::<T>(self.t0)) / real::<T>(self.dt)
    }
}

/// Backend-agnostic factor kinds.
///
/// Each factor kind implies its parameter layout and residual dimension.
/// `so3` and `scale` below stand for the four knot blocks of the segment of
/// the respective spline.
#[derive(Debug, Clone, PartialEq)]
pub enum FactorKind {
    /// Gyroscope reading.
    ///
    /// Parameters: \[so3 x4, so3_sensor_to_body, time_offset, gyro_bias\]
    ImuGyro {
        t: f64,
        gyro: [f64; 3],
        so3_seg: SegmentTime,
        w: f64,
    },
    /// Accelerometer reading with lever arm.
    ///
    /// Parameters: \[so3 x4, scale x4, so3_sensor_to_body, pos_sensor_in_body,
    /// time_offset, acce_bias, gravity\]
    ImuAcce {
        t: f64,
        acce: [f64; 3],
        so3_seg: SegmentTime,
        scale_seg: SegmentTime,
        scale_type: ScaleSplineType,
        w: f64,
    },
    /// Doppler velocity of a static radar target.
    ///
    /// Parameters: \[so3 x4, scale x4, so3_sensor_to_body, pos_sensor_in_body,
    /// time_offset\]
    RadarDoppler {
        t: f64,
        dir: [f64; 3],
        radial_vel: f64,
        so3_seg: SegmentTime,
        scale_seg: SegmentTime,
        scale_type: ScaleSplineType,
        w: f64,
    },
    /// Camera-to-world pose from the reconstruction.
    ///
    /// Parameters: \[so3 x4, scale x4, so3_sensor_to_body, pos_sensor_in_body,
    /// time_offset\]
    CameraPose {
        t: f64,
        so3_cam_to_world: [f64; 4],
        pos_cam_in_world: [f64; 3],
        so3_seg: SegmentTime,
        scale_seg: SegmentTime,
        w_rot: f64,
        w_pos: f64,
    },
    /// Pinhole reprojection of a world landmark in an undistorted image.
    ///
    /// Parameters: \[so3 x4, scale x4, so3_sensor_to_body, pos_sensor_in_body,
    /// time_offset, landmark\]
    Reprojection {
        t: f64,
        uv: [f64; 2],
        /// `[fx, fy, cx, cy]`
        intrinsics: [f64; 4],
        so3_seg: SegmentTime,
        scale_seg: SegmentTime,
        w: f64,
    },
    /// Distance of a LiDAR point to a plane of the world surfel map.
    ///
    /// `point` is in the LiDAR frame, sampled at the point time `t`;
    /// `plane` is `[nx, ny, nz, d]` with `n . p + d = 0` in the world frame.
    ///
    /// Parameters: \[so3 x4, scale x4, so3_sensor_to_body, pos_sensor_in_body,
    /// time_offset\]
    LidarPointToPlane {
        t: f64,
        point: [f64; 3],
        plane: [f64; 4],
        so3_seg: SegmentTime,
        scale_seg: SegmentTime,
        w: f64,
    },
}

/// Expected parameter layout of a factor: (dim, manifold) per slot.
fn factor_layout(factor: &FactorKind) -> Vec<(usize, ManifoldKind)> {
    const SO3: (usize, ManifoldKind) = (4, ManifoldKind::SO3);
    const R3: (usize, ManifoldKind) = (3, ManifoldKind::Euclidean);
    const R1: (usize, ManifoldKind) = (1, ManifoldKind::Euclidean);
    const GRAVITY: (usize, ManifoldKind) = (3, ManifoldKind::S2);

    let mut layout = vec![SO3; 4];
    match factor {
        FactorKind::ImuGyro { .. } => {
            layout.extend([SO3, R1, R3]);
        }
        FactorKind::ImuAcce { .. } => {
            layout.extend([R3; 4]);
            layout.extend([SO3, R3, R1, R3]);
            layout.push(GRAVITY);
        }
        FactorKind::RadarDoppler { .. }
        | FactorKind::CameraPose { .. }
        | FactorKind::LidarPointToPlane { .. } => {
            layout.extend([R3; 4]);
            layout.extend([SO3, R3, R1]);
        }
        FactorKind::Reprojection { .. } => {
            layout.extend([R3; 4]);
            layout.extend([SO3, R3, R1, R3]);
        }
    }
    layout
}

impl FactorKind {
    /// Residual dimension implied by the factor.
    pub fn residual_dim(&self) -> usize {
        match self {
            FactorKind::ImuGyro { .. } => 3,
            FactorKind::ImuAcce { .. } => 3,
            FactorKind::RadarDoppler { .. } => 1,
            FactorKind::CameraPose { .. } => 6,
            FactorKind::Reprojection { .. } => 2,
            FactorKind::LidarPointToPlane { .. } => 1,
        }
    }

    /// Sum of the tangent dimensions of all parameter slots.
    pub fn local_dim(&self) -> usize {
        factor_layout(self)
            .into_iter()
            .map(|(dim, manifold)| manifold.tangent_dim(dim))
            .sum()
    }

    /// Number of parameter blocks the factor reads.
    pub fn param_count(&self) -> usize {
        factor_layout(self).len()
    }

    pub fn name(&self) -> &'static str {
        match self {
            FactorKind::ImuGyro { .. } => "imu_gyro",
            FactorKind::ImuAcce { .. } => "imu_acce",
            FactorKind::RadarDoppler { .. } => "radar_doppler",
            FactorKind::CameraPose { .. } => "camera_pose",
            FactorKind::Reprojection { .. } => "reprojection",
            FactorKind::LidarPointToPlane { .. } => "lidar_point_to_plane",
        }
    }
}

/// Parameter block definition in the IR.
///
/// This describes the storage layout and constraints for a single variable.
#[derive(Debug, Clone)]
pub struct ParamBlock {
    pub id: ParamId,
    pub name: String,
    pub dim: usize,
    pub manifold: ManifoldKind,
    pub fixed: FixedMask,
    pub bounds: Option<Vec<Bound>>,
}

/// Residual block definition in the IR.
///
/// The order of `params` must match the factor's expected parameter order.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub params: Vec<ParamId>,
    pub loss: RobustLoss,
    pub factor: FactorKind,
    pub residual_dim: usize,
}

impl ResidualBlock {
    pub fn new(factor: FactorKind, params: Vec<ParamId>, loss: RobustLoss) -> Self {
        Self {
            residual_dim: factor.residual_dim(),
            params,
            loss,
            factor,
        }
    }
}

/// Backend-agnostic optimization problem representation.
#[derive(Debug, Default, Clone)]
pub struct ProblemIR {
    pub params: Vec<ParamBlock>,
    pub residuals: Vec<ResidualBlock>,
}

impl ProblemIR {
    /// Creates an empty IR.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter block and returns its `ParamId`.
    pub fn add_param_block(
        &mut self,
        name: impl Into<String>,
        dim: usize,
        manifold: ManifoldKind,
        fixed: FixedMask,
        bounds: Option<Vec<Bound>>,
    ) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(ParamBlock {
            id,
            name: name.into(),
            dim,
            manifold,
            fixed,
            bounds,
        });
        id
    }

    /// Adds a residual block to the IR.
    pub fn add_residual_block(&mut self, residual: ResidualBlock) {
        self.residuals.push(residual);
    }

    /// Finds a parameter by name.
    pub fn param_by_name(&self, name: &str) -> Option<ParamId> {
        self.params.iter().find(|p| p.name == name).map(|p| p.id)
    }

    /// Residual count per factor name, for logging.
    pub fn factor_histogram(&self) -> Vec<(&'static str, usize)> {
        let mut hist: Vec<(&'static str, usize)> = Vec::new();
        for r in &self.residuals {
            let name = r.factor.name();
            match hist.iter_mut().find(|(n, _)| *n == name) {
                Some((_, count)) => *count += 1,
                None => hist.push((name, 1)),
            }
        }
        hist
    }

    /// Validates internal consistency and factor expectations.
    pub fn validate(&self) -> Result<()> {
        for (idx, param) in self.params.iter().enumerate() {
            ensure!(
                param.id.0 == idx,
                "param id mismatch: expected {}, got {:?}",
                idx,
                param.id
            );
            ensure!(
                param.manifold.compatible_dim(param.dim),
                "param {} manifold {:?} incompatible with dim {}",
                param.name,
                param.manifold,
                param.dim
            );
            for fixed_idx in param.fixed.iter() {
                ensure!(
                    fixed_idx < param.dim,
                    "param {} fixed index {} out of range",
                    param.name,
                    fixed_idx
                );
            }
            if param.manifold != ManifoldKind::Euclidean {
                ensure!(
                    param.fixed.is_empty() || param.fixed.is_all_fixed(param.dim),
                    "param {} on {:?} cannot be partially fixed",
                    param.name,
                    param.manifold
                );
                ensure!(
                    param.bounds.is_none(),
                    "param {} on {:?} cannot be bounded",
                    param.name,
                    param.manifold
                );
            }
            if let Some(bounds) = &param.bounds {
                for bound in bounds {
                    ensure!(
                        bound.idx < param.dim,
                        "param {} bound index {} out of range",
                        param.name,
                        bound.idx
                    );
                    ensure!(
                        bound.lower <= bound.upper,
                        "param {} bound lower {} > upper {}",
                        param.name,
                        bound.lower,
                        bound.upper
                    );
                }
            }
        }

        for (r_idx, residual) in self.residuals.iter().enumerate() {
            ensure!(
                residual.residual_dim == residual.factor.residual_dim(),
                "residual {} dim {} does not match factor expectation {}",
                r_idx,
                residual.residual_dim,
                residual.factor.residual_dim()
            );
            for param in &residual.params {
                ensure!(
                    param.0 < self.params.len(),
                    "residual {} references missing param {:?}",
                    r_idx,
                    param
                );
            }

            let layout = factor_layout(&residual.factor);
            ensure!(
                residual.params.len() == layout.len(),
                "{} factor requires {} params, residual {} has {}",
                residual.factor.name(),
                layout.len(),
                r_idx,
                residual.params.len()
            );
            for (slot, (id, (dim, manifold))) in residual.params.iter().zip(layout).enumerate() {
                let block = &self.params[id.0];
                ensure!(
                    block.dim == dim && block.manifold == manifold,
                    "{} factor slot {} expects {}D {:?}, got {} ({}D {:?})",
                    residual.factor.name(),
                    slot,
                    dim,
                    manifold,
                    block.name,
                    block.dim,
                    block.manifold
                );
            }
        }
        Ok(())
    }
}
