//! Bringing a reconstruction into the trajectory frame.
//!
//! SfM output lives in an arbitrary frame with an arbitrary scale. The camera
//! rotation is first related to the body with a rotation-only hand-eye solve
//! (Tsai-Lenz over quaternions), then the camera centers are registered to
//! the spline-predicted ones with a similarity transform (Umeyama).

use anyhow::{ensure, Result};
use ctcalib_core::{Iso3, Mat3, Pt3, Quat, Real, Vec3};
use nalgebra::{DMatrix, Matrix4, Quaternion, Rotation3, Translation3};
use rand::seq::index;
use rand::Rng;

use super::veta::Veta;

/// Scale every pose translation and landmark by `scale`, then map them with
/// `cur_to_new`.
pub fn perform_transform_for_veta(veta: &mut Veta, cur_to_new: &Iso3, scale: Real) {
    for pose in veta.poses.values_mut() {
        pose.translation.vector *= scale;
        *pose = cur_to_new * *pose;
    }
    for lm in veta.landmarks.values_mut() {
        lm.position = cur_to_new.transform_point(&Pt3::from(lm.position * scale)).coords;
    }
}

/// Randomly keep `lm_num_thd` landmarks and at most `obs_num_thd`
/// observations per landmark.
pub fn downsample_veta<R: Rng + ?Sized>(
    veta: &mut Veta,
    lm_num_thd: usize,
    obs_num_thd: usize,
    rng: &mut R,
) {
    let count = veta.landmarks.len();
    if count > lm_num_thd {
        let ids: Vec<u64> = veta.landmarks.keys().copied().collect();
        for i in index::sample(rng, count, count - lm_num_thd) {
            veta.landmarks.remove(&ids[i]);
        }
    }

    for lm in veta.landmarks.values_mut() {
        let count = lm.obs.len();
        if count <= obs_num_thd {
            continue;
        }
        let views: Vec<u64> = lm.obs.keys().copied().collect();
        for i in index::sample(rng, count, count - obs_num_thd) {
            lm.obs.remove(&views[i]);
        }
    }
}

/// Similarity `(iso, scale)` minimizing `|dst - iso * (scale * src)|^2`.
pub fn umeyama(src: &[Vec3], dst: &[Vec3]) -> Result<(Iso3, Real)> {
    ensure!(
        src.len() == dst.len(),
        "point sets differ in size: {} vs {}",
        src.len(),
        dst.len()
    );
    ensure!(src.len() >= 3, "at least 3 point pairs are needed, got {}", src.len());

    let n = src.len() as Real;
    let mu_src = src.iter().sum::<Vec3>() / n;
    let mu_dst = dst.iter().sum::<Vec3>() / n;

    let mut cov = Mat3::zeros();
    let mut var_src = 0.0;
    for (s, d) in src.iter().zip(dst) {
        let (s, d) = (s - mu_src, d - mu_dst);
        cov += d * s.transpose();
        var_src += s.norm_squared();
    }
    cov /= n;
    var_src /= n;
    ensure!(var_src > 1e-12, "source points are degenerate");

    let svd = cov.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| anyhow::anyhow!("svd failed during similarity estimation"))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| anyhow::anyhow!("svd failed during similarity estimation"))?;

    let mut sign = Mat3::identity();
    if (u * v_t).determinant() < 0.0 {
        sign[(2, 2)] = -1.0;
    }
    let rot = u * sign * v_t;
    let trace = (Mat3::from_diagonal(&svd.singular_values) * sign).trace();
    let scale = trace / var_src;
    let trans = mu_dst - rot * (mu_src * scale);

    let rot = Quat::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rot));
    Ok((Iso3::from_parts(Translation3::from(trans), rot), scale))
}

fn quat_left(q: &Quat) -> Matrix4<Real> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    Matrix4::new(w, -x, -y, -z, x, w, -z, y, y, z, w, -x, z, -y, x, w)
}

fn quat_right(q: &Quat) -> Matrix4<Real> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    Matrix4::new(w, -x, -y, -z, x, w, z, -y, y, -z, w, x, z, y, -x, w)
}

/// Rotation `X` solving `A_i X = X B_i` for relative motion pairs
/// `(A_i, B_i)`.
///
/// With `A_i` the relative body rotations and `B_i` the relative camera
/// rotations, `X` is the camera-to-body rotation.
pub fn handeye_rotation(pairs: &[(Quat, Quat)]) -> Result<Quat> {
    ensure!(pairs.len() >= 2, "at least 2 motion pairs are needed, got {}", pairs.len());

    let mut m = DMatrix::<Real>::zeros(4 * pairs.len(), 4);
    for (idx, (qa, qb)) in pairs.iter().enumerate() {
        // Conjugate rotations share the scalar part; keep both in the same
        // hemisphere.
        let qb = if qa.w * qb.w < 0.0 {
            Quat::new_unchecked(-qb.into_inner())
        } else {
            *qb
        };
        m.view_mut((4 * idx, 0), (4, 4))
            .copy_from(&(quat_left(qa) - quat_right(&qb)));
    }

    let svd = m.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| anyhow::anyhow!("svd failed during hand-eye estimation"))?;
    let q = v_t.row(v_t.nrows() - 1);
    Ok(Quat::from_quaternion(Quaternion::new(q[0], q[1], q[2], q[3])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfm::{Landmark, Observation};
    use approx::assert_relative_eq;
    use ctcalib_core::{so3_exp, Vec2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn veta_with(landmarks: usize, obs_per_lm: usize) -> Veta {
        let mut veta = Veta::default();
        for id in 0..landmarks as u64 {
            let obs: BTreeMap<u64, Observation> = (0..obs_per_lm as u64)
                .map(|v| {
                    (
                        v,
                        Observation {
                            uv: Vec2::new(v as f64, id as f64),
                            feature_idx: 0,
                        },
                    )
                })
                .collect();
            veta.landmarks.insert(
                id,
                Landmark {
                    position: Vec3::new(id as f64, 0.0, 1.0),
                    color: [0; 3],
                    obs,
                },
            );
        }
        veta
    }

    #[test]
    fn downsample_is_noop_below_threshold() {
        let mut veta = veta_with(10, 4);
        let before = veta.clone();
        downsample_veta(&mut veta, 10, 4, &mut StdRng::seed_from_u64(1));
        assert_eq!(veta, before);
    }

    #[test]
    fn downsample_keeps_exact_counts() {
        let mut veta = veta_with(50, 12);
        downsample_veta(&mut veta, 20, 5, &mut StdRng::seed_from_u64(7));
        assert_eq!(veta.landmark_count(), 20);
        assert!(veta.landmarks.values().all(|lm| lm.obs.len() == 5));
    }

    #[test]
    fn downsample_is_reproducible_with_seed() {
        let mut a = veta_with(30, 3);
        let mut b = a.clone();
        downsample_veta(&mut a, 10, 3, &mut StdRng::seed_from_u64(42));
        downsample_veta(&mut b, 10, 3, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn transform_scales_then_maps() {
        let mut veta = veta_with(1, 1);
        veta.poses.insert(0, Iso3::translation(1.0, 0.0, 0.0));
        let cur_to_new = Iso3::from_parts(
            Translation3::new(0.0, 0.0, 1.0),
            so3_exp(&Vec3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2)),
        );
        perform_transform_for_veta(&mut veta, &cur_to_new, 2.0);

        let pose = veta.poses[&0];
        assert_relative_eq!(pose.translation.vector, Vec3::new(0.0, 2.0, 1.0), epsilon = 1e-12);
        assert_relative_eq!(
            veta.landmarks[&0].position,
            Vec3::new(0.0, 0.0, 3.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn umeyama_recovers_similarity() {
        let rot = so3_exp(&Vec3::new(0.2, -0.4, 0.9));
        let iso = Iso3::from_parts(Translation3::new(1.0, -2.0, 0.5), rot);
        let scale = 3.5;
        let src: Vec<Vec3> = (0..10)
            .map(|i| {
                let t = i as f64;
                Vec3::new(t.sin(), (0.7 * t).cos(), 0.1 * t)
            })
            .collect();
        let dst: Vec<Vec3> = src
            .iter()
            .map(|p| iso.transform_point(&Pt3::from(p * scale)).coords)
            .collect();

        let (est, s) = umeyama(&src, &dst).unwrap();
        assert_relative_eq!(s, scale, epsilon = 1e-9);
        assert!(est.rotation.angle_to(&rot) < 1e-9);
        assert_relative_eq!(est.translation.vector, iso.translation.vector, epsilon = 1e-9);

        assert!(umeyama(&src[..2], &dst[..2]).is_err());
    }

    #[test]
    fn handeye_rotation_recovers_extrinsic() {
        let x = so3_exp(&Vec3::new(0.3, -0.1, 1.2));
        let pairs: Vec<(Quat, Quat)> = [
            Vec3::new(0.4, 0.0, 0.1),
            Vec3::new(0.0, 0.5, -0.2),
            Vec3::new(-0.3, 0.2, 0.6),
        ]
        .iter()
        .map(|w| {
            let a = so3_exp(w);
            (a, x.inverse() * a * x)
        })
        .collect();
        let est = handeye_rotation(&pairs).unwrap();
        assert!(est.angle_to(&x) < 1e-9, "error {}", est.angle_to(&x));
    }
}
