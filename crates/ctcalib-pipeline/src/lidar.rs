//! Voxel surfel map of the LiDAR point-to-plane factors.
//!
//! Scan points are moved into the world with the current trajectory and
//! extrinsics, binned into cubic voxels, and every voxel whose points are
//! planar gets a surfel. The same points are then associated back to the
//! surfel of their voxel; each association becomes one residual.

use std::collections::HashMap;

use ctcalib_core::{LidarMapConfig, Real, Vec3};
use nalgebra::Matrix3;

/// Plane `normal . p + offset = 0` fitted to the points of one voxel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Surfel {
    pub normal: Vec3,
    pub offset: Real,
    pub centroid: Vec3,
    pub count: usize,
}

impl Surfel {
    pub fn distance(&self, p: &Vec3) -> Real {
        self.normal.dot(p) + self.offset
    }

    /// `[nx, ny, nz, d]`
    pub fn plane(&self) -> [f64; 4] {
        [self.normal.x, self.normal.y, self.normal.z, self.offset]
    }
}

type VoxelKey = [i64; 3];

fn voxel_key(p: &Vec3, size: Real) -> VoxelKey {
    [
        (p.x / size).floor() as i64,
        (p.y / size).floor() as i64,
        (p.z / size).floor() as i64,
    ]
}

/// Least-squares plane through `points`; `None` unless the spread normal to
/// the plane is small against the in-plane spread.
pub fn fit_surfel(points: &[Vec3], planarity_thd: Real) -> Option<Surfel> {
    if points.len() < 3 {
        return None;
    }
    let n = points.len() as Real;
    let centroid = points.iter().fold(Vec3::zeros(), |acc, p| acc + p) / n;
    let cov = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let c = p - centroid;
        acc + c * c.transpose()
    }) / n;

    let eigen = cov.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|a, b| eigen.eigenvalues[*a].total_cmp(&eigen.eigenvalues[*b]));
    let (min, mid, max) = (
        eigen.eigenvalues[order[0]],
        eigen.eigenvalues[order[1]],
        eigen.eigenvalues[order[2]],
    );
    // collinear or coincident points span no plane
    if max <= 1e-12 || mid / max < 1e-4 {
        return None;
    }
    if min.max(0.0) > planarity_thd * mid {
        return None;
    }

    let normal = eigen.eigenvectors.column(order[0]).normalize();
    Some(Surfel {
        normal,
        offset: -normal.dot(&centroid),
        centroid,
        count: points.len(),
    })
}

/// Planar voxels of a world-frame point cloud.
#[derive(Debug, Clone)]
pub struct SurfelMap {
    voxel_size: Real,
    association_dist: Real,
    surfels: HashMap<VoxelKey, Surfel>,
}

impl SurfelMap {
    pub fn build<'p>(points: impl IntoIterator<Item = &'p Vec3>, config: &LidarMapConfig) -> Self {
        let mut voxels: HashMap<VoxelKey, Vec<Vec3>> = HashMap::new();
        for p in points {
            voxels
                .entry(voxel_key(p, config.voxel_size))
                .or_default()
                .push(*p);
        }
        let surfels = voxels
            .into_iter()
            .filter(|(_, pts)| pts.len() >= config.min_points)
            .filter_map(|(key, pts)| fit_surfel(&pts, config.planarity_thd).map(|s| (key, s)))
            .collect();
        Self {
            voxel_size: config.voxel_size,
            association_dist: config.association_dist,
            surfels,
        }
    }

    pub fn len(&self) -> usize {
        self.surfels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfels.is_empty()
    }

    /// Surfel of the voxel holding `p`, if `p` lies close to its plane.
    pub fn associate(&self, p: &Vec3) -> Option<&Surfel> {
        self.surfels
            .get(&voxel_key(p, self.voxel_size))
            .filter(|s| s.distance(p).abs() <= self.association_dist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid_on_plane(origin: Vec3, u: Vec3, v: Vec3, n: usize, step: Real) -> Vec<Vec3> {
        (0..n)
            .flat_map(|i| (0..n).map(move |j| origin + u * (i as Real * step) + v * (j as Real * step)))
            .collect()
    }

    #[test]
    fn fits_tilted_plane() {
        let normal = Vec3::new(1.0, 1.0, 1.0).normalize();
        let u = Vec3::new(1.0, -1.0, 0.0).normalize();
        let v = normal.cross(&u);
        let origin = Vec3::new(0.2, 0.1, 0.3);
        let surfel = fit_surfel(&grid_on_plane(origin, u, v, 5, 0.1), 0.05).unwrap();

        assert_relative_eq!(surfel.normal.dot(&normal).abs(), 1.0, epsilon = 1e-9);
        assert!(surfel.distance(&origin).abs() < 1e-9);
        assert_relative_eq!(surfel.distance(&(origin + normal * 0.5)).abs(), 0.5, epsilon = 1e-9);
        assert_eq!(surfel.count, 25);
    }

    #[test]
    fn rejects_lines_and_blobs() {
        let line: Vec<_> = (0..10).map(|i| Vec3::new(0.1 * i as Real, 0.0, 0.0)).collect();
        assert!(fit_surfel(&line, 0.05).is_none());

        // corner of a unit cube: isotropic spread
        let blob: Vec<_> = (0..8)
            .map(|i| Vec3::new((i & 1) as Real, ((i >> 1) & 1) as Real, ((i >> 2) & 1) as Real))
            .collect();
        assert!(fit_surfel(&blob, 0.05).is_none());
        assert!(fit_surfel(&blob[..2], 0.05).is_none());
    }

    #[test]
    fn associates_points_near_their_voxel_plane() {
        let config = LidarMapConfig {
            voxel_size: 1.0,
            min_points: 10,
            association_dist: 0.2,
            ..LidarMapConfig::default()
        };
        // floor z = 0.5 spanning voxel (0, 0, 0) only
        let floor = grid_on_plane(Vec3::new(0.05, 0.05, 0.5), Vec3::x(), Vec3::y(), 9, 0.1);
        // sparse voxel next to it
        let sparse = grid_on_plane(Vec3::new(1.05, 0.05, 0.5), Vec3::x(), Vec3::y(), 2, 0.1);
        let map = SurfelMap::build(floor.iter().chain(&sparse), &config);
        assert_eq!(map.len(), 1);

        let s = map.associate(&Vec3::new(0.5, 0.5, 0.6)).unwrap();
        assert_relative_eq!(s.distance(&Vec3::new(0.5, 0.5, 0.6)).abs(), 0.1, epsilon = 1e-9);
        assert_relative_eq!(s.plane()[3].abs(), 0.5, epsilon = 1e-9);
        assert!(map.associate(&Vec3::new(0.5, 0.5, 0.9)).is_none());
        assert!(map.associate(&Vec3::new(1.2, 0.2, 0.5)).is_none());
    }
}
