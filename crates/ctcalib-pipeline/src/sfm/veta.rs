//! Views, poses and landmarks of one camera's reconstruction.

use std::collections::BTreeMap;

use ctcalib_core::{Iso3, Real, Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// One reconstructed exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    /// Internal frame id.
    pub id: u64,
    pub intrinsics_id: u64,
    pub pose_id: u64,
    pub width: u32,
    pub height: u32,
    /// Aligned frame time in the camera clock.
    pub timestamp: Real,
}

/// 2D observation of a landmark in one view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Pixel position in the undistorted image.
    pub uv: Vec2,
    /// Index of the feature inside its image.
    pub feature_idx: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub position: Vec3,
    pub color: [u8; 3],
    /// Observations keyed by view id.
    pub obs: BTreeMap<u64, Observation>,
}

/// Reconstruction of one camera topic.
///
/// Poses are camera-to-world. Views, poses and landmarks are keyed by their
/// ids; a view's pose shares its id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Veta {
    pub views: BTreeMap<u64, View>,
    pub poses: BTreeMap<u64, Iso3>,
    pub landmarks: BTreeMap<u64, Landmark>,
}

impl Veta {
    pub fn landmark_count(&self) -> usize {
        self.landmarks.len()
    }

    pub fn observation_count(&self) -> usize {
        self.landmarks.values().map(|lm| lm.obs.len()).sum()
    }

    /// Camera-to-world pose of a view.
    pub fn view_pose(&self, view_id: u64) -> Option<&Iso3> {
        self.views
            .get(&view_id)
            .and_then(|v| self.poses.get(&v.pose_id))
    }

    /// `(time, camera-to-world)` of every view with a pose, in id order.
    pub fn timed_poses(&self) -> Vec<(Real, Iso3)> {
        self.views
            .values()
            .filter_map(|v| self.poses.get(&v.pose_id).map(|p| (v.timestamp, *p)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_pose_lookup() {
        let mut veta = Veta::default();
        veta.views.insert(
            7,
            View {
                id: 7,
                intrinsics_id: 1,
                pose_id: 7,
                width: 640,
                height: 480,
                timestamp: 1.5,
            },
        );
        veta.poses.insert(7, Iso3::translation(1.0, 2.0, 3.0));
        let mut obs = BTreeMap::new();
        obs.insert(
            7,
            Observation {
                uv: Vec2::new(10.0, 20.0),
                feature_idx: 0,
            },
        );
        veta.landmarks.insert(
            1,
            Landmark {
                position: Vec3::new(0.0, 0.0, 5.0),
                color: [255, 0, 0],
                obs,
            },
        );

        assert_eq!(veta.landmark_count(), 1);
        assert_eq!(veta.observation_count(), 1);
        assert_eq!(veta.view_pose(7).unwrap().translation.vector.z, 3.0);
        assert!(veta.view_pose(8).is_none());
        assert_eq!(veta.timed_poses().len(), 1);
    }
}
