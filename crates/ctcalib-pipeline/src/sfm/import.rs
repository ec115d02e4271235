//! Loading a finished COLMAP reconstruction back into a [`Veta`].

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use ctcalib_core::{iso3_from_parts, CalibConfig, CalibParamManager, Real};
use log::{debug, info, warn};

use super::colmap::{read_cameras, read_images, read_points3d, ColmapImage};
use super::export::ImagesInfo;
use super::veta::{Landmark, Observation, View, Veta};
use crate::data::CalibDataManager;

/// Read the reconstruction of `topic`, if one exists.
///
/// Missing files and a model with other than one camera are reported as
/// warnings and give `Ok(None)`. Landmarks with a mean reprojection error
/// above `error_thd` or fewer than `track_len_thd` usable observations are
/// dropped.
pub fn try_load_sfm_data(
    config: &CalibConfig,
    data: &CalibDataManager,
    params: &CalibParamManager,
    topic: &str,
    error_thd: Real,
    track_len_thd: usize,
) -> Result<Option<Veta>> {
    let info_file = config.image_info_file(topic);
    let workspace = config.sfm_workspace_dir(topic);
    let cameras_file = workspace.join("cameras.txt");
    let images_file = workspace.join("images.txt");
    let points_file = workspace.join("points3D.txt");

    for (what, path) in [
        ("info", &info_file),
        ("cameras", &cameras_file),
        ("images", &images_file),
        ("points 3D", &points_file),
    ] {
        if !path.exists() {
            warn!("the {what} file '{}' does not exist", path.display());
            return Ok(None);
        }
    }

    let info: ImagesInfo = config
        .preference
        .output_data_format
        .load(&info_file)
        .with_context(|| format!("loading the image info of camera '{topic}'"))?;
    let cameras = read_cameras(&cameras_file)?;
    let images = read_images(&images_file)?;
    let points = read_points3d(&points_file)?;

    let Some(camera) = cameras.values().next().filter(|_| cameras.len() == 1) else {
        warn!(
            "the reconstruction of camera '{topic}' holds {} cameras, exactly one is expected",
            cameras.len()
        );
        return Ok(None);
    };
    let intrinsics = params.camera_intrinsics(topic)?;

    let name_to_id: HashMap<&str, u64> = info
        .images
        .iter()
        .map(|(id, name)| (name.as_str(), *id))
        .collect();
    let frame_time: BTreeMap<u64, Real> = data
        .camera_topic(topic)?
        .iter()
        .map(|f| (f.id, f.timestamp))
        .collect();
    let view_of = |image: &ColmapImage| {
        name_to_id
            .get(image.name.as_str())
            .copied()
            .filter(|id| frame_time.contains_key(id))
    };

    let mut veta = Veta::default();
    for image in images.values() {
        let Some(view_id) = view_of(image) else {
            debug!("'{topic}': image '{}' is not used in solving", image.name);
            continue;
        };
        veta.views.insert(
            view_id,
            View {
                id: view_id,
                intrinsics_id: camera.id,
                pose_id: view_id,
                width: intrinsics.width,
                height: intrinsics.height,
                timestamp: frame_time[&view_id],
            },
        );
        let world_to_cam = iso3_from_parts(image.q_cw, image.t_cw);
        veta.poses.insert(view_id, world_to_cam.inverse());
    }

    let missing = frame_time
        .keys()
        .filter(|id| !veta.views.contains_key(id))
        .count();
    if missing > 0 {
        warn!(
            "{missing} frames of camera '{topic}' are used in solving but were not reconstructed"
        );
    }

    let mut conflicts = 0usize;
    for (pt_id, point) in &points {
        if point.error > error_thd || point.track.len() < track_len_thd {
            continue;
        }
        let mut landmark = Landmark {
            position: point.xyz,
            color: point.rgb,
            obs: BTreeMap::new(),
        };
        for &(image_id, feature_idx) in &point.track {
            let Some(image) = images.get(&image_id) else {
                continue;
            };
            let Some(feature) = image.points2d.get(feature_idx) else {
                conflicts += 1;
                continue;
            };
            if feature.point3d_id != Some(*pt_id) {
                conflicts += 1;
                continue;
            }
            let Some(view_id) = view_of(image).filter(|id| veta.views.contains_key(id)) else {
                continue;
            };
            landmark.obs.insert(
                view_id,
                Observation {
                    uv: feature.uv,
                    feature_idx,
                },
            );
        }
        if landmark.obs.len() >= track_len_thd {
            veta.landmarks.insert(*pt_id, landmark);
        }
    }
    if conflicts > 0 {
        warn!("'{topic}': skipped {conflicts} track entries whose feature references another 3D point");
    }

    info!(
        "'{topic}': loaded {} views, {} landmarks, {} observations from '{}'",
        veta.views.len(),
        veta.landmark_count(),
        veta.observation_count(),
        workspace.display()
    );
    Ok(Some(veta))
}
