//! Image export and COLMAP command generation for one camera topic.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ctcalib_core::format::u64_key_map;
use ctcalib_core::spline::So3Spline;
use ctcalib_core::{
    rotation_angle_between, CalibConfig, CalibError, CameraFrame, CalibParamManager, Extrinsic,
    PinholeIntrinsics, Real,
};
use image::DynamicImage;
use indicatif::ParallelProgressIterator;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::{progress_bar, CalibDataManager};

pub const SFM_COMMAND_FILE: &str = "sfm-command-line.txt";
pub const MATCH_LIST_FILE: &str = "matches.txt";

/// Mapping between exported image files and internal frame ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagesInfo {
    pub topic: String,
    pub root_path: PathBuf,
    /// Frame id to file name.
    #[serde(with = "u64_key_map")]
    pub images: BTreeMap<u64, String>,
}

impl ImagesInfo {
    /// Frame id of an exported file name.
    pub fn id_of(&self, filename: &str) -> Option<u64> {
        self.images
            .iter()
            .find_map(|(id, name)| (name == filename).then_some(*id))
    }
}

pub fn image_filename(id: u64) -> String {
    format!("{id}.jpg")
}

/// Candidate image pair for feature matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchPair {
    pub first: u64,
    pub second: u64,
    /// `false` when the orientation spline could not judge the pair.
    pub verified: bool,
}

/// Pair every frame with the following `window` frames.
///
/// A pair whose predicted relative camera rotation exceeds `max_angle_deg`
/// is dropped. Pairs the spline cannot evaluate are kept unverified.
pub fn match_candidates(
    frames: &[CameraFrame],
    so3: &So3Spline,
    extrinsic: &Extrinsic,
    time_offset: Real,
    window: usize,
    max_angle_deg: f64,
) -> Vec<MatchPair> {
    let max_angle = max_angle_deg.to_radians();
    let camera_rotation = |frame: &CameraFrame| {
        so3.evaluate(frame.timestamp + time_offset)
            .map(|q| q * extrinsic.so3)
    };
    let rotations: Vec<_> = frames.iter().map(camera_rotation).collect();

    let mut pairs = Vec::new();
    for (i, first) in frames.iter().enumerate() {
        for j in (i + 1)..frames.len().min(i + 1 + window) {
            match (&rotations[i], &rotations[j]) {
                (Some(a), Some(b)) => {
                    if rotation_angle_between(a, b) <= max_angle {
                        pairs.push(MatchPair {
                            first: first.id,
                            second: frames[j].id,
                            verified: true,
                        });
                    }
                }
                _ => pairs.push(MatchPair {
                    first: first.id,
                    second: frames[j].id,
                    verified: false,
                }),
            }
        }
    }
    pairs
}

/// Text of the command file guiding the user through the reconstruction.
pub fn sfm_command_text(
    topic: &str,
    image_dir: &Path,
    workspace: &Path,
    intrinsics: &PinholeIntrinsics,
    rolling_shutter: bool,
) -> String {
    let database = workspace.join("database.db");
    let match_list = workspace.join(MATCH_LIST_FILE);
    let model_dir = workspace.join("0");
    let init_max_error = if rolling_shutter { 2.0 } else { 1.0 };
    let rule = "-".repeat(78);

    let mut text = String::new();
    let _ = writeln!(
        text,
        "# feature extraction for topic '{topic}'\n\
         colmap feature_extractor --database_path {} --image_path {} \
         --ImageReader.camera_model PINHOLE --ImageReader.single_camera 1 \
         --ImageReader.camera_params {:.3},{:.3},{:.3},{:.3}\n",
        database.display(),
        image_dir.display(),
        intrinsics.fx,
        intrinsics.fy,
        intrinsics.cx,
        intrinsics.cy,
    );
    let _ = writeln!(
        text,
        "# feature matching for topic '{topic}'\n\
         colmap matches_importer --database_path {} --match_list_path {} --match_type pairs\n",
        database.display(),
        match_list.display(),
    );
    let _ = writeln!(text, "# {rule}");
    let _ = writeln!(
        text,
        "# reconstruct with [colmap gui] (recommended) or [colmap mapper]; the mapper's\n\
         # automatic initialization is strict and may take long\n\
         colmap gui --database_path {} --image_path {}",
        database.display(),
        image_dir.display(),
    );
    let _ = writeln!(text, "# {rule}");
    let _ = writeln!(
        text,
        "colmap mapper --database_path {} --image_path {} --output_path {} \
         --Mapper.init_min_tri_angle 25 --Mapper.init_max_error {init_max_error:.1} \
         --Mapper.tri_min_angle 3 --Mapper.ba_refine_focal_length 0 \
         --Mapper.ba_refine_principal_point 0",
        database.display(),
        image_dir.display(),
        workspace.display(),
    );
    let _ = writeln!(text, "# {rule}\n");
    let _ = writeln!(
        text,
        "# export the model as text for topic '{topic}'\n\
         colmap model_converter --input_path {} --output_path {} --output_type TXT",
        model_dir.display(),
        workspace.display(),
    );
    text
}

/// Lines of the pair list consumed by `matches_importer`.
pub fn match_list_text(pairs: &[MatchPair]) -> String {
    pairs
        .iter()
        .map(|p| format!("{} {}\n", image_filename(p.first), image_filename(p.second)))
        .collect()
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| CalibError::io(path, e))?;
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).map_err(|e| CalibError::io(path, e))?;
    Ok(())
}

/// JPEG cannot hold alpha or 16-bit samples.
fn jpeg_compatible(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => img,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

/// Export undistorted images, the pair list, the info file and the command
/// file of `topic`. Returns the command file path.
pub fn store_images_for_sfm(
    config: &CalibConfig,
    data: &CalibDataManager,
    params: &CalibParamManager,
    topic: &str,
    pairs: &[MatchPair],
) -> Result<PathBuf> {
    let image_dir = config.image_store_dir(topic);
    create_dir(&image_dir)
        .with_context(|| format!("creating the image store of camera '{topic}'"))?;

    let frames = data.camera_topic(topic)?;
    let intrinsics = params.camera_intrinsics(topic)?;
    let rolling_shutter = config.camera_model(topic)?.is_rolling_shutter();

    let pb = progress_bar(frames.len() as u64, &format!("exporting '{topic}'"));
    frames
        .par_iter()
        .progress_with(pb.clone())
        .try_for_each(|frame| -> Result<()> {
            let path = image_dir.join(image_filename(frame.id));
            jpeg_compatible(intrinsics.undistort_image(&frame.image))
                .save(&path)
                .with_context(|| format!("saving '{}'", path.display()))
        })?;
    pb.finish_and_clear();

    let info = ImagesInfo {
        topic: topic.to_string(),
        root_path: image_dir.clone(),
        images: frames
            .iter()
            .map(|f| (f.id, image_filename(f.id)))
            .collect(),
    };

    let workspace = config.sfm_workspace_dir(topic);
    create_dir(&workspace)
        .with_context(|| format!("creating the SfM workspace of camera '{topic}'"))?;

    let unverified = pairs.iter().filter(|p| !p.verified).count();
    if unverified > 0 {
        warn!("'{topic}': {unverified} of {} match pairs could not be verified", pairs.len());
    }
    write_file(&workspace.join(MATCH_LIST_FILE), &match_list_text(pairs))?;

    let command_file = workspace.join(SFM_COMMAND_FILE);
    write_file(
        &command_file,
        &sfm_command_text(topic, &image_dir, &workspace, intrinsics, rolling_shutter),
    )?;

    let info_file = config.image_info_file(topic);
    config
        .preference
        .output_data_format
        .save(&info, &info_file)?;

    info!(
        "'{topic}': exported {} images and {} match pairs to '{}'",
        frames.len(),
        pairs.len(),
        workspace.display()
    );
    Ok(command_file)
}
