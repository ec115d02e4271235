//! Bridge to an external structure-from-motion tool.
//!
//! Camera trajectories cannot be bootstrapped from inertial data alone, so
//! the solver exports every camera topic as undistorted images plus a list of
//! candidate pairs, asks the user to run COLMAP, and on the next run imports
//! the text model as a [`Veta`]. The imported reconstruction is aligned to
//! the trajectory frame and downsampled before it enters the joint solve.

pub mod align;
pub mod colmap;
pub mod export;
pub mod import;
mod veta;

pub use align::{downsample_veta, handeye_rotation, perform_transform_for_veta, umeyama};
pub use export::{match_candidates, store_images_for_sfm, ImagesInfo, MatchPair};
pub use import::try_load_sfm_data;
pub use veta::{Landmark, Observation, View, Veta};
