//! Iteration observers registered with the backend.
//!
//! Both callbacks keep their own copy of the estimation state and refresh it
//! from the snapshot of every iteration, so the solver's state is never
//! touched while a solve is running.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use ctcalib_core::{CalibError, CalibParamManager, DataFormat, SplineBundle};
use ctcalib_optim::{IterationCallback, IterationSummary, ParamSnapshot};
use log::warn;

use super::problem::{apply_to_bundle, apply_to_params};
use crate::viewer::{Viewer, ViewerFrame};

pub const EPOCH_INFO_FILE: &str = "epoch_info.csv";
pub const EPOCH_INFO_HEADER: &str = "epoch,cost,gradient,tr_radius(1/lambda)";

/// Pushes a snapshot to the viewer every iteration.
pub(crate) struct ViewerCallback<'a> {
    viewer: &'a Viewer,
    bundle: SplineBundle,
    params: CalibParamManager,
    first_iteration: usize,
}

impl<'a> ViewerCallback<'a> {
    pub fn new(
        viewer: &'a Viewer,
        bundle: &SplineBundle,
        params: &CalibParamManager,
        first_iteration: usize,
    ) -> Self {
        Self {
            viewer,
            bundle: bundle.clone(),
            params: params.clone(),
            first_iteration,
        }
    }
}

impl IterationCallback for ViewerCallback<'_> {
    fn on_iteration(&mut self, summary: &IterationSummary, snapshot: &ParamSnapshot<'_>) {
        apply_to_bundle(|name| snapshot.get(name), &mut self.bundle);
        apply_to_params(|name| snapshot.get(name), &mut self.params);
        self.viewer.send(ViewerFrame::snapshot(
            self.first_iteration + summary.iteration,
            summary.cost,
            &self.bundle,
            &self.params,
        ));
    }
}

/// Writes the parameters of every iteration under the epoch directory.
#[derive(Debug)]
pub struct DebugCallback {
    dir: PathBuf,
    format: DataFormat,
    epoch: usize,
}

impl DebugCallback {
    /// Recreate `dir` and start `epoch_info.csv`. Failures are warnings;
    /// nothing is written later while the directory is missing.
    pub fn create(dir: PathBuf, format: DataFormat) -> Self {
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!("cannot clear '{}': {e}", dir.display());
            }
        }
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("cannot create '{}': {e}", dir.display());
        } else {
            let path = dir.join(EPOCH_INFO_FILE);
            if let Err(e) = fs::write(&path, format!("{EPOCH_INFO_HEADER}\n")) {
                warn!("cannot write '{}': {e}", path.display());
            }
        }
        Self {
            dir,
            format,
            epoch: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Iterations recorded so far, across stages.
    pub fn epochs(&self) -> usize {
        self.epoch
    }

    /// Observer for one solve starting from `params`.
    pub(crate) fn stage<'a>(&'a mut self, params: &CalibParamManager) -> DebugStage<'a> {
        DebugStage {
            debug: self,
            params: params.clone(),
        }
    }

    fn record(&mut self, summary: &IterationSummary, params: &CalibParamManager) -> Result<()> {
        let file = self.dir.join(format!(
            "ctcalib_param_{}.{}",
            self.epoch,
            self.format.extension()
        ));
        params.save(&file, self.format)?;

        let info = self.dir.join(EPOCH_INFO_FILE);
        let mut csv = OpenOptions::new()
            .append(true)
            .open(&info)
            .map_err(|e| CalibError::io(&info, e))?;
        writeln!(
            csv,
            "{},{},{},{}",
            self.epoch, summary.cost, summary.gradient_norm, summary.trust_region_radius
        )
        .map_err(|e| CalibError::io(&info, e))?;
        Ok(())
    }
}

pub(crate) struct DebugStage<'a> {
    debug: &'a mut DebugCallback,
    params: CalibParamManager,
}

impl IterationCallback for DebugStage<'_> {
    fn on_iteration(&mut self, summary: &IterationSummary, snapshot: &ParamSnapshot<'_>) {
        apply_to_params(|name| snapshot.get(name), &mut self.params);
        if self.debug.dir.exists() {
            if let Err(e) = self.debug.record(summary, &self.params) {
                warn!("saving iteration {} failed: {e:#}", self.debug.epoch);
            }
        }
        self.debug.epoch += 1;
    }
}
