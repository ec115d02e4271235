//! Background viewer fed with solver snapshots.
//!
//! The solver never shares its state with the viewer: every iteration it
//! sends an owned [`ViewerFrame`] through a bounded channel. When the viewer
//! falls behind, new frames are dropped rather than blocking the solve.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use ctcalib_core::{
    CalibError, CalibParamManager, Extrinsic, Quat, Real, ScaleSplineType, SplineBundle, Vec3,
    ViewerMode,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

const CHANNEL_CAPACITY: usize = 16;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const RECORD_FILE: &str = "frames.jsonl";

/// Owned snapshot of the estimation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerFrame {
    pub iteration: usize,
    pub cost: Real,
    pub so3_knots: Vec<Quat>,
    pub scale_knots: Vec<Vec3>,
    pub scale_type: ScaleSplineType,
    pub extrinsics: BTreeMap<String, Extrinsic>,
    pub gravity: Vec3,
}

impl ViewerFrame {
    pub fn snapshot(
        iteration: usize,
        cost: Real,
        bundle: &SplineBundle,
        params: &CalibParamManager,
    ) -> Self {
        Self {
            iteration,
            cost,
            so3_knots: bundle.so3.knots().to_vec(),
            scale_knots: bundle.scale_knots().to_vec(),
            scale_type: bundle.scale_type,
            extrinsics: params.extri.clone(),
            gravity: params.gravity,
        }
    }
}

enum ViewerMsg {
    Frame(Box<ViewerFrame>),
    Quit,
}

trait Renderer: Send {
    fn render(&mut self, frame: &ViewerFrame) -> Result<()>;
    fn idle(&mut self) {}
    fn finish(&mut self);
}

struct ProgressRenderer {
    spinner: ProgressBar,
}

impl ProgressRenderer {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
            spinner.set_style(style);
        }
        spinner.set_message("waiting for the solver".to_string());
        Self { spinner }
    }
}

impl Renderer for ProgressRenderer {
    fn render(&mut self, frame: &ViewerFrame) -> Result<()> {
        self.spinner.set_message(format!(
            "iteration {:>4}  cost {:.6e}  gravity [{:+.3}, {:+.3}, {:+.3}]",
            frame.iteration, frame.cost, frame.gravity.x, frame.gravity.y, frame.gravity.z
        ));
        self.spinner.tick();
        Ok(())
    }

    fn idle(&mut self) {
        self.spinner.tick();
    }

    fn finish(&mut self) {
        self.spinner.finish_and_clear();
    }
}

struct RecordRenderer {
    writer: BufWriter<File>,
}

impl RecordRenderer {
    fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| CalibError::io(dir, e))?;
        let path = dir.join(RECORD_FILE);
        let file = File::create(&path).map_err(|e| CalibError::io(&path, e))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl Renderer for RecordRenderer {
    fn render(&mut self, frame: &ViewerFrame) -> Result<()> {
        serde_json::to_writer(&mut self.writer, frame)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("flushing the viewer record failed: {e}");
        }
    }
}

/// Clears the activity flag when the viewer thread ends, panics included.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle of the viewer thread.
pub struct Viewer {
    tx: Sender<ViewerMsg>,
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Viewer {
    /// Start the viewer for `mode`; `Ok(None)` when headless.
    pub fn spawn(mode: ViewerMode, viewer_dir: &Path) -> Result<Option<Self>> {
        let renderer: Box<dyn Renderer> = match mode {
            ViewerMode::Headless => return Ok(None),
            ViewerMode::Progress => Box::new(ProgressRenderer::new()),
            ViewerMode::Record => Box::new(
                RecordRenderer::create(viewer_dir).context("starting the recording viewer")?,
            ),
        };

        let viewer = Self::start(renderer)?;
        debug!("viewer started in {mode:?} mode");
        Ok(Some(viewer))
    }

    fn start(renderer: Box<dyn Renderer>) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(CHANNEL_CAPACITY);
        let active = Arc::new(AtomicBool::new(true));
        let guard = ActiveGuard(Arc::clone(&active));
        let handle = thread::Builder::new()
            .name("ctcalib-viewer".to_string())
            .spawn(move || {
                let _guard = guard;
                run_viewer(renderer, rx);
            })
            .context("spawning the viewer thread")?;

        Ok(Self {
            tx,
            active,
            handle: Some(handle),
        })
    }

    /// Queue a frame; dropped when the viewer lags behind.
    pub fn send(&self, frame: ViewerFrame) {
        match self.tx.try_send(ViewerMsg::Frame(Box::new(frame))) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("viewer busy, frame dropped"),
            Err(TrySendError::Disconnected(_)) => debug!("viewer gone, frame dropped"),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Ask the viewer to quit and wait until it has.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        // A full queue still drains, so the blocking send terminates.
        let _ = self.tx.send(ViewerMsg::Quit);
        while self.is_active() && !handle.is_finished() {
            thread::sleep(POLL_INTERVAL);
        }
        if handle.join().is_err() {
            warn!("the viewer thread panicked");
        }
        debug!("viewer stopped");
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_viewer(mut renderer: Box<dyn Renderer>, rx: Receiver<ViewerMsg>) {
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(ViewerMsg::Frame(frame)) => {
                if let Err(e) = renderer.render(&frame) {
                    warn!("viewer failed to render iteration {}: {e:#}", frame.iteration);
                }
            }
            Ok(ViewerMsg::Quit) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => renderer.idle(),
        }
    }
    renderer.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(iteration: usize) -> ViewerFrame {
        ViewerFrame {
            iteration,
            cost: 1.0 / (iteration + 1) as f64,
            so3_knots: vec![Quat::identity(); 4],
            scale_knots: vec![Vec3::zeros(); 4],
            scale_type: ScaleSplineType::LinAcce,
            extrinsics: BTreeMap::new(),
            gravity: Vec3::new(0.0, 0.0, -9.8),
        }
    }

    struct FailingRenderer;

    impl Renderer for FailingRenderer {
        fn render(&mut self, _frame: &ViewerFrame) -> Result<()> {
            panic!("renderer failure");
        }

        fn finish(&mut self) {}
    }

    #[test]
    fn panicking_renderer_does_not_block_shutdown() {
        let mut viewer = Viewer::start(Box::new(FailingRenderer)).unwrap();
        viewer.send(frame(0));
        for _ in 0..50 {
            if !viewer.is_active() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!viewer.is_active());
        viewer.shutdown();
        assert!(viewer.handle.is_none());
    }

    #[test]
    fn headless_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Viewer::spawn(ViewerMode::Headless, dir.path()).unwrap().is_none());
    }

    #[test]
    fn record_viewer_writes_frames_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let viewer_dir = dir.path().join("viewer");
        let mut viewer = Viewer::spawn(ViewerMode::Record, &viewer_dir)
            .unwrap()
            .unwrap();
        assert!(viewer.is_active());
        for i in 0..3 {
            viewer.send(frame(i));
            // Keep the queue short so no frame is dropped.
            thread::sleep(Duration::from_millis(5));
        }
        viewer.shutdown();
        assert!(!viewer.is_active());

        let text = fs::read_to_string(viewer_dir.join(RECORD_FILE)).unwrap();
        let frames: Vec<ViewerFrame> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].iteration, 2);
        assert!((frames[2].cost - frame(2).cost).abs() < 1e-12);
        assert_eq!(frames[2].so3_knots.len(), 4);
    }
}
