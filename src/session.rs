//! Camera session: owns the frame source, the shared buffer and the
//! calibration results

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use nalgebra::{Point2, Point3};
use tracing::{debug, info, warn};

use crate::calibration::{
    CalibrationEngine, ExtrinsicParameters, ExtrinsicsSource, IntrinsicParameters,
};
use crate::capture::{Frame, FrameSource, StreamHandle, StreamKind};
use crate::error::{CalibrationFailure, SessionError};
use crate::pipeline::{AcquisitionLoop, AcquisitionSettings, FrameBuffer, SharedState};
use crate::Config;

pub use crate::pipeline::SessionState;

const JOIN_POLL: Duration = Duration::from_millis(5);

struct Worker {
    handle: JoinHandle<Result<Box<dyn FrameSource>, flume::RecvError>>,
    stop: Arc<AtomicBool>,
}

/// A depth camera with its acquisition thread and calibration state.
///
/// `start` and `stop` are idempotent. Consumers read frames through
/// [`snapshot`](Self::snapshot) or the shared [`FrameBuffer`] from any thread.
pub struct CameraSession {
    config: Config,
    engine: CalibrationEngine,
    source: Option<Box<dyn FrameSource>>,
    worker: Option<Worker>,
    buffer: Arc<FrameBuffer>,
    state: Arc<SharedState>,
    stream: ArcSwapOption<StreamHandle>,
    intrinsics: ArcSwapOption<IntrinsicParameters>,
    extrinsics: ArcSwapOption<ExtrinsicParameters>,
}

impl CameraSession {
    pub fn new(source: Box<dyn FrameSource>, config: Config) -> Result<Self, SessionError> {
        let engine = CalibrationEngine::new(&config.calibration)?;
        Ok(Self {
            config,
            engine,
            source: Some(source),
            worker: None,
            buffer: Arc::new(FrameBuffer::new()),
            state: Arc::new(SharedState::default()),
            stream: ArcSwapOption::empty(),
            intrinsics: ArcSwapOption::empty(),
            extrinsics: ArcSwapOption::empty(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Configure and start the source, then spawn the acquisition thread.
    /// Does nothing if already running.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.worker.is_some() {
            debug!("Session already running");
            return Ok(());
        }
        let mut source = self.source.take().ok_or(SessionError::SourceLost)?;

        let handle = match source
            .configure(&self.config.capture)
            .and_then(|()| source.start())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.source = Some(source);
                return Err(SessionError::Start(e));
            }
        };

        let calibration_intrinsics = handle
            .color
            .as_ref()
            .or(handle.depth.as_ref())
            .map(IntrinsicParameters::from_source);
        self.intrinsics.store(calibration_intrinsics.map(Arc::new));
        self.stream.store(Some(Arc::new(handle)));

        self.buffer.clear();
        let stop = Arc::new(AtomicBool::new(false));
        let acquisition = AcquisitionLoop::new(
            source,
            Arc::clone(&self.buffer),
            Arc::clone(&self.state),
            Arc::clone(&stop),
            AcquisitionSettings::from_config(&self.config),
        );

        // Hand the loop over through a channel so a failed spawn still
        // leaves the source with us.
        let (tx, rx) = flume::bounded::<AcquisitionLoop>(1);
        let spawned = thread::Builder::new()
            .name("depthcam-acquisition".into())
            .spawn(move || rx.recv().map(AcquisitionLoop::run));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.reclaim(acquisition);
                return Err(SessionError::Spawn(e));
            }
        };
        if let Err(flume::SendError(acquisition)) = tx.send(acquisition) {
            self.reclaim(acquisition);
            return Err(SessionError::SourceLost);
        }

        self.worker = Some(Worker { handle, stop });
        info!("Session started");
        Ok(())
    }

    /// Signal the acquisition thread, wait for it and stop the source.
    /// Does nothing if not running.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        let Some(worker) = self.worker.take() else {
            debug!("Session not running");
            return Ok(());
        };
        worker.stop.store(true, Ordering::Release);

        let deadline = self.config.acquisition.stop_deadline();
        let started = Instant::now();
        while !worker.handle.is_finished() && started.elapsed() < deadline {
            thread::sleep(JOIN_POLL);
        }
        if !worker.handle.is_finished() {
            warn!(
                deadline_ms = deadline.as_millis() as u64,
                "Acquisition thread overran its stop deadline, still waiting"
            );
        }

        let joined = worker.handle.join();
        self.state.store(SessionState::Stopped);
        self.buffer.clear();
        self.drop_stream_info();

        let mut source = match joined {
            Ok(Ok(source)) => source,
            Ok(Err(_)) | Err(_) => return Err(SessionError::SourceLost),
        };
        if let Err(e) = source.stop() {
            warn!(error = %e, "Frame source did not stop cleanly");
        }
        self.source = Some(source);
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Session stopped");
        Ok(())
    }

    /// Take the source back from a loop that never ran.
    fn reclaim(&mut self, acquisition: AcquisitionLoop) {
        let mut source = acquisition.into_source();
        if let Err(e) = source.stop() {
            warn!(error = %e, "Frame source did not stop cleanly");
        }
        self.source = Some(source);
        self.drop_stream_info();
    }

    fn drop_stream_info(&self) {
        self.stream.store(None);
        self.intrinsics.store(None);
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// The buffer consumers can share across threads.
    pub fn buffer(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn snapshot(&self, stream: StreamKind) -> Option<Frame> {
        self.buffer.snapshot(stream)
    }

    /// Independent (color, depth) snapshots; not guaranteed to share a
    /// capture instant.
    pub fn frames(&self) -> (Option<Frame>, Option<Frame>) {
        (
            self.buffer.snapshot(StreamKind::Color),
            self.buffer.snapshot(StreamKind::Depth),
        )
    }

    /// Driver-reported stream constants, while streaming.
    pub fn stream_handle(&self) -> Option<Arc<StreamHandle>> {
        self.stream.load_full()
    }

    /// Intrinsics used for calibration (color stream, else depth).
    pub fn intrinsics(&self) -> Option<Arc<IntrinsicParameters>> {
        self.intrinsics.load_full()
    }

    /// Intrinsics of one stream, derived from the reported constants.
    pub fn compute_intrinsics(
        &self,
        stream: StreamKind,
    ) -> Result<IntrinsicParameters, crate::CalibrationError> {
        let handle = self.stream.load();
        let reported = handle.as_ref().and_then(|h| match stream {
            StreamKind::Color => h.color.as_ref(),
            StreamKind::Depth => h.depth.as_ref(),
        });
        self.engine.compute_intrinsics(reported)
    }

    /// Meters per depth unit, while streaming.
    pub fn depth_scale(&self) -> Option<f32> {
        self.stream.load().as_ref().map(|h| h.depth_scale)
    }

    pub fn extrinsics(&self) -> Option<Arc<ExtrinsicParameters>> {
        self.extrinsics.load_full()
    }

    pub fn engine(&self) -> &CalibrationEngine {
        &self.engine
    }

    /// Run extrinsic calibration and publish the result to consumers.
    ///
    /// Blocks for the operator in live mode; no buffer lock is held meanwhile.
    pub fn calibrate(
        &self,
        source: &ExtrinsicsSource,
    ) -> Result<Arc<ExtrinsicParameters>, CalibrationFailure> {
        let intrinsics = self.intrinsics.load_full();
        let extrinsics =
            Arc::new(
                self.engine
                    .compute_extrinsics(source, intrinsics.as_deref(), &self.buffer)?,
            );
        self.extrinsics.store(Some(Arc::clone(&extrinsics)));
        Ok(extrinsics)
    }

    /// World (target-frame) coordinates of color pixel `(u, v)` from the
    /// latest depth frame.
    pub fn world_point_at(&self, u: u32, v: u32) -> Option<Point3<f64>> {
        let intrinsics = self.intrinsics.load_full()?;
        let extrinsics = self.extrinsics.load_full()?;
        let scale = self.depth_scale()?;
        let color_size = self
            .buffer
            .peek(StreamKind::Color, |f| (f.width(), f.height()))?;
        let (depth_size, units) = self.buffer.peek(StreamKind::Depth, |f| {
            ((f.width(), f.height()), f.depth_at(u, v))
        })?;
        if depth_size != color_size {
            return None;
        }
        let units = units.filter(|d| *d > 0)?;
        let camera = intrinsics.deproject(
            &Point2::new(u as f64, v as f64),
            units as f64 * scale as f64,
        );
        Some(extrinsics.camera_to_world(&camera))
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop() {
                warn!(error = %e, "Failed to stop session on drop");
            }
        }
    }
}
