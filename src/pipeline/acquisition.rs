//! Background loop moving frame pairs from the source into the buffer

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::buffer::FrameBuffer;
use crate::capture::decode::normalize;
use crate::capture::{Frame, FrameSource, StreamKind};
use crate::error::CaptureError;
use crate::Config;

/// Lifecycle of a camera session as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Stopped = 0,
    /// Streaming, but still discarding the initial unstable frames
    WarmingUp = 1,
    Streaming = 2,
    /// Too many consecutive waits failed; still retrying
    Degraded = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::WarmingUp,
            2 => SessionState::Streaming,
            3 => SessionState::Degraded,
            _ => SessionState::Stopped,
        }
    }
}

/// [`SessionState`] shared between the session and its worker.
#[derive(Debug)]
pub struct SharedState(AtomicU8);

impl Default for SharedState {
    fn default() -> Self {
        Self(AtomicU8::new(SessionState::Stopped as u8))
    }
}

impl SharedState {
    pub fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionSettings {
    pub wait_timeout: Duration,
    pub warmup_frames: u32,
    pub max_consecutive_failures: u32,
    pub color: bool,
    pub depth: bool,
}

impl AcquisitionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            wait_timeout: config.acquisition.wait_timeout(),
            warmup_frames: config.acquisition.warmup_frames,
            max_consecutive_failures: config.acquisition.max_consecutive_failures.max(1),
            color: config.capture.color.enabled,
            depth: config.capture.depth.enabled,
        }
    }

    fn enabled(&self, stream: StreamKind) -> bool {
        match stream {
            StreamKind::Color => self.color,
            StreamKind::Depth => self.depth,
        }
    }
}

/// What one iteration of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A pair arrived during warm-up and was thrown away
    Discarded,
    /// At least one frame was published
    Published { color: bool, depth: bool },
    /// A pair arrived but nothing in it was publishable
    Skipped,
    /// The wait failed; `consecutive` counts failures since the last pair
    Failed { consecutive: u32 },
}

/// Owns the source while streaming and publishes into the shared buffer.
pub struct AcquisitionLoop {
    source: Box<dyn FrameSource>,
    buffer: Arc<FrameBuffer>,
    state: Arc<SharedState>,
    stop: Arc<AtomicBool>,
    settings: AcquisitionSettings,
    warmup_remaining: u32,
    consecutive_failures: u32,
}

impl AcquisitionLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        buffer: Arc<FrameBuffer>,
        state: Arc<SharedState>,
        stop: Arc<AtomicBool>,
        settings: AcquisitionSettings,
    ) -> Self {
        Self {
            source,
            buffer,
            state,
            stop,
            warmup_remaining: settings.warmup_frames,
            settings,
            consecutive_failures: 0,
        }
    }

    /// Run until the stop flag is raised, then clear the buffer and hand
    /// the source back.
    pub fn run(mut self) -> Box<dyn FrameSource> {
        info!(
            warmup = self.settings.warmup_frames,
            timeout_ms = self.settings.wait_timeout.as_millis() as u64,
            "Acquisition loop started"
        );
        self.state.store(if self.warmup_remaining > 0 {
            SessionState::WarmingUp
        } else {
            SessionState::Streaming
        });

        while !self.stop.load(Ordering::Acquire) {
            self.step();
        }

        // Nothing left behind may look fresh to a reader.
        self.buffer.clear();
        info!(stats = ?self.buffer.stats(), "Acquisition loop exiting");
        self.source
    }

    /// Give up the source without running.
    pub fn into_source(self) -> Box<dyn FrameSource> {
        self.source
    }

    /// One bounded wait on the source.
    pub fn step(&mut self) -> StepOutcome {
        let pair = match self.source.wait_for_frame_pair(self.settings.wait_timeout) {
            Ok(pair) => pair,
            Err(e) => return self.record_failure(e),
        };

        if self.consecutive_failures > 0 {
            debug!(after = self.consecutive_failures, "Frames flowing again");
        }
        self.consecutive_failures = 0;

        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            metrics::counter!("depthcam_frames_discarded_total").increment(1);
            if self.warmup_remaining == 0 {
                info!("Warm-up complete, publishing frames");
                self.state.store(SessionState::Streaming);
            }
            return StepOutcome::Discarded;
        }

        if self.state.load() == SessionState::Degraded {
            info!("Acquisition recovered");
            self.state.store(SessionState::Streaming);
        }

        let color = self.publish(StreamKind::Color, pair.color);
        let depth = self.publish(StreamKind::Depth, pair.depth);
        if color || depth {
            StepOutcome::Published { color, depth }
        } else {
            StepOutcome::Skipped
        }
    }

    fn publish(&self, stream: StreamKind, frame: Option<Frame>) -> bool {
        let Some(frame) = frame else {
            return false;
        };
        if !self.settings.enabled(stream) {
            return false;
        }
        if frame.stream() != stream {
            warn!(expected = %stream, got = %frame.stream(), "Frame delivered on the wrong stream");
            return false;
        }
        match normalize(frame) {
            Ok(frame) => {
                let latency = frame.timestamp.elapsed();
                let sequence = frame.sequence();
                let stored = self.buffer.publish(frame);
                if stored {
                    metrics::counter!("depthcam_frames_published_total", "stream" => stream.as_str())
                        .increment(1);
                    metrics::histogram!("depthcam_publish_latency_ms")
                        .record(latency.as_secs_f64() * 1e3);
                } else {
                    debug!(%stream, sequence, "Dropped out-of-order frame");
                }
                stored
            }
            Err(e) => {
                metrics::counter!("depthcam_decode_errors_total").increment(1);
                warn!(%stream, error = %e, "Skipping malformed frame");
                false
            }
        }
    }

    fn record_failure(&mut self, err: CaptureError) -> StepOutcome {
        self.consecutive_failures += 1;
        let consecutive = self.consecutive_failures;
        if matches!(err, CaptureError::FrameTimeout(_)) {
            metrics::counter!("depthcam_frame_timeouts_total").increment(1);
        }
        warn!(consecutive, error = %err, "Frame wait failed, retrying");

        if consecutive >= self.settings.max_consecutive_failures
            && self.state.load() != SessionState::Degraded
        {
            error!(consecutive, "Acquisition degraded");
            self.state.store(SessionState::Degraded);
        }
        StepOutcome::Failed { consecutive }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FramePair, PixelFormat, StreamHandle};
    use crate::CaptureConfig;
    use bytes::Bytes;
    use std::collections::VecDeque;

    /// Replays a scripted sequence of wait results.
    struct Scripted {
        script: VecDeque<Result<FramePair, CaptureError>>,
    }

    impl FrameSource for Scripted {
        fn configure(&mut self, _: &CaptureConfig) -> Result<(), CaptureError> {
            Ok(())
        }

        fn start(&mut self) -> Result<StreamHandle, CaptureError> {
            Ok(StreamHandle {
                color: None,
                depth: None,
                depth_scale: 0.001,
            })
        }

        fn stop(&mut self) -> Result<(), CaptureError> {
            Ok(())
        }

        fn wait_for_frame_pair(&mut self, timeout: Duration) -> Result<FramePair, CaptureError> {
            self.script
                .pop_front()
                .unwrap_or(Err(CaptureError::FrameTimeout(timeout)))
        }
    }

    fn pair(seq: u64) -> Result<FramePair, CaptureError> {
        Ok(FramePair {
            color: Some(
                Frame::new(
                    StreamKind::Color,
                    PixelFormat::Bgr8,
                    4,
                    2,
                    seq,
                    Bytes::from(vec![seq as u8; 24]),
                )
                .unwrap(),
            ),
            depth: Some(
                Frame::new(
                    StreamKind::Depth,
                    PixelFormat::Z16,
                    4,
                    2,
                    seq,
                    Bytes::from(vec![0u8; 16]),
                )
                .unwrap(),
            ),
        })
    }

    fn timeout() -> Result<FramePair, CaptureError> {
        Err(CaptureError::FrameTimeout(Duration::from_millis(1)))
    }

    fn acquisition(
        script: Vec<Result<FramePair, CaptureError>>,
        warmup: u32,
    ) -> (AcquisitionLoop, Arc<FrameBuffer>, Arc<SharedState>) {
        let buffer = Arc::new(FrameBuffer::new());
        let state = Arc::new(SharedState::default());
        let settings = AcquisitionSettings {
            wait_timeout: Duration::from_millis(1),
            warmup_frames: warmup,
            max_consecutive_failures: 3,
            color: true,
            depth: true,
        };
        let acq = AcquisitionLoop::new(
            Box::new(Scripted {
                script: script.into(),
            }),
            Arc::clone(&buffer),
            Arc::clone(&state),
            Arc::new(AtomicBool::new(false)),
            settings,
        );
        (acq, buffer, state)
    }

    #[test]
    fn warm_up_pairs_are_never_published() {
        let (mut acq, buffer, state) = acquisition((1..=4).map(pair).collect(), 3);
        state.store(SessionState::WarmingUp);
        for _ in 0..3 {
            assert_eq!(acq.step(), StepOutcome::Discarded);
            assert!(buffer.snapshot(StreamKind::Color).is_none());
        }
        assert_eq!(state.load(), SessionState::Streaming);
        assert_eq!(
            acq.step(),
            StepOutcome::Published {
                color: true,
                depth: true
            }
        );
        assert_eq!(buffer.latest_sequence(StreamKind::Color), Some(4));
    }

    #[test]
    fn timeouts_degrade_and_a_frame_recovers() {
        let script = vec![timeout(), timeout(), timeout(), timeout(), pair(1)];
        let (mut acq, buffer, state) = acquisition(script, 0);
        state.store(SessionState::Streaming);

        assert_eq!(acq.step(), StepOutcome::Failed { consecutive: 1 });
        assert_eq!(acq.step(), StepOutcome::Failed { consecutive: 2 });
        assert_eq!(state.load(), SessionState::Streaming);
        assert_eq!(acq.step(), StepOutcome::Failed { consecutive: 3 });
        assert_eq!(state.load(), SessionState::Degraded);
        assert_eq!(acq.step(), StepOutcome::Failed { consecutive: 4 });

        assert!(matches!(acq.step(), StepOutcome::Published { .. }));
        assert_eq!(state.load(), SessionState::Streaming);
        assert!(buffer.has_frame(StreamKind::Depth));
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let bad = Frame {
            data: Bytes::from_static(&[1, 2, 3]),
            ..pair(1).unwrap().color.unwrap()
        };
        let script = vec![Ok(FramePair {
            color: Some(bad),
            depth: None,
        })];
        let (mut acq, buffer, _) = acquisition(script, 0);
        assert_eq!(acq.step(), StepOutcome::Skipped);
        assert!(!buffer.has_frame(StreamKind::Color));
    }

    #[test]
    fn run_clears_buffer_and_returns_source_on_stop() {
        let (acq, buffer, state) = acquisition((1..=3).map(pair).collect(), 0);
        let stop = Arc::clone(&acq.stop);
        let handle = std::thread::spawn(move || acq.run());
        while buffer.latest_sequence(StreamKind::Color).is_none() {
            std::thread::yield_now();
        }
        stop.store(true, Ordering::Release);
        let _source = handle.join().unwrap();
        assert!(!buffer.has_frame(StreamKind::Color));
        assert!(!buffer.has_frame(StreamKind::Depth));
        assert_ne!(state.load(), SessionState::Stopped);
    }
}
