use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use depthcam::calibration::{ChannelPrompt, ExtrinsicsSource};
use depthcam::capture::{PixelFormat, SyntheticControl, SyntheticScene, SyntheticSource};
use depthcam::error::CalibrationMode;
use depthcam::{CalibrationError, CameraSession, Config, SessionState, StreamKind};

fn config(width: u32, height: u32, dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    for stream in [&mut config.capture.color, &mut config.capture.depth] {
        stream.width = width;
        stream.height = height;
        stream.fps = 100;
    }
    config.acquisition.wait_timeout_ms = 200;
    config.acquisition.warmup_frames = 2;
    config.acquisition.max_consecutive_failures = 3;
    config.acquisition.stop_grace_ms = 50;
    config.calibration.translation_path = dir.join("t.txt");
    config.calibration.rotation_path = dir.join("r.txt");
    config
}

fn session_with(config: Config, source: SyntheticSource) -> (CameraSession, SyntheticControl) {
    let control = source.control();
    (CameraSession::new(Box::new(source), config).unwrap(), control)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn start_is_idempotent_and_stop_clears_frames() {
    let dir = tempfile::tempdir().unwrap();
    let (mut session, _) = session_with(config(160, 120, dir.path()), SyntheticSource::default());
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(session.intrinsics().is_none());

    session.start().unwrap();
    session.start().unwrap();
    assert!(session.is_running());
    assert!(session.intrinsics().is_some());
    assert_eq!(session.depth_scale(), Some(0.001));

    wait_until("frames", || {
        let (color, depth) = session.frames();
        color.is_some() && depth.is_some()
    });
    assert_eq!(session.state(), SessionState::Streaming);

    session.stop().unwrap();
    session.stop().unwrap();
    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(session.snapshot(StreamKind::Color).is_none());
    assert!(session.intrinsics().is_none());
}

#[test]
fn warm_up_frames_are_never_published() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(160, 120, dir.path());
    config.acquisition.warmup_frames = 5;
    let (mut session, _) = session_with(config, SyntheticSource::default());

    session.start().unwrap();
    wait_until("first frame", || session.snapshot(StreamKind::Color).is_some());
    let first = session.snapshot(StreamKind::Color).unwrap();
    assert!(first.sequence() > 5, "published warm-up frame {}", first.sequence());
    session.stop().unwrap();
}

#[test]
fn snapshots_never_go_back_in_time() {
    let dir = tempfile::tempdir().unwrap();
    let (mut session, _) = session_with(config(160, 120, dir.path()), SyntheticSource::default());
    session.start().unwrap();
    let buffer = session.buffer();

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut last = 0;
                let until = Instant::now() + Duration::from_millis(300);
                while Instant::now() < until {
                    if let Some(frame) = buffer.snapshot(StreamKind::Depth) {
                        assert!(frame.sequence() >= last);
                        last = frame.sequence();
                    }
                }
                last
            })
        })
        .collect();
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    session.stop().unwrap();
}

#[test]
fn stop_is_bounded_while_the_driver_stalls_and_restart_works() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(160, 120, dir.path());
    let wait_timeout = config.acquisition.wait_timeout();
    let (mut session, control) = session_with(config, SyntheticSource::default());

    session.start().unwrap();
    wait_until("frames", || session.snapshot(StreamKind::Color).is_some());
    control.set_stalled(true);
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    session.stop().unwrap();
    assert!(
        started.elapsed() < 2 * wait_timeout,
        "stop took {:?}",
        started.elapsed()
    );

    control.set_stalled(false);
    session.start().unwrap();
    wait_until("frames after restart", || {
        session.snapshot(StreamKind::Color).is_some()
    });
    session.stop().unwrap();
}

#[test]
fn consecutive_timeouts_degrade_then_recover() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(160, 120, dir.path());
    config.acquisition.wait_timeout_ms = 20;
    let (mut session, control) = session_with(config, SyntheticSource::default());
    control.inject_timeouts(6);

    session.start().unwrap();
    wait_until("degraded", || session.state() == SessionState::Degraded);
    wait_until("recovery", || session.state() == SessionState::Streaming);
    wait_until("frames", || session.snapshot(StreamKind::Color).is_some());
    session.stop().unwrap();
}

#[test]
fn live_calibration_through_channel_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let source = SyntheticSource::default();
    let truth = source.scene().extrinsics();
    let (mut session, _) = session_with(config(640, 480, dir.path()), source);

    let (prompt, confirm) = ChannelPrompt::new();
    let live = ExtrinsicsSource::Live(Arc::new(prompt));

    // No reported intrinsics before start.
    let failure = session.calibrate(&live).unwrap_err();
    assert_eq!(failure.mode, CalibrationMode::Live);
    assert!(matches!(failure.cause, CalibrationError::NotStreaming));

    session.start().unwrap();
    wait_until("frames", || {
        let (color, depth) = session.frames();
        color.is_some() && depth.is_some()
    });

    let operator = thread::spawn(move || confirm.next_prompt().is_some() && confirm.confirm());
    let extrinsics = session.calibrate(&live).unwrap();
    assert!(operator.join().unwrap());
    assert!((extrinsics.t - truth.t).norm() < 3e-3);
    assert!((extrinsics.r - truth.r).abs().max() < 1e-2);
    assert!(dir.path().join("t.txt").exists());
    assert!(dir.path().join("r.txt").exists());

    // A pixel on the target plane maps back onto z = 0 in the target frame.
    let p = session.world_point_at(320, 240).unwrap();
    assert!(p.z.abs() < 5e-3, "world point {p:?}");
    assert!(p.x > -0.0253 && p.x < 6.0 * 0.0253);
    assert!(p.y > -0.0253 && p.y < 9.0 * 0.0253);

    // Extrinsics outlive the stream; intrinsics do not.
    session.stop().unwrap();
    assert!(session.extrinsics().is_some());
    assert!(session.world_point_at(320, 240).is_none());
}

#[test]
fn load_mode_works_without_streaming() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("t.txt"), "0.01\n0.02\n0.5\n").unwrap();
    std::fs::write(dir.path().join("r.txt"), "1 0 0\n0 1 0\n0 0 1\n").unwrap();
    let (session, _) = session_with(config(160, 120, dir.path()), SyntheticSource::default());

    let extrinsics = session
        .calibrate(&ExtrinsicsSource::Load {
            translation: dir.path().join("t.txt"),
            rotation: dir.path().join("r.txt"),
        })
        .unwrap();
    assert_eq!(extrinsics.t.z, 0.5);
    assert!(session.extrinsics().is_some());
}

#[test]
fn compressed_color_stream_is_decoded_before_publishing() {
    let dir = tempfile::tempdir().unwrap();
    let source = SyntheticSource::new(SyntheticScene::default()).with_color_format(PixelFormat::Mjpeg);
    let (mut session, _) = session_with(config(160, 120, dir.path()), source);

    session.start().unwrap();
    wait_until("color frame", || session.snapshot(StreamKind::Color).is_some());
    let frame = session.snapshot(StreamKind::Color).unwrap();
    assert_eq!(frame.meta.format, PixelFormat::Rgb8);
    assert_eq!(frame.data.len(), 160 * 120 * 3);
    session.stop().unwrap();
}

#[test]
fn dropping_a_running_session_stops_it() {
    let dir = tempfile::tempdir().unwrap();
    let (mut session, _) = session_with(config(160, 120, dir.path()), SyntheticSource::default());
    session.start().unwrap();
    let buffer = session.buffer();
    wait_until("frames", || buffer.has_frame(StreamKind::Color));
    drop(session);
    assert!(!buffer.has_frame(StreamKind::Color));
}
