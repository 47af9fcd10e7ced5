use std::fs;
use std::path::Path;

use depthcam::calibration::{
    CalibrationEngine, ExtrinsicsSource, IntrinsicParameters,
};
use depthcam::capture::synthetic::render_target;
use depthcam::capture::SyntheticScene;
use depthcam::error::CalibrationMode;
use depthcam::{CalibrationConfig, CalibrationError, FrameBuffer};
use image::GrayImage;
use nalgebra::Vector3;

fn engine_in(dir: &Path) -> CalibrationEngine {
    let config = CalibrationConfig {
        translation_path: dir.join("calibration/t.txt"),
        rotation_path: dir.join("calibration/r.txt"),
        ..CalibrationConfig::default()
    };
    CalibrationEngine::new(&config).unwrap()
}

fn camera() -> IntrinsicParameters {
    IntrinsicParameters::from_source(&SyntheticScene::intrinsics_for(640, 480))
}

fn render(scene: &SyntheticScene) -> GrayImage {
    let truth = scene.extrinsics();
    render_target(&camera(), &truth.r, &truth.t, &scene.target, 640, 480)
}

#[test]
fn synthetic_board_pose_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let scene = SyntheticScene::default();
    let truth = scene.extrinsics();

    let pose = engine.estimate_pose(&render(&scene), &camera()).unwrap();
    assert!(pose.rms_error < 0.5, "rms {} px", pose.rms_error);
    assert!((pose.translation - truth.t).norm() < 3e-3, "t {:?}", pose.translation);
    assert!((pose.rotation_matrix() - truth.r).abs().max() < 1e-2);
}

#[test]
fn rotated_board_keeps_canonical_corner_order() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let mut scene = SyntheticScene::default();
    scene.rotation = Vector3::new(-0.1, 0.2, 0.3);
    let center = Vector3::new(2.5 * 0.0253, 4.0 * 0.0253, 0.0);
    scene.translation = Vector3::new(0.01, -0.005, 0.55) - scene.extrinsics().r * center;
    let truth = scene.extrinsics();

    let pose = engine.estimate_pose(&render(&scene), &camera()).unwrap();
    assert!(pose.rms_error < 0.5, "rms {} px", pose.rms_error);
    assert!((pose.translation - truth.t).norm() < 3e-3);
}

/// Default board pose, pushed back so its center sits `distance` meters away.
fn scene_at(distance: f64) -> SyntheticScene {
    let mut scene = SyntheticScene::default();
    let center = Vector3::new(2.5 * 0.0253, 4.0 * 0.0253, 0.0);
    scene.translation = Vector3::new(0.0, 0.0, distance) - scene.extrinsics().r * center;
    scene
}

#[test]
fn distant_board_with_small_squares_is_still_accurate() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    for distance in [1.3, 1.5, 1.8] {
        let scene = scene_at(distance);
        let truth = scene.extrinsics();
        let pose = engine.estimate_pose(&render(&scene), &camera()).unwrap();
        assert!(
            pose.rms_error < 0.5,
            "rms {} px at {distance} m",
            pose.rms_error
        );
        assert!(
            (pose.translation - truth.t).norm() < 1e-2,
            "t {:?} vs {:?} at {distance} m",
            pose.translation,
            truth.t
        );
    }
}

#[test]
fn image_mode_solves_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let scene = SyntheticScene::default();
    let image_path = dir.path().join("board.png");
    render(&scene).save(&image_path).unwrap();

    let extrinsics = engine
        .compute_extrinsics(
            &ExtrinsicsSource::Image(image_path),
            Some(&camera()),
            &FrameBuffer::new(),
        )
        .unwrap();
    assert!((extrinsics.t - scene.extrinsics().t).norm() < 3e-3);

    // The persisted files load back to the same pose.
    let loaded = engine
        .compute_extrinsics(
            &ExtrinsicsSource::Load {
                translation: engine.paths().translation.clone(),
                rotation: engine.paths().rotation.clone(),
            },
            None,
            &FrameBuffer::new(),
        )
        .unwrap();
    assert!((loaded.r - extrinsics.r).abs().max() < 1e-9);
    assert!((loaded.t - extrinsics.t).norm() < 1e-9);
}

#[test]
fn blank_image_is_target_not_found_and_leaves_files_alone() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let paths = engine.paths().clone();
    fs::create_dir_all(paths.translation.parent().unwrap()).unwrap();
    fs::write(&paths.translation, "1\n2\n3\n").unwrap();
    fs::write(&paths.rotation, "1 0 0\n0 1 0\n0 0 1\n").unwrap();

    let image_path = dir.path().join("blank.png");
    GrayImage::from_pixel(640, 480, image::Luma([128]))
        .save(&image_path)
        .unwrap();
    let failure = engine
        .compute_extrinsics(
            &ExtrinsicsSource::Image(image_path),
            Some(&camera()),
            &FrameBuffer::new(),
        )
        .unwrap_err();

    assert_eq!(failure.mode, CalibrationMode::Image);
    assert!(matches!(
        failure.cause,
        CalibrationError::TargetNotFound { cols: 6, rows: 9 }
    ));
    assert!(failure.is_retryable());
    assert_eq!(fs::read_to_string(&paths.translation).unwrap(), "1\n2\n3\n");
    assert_eq!(
        fs::read_to_string(&paths.rotation).unwrap(),
        "1 0 0\n0 1 0\n0 0 1\n"
    );
}

#[test]
fn poorly_fitting_pose_is_rejected_and_not_saved() {
    let dir = tempfile::tempdir().unwrap();
    let config = CalibrationConfig {
        translation_path: dir.path().join("t.txt"),
        rotation_path: dir.path().join("r.txt"),
        max_rms_px: 1e-6,
        ..CalibrationConfig::default()
    };
    let engine = CalibrationEngine::new(&config).unwrap();
    fs::write(&config.translation_path, "1\n2\n3\n").unwrap();
    fs::write(&config.rotation_path, "1 0 0\n0 1 0\n0 0 1\n").unwrap();

    let image_path = dir.path().join("board.png");
    render(&SyntheticScene::default()).save(&image_path).unwrap();
    let failure = engine
        .compute_extrinsics(
            &ExtrinsicsSource::Image(image_path),
            Some(&camera()),
            &FrameBuffer::new(),
        )
        .unwrap_err();

    match failure.cause {
        CalibrationError::PoseRejected { rms_px, limit_px } => {
            assert!(rms_px > limit_px);
            assert_eq!(limit_px, 1e-6);
        }
        ref other => panic!("unexpected {other:?}"),
    }
    assert!(failure.is_retryable());
    assert_eq!(fs::read_to_string(&config.translation_path).unwrap(), "1\n2\n3\n");
    assert_eq!(
        fs::read_to_string(&config.rotation_path).unwrap(),
        "1 0 0\n0 1 0\n0 0 1\n"
    );
}

#[test]
fn load_mode_reports_missing_and_malformed_files() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let source = ExtrinsicsSource::Load {
        translation: dir.path().join("t.txt"),
        rotation: dir.path().join("r.txt"),
    };
    let failure = engine
        .compute_extrinsics(&source, None, &FrameBuffer::new())
        .unwrap_err();
    assert_eq!(failure.mode, CalibrationMode::Load);
    assert!(matches!(failure.cause, CalibrationError::FileMissing { .. }));

    fs::write(dir.path().join("t.txt"), "0.1 0.2 0.3\n").unwrap();
    fs::write(dir.path().join("r.txt"), "1 0 0\n0 1 0\n").unwrap();
    let failure = engine
        .compute_extrinsics(&source, None, &FrameBuffer::new())
        .unwrap_err();
    assert!(matches!(failure.cause, CalibrationError::FileInvalid { .. }));
    assert!(!failure.is_retryable());
}
