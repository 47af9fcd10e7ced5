use std::fs;

use depthcam::{Config, ConfigError, StartupMode};

#[test]
fn toml_file_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("depthcam.toml");
    fs::write(
        &path,
        r#"
[capture.color]
enabled = true
width = 1280
height = 720
fps = 15

[acquisition]
wait_timeout_ms = 500

[calibration]
mode = "image"
image_path = "boards/left.png"

[calibration.target]
cols = 7
rows = 10
square_size_m = 0.03
"#,
    )
    .unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.capture.color.width, 1280);
    assert_eq!(config.capture.color.fps, 15);
    // Untouched sections keep their defaults.
    assert_eq!(config.capture.depth.width, 640);
    assert_eq!(config.acquisition.wait_timeout_ms, 500);
    assert_eq!(config.acquisition.stop_grace_ms, 250);
    assert_eq!(config.calibration.mode, StartupMode::Image);
    assert_eq!(config.calibration.image_path.to_str(), Some("boards/left.png"));
    assert_eq!(config.calibration.target.cols, 7);
    assert_eq!(config.calibration.refinement.half_window, 11);
}

#[test]
fn unknown_calibration_mode_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "[calibration]\nmode = \"sideways\"\n").unwrap();
    assert!(matches!(Config::load(Some(&path)), Err(ConfigError::Load(_))));
}

#[test]
fn invalid_values_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zero.toml");
    fs::write(&path, "[acquisition]\nwait_timeout_ms = 0\n").unwrap();
    assert!(matches!(Config::load(Some(&path)), Err(ConfigError::Invalid(_))));
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("nope.toml"))).is_err());
}
