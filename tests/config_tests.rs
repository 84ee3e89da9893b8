// SPDX-License-Identifier: MPL-2.0

//! Integration tests for configuration module

use edgecam::Config;
use edgecam::backends::camera::FrameSize;
use std::path::PathBuf;

fn temp_config_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("edgecam-test-{}-{}", name, std::process::id()))
        .join("config.json")
}

#[test]
fn test_config_default() {
    // Test that default config can be created
    let config = Config::default();

    // Check sensible defaults
    assert_eq!(config.camera_id, "virtual:0");
    assert!(
        config.capture.preview_enabled,
        "Preview should be enabled by default"
    );
    assert_eq!(config.timing.render_rate_hz, 60);
    assert_eq!(config.timing.fps_report_interval_ms, 1000);
}

#[test]
fn test_config_missing_file_yields_defaults() {
    let path = temp_config_path("missing");
    let config = Config::load(&path).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn test_config_save_and_load() {
    let path = temp_config_path("roundtrip");
    let mut config = Config::default();
    config.capture.fallback_size = FrameSize::new(800, 600);
    config.virtual_sensor.framerate = 15;

    config.save(&path).unwrap();
    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded, config);

    if let Some(dir) = path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[test]
fn test_config_invalid_file_is_rejected() {
    let path = temp_config_path("invalid");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, r#"{"capture": {"max_images": 0}}"#).unwrap();

    assert!(Config::load(&path).is_err());

    std::fs::write(&path, "not json").unwrap();
    assert!(Config::load(&path).is_err());

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn test_sensor_settings_follow_config() {
    let mut config = Config::default();
    config.virtual_sensor.output_sizes = vec![FrameSize::new(1280, 720)];
    config.virtual_sensor.open_latency_ms = 7;

    let settings = config.sensor_settings();
    assert_eq!(settings.cameras.len(), 1);
    assert_eq!(settings.cameras[0].id, config.camera_id);
    assert_eq!(settings.cameras[0].output_sizes, vec![FrameSize::new(1280, 720)]);
    assert_eq!(settings.open_latency.as_millis(), 7);
}
