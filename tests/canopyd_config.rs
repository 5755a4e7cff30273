use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use canopy_sense::config::{ProcessorKind, ServiceConfig, SourceKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CANOPY_MQTT_HOST",
        "CANOPY_MQTT_PORT",
        "CANOPY_MQTT_USERNAME",
        "CANOPY_MQTT_PASSWORD",
        "CANOPY_LOG_LEVEL",
    ] {
        std::env::remove_var(key);
    }
}

fn write_options(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp options");
    file.write_all(json.as_bytes()).expect("write options");
    file
}

#[test]
fn loads_options_with_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_options(
        r#"{
            "mqtt": { "host": "core-mosquitto" },
            "sources": [
                { "name": "Camera Left", "type": "folder", "path": "/share/canopy/camera_left" }
            ],
            "processors": [
                { "name": "Green Pixels", "type": "green_pixels" }
            ]
        }"#,
    );

    let cfg = ServiceConfig::load(file.path()).expect("load options");

    assert_eq!(cfg.mqtt.host, "core-mosquitto");
    assert_eq!(cfg.mqtt.port, 1883);
    assert_eq!(cfg.mqtt.username, None);
    assert_eq!(cfg.mqtt.discovery_prefix, "homeassistant");
    assert_eq!(cfg.log_level, "info");

    assert_eq!(cfg.sources.len(), 1);
    assert_eq!(cfg.sources[0].kind, SourceKind::Folder);
    assert_eq!(cfg.sources[0].update_interval, Duration::from_secs(30));
    assert!(cfg.sources[0].enabled);

    assert_eq!(cfg.processors.len(), 1);
    assert_eq!(cfg.processors[0].kind, ProcessorKind::GreenPixels);
    assert!(!cfg.processors[0].quadrants);
    assert_eq!(cfg.processors[0].lower_green, [35, 40, 40]);
    assert_eq!(cfg.processors[0].upper_green, [85, 255, 255]);

    clear_env();
}

#[test]
fn loads_explicit_settings_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_options(
        r#"{
            "mqtt": {
                "host": "broker.local",
                "port": 8883,
                "username": "canopy",
                "password": "secret",
                "discovery_prefix": "ha"
            },
            "sources": [
                {
                    "name": "Greenhouse",
                    "type": "folder",
                    "path": "/share/canopy/greenhouse",
                    "update_interval": 120,
                    "enabled": false
                }
            ],
            "processors": [
                {
                    "name": "Green Pixels",
                    "type": "green_pixels",
                    "quadrants": true,
                    "lower_green": [40, 40, 40],
                    "upper_green": [80, 255, 255]
                }
            ],
            "log_level": "debug"
        }"#,
    );

    std::env::set_var("CANOPY_MQTT_HOST", "override.local");
    std::env::set_var("CANOPY_MQTT_PORT", "1884");

    let cfg = ServiceConfig::load(file.path()).expect("load options");

    assert_eq!(cfg.mqtt.host, "override.local");
    assert_eq!(cfg.mqtt.port, 1884);
    assert_eq!(cfg.mqtt.username.as_deref(), Some("canopy"));
    assert_eq!(cfg.mqtt.password.as_deref(), Some("secret"));
    assert_eq!(cfg.mqtt.discovery_prefix, "ha");
    assert_eq!(cfg.log_level, "debug");

    assert_eq!(cfg.sources[0].update_interval, Duration::from_secs(120));
    assert!(!cfg.sources[0].enabled);
    assert!(cfg.processors[0].quadrants);
    assert_eq!(cfg.processors[0].lower_green, [40, 40, 40]);
    assert_eq!(cfg.processors[0].upper_green, [80, 255, 255]);

    clear_env();
}

#[test]
fn empty_credentials_are_treated_as_absent() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_options(
        r#"{
            "mqtt": { "host": "core-mosquitto", "username": "", "password": "" }
        }"#,
    );

    let cfg = ServiceConfig::load(file.path()).expect("load options");
    assert_eq!(cfg.mqtt.username, None);
    assert_eq!(cfg.mqtt.password, None);

    clear_env();
}

#[test]
fn missing_mqtt_host_is_fatal() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_options(r#"{ "mqtt": { "port": 1883 } }"#);

    let err = ServiceConfig::load(file.path()).unwrap_err();
    assert!(format!("{err}").contains("mqtt.host"));

    clear_env();
}

#[test]
fn folder_source_without_path_is_fatal() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_options(
        r#"{
            "mqtt": { "host": "core-mosquitto" },
            "sources": [ { "name": "Camera Left", "type": "folder" } ]
        }"#,
    );

    let err = ServiceConfig::load(file.path()).unwrap_err();
    assert!(format!("{err}").contains("Camera Left"));

    clear_env();
}

#[test]
fn inverted_thresholds_are_fatal() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_options(
        r#"{
            "mqtt": { "host": "core-mosquitto" },
            "processors": [
                {
                    "name": "Green Pixels",
                    "lower_green": [90, 40, 40],
                    "upper_green": [80, 255, 255]
                }
            ]
        }"#,
    );

    let err = ServiceConfig::load(file.path()).unwrap_err();
    assert!(format!("{err}").contains("lower_green"));

    clear_env();
}

#[test]
fn unknown_kinds_are_parsed_not_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_options(
        r#"{
            "mqtt": { "host": "core-mosquitto" },
            "sources": [ { "name": "Stream", "type": "rtsp", "path": "x" } ],
            "processors": [ { "name": "Motion", "type": "motion" } ]
        }"#,
    );

    let cfg = ServiceConfig::load(file.path()).expect("load options");
    assert_eq!(cfg.sources[0].kind, SourceKind::Unknown);
    assert_eq!(cfg.processors[0].kind, ProcessorKind::Unknown);

    clear_env();
}

#[test]
fn missing_options_file_is_fatal() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = ServiceConfig::load(std::path::Path::new("/nonexistent/options.json")).unwrap_err();
    assert!(format!("{err}").contains("options file"));

    clear_env();
}
