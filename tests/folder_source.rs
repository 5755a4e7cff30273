use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use canopy_sense::processor::{
    FrameProcessor, GreenPixelsConfig, GreenPixelsProcessor, SensorValue,
};
use canopy_sense::source::{FolderConfig, FolderSource, ImageSource};

fn write_image(path: &Path, rgb: [u8; 3]) {
    image::RgbImage::from_pixel(8, 8, image::Rgb(rgb))
        .save(path)
        .expect("write image");
}

fn folder_source(dir: &TempDir, interval: Duration) -> FolderSource {
    FolderSource::new(FolderConfig {
        name: "Camera Left".to_string(),
        path: dir.path().to_path_buf(),
        update_interval: interval,
        enabled: true,
    })
}

#[test]
fn initial_scan_selects_newest_recognized_file() {
    let dir = TempDir::new().expect("tempdir");
    write_image(&dir.path().join("a.jpg"), [10, 20, 30]);
    std::fs::write(dir.path().join("notes.txt"), b"ignored").expect("write txt");
    // Coarse-mtime filesystems need a visible gap between the two writes.
    std::thread::sleep(Duration::from_millis(1100));
    write_image(&dir.path().join("b.png"), [40, 50, 60]);

    let mut source = folder_source(&dir, Duration::ZERO);
    source.start().expect("start source");

    let frame = source.latest_frame().expect("frame delivered");
    assert_eq!((frame.width(), frame.height()), (8, 8));

    let metadata = source.metadata();
    assert_eq!(metadata.name, "Camera Left");
    assert_eq!(metadata.kind, "folder");
    assert_eq!(
        metadata.file_path.as_deref(),
        Some(dir.path().join("b.png").as_path())
    );
    assert!(metadata.file_size.unwrap_or(0) > 0);
    assert!(metadata.modified_at.is_some());
    assert!(metadata.last_delivered_at.is_some());

    source.stop();
}

#[test]
fn repeated_fetch_without_new_file_returns_no_frame() {
    let dir = TempDir::new().expect("tempdir");
    write_image(&dir.path().join("a.png"), [0, 255, 0]);

    let mut source = folder_source(&dir, Duration::ZERO);
    source.start().expect("start source");

    assert!(source.latest_frame().is_some());
    assert!(source.latest_frame().is_none());

    source.stop();
}

#[test]
fn fetch_within_interval_defers_even_a_newer_file() {
    let dir = TempDir::new().expect("tempdir");
    write_image(&dir.path().join("a.png"), [0, 255, 0]);

    let mut source = folder_source(&dir, Duration::from_secs(3600));
    source.start().expect("start source");

    assert!(source.latest_frame().is_some());

    write_image(&dir.path().join("b.png"), [255, 0, 0]);
    assert!(source.latest_frame().is_none());

    source.stop();
}

#[test]
fn decode_failure_reports_no_frame() {
    let dir = TempDir::new().expect("tempdir");
    std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").expect("write");

    let mut source = folder_source(&dir, Duration::ZERO);
    source.start().expect("start source");

    assert!(source.latest_frame().is_none());

    source.stop();
}

#[test]
fn start_creates_missing_directory() {
    let dir = TempDir::new().expect("tempdir");
    let nested = dir.path().join("camera_left");

    let mut source = FolderSource::new(FolderConfig {
        name: "Camera Left".to_string(),
        path: nested.clone(),
        update_interval: Duration::ZERO,
        enabled: true,
    });
    assert!(!source.is_available());

    source.start().expect("start source");
    assert!(source.is_available());
    assert!(nested.is_dir());

    source.stop();
}

#[test]
fn watch_event_delivers_file_created_after_start() {
    let dir = TempDir::new().expect("tempdir");

    let mut source = folder_source(&dir, Duration::ZERO);
    source.start().expect("start source");
    assert!(source.latest_frame().is_none());

    write_image(&dir.path().join("late.png"), [0, 255, 0]);

    let mut delivered = None;
    for _ in 0..50 {
        if let Some(frame) = source.latest_frame() {
            delivered = Some(frame);
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(delivered.is_some(), "watcher never delivered the new file");

    source.stop();
}

#[test]
fn delivered_frame_feeds_the_green_pixel_metric() {
    let dir = TempDir::new().expect("tempdir");
    write_image(&dir.path().join("canopy.png"), [0, 255, 0]);

    let mut source = folder_source(&dir, Duration::ZERO);
    source.start().expect("start source");

    let frame = source.latest_frame().expect("frame delivered");
    let processor = GreenPixelsProcessor::new(GreenPixelsConfig::default());
    let readings = processor.process(&frame, &source.metadata());

    assert_eq!(readings.get("green_pixels"), Some(&SensorValue::Int(64)));
    assert_eq!(readings.get("total_pixels"), Some(&SensorValue::Int(64)));
    assert_eq!(
        readings.get("green_percentage"),
        Some(&SensorValue::Float(100.0))
    );

    source.stop();
}
