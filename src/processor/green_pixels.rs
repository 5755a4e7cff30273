//! Green-pixel coverage processor.
//!
//! Classifies pixels as "green" with an inclusive HSV range test and reports
//! matched count, total count and matched percentage for the whole frame,
//! optionally per quadrant.

use anyhow::{anyhow, Result};

use super::{FrameProcessor, SensorDescriptor, SensorReadings, SensorValue};
use crate::frame::Frame;
use crate::source::SourceMetadata;

const QUADRANTS: [&str; 4] = ["top_left", "top_right", "bottom_left", "bottom_right"];

/// Configuration for a green-pixel processor.
///
/// Thresholds are HSV triples on the OpenCV 8-bit scale (hue 0..=179,
/// saturation and value 0..=255), so threshold arrays from existing options
/// documents keep their meaning.
#[derive(Clone, Debug)]
pub struct GreenPixelsConfig {
    /// Logical processor name.
    pub name: String,
    pub enabled: bool,
    /// Additionally report each metric per image quadrant.
    pub quadrants: bool,
    pub lower_green: [u8; 3],
    pub upper_green: [u8; 3],
}

impl Default for GreenPixelsConfig {
    fn default() -> Self {
        Self {
            name: "green_pixels".to_string(),
            enabled: true,
            quadrants: false,
            lower_green: [35, 40, 40],
            upper_green: [85, 255, 255],
        }
    }
}

/// Processor counting green pixels in delivered frames.
pub struct GreenPixelsProcessor {
    config: GreenPixelsConfig,
}

impl GreenPixelsProcessor {
    pub fn new(config: GreenPixelsConfig) -> Self {
        log::info!(
            "processor {}: thresholds lower={:?} upper={:?}",
            config.name,
            config.lower_green,
            config.upper_green
        );
        Self { config }
    }

    fn analyze(&self, frame: &Frame) -> Result<SensorReadings> {
        let mut readings = SensorReadings::new();

        let matched = self.count_region(frame, 0, frame.height(), 0, frame.width())?;
        insert_region_metrics(&mut readings, None, matched, frame.pixel_count());

        if self.config.quadrants {
            let mid_h = frame.height() / 2;
            let mid_w = frame.width() / 2;
            let regions = [
                ("top_left", 0, mid_h, 0, mid_w),
                ("top_right", 0, mid_h, mid_w, frame.width()),
                ("bottom_left", mid_h, frame.height(), 0, mid_w),
                ("bottom_right", mid_h, frame.height(), mid_w, frame.width()),
            ];
            for (region, y0, y1, x0, x1) in regions {
                let matched = self.count_region(frame, y0, y1, x0, x1)?;
                let total = (y1 - y0) as u64 * (x1 - x0) as u64;
                insert_region_metrics(&mut readings, Some(region), matched, total);
            }
        }

        Ok(readings)
    }

    fn count_region(&self, frame: &Frame, y0: u32, y1: u32, x0: u32, x1: u32) -> Result<u64> {
        let pixels = frame.pixels();
        let width = frame.width() as usize;
        let mut matched = 0u64;
        for y in y0..y1 {
            let row_start = y as usize * width * 3;
            for x in x0..x1 {
                let i = row_start + x as usize * 3;
                let px = pixels
                    .get(i..i + 3)
                    .ok_or_else(|| anyhow!("pixel ({}, {}) out of frame bounds", x, y))?;
                let hsv = rgb_to_hsv(px[0], px[1], px[2]);
                if in_range(hsv, self.config.lower_green, self.config.upper_green) {
                    matched += 1;
                }
            }
        }
        Ok(matched)
    }
}

impl FrameProcessor for GreenPixelsProcessor {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn process(&self, frame: &Frame, metadata: &SourceMetadata) -> SensorReadings {
        if !self.config.enabled {
            return SensorReadings::new();
        }
        match self.analyze(frame) {
            Ok(readings) => {
                log::debug!(
                    "processor {}: {} metrics for source {}",
                    self.config.name,
                    readings.len(),
                    metadata.name
                );
                readings
            }
            Err(e) => {
                log::error!(
                    "processor {}: analysis failed for source {}: {:#}",
                    self.config.name,
                    metadata.name,
                    e
                );
                SensorReadings::new()
            }
        }
    }

    fn sensor_descriptors(&self) -> Vec<SensorDescriptor> {
        if !self.config.enabled {
            return Vec::new();
        }
        let mut descriptors = region_descriptors(None);
        if self.config.quadrants {
            for region in QUADRANTS {
                descriptors.extend(region_descriptors(Some(region)));
            }
        }
        descriptors
    }
}

fn insert_region_metrics(
    readings: &mut SensorReadings,
    region: Option<&str>,
    matched: u64,
    total: u64,
) {
    let percentage = if total == 0 {
        0.0
    } else {
        round2(matched as f64 / total as f64 * 100.0)
    };
    readings.insert(region_key(region, "green_pixels"), SensorValue::Int(matched));
    readings.insert(region_key(region, "total_pixels"), SensorValue::Int(total));
    readings.insert(
        region_key(region, "green_percentage"),
        SensorValue::Float(percentage),
    );
}

fn region_key(region: Option<&str>, metric: &str) -> String {
    match region {
        Some(region) => format!("{}_{}", region, metric),
        None => metric.to_string(),
    }
}

fn region_descriptors(region: Option<&str>) -> Vec<SensorDescriptor> {
    let label = region.map(display_label);
    let named = |metric: &str| match &label {
        Some(label) => format!("{} {}", label, metric),
        None => metric.to_string(),
    };
    vec![
        SensorDescriptor {
            key: region_key(region, "green_pixels"),
            name: named("Green Pixels"),
            unit_of_measurement: Some("pixels".to_string()),
            icon: Some("mdi:leaf".to_string()),
            device_class: None,
            state_class: Some("measurement".to_string()),
        },
        SensorDescriptor {
            key: region_key(region, "total_pixels"),
            name: named("Total Pixels"),
            unit_of_measurement: Some("pixels".to_string()),
            icon: Some("mdi:image-size-select-large".to_string()),
            device_class: None,
            state_class: Some("measurement".to_string()),
        },
        SensorDescriptor {
            key: region_key(region, "green_percentage"),
            name: named("Green Percentage"),
            unit_of_measurement: Some("%".to_string()),
            icon: Some("mdi:percent".to_string()),
            device_class: None,
            state_class: Some("measurement".to_string()),
        },
    ]
}

/// "top_left" -> "Top Left".
fn display_label(region: &str) -> String {
    region
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// RGB8 to HSV on the OpenCV 8-bit scale (hue halved into 0..=179).
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue_deg = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let hue_deg = if hue_deg < 0.0 { hue_deg + 360.0 } else { hue_deg };
    let saturation = if max == 0.0 { 0.0 } else { delta / max };

    [
        (hue_deg / 2.0).round().min(179.0) as u8,
        (saturation * 255.0).round() as u8,
        (max * 255.0).round() as u8,
    ]
}

fn in_range(hsv: [u8; 3], lower: [u8; 3], upper: [u8; 3]) -> bool {
    hsv.iter()
        .zip(lower.iter().zip(upper.iter()))
        .all(|(v, (lo, hi))| v >= lo && v <= hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    const GREEN: [u8; 3] = [0, 255, 0];
    const RED: [u8; 3] = [255, 0, 0];

    fn solid_frame(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..width as usize * height as usize {
            pixels.extend_from_slice(&rgb);
        }
        Frame::new(pixels, width, height).expect("frame")
    }

    fn processor(quadrants: bool) -> GreenPixelsProcessor {
        GreenPixelsProcessor::new(GreenPixelsConfig {
            quadrants,
            ..GreenPixelsConfig::default()
        })
    }

    #[test]
    fn hsv_conversion_matches_reference_colors() {
        assert_eq!(rgb_to_hsv(0, 255, 0), [60, 255, 255]);
        assert_eq!(rgb_to_hsv(255, 0, 0), [0, 255, 255]);
        assert_eq!(rgb_to_hsv(0, 0, 255), [120, 255, 255]);
        assert_eq!(rgb_to_hsv(0, 0, 0), [0, 0, 0]);
        assert_eq!(rgb_to_hsv(255, 255, 255), [0, 0, 255]);
    }

    #[test]
    fn counts_green_pixels_and_percentage() {
        let mut pixels = Vec::new();
        pixels.extend_from_slice(&GREEN);
        pixels.extend_from_slice(&RED);
        pixels.extend_from_slice(&RED);
        pixels.extend_from_slice(&RED);
        let frame = Frame::new(pixels, 2, 2).expect("frame");

        let readings = processor(false).process(&frame, &SourceMetadata::default());

        assert_eq!(readings.get("green_pixels"), Some(&SensorValue::Int(1)));
        assert_eq!(readings.get("total_pixels"), Some(&SensorValue::Int(4)));
        assert_eq!(
            readings.get("green_percentage"),
            Some(&SensorValue::Float(25.0))
        );
    }

    #[test]
    fn empty_frame_reports_zero_percentage() {
        let frame = Frame::new(Vec::new(), 0, 0).expect("frame");
        let readings = processor(false).process(&frame, &SourceMetadata::default());

        assert_eq!(readings.get("green_pixels"), Some(&SensorValue::Int(0)));
        assert_eq!(readings.get("total_pixels"), Some(&SensorValue::Int(0)));
        assert_eq!(
            readings.get("green_percentage"),
            Some(&SensorValue::Float(0.0))
        );
    }

    #[test]
    fn quadrant_totals_cover_odd_dimensions() {
        let frame = solid_frame(101, 101, GREEN);
        let readings = processor(true).process(&frame, &SourceMetadata::default());

        assert_eq!(
            readings.get("top_left_total_pixels"),
            Some(&SensorValue::Int(2500))
        );
        assert_eq!(
            readings.get("top_right_total_pixels"),
            Some(&SensorValue::Int(2550))
        );
        assert_eq!(
            readings.get("bottom_left_total_pixels"),
            Some(&SensorValue::Int(2550))
        );
        assert_eq!(
            readings.get("bottom_right_total_pixels"),
            Some(&SensorValue::Int(2601))
        );
        assert_eq!(
            readings.get("top_left_green_percentage"),
            Some(&SensorValue::Float(100.0))
        );
        // Quadrant totals cover the full frame for odd dimensions too.
        assert_eq!(2500 + 2550 + 2550 + 2601, 101 * 101);
    }

    #[test]
    fn descriptor_keys_match_emitted_keys() {
        for quadrants in [false, true] {
            let processor = processor(quadrants);
            let frame = solid_frame(4, 4, GREEN);

            let emitted: BTreeSet<String> = processor
                .process(&frame, &SourceMetadata::default())
                .into_keys()
                .collect();
            let declared: BTreeSet<String> = processor
                .sensor_descriptors()
                .into_iter()
                .map(|d| d.key)
                .collect();

            assert_eq!(emitted, declared);
        }
    }

    #[test]
    fn disabled_processor_emits_nothing() {
        let processor = GreenPixelsProcessor::new(GreenPixelsConfig {
            enabled: false,
            ..GreenPixelsConfig::default()
        });
        let frame = solid_frame(2, 2, GREEN);

        assert!(processor
            .process(&frame, &SourceMetadata::default())
            .is_empty());
        assert!(processor.sensor_descriptors().is_empty());
    }

    #[test]
    fn quadrant_labels_are_title_cased() {
        assert_eq!(display_label("top_left"), "Top Left");
        assert_eq!(display_label("bottom_right"), "Bottom Right");
    }
}
