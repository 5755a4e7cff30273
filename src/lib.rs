//! canopy-sense
//!
//! This crate watches image folders, computes a green-pixel coverage metric
//! per delivered frame, and republishes the results as Home Assistant MQTT
//! sensors, including the retained discovery messages that let the hub
//! auto-register them.
//!
//! # Module Structure
//!
//! - `source`: image sources (folder watching, frame delivery gating)
//! - `processor`: frame processors (green-pixel HSV classification)
//! - `mqtt`: broker session, discovery registration, state publishing
//! - `coordinator`: the polling loop wiring sources x processors to MQTT
//! - `config`: the options document consumed at startup

pub mod config;
pub mod coordinator;
pub mod frame;
pub mod mqtt;
pub mod processor;
pub mod source;

pub use config::ServiceConfig;
pub use coordinator::Coordinator;
pub use frame::Frame;
pub use mqtt::{ConnectionState, DeviceInfo, MqttClient};
pub use processor::{
    FrameProcessor, GreenPixelsConfig, GreenPixelsProcessor, SensorDescriptor, SensorReadings,
    SensorValue,
};
pub use source::{FolderConfig, FolderSource, ImageSource, SourceMetadata};

/// Lowercase a display name into a form usable in sensor ids and topics.
///
/// Every non-alphanumeric character becomes an underscore, matching what the
/// hub accepts in discovery object ids.
pub fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_lowercases_and_replaces_special_chars() {
        assert_eq!(slugify("Camera Left"), "camera_left");
        assert_eq!(slugify("green-pixels"), "green_pixels");
        assert_eq!(slugify("greenhouse_2"), "greenhouse_2");
    }
}
