//! Frame processors.
//!
//! A processor is a pure transformation from a frame plus source metadata to
//! a flat map of named numeric results. Each processor also declares one
//! sensor descriptor per metric it can emit, so every publishable key is
//! always registrable with the hub and no registered sensor is orphaned.

mod green_pixels;

pub use green_pixels::{GreenPixelsConfig, GreenPixelsProcessor};

use std::collections::BTreeMap;

use crate::frame::Frame;
use crate::source::SourceMetadata;

/// A single published sensor value.
#[derive(Clone, Debug, PartialEq)]
pub enum SensorValue {
    Int(u64),
    Float(f64),
    Text(String),
}

impl SensorValue {
    /// Wire encoding: numeric values as plain text, everything else as JSON.
    pub fn to_payload(&self) -> String {
        match self {
            SensorValue::Int(v) => v.to_string(),
            SensorValue::Float(v) => v.to_string(),
            SensorValue::Text(v) => serde_json::Value::String(v.clone()).to_string(),
        }
    }
}

/// Metric key -> value map produced by one processor run.
pub type SensorReadings = BTreeMap<String, SensorValue>;

/// Discovery-facing description of one metric a processor can emit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensorDescriptor {
    /// Metric key; matches the key the processor emits in its readings.
    pub key: String,
    /// Human-readable sensor name.
    pub name: String,
    pub unit_of_measurement: Option<String>,
    pub icon: Option<String>,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
}

/// Contract implemented by every frame processor variant.
pub trait FrameProcessor: Send {
    /// Logical processor name from configuration.
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    /// Run the processor over a frame. Disabled processors and processing
    /// failures yield empty readings; this never aborts the calling loop.
    fn process(&self, frame: &Frame, metadata: &SourceMetadata) -> SensorReadings;

    /// One descriptor per metric `process` can emit under the current
    /// configuration. The key sets match exactly.
    fn sensor_descriptors(&self) -> Vec<SensorDescriptor>;
}
