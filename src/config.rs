use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
const DEFAULT_UPDATE_INTERVAL_S: u64 = 30;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_LOWER_GREEN: [u8; 3] = [35, 40, 40];
const DEFAULT_UPPER_GREEN: [u8; 3] = [85, 255, 255];

#[derive(Debug, Deserialize, Default)]
struct OptionsFile {
    mqtt: Option<MqttOptionsFile>,
    sources: Option<Vec<SourceOptionsFile>>,
    processors: Option<Vec<ProcessorOptionsFile>>,
    log_level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttOptionsFile {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    discovery_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SourceOptionsFile {
    name: String,
    #[serde(rename = "type", default)]
    kind: SourceKind,
    path: Option<String>,
    update_interval: Option<u64>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ProcessorOptionsFile {
    name: String,
    #[serde(rename = "type", default)]
    kind: ProcessorKind,
    enabled: Option<bool>,
    quadrants: Option<bool>,
    lower_green: Option<[u8; 3]>,
    upper_green: Option<[u8; 3]>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Folder,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    #[default]
    GreenPixels,
    #[serde(other)]
    Unknown,
}

/// Resolved service configuration.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub mqtt: MqttSettings,
    pub sources: Vec<SourceSettings>,
    pub processors: Vec<ProcessorSettings>,
    pub log_level: String,
}

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub discovery_prefix: String,
}

#[derive(Clone, Debug)]
pub struct SourceSettings {
    pub name: String,
    pub kind: SourceKind,
    pub path: PathBuf,
    pub update_interval: Duration,
    pub enabled: bool,
}

#[derive(Clone, Debug)]
pub struct ProcessorSettings {
    pub name: String,
    pub kind: ProcessorKind,
    pub enabled: bool,
    pub quadrants: bool,
    pub lower_green: [u8; 3],
    pub upper_green: [u8; 3],
}

impl ServiceConfig {
    /// Load the options document, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let file = read_options_file(path)?;
        let mut cfg = Self::from_file(file);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: OptionsFile) -> Self {
        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt = MqttSettings {
            host: mqtt_file.host.unwrap_or_default(),
            port: mqtt_file.port.unwrap_or(DEFAULT_MQTT_PORT),
            username: non_empty(mqtt_file.username),
            password: non_empty(mqtt_file.password),
            discovery_prefix: mqtt_file
                .discovery_prefix
                .unwrap_or_else(|| DEFAULT_DISCOVERY_PREFIX.to_string()),
        };

        let sources = file
            .sources
            .unwrap_or_default()
            .into_iter()
            .map(|source| SourceSettings {
                name: source.name,
                kind: source.kind,
                path: PathBuf::from(source.path.unwrap_or_default()),
                update_interval: Duration::from_secs(
                    source.update_interval.unwrap_or(DEFAULT_UPDATE_INTERVAL_S),
                ),
                enabled: source.enabled.unwrap_or(true),
            })
            .collect();

        let processors = file
            .processors
            .unwrap_or_default()
            .into_iter()
            .map(|processor| ProcessorSettings {
                name: processor.name,
                kind: processor.kind,
                enabled: processor.enabled.unwrap_or(true),
                quadrants: processor.quadrants.unwrap_or(false),
                lower_green: processor.lower_green.unwrap_or(DEFAULT_LOWER_GREEN),
                upper_green: processor.upper_green.unwrap_or(DEFAULT_UPPER_GREEN),
            })
            .collect();

        Self {
            mqtt,
            sources,
            processors,
            log_level: file
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("CANOPY_MQTT_HOST") {
            if !host.trim().is_empty() {
                self.mqtt.host = host;
            }
        }
        if let Ok(port) = std::env::var("CANOPY_MQTT_PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow!("CANOPY_MQTT_PORT must be a port number"))?;
            self.mqtt.port = port;
        }
        if let Ok(username) = std::env::var("CANOPY_MQTT_USERNAME") {
            self.mqtt.username = non_empty(Some(username));
        }
        if let Ok(password) = std::env::var("CANOPY_MQTT_PASSWORD") {
            self.mqtt.password = non_empty(Some(password));
        }
        if let Ok(level) = std::env::var("CANOPY_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.log_level = level;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt.host.trim().is_empty() {
            return Err(anyhow!("mqtt.host is required"));
        }
        for source in &self.sources {
            if source.kind == SourceKind::Folder && source.path.as_os_str().is_empty() {
                return Err(anyhow!("source {} requires a path", source.name));
            }
        }
        for processor in &self.processors {
            for channel in 0..3 {
                if processor.lower_green[channel] > processor.upper_green[channel] {
                    return Err(anyhow!(
                        "processor {} has lower_green above upper_green",
                        processor.name
                    ));
                }
            }
        }
        Ok(())
    }
}

fn read_options_file(path: &Path) -> Result<OptionsFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read options file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid options file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
