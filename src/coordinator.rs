//! Coordination of sources, processors and the messaging client.
//!
//! The coordinator wires every configured source to every configured
//! processor, announces the resulting sensor set via MQTT discovery, and
//! runs the polling loop on a dedicated thread. On connection loss it
//! reconnects and re-announces the full discovery set before publishing
//! resumes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::config::{ProcessorKind, ServiceConfig, SourceKind};
use crate::mqtt::MqttClient;
use crate::processor::{
    FrameProcessor, GreenPixelsConfig, GreenPixelsProcessor, SensorDescriptor, SensorValue,
};
use crate::slugify;
use crate::source::{FolderConfig, FolderSource, ImageSource};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// One entry of the discovery set: a namespaced sensor id plus the
/// descriptor announced for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryEntry {
    pub sensor_id: String,
    pub descriptor: SensorDescriptor,
}

/// Main coordinator for image processing and MQTT publishing.
pub struct Coordinator {
    client: Option<MqttClient>,
    sources: Vec<Box<dyn ImageSource>>,
    processors: Vec<Box<dyn FrameProcessor>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    done_rx: Option<Receiver<()>>,
}

impl Coordinator {
    /// Build sources, processors and the messaging client from configuration.
    pub fn new(config: &ServiceConfig) -> Self {
        let client = MqttClient::new(config.mqtt.clone());

        let mut sources: Vec<Box<dyn ImageSource>> = Vec::new();
        for settings in &config.sources {
            match settings.kind {
                SourceKind::Folder => {
                    sources.push(Box::new(FolderSource::new(FolderConfig {
                        name: settings.name.clone(),
                        path: settings.path.clone(),
                        update_interval: settings.update_interval,
                        enabled: settings.enabled,
                    })));
                    log::info!("initialized folder source: {}", settings.name);
                }
                SourceKind::Unknown => {
                    log::warn!("skipping source {} with unknown type", settings.name);
                }
            }
        }

        let mut processors: Vec<Box<dyn FrameProcessor>> = Vec::new();
        for settings in &config.processors {
            match settings.kind {
                ProcessorKind::GreenPixels => {
                    processors.push(Box::new(GreenPixelsProcessor::new(GreenPixelsConfig {
                        name: settings.name.clone(),
                        enabled: settings.enabled,
                        quadrants: settings.quadrants,
                        lower_green: settings.lower_green,
                        upper_green: settings.upper_green,
                    })));
                    log::info!("initialized green pixels processor: {}", settings.name);
                }
                ProcessorKind::Unknown => {
                    log::warn!("skipping processor {} with unknown type", settings.name);
                }
            }
        }

        Self {
            client: Some(client),
            sources,
            processors,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            done_rx: None,
        }
    }

    /// Connect the messaging client, start sources, register the discovery
    /// set and launch the processing loop. A broker that cannot be reached
    /// here is fatal; a single source failing to start is not.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(anyhow!("coordinator already started"));
        }
        let mut client = self
            .client
            .take()
            .ok_or_else(|| anyhow!("coordinator cannot be restarted"))?;

        log::info!(
            "starting coordinator: {} sources, {} processors",
            self.sources.len(),
            self.processors.len()
        );

        if !client.connect() {
            return Err(anyhow!("failed to connect to mqtt broker"));
        }

        let mut sources = std::mem::take(&mut self.sources);
        for source in &mut sources {
            if !source.is_enabled() {
                log::info!("source {} is disabled", source.name());
                continue;
            }
            if let Err(e) = source.start() {
                log::error!("error starting source {}: {:#}", source.name(), e);
            } else if !source.is_available() {
                log::warn!("source {} is not available", source.name());
            }
        }

        let processors = std::mem::take(&mut self.processors);
        let discovery = build_discovery_set(&sources, &processors);
        let registered = register_all(&mut client, &discovery);
        log::info!("registered {}/{} sensors", registered, discovery.len());

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let (done_tx, done_rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("canopy-coordinator".to_string())
            .spawn(move || {
                run_loop(client, sources, processors, discovery, &running);
                let _ = done_tx.send(());
            })
            .context("spawn processing loop")?;
        self.worker = Some(worker);
        self.done_rx = Some(done_rx);

        log::info!("coordinator started");
        Ok(())
    }

    /// Clear the running flag and wait (bounded) for the worker to finish
    /// its shutdown sequence: stop sources, publish offline, disconnect.
    pub fn stop(&mut self) {
        log::info!("stopping coordinator");
        self.running.store(false, Ordering::SeqCst);

        let finished = match self.done_rx.take() {
            Some(done_rx) => match done_rx.recv_timeout(STOP_TIMEOUT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "processing loop did not stop within {}s",
                        STOP_TIMEOUT.as_secs()
                    );
                    false
                }
            },
            None => false,
        };
        if let Some(worker) = self.worker.take() {
            if finished {
                let _ = worker.join();
            }
        }

        log::info!("coordinator stopped");
    }
}

fn run_loop(
    mut client: MqttClient,
    mut sources: Vec<Box<dyn ImageSource>>,
    processors: Vec<Box<dyn FrameProcessor>>,
    discovery: Vec<DiscoveryEntry>,
    running: &AtomicBool,
) {
    log::info!("processing loop started");

    while running.load(Ordering::SeqCst) {
        let tick_started = Instant::now();

        if !client.is_connected() {
            log::warn!("mqtt connection lost, reconnecting");
            if client.connect() {
                let registered = register_all(&mut client, &discovery);
                log::info!(
                    "re-registered {}/{} sensors after reconnect",
                    registered,
                    discovery.len()
                );
            } else {
                sleep_while_running(running, RECONNECT_BACKOFF);
                continue;
            }
        }

        if client.take_hub_birth() {
            log::info!("hub restarted, replaying discovery");
            register_all(&mut client, &discovery);
        }

        for source in &mut sources {
            if !source.is_enabled() || !source.is_available() {
                continue;
            }
            let Some(frame) = source.latest_frame() else {
                continue;
            };
            let metadata = source.metadata();
            log::info!("processing new frame from source: {}", source.name());

            for processor in &processors {
                if !processor.is_enabled() {
                    continue;
                }
                let readings = processor.process(&frame, &metadata);
                if readings.is_empty() {
                    continue;
                }
                let data = namespace_readings(source.as_ref(), processor.as_ref(), readings);
                if !client.publish_sensor_data(&data) {
                    log::error!(
                        "failed to publish all results for {} via {}",
                        source.name(),
                        processor.name()
                    );
                }
            }
        }

        let elapsed = tick_started.elapsed();
        if elapsed < TICK_INTERVAL {
            sleep_while_running(running, TICK_INTERVAL - elapsed);
        }
    }

    // Orderly shutdown runs on the worker so in-flight work finishes first.
    for source in &mut sources {
        source.stop();
    }
    client.publish_availability(false);
    client.disconnect();
    log::info!("processing loop stopped");
}

/// Sleep in short slices so a cleared running flag ends the wait promptly.
fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

/// Cross product of every enabled source and every enabled processor's
/// descriptors, namespaced per source.
pub fn build_discovery_set(
    sources: &[Box<dyn ImageSource>],
    processors: &[Box<dyn FrameProcessor>],
) -> Vec<DiscoveryEntry> {
    let mut entries = Vec::new();
    for source in sources {
        if !source.is_enabled() {
            continue;
        }
        for processor in processors {
            if !processor.is_enabled() {
                continue;
            }
            let prefix = sensor_prefix(source.name(), processor.name());
            for descriptor in processor.sensor_descriptors() {
                let sensor_id = format!("{}_{}", prefix, descriptor.key);
                let descriptor = SensorDescriptor {
                    name: format!("{} {}", source.name(), descriptor.name),
                    ..descriptor
                };
                entries.push(DiscoveryEntry {
                    sensor_id,
                    descriptor,
                });
            }
        }
    }
    entries
}

fn register_all(client: &mut MqttClient, discovery: &[DiscoveryEntry]) -> usize {
    let mut registered = 0;
    for entry in discovery {
        if client.register_sensor(&entry.sensor_id, &entry.descriptor) {
            registered += 1;
        }
    }
    registered
}

fn namespace_readings(
    source: &dyn ImageSource,
    processor: &dyn FrameProcessor,
    readings: BTreeMap<String, SensorValue>,
) -> BTreeMap<String, SensorValue> {
    let prefix = sensor_prefix(source.name(), processor.name());
    readings
        .into_iter()
        .map(|(key, value)| (format!("{}_{}", prefix, key), value))
        .collect()
}

fn sensor_prefix(source_name: &str, processor_name: &str) -> String {
    format!("{}_{}", slugify(source_name), slugify(processor_name))
}
