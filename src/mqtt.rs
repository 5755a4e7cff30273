//! MQTT session, Home Assistant discovery and state publishing.
//!
//! The client owns the broker session lifecycle and the registration table:
//! a sensor's state may only be published once its discovery record exists
//! here. The network-event loop runs on its own thread and is the single
//! writer of the connection state; the coordinator reads it to supervise
//! liveness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, LastWill, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, MqttOptions};
use serde::Serialize;

use crate::config::MqttSettings;
use crate::processor::{SensorDescriptor, SensorValue};

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Retained availability path for the whole process.
pub const AVAILABILITY_TOPIC: &str = "canopy/availability";

const CLIENT_ID: &str = "canopy-sense";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 64;

/// Broker connection state, driven by the network-event thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Home Assistant MQTT discovery payload for a sensor.
#[derive(Clone, Debug, Serialize)]
pub struct DiscoveryConfig {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub availability_topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
    pub device: DeviceInfo,
}

/// Home Assistant device info for entity grouping.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            identifiers: vec!["canopy_sense".to_string()],
            name: "Canopy Sense".to_string(),
            manufacturer: "canopy-sense".to_string(),
            model: "Image Analyzer".to_string(),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Registration record: the source of truth for what has been announced to
/// the hub and where its state gets published.
#[derive(Clone, Debug)]
struct RegisteredSensor {
    config: DiscoveryConfig,
}

/// Connection state shared with the network-event thread.
struct ClientShared {
    state: Mutex<ConnectionState>,
    state_changed: Condvar,
    hub_birth: AtomicBool,
}

impl ClientShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            state_changed: Condvar::new(),
            hub_birth: AtomicBool::new(false),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
        self.state_changed.notify_all();
    }

    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Disconnected)
    }
}

/// Live broker session: the request handle plus its event-loop thread.
struct MqttRuntime {
    client: Client,
    event_thread: Option<JoinHandle<()>>,
}

/// MQTT client for Home Assistant integration with discovery.
pub struct MqttClient {
    settings: MqttSettings,
    device: DeviceInfo,
    shared: Arc<ClientShared>,
    runtime: Option<MqttRuntime>,
    registered: HashMap<String, RegisteredSensor>,
}

impl MqttClient {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            device: DeviceInfo::default(),
            shared: Arc::new(ClientShared::new()),
            runtime: None,
            registered: HashMap::new(),
        }
    }

    /// Open the broker session and block up to the connect timeout for the
    /// connected signal. Never panics out of the call; failures are logged
    /// and reported as `false`.
    pub fn connect(&mut self) -> bool {
        match self.try_connect() {
            Ok(()) => true,
            Err(e) => {
                log::error!(
                    "failed to connect to mqtt broker {}:{}: {:#}",
                    self.settings.host,
                    self.settings.port,
                    e
                );
                self.teardown_runtime();
                false
            }
        }
    }

    fn try_connect(&mut self) -> Result<()> {
        self.teardown_runtime();
        self.shared.set_state(ConnectionState::Connecting);
        self.shared.hub_birth.store(false, Ordering::SeqCst);

        let mut options = MqttOptions::new(CLIENT_ID, &self.settings.host, self.settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        if let Some(username) = &self.settings.username {
            options.set_credentials(
                username.as_str(),
                self.settings.password.as_deref().unwrap_or_default(),
            );
        }
        let will = LastWill::new(
            AVAILABILITY_TOPIC,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        );
        options.set_last_will(will);

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let event_thread =
            spawn_event_loop(connection, Arc::clone(&self.shared), self.status_topic());
        self.runtime = Some(MqttRuntime {
            client,
            event_thread: Some(event_thread),
        });

        self.wait_connected()?;

        // Fresh session: everything must be announced again.
        self.registered.clear();

        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| anyhow!("mqtt session missing after connect"))?;
        runtime
            .client
            .subscribe(self.status_topic(), QoS::AtLeastOnce)
            .context("subscribe to hub status topic")?;
        runtime
            .client
            .publish(
                AVAILABILITY_TOPIC,
                QoS::AtLeastOnce,
                true,
                PAYLOAD_ONLINE.as_bytes().to_vec(),
            )
            .context("publish online availability")?;

        log::info!(
            "connected to mqtt broker {}:{}",
            self.settings.host,
            self.settings.port
        );
        Ok(())
    }

    fn wait_connected(&self) -> Result<()> {
        let guard = self
            .shared
            .state
            .lock()
            .map_err(|_| anyhow!("connection state lock poisoned"))?;
        let (guard, timeout) = self
            .shared
            .state_changed
            .wait_timeout_while(guard, CONNECT_TIMEOUT, |state| {
                *state == ConnectionState::Connecting
            })
            .map_err(|_| anyhow!("connection state lock poisoned"))?;
        match *guard {
            ConnectionState::Connected => Ok(()),
            _ if timeout.timed_out() => Err(anyhow!(
                "no broker response within {}s",
                CONNECT_TIMEOUT.as_secs()
            )),
            _ => Err(anyhow!("broker rejected the connection")),
        }
    }

    /// Stop the event loop and close the session. Safe when already
    /// disconnected.
    pub fn disconnect(&mut self) {
        if self.runtime.is_some() {
            self.teardown_runtime();
            log::info!("disconnected from mqtt broker");
        }
    }

    fn teardown_runtime(&mut self) {
        if let Some(mut runtime) = self.runtime.take() {
            if let Err(e) = runtime.client.disconnect() {
                log::debug!("mqtt disconnect request failed: {}", e);
            }
            if let Some(handle) = runtime.event_thread.take() {
                let _ = handle.join();
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Consume a pending hub birth announcement, if one arrived.
    pub fn take_hub_birth(&self) -> bool {
        self.shared.hub_birth.swap(false, Ordering::SeqCst)
    }

    /// Publish the retained discovery config for a sensor and record it in
    /// the registration table. Fails without registering when not connected.
    pub fn register_sensor(&mut self, sensor_id: &str, descriptor: &SensorDescriptor) -> bool {
        if !self.is_connected() {
            log::error!("cannot register sensor {}: not connected", sensor_id);
            return false;
        }
        let config = self.discovery_config(sensor_id, descriptor);
        let payload = match serde_json::to_vec(&config) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("cannot serialize discovery for {}: {}", sensor_id, e);
                return false;
            }
        };
        let topic = self.discovery_topic(sensor_id);
        match self.publish(&topic, QoS::AtLeastOnce, true, payload) {
            Ok(()) => {
                self.registered
                    .insert(sensor_id.to_string(), RegisteredSensor { config });
                log::info!("registered sensor {}", sensor_id);
                true
            }
            Err(e) => {
                log::error!("failed to register sensor {}: {:#}", sensor_id, e);
                false
            }
        }
    }

    /// Publish a single state value to the topic recorded at registration.
    /// Fails when not connected or when the sensor was never registered.
    pub fn publish_sensor_state(&self, sensor_id: &str, value: &SensorValue) -> bool {
        if !self.is_connected() {
            log::error!("cannot publish {}: not connected", sensor_id);
            return false;
        }
        let Some(sensor) = self.registered.get(sensor_id) else {
            log::error!("cannot publish {}: sensor not registered", sensor_id);
            return false;
        };
        let payload = value.to_payload();
        match self.publish(
            &sensor.config.state_topic,
            QoS::AtMostOnce,
            false,
            payload.clone().into_bytes(),
        ) {
            Ok(()) => {
                log::debug!("published {} = {}", sensor_id, payload);
                true
            }
            Err(e) => {
                log::error!("failed to publish state for {}: {:#}", sensor_id, e);
                false
            }
        }
    }

    /// Publish every entry. All entries are attempted; the aggregate result
    /// is success only if every individual publish succeeded.
    pub fn publish_sensor_data<'a, I>(&self, data: I) -> bool
    where
        I: IntoIterator<Item = (&'a String, &'a SensorValue)>,
    {
        let mut all_ok = true;
        for (sensor_id, value) in data {
            if !self.publish_sensor_state(sensor_id, value) {
                all_ok = false;
            }
        }
        all_ok
    }

    /// Clear the retained discovery config and drop the registration record.
    /// A sensor that was never registered is a no-op.
    pub fn unregister_sensor(&mut self, sensor_id: &str) -> bool {
        if !self.registered.contains_key(sensor_id) {
            log::debug!("unregister {}: never registered", sensor_id);
            return true;
        }
        if !self.is_connected() {
            log::error!("cannot unregister {}: not connected", sensor_id);
            return false;
        }
        let topic = self.discovery_topic(sensor_id);
        match self.publish(&topic, QoS::AtLeastOnce, true, Vec::new()) {
            Ok(()) => {
                self.registered.remove(sensor_id);
                log::info!("unregistered sensor {}", sensor_id);
                true
            }
            Err(e) => {
                log::error!("failed to unregister sensor {}: {:#}", sensor_id, e);
                false
            }
        }
    }

    /// Publish the retained process-wide availability state.
    pub fn publish_availability(&self, online: bool) -> bool {
        if !self.is_connected() {
            log::warn!("cannot publish availability: not connected");
            return false;
        }
        let payload = if online { PAYLOAD_ONLINE } else { PAYLOAD_OFFLINE };
        match self.publish(
            AVAILABILITY_TOPIC,
            QoS::AtLeastOnce,
            true,
            payload.as_bytes().to_vec(),
        ) {
            Ok(()) => {
                log::info!("published availability: {}", payload);
                true
            }
            Err(e) => {
                log::error!("failed to publish availability: {:#}", e);
                false
            }
        }
    }

    pub fn is_registered(&self, sensor_id: &str) -> bool {
        self.registered.contains_key(sensor_id)
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| anyhow!("mqtt session not started"))?;
        runtime
            .client
            .publish(topic, qos, retain, payload)
            .context("queue mqtt publish")?;
        Ok(())
    }

    fn discovery_config(&self, sensor_id: &str, descriptor: &SensorDescriptor) -> DiscoveryConfig {
        DiscoveryConfig {
            name: descriptor.name.clone(),
            unique_id: sensor_id.to_string(),
            state_topic: self.state_topic(sensor_id),
            unit_of_measurement: descriptor.unit_of_measurement.clone(),
            device_class: descriptor.device_class.clone(),
            state_class: descriptor.state_class.clone(),
            icon: descriptor.icon.clone(),
            availability_topic: AVAILABILITY_TOPIC.to_string(),
            payload_available: PAYLOAD_ONLINE.to_string(),
            payload_not_available: PAYLOAD_OFFLINE.to_string(),
            device: self.device.clone(),
        }
    }

    fn discovery_topic(&self, sensor_id: &str) -> String {
        format!(
            "{}/sensor/{}/config",
            self.settings.discovery_prefix, sensor_id
        )
    }

    fn state_topic(&self, sensor_id: &str) -> String {
        format!(
            "{}/sensor/{}/state",
            self.settings.discovery_prefix, sensor_id
        )
    }

    fn status_topic(&self) -> String {
        format!("{}/status", self.settings.discovery_prefix)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.teardown_runtime();
    }
}

fn spawn_event_loop(
    mut connection: Connection,
    shared: Arc<ClientShared>,
    status_topic: String,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        shared.set_state(ConnectionState::Connected);
                    } else {
                        log::error!("mqtt broker rejected session: {:?}", ack.code);
                        shared.set_state(ConnectionState::Disconnected);
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic.as_ref() == status_topic.as_bytes()
                        && publish.payload.as_ref() == PAYLOAD_ONLINE.as_bytes()
                    {
                        log::info!("hub birth announcement received");
                        shared.hub_birth.store(true, Ordering::SeqCst);
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect(_))) => {
                    log::warn!("broker closed the session");
                    shared.set_state(ConnectionState::Disconnected);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("mqtt connection error: {}", e);
                    shared.set_state(ConnectionState::Disconnected);
                    break;
                }
            }
        }
        shared.set_state(ConnectionState::Disconnected);
    })
}
