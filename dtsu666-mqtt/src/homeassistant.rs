//! Home Assistant MQTT discovery payloads for the meter's sensors.

use serde::Serialize;

use crate::config::MqttConfig;
use crate::modbus::RegisterSpec;

pub const MANUFACTURER: &str = "Chint";
pub const MODEL: &str = "DTSU666";

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

#[derive(Clone, Debug, Serialize)]
pub struct Discovery {
    pub name: String,
    pub object_id: String,
    pub unique_id: String,
    pub state_topic: String,
    pub availability_topic: String,
    pub payload_available: &'static str,
    pub payload_not_available: &'static str,
    pub device_class: &'static str,
    pub state_class: &'static str,
    pub unit_of_measurement: &'static str,
    pub device: Device,
}

#[derive(Clone, Debug, Serialize)]
pub struct Device {
    pub name: String,
    pub identifiers: Vec<String>,
    pub manufacturer: &'static str,
    pub model: &'static str,
}

impl Device {
    pub fn new(config: &MqttConfig) -> Self {
        Self {
            name: config.device_name.clone(),
            identifiers: vec![config.device_id.clone()],
            manufacturer: MANUFACTURER,
            model: MODEL,
        }
    }
}

/// `<deviceId>_<name>`, stable across restarts so repeated announcements update the same entity.
pub fn unique_id(device_id: &str, name: &str) -> String {
    format!("{}_{}", device_id, name)
}

pub fn config_topic(discovery_prefix: &str, device_id: &str, name: &str) -> String {
    format!(
        "{}/sensor/{}/config",
        discovery_prefix,
        unique_id(device_id, name)
    )
}

pub fn state_topic(topic_prefix: &str, name: &str) -> String {
    format!("{}/{}", topic_prefix, name)
}

pub fn availability_topic(topic_prefix: &str) -> String {
    format!("{}/status", topic_prefix)
}

impl Discovery {
    pub fn new(config: &MqttConfig, spec: &RegisterSpec) -> Self {
        let unique_id = unique_id(&config.device_id, &spec.name);
        Self {
            name: spec.name.replace('_', " "),
            object_id: unique_id.clone(),
            unique_id,
            state_topic: state_topic(&config.topic_prefix, &spec.name),
            availability_topic: availability_topic(&config.topic_prefix),
            payload_available: PAYLOAD_ONLINE,
            payload_not_available: PAYLOAD_OFFLINE,
            device_class: spec.quantity.device_class(),
            state_class: spec.quantity.state_class(),
            unit_of_measurement: spec.unit(),
            device: Device::new(config),
        }
    }
}
