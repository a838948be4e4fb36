//! Home Assistant MQTT discovery descriptors.

use serde::Serialize;

use crate::config::MqttSettings;

/// Retained topic announcing the clap sensor.
pub const DISCOVERY_TOPIC: &str = "homeassistant/binary_sensor/Clapper/config";
pub const PAYLOAD_ON: &str = "on";
pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";
const AVAILABILITY_TOPIC_SUFFIX: &str = "status";

/// Home Assistant MQTT Discovery config for a binary sensor.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HaBinarySensorConfig {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    pub payload_on: String,
    pub device_class: String,
    /// Seconds until Home Assistant flips the sensor back off.
    pub off_delay: u32,
    pub availability_topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
    pub device: HaDeviceInfo,
}

/// Home Assistant device info for entity grouping.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HaDeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
}

pub fn availability_topic(base_topic: &str) -> String {
    format!(
        "{}/{}",
        base_topic.trim_end_matches('/'),
        AVAILABILITY_TOPIC_SUFFIX
    )
}

impl HaBinarySensorConfig {
    /// Descriptor for the clap sensor reporting on `state_topic`.
    ///
    /// Stable for a given client id and source, so re-announcing only
    /// rewrites the same retained message.
    pub fn clapper(mqtt: &MqttSettings, state_topic: &str, delay_secs: f64) -> Self {
        Self {
            name: "Clapper".to_string(),
            unique_id: format!("{}_clapper", sanitize_for_id(&mqtt.client_id)),
            state_topic: state_topic.to_string(),
            payload_on: PAYLOAD_ON.to_string(),
            device_class: "sound".to_string(),
            off_delay: delay_secs.ceil().max(1.0) as u32,
            availability_topic: availability_topic(&mqtt.topic),
            payload_available: PAYLOAD_ONLINE.to_string(),
            payload_not_available: PAYLOAD_OFFLINE.to_string(),
            device: HaDeviceInfo {
                identifiers: vec![mqtt.client_id.clone()],
                name: "ClapTrap".to_string(),
                manufacturer: "ClapTrap".to_string(),
                model: "Acoustic event detector".to_string(),
                sw_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

fn sanitize_for_id(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}
