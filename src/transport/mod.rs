//! Message-bus transport: broker endpoint and TLS selection, Home Assistant
//! discovery descriptors, and the retrying event publisher.

mod discovery;
mod mqtt;
mod publisher;
mod tls;

pub use discovery::{
    availability_topic, HaBinarySensorConfig, HaDeviceInfo, DISCOVERY_TOPIC, PAYLOAD_OFFLINE,
    PAYLOAD_ON, PAYLOAD_ONLINE,
};
pub use mqtt::{MqttLink, RumqttConnector};
pub use publisher::{
    BusConnector, BusLink, EventPublisher, LinkBusy, PublishQueue, MAX_PUBLISH_RETRIES,
    QUEUE_CAPACITY,
};
pub use tls::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};
