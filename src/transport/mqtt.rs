//! rumqttc-backed bus connector.

use anyhow::{anyhow, Result};
use rumqttc::v5::mqttbytes::v5::{LastWill, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::discovery::{availability_topic, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use super::publisher::{BusConnector, BusLink, LinkBusy};
use super::tls::{MqttEndpoint, TlsMaterials};
use crate::config::MqttSettings;

const CONNACK_TIMEOUT: Duration = Duration::from_secs(5);
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;

pub struct RumqttConnector {
    settings: MqttSettings,
}

impl RumqttConnector {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn options(&self, endpoint: &MqttEndpoint, status_topic: &str) -> Result<MqttOptions> {
        let tls = TlsMaterials::load(self.settings.tls_ca_path.as_deref())?;

        let mut options = MqttOptions::new(&self.settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        if let Some(user) = self.settings.username.as_deref() {
            options.set_credentials(user, self.settings.password.as_deref().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            status_topic,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));
        options.set_transport(tls.build_transport(endpoint)?);
        Ok(options)
    }
}

impl BusConnector for RumqttConnector {
    fn connect(&self) -> Result<Arc<dyn BusLink>> {
        let endpoint = MqttEndpoint::from_settings(&self.settings)?;
        let status_topic = availability_topic(&self.settings.topic);
        let options = self.options(&endpoint, &status_topic)?;

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let link = MqttLink::spawn(client, connection, status_topic, &endpoint)?;
        log::info!(
            "connected to MQTT broker {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            self.settings.username.is_some()
        );
        if let Err(e) = link.publish(&link.status_topic, PAYLOAD_ONLINE.as_bytes(), true) {
            log::warn!("failed to mark {} online: {}", link.status_topic, e);
        }
        Ok(Arc::new(link))
    }
}

/// Live client plus the thread driving its event loop.
pub struct MqttLink {
    client: Client,
    status_topic: String,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttLink {
    fn spawn(
        client: Client,
        mut connection: Connection,
        status_topic: String,
        endpoint: &MqttEndpoint,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        let loop_shutdown = shutdown.clone();
        let handle = std::thread::spawn(move || {
            let mut ready = Some(ready_tx);
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Ok(()));
                        } else {
                            log::info!("MQTT connection re-established");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Err(e.to_string()));
                            break;
                        }
                        if loop_shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        log::warn!("MQTT connection error: {}", e);
                        std::thread::sleep(RECONNECT_PAUSE);
                    }
                }
                if loop_shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
        });

        let link = Self {
            client,
            status_topic,
            shutdown,
            handle: Mutex::new(Some(handle)),
        };
        match ready_rx.recv_timeout(CONNACK_TIMEOUT) {
            Ok(Ok(())) => Ok(link),
            Ok(Err(e)) => {
                link.stop_loop();
                Err(anyhow!(
                    "MQTT connect to {}:{} failed: {}",
                    endpoint.host,
                    endpoint.port,
                    e
                ))
            }
            Err(_) => {
                link.stop_loop();
                Err(anyhow!(
                    "no CONNACK from {}:{} within {:?}",
                    endpoint.host,
                    endpoint.port,
                    CONNACK_TIMEOUT
                ))
            }
        }
    }

    fn loop_alive(&self) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        self.handle
            .lock()
            .map(|h| h.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    fn stop_loop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.client.try_disconnect();
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl BusLink for MqttLink {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        let qos = if retain {
            QoS::AtLeastOnce
        } else {
            QoS::AtMostOnce
        };
        match self.client.try_publish(topic, qos, retain, payload.to_vec()) {
            Ok(()) => Ok(()),
            // The request queue is full but the event loop is still draining it.
            Err(_) if self.loop_alive() => Err(LinkBusy.into()),
            Err(e) => Err(anyhow!("MQTT publish to {} failed: {}", topic, e)),
        }
    }

    fn disconnect(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        // A clean disconnect suppresses the Last Will, so mark offline first.
        let _ = self.publish(&self.status_topic, PAYLOAD_OFFLINE.as_bytes(), true);
        self.stop_loop();
        Ok(())
    }
}
