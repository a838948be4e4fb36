//! Lazily connected event publisher with bounded retry.
//!
//! One `EventPublisher` is built at the composition root and shared by
//! every detection session. The first publish creates the bus connection
//! under a lock; later publishes reuse it without taking the lock for the
//! write itself.
//!
//! Detection sessions never publish on their own thread. They hand events
//! to a `PublishQueue`, whose worker thread owns the blocking retry loop,
//! so a dead broker cannot stall audio I/O or `stop()`.

use anyhow::Result;
use std::fmt;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::discovery::{HaBinarySensorConfig, DISCOVERY_TOPIC, PAYLOAD_ON};
use super::mqtt::RumqttConnector;
use crate::config::MqttSettings;
use crate::detect::DetectionEvent;

/// Retries after the first failed attempt before an event is dropped.
pub const MAX_PUBLISH_RETRIES: u32 = 3;

/// Messages a session may have in flight before new ones are dropped.
pub const QUEUE_CAPACITY: usize = 32;

/// Pause before retrying on a link whose outgoing queue is full.
const BUSY_BACKOFF: Duration = Duration::from_millis(100);

/// Returned by a `BusLink` whose connection is healthy but cannot take
/// another message right now. The publisher keeps the link.
#[derive(Debug)]
pub struct LinkBusy;

impl fmt::Display for LinkBusy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("outgoing queue full")
    }
}

impl std::error::Error for LinkBusy {}

/// An established bus connection.
pub trait BusLink: Send + Sync {
    /// Fire-and-forget publish.
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;
    /// Stop the network loop and close the socket.
    fn disconnect(&self) -> Result<()>;
}

/// Opens bus connections.
pub trait BusConnector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn BusLink>>;
}

pub struct EventPublisher {
    connector: Box<dyn BusConnector>,
    link: Mutex<Option<Arc<dyn BusLink>>>,
    mqtt: MqttSettings,
}

impl EventPublisher {
    pub fn new(connector: Box<dyn BusConnector>, mqtt: MqttSettings) -> Self {
        Self {
            connector,
            link: Mutex::new(None),
            mqtt,
        }
    }

    /// Publisher backed by the rumqttc client.
    pub fn mqtt(mqtt: &MqttSettings) -> Self {
        Self::new(Box::new(RumqttConnector::new(mqtt.clone())), mqtt.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().map(|l| l.is_some()).unwrap_or(false)
    }

    /// Publish `payload` on `topic`. Returns false when the message was
    /// dropped after `MAX_PUBLISH_RETRIES` retries. Never panics or
    /// propagates errors to the caller.
    pub fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> bool {
        let mut attempt = 0;
        loop {
            match self.try_publish_once(topic, payload, retain) {
                Ok(()) => return true,
                Err(e) if attempt < MAX_PUBLISH_RETRIES => {
                    attempt += 1;
                    if e.downcast_ref::<LinkBusy>().is_some() {
                        std::thread::sleep(BUSY_BACKOFF);
                    }
                    log::warn!(
                        "publish to {} failed ({}), retry {}/{}",
                        topic,
                        e,
                        attempt,
                        MAX_PUBLISH_RETRIES
                    );
                }
                Err(e) => {
                    log::error!(
                        "dropping message for {} after {} attempts: {}",
                        topic,
                        attempt + 1,
                        e
                    );
                    return false;
                }
            }
        }
    }

    /// Publish the `on` payload for a detection on its source topic.
    pub fn publish_detection(&self, event: &DetectionEvent) -> bool {
        log::info!(
            "{} detected on {} (score {:.2})",
            event.label,
            event.source_id,
            event.score
        );
        self.publish(&event.source_id, PAYLOAD_ON.as_bytes(), false)
    }

    /// Announce the clap sensor for `state_topic` (retained).
    pub fn announce_discovery(&self, state_topic: &str, delay_secs: f64) -> bool {
        let config = HaBinarySensorConfig::clapper(&self.mqtt, state_topic, delay_secs);
        let payload = match serde_json::to_vec(&config) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("failed to serialize discovery config: {}", e);
                return false;
            }
        };
        self.publish(DISCOVERY_TOPIC, &payload, true)
    }

    /// Close the connection if one exists. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let link = match self.link.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(link) = link {
            if let Err(e) = link.disconnect() {
                log::warn!("bus disconnect failed: {}", e);
            } else {
                log::info!("disconnected from message bus");
            }
        }
    }

    fn try_publish_once(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        let link = self.connection()?;
        if let Err(e) = link.publish(topic, payload, retain) {
            if e.downcast_ref::<LinkBusy>().is_none() {
                self.discard(&link);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Current link, connecting first if there is none. The lock covers
    /// creation only.
    fn connection(&self) -> Result<Arc<dyn BusLink>> {
        let mut guard = self
            .link
            .lock()
            .map_err(|_| anyhow::anyhow!("publisher lock poisoned"))?;
        if let Some(link) = guard.as_ref() {
            return Ok(link.clone());
        }
        let link = self.connector.connect()?;
        *guard = Some(link.clone());
        Ok(link)
    }

    fn discard(&self, failed: &Arc<dyn BusLink>) {
        let Ok(mut guard) = self.link.lock() else {
            return;
        };
        if guard.as_ref().is_some_and(|l| Arc::ptr_eq(l, failed)) {
            guard.take();
            drop(guard);
            let _ = failed.disconnect();
        }
    }
}

impl Drop for EventPublisher {
    fn drop(&mut self) {
        self.disconnect();
    }
}

enum Outbound {
    Discovery { state_topic: String, delay_secs: f64 },
    Detection(DetectionEvent),
}

/// Bounded hand-off from a detection session to a publisher worker.
///
/// Enqueueing never blocks. When the worker is behind (for example while
/// retrying an unreachable broker) and the queue is full, new messages are
/// dropped with a warning. The worker exits once every handle is dropped.
#[derive(Clone)]
pub struct PublishQueue {
    tx: SyncSender<Outbound>,
}

impl PublishQueue {
    pub fn spawn(publisher: Arc<EventPublisher>, capacity: usize) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity);
        std::thread::Builder::new()
            .name("claptrap-publisher".to_string())
            .spawn(move || drain(&publisher, rx))?;
        Ok(Self { tx })
    }

    /// Queue the `on` message for a detection.
    pub fn detection(&self, event: &DetectionEvent) -> bool {
        self.send(Outbound::Detection(event.clone()))
    }

    /// Queue a discovery announcement for `state_topic`.
    pub fn discovery(&self, state_topic: &str, delay_secs: f64) -> bool {
        self.send(Outbound::Discovery {
            state_topic: state_topic.to_string(),
            delay_secs,
        })
    }

    fn send(&self, message: Outbound) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(Outbound::Detection(event))) => {
                log::warn!("publish queue full, dropping detection on {}", event.source_id);
                false
            }
            Err(TrySendError::Full(Outbound::Discovery { state_topic, .. })) => {
                log::warn!("publish queue full, dropping discovery for {}", state_topic);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                log::error!("publisher worker is gone");
                false
            }
        }
    }
}

fn drain(publisher: &EventPublisher, rx: Receiver<Outbound>) {
    for message in rx {
        match message {
            Outbound::Detection(event) => {
                publisher.publish_detection(&event);
            }
            Outbound::Discovery {
                state_topic,
                delay_secs,
            } => {
                publisher.announce_discovery(&state_topic, delay_secs);
            }
        }
    }
    log::debug!("publisher worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Writes = Arc<Mutex<Vec<(String, Vec<u8>, bool)>>>;

    #[derive(Default)]
    struct MockLink {
        writes: Writes,
        disconnects: Arc<AtomicUsize>,
    }

    impl BusLink for MockLink {
        fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
            self.writes
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec(), retain));
            Ok(())
        }

        fn disconnect(&self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockConnector {
        fail_first: usize,
        connect_delay: Option<Duration>,
        attempts: Arc<AtomicUsize>,
        writes: Writes,
        disconnects: Arc<AtomicUsize>,
    }

    impl BusConnector for MockConnector {
        fn connect(&self) -> Result<Arc<dyn BusLink>> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.connect_delay {
                std::thread::sleep(delay);
            }
            if n < self.fail_first {
                anyhow::bail!("broker unreachable");
            }
            Ok(Arc::new(MockLink {
                writes: self.writes.clone(),
                disconnects: self.disconnects.clone(),
            }))
        }
    }

    fn publisher(connector: MockConnector) -> EventPublisher {
        EventPublisher::new(Box::new(connector), MqttSettings::default())
    }

    #[test]
    fn four_connect_failures_drop_the_event() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let writes = Writes::default();
        let publisher = publisher(MockConnector {
            fail_first: usize::MAX,
            attempts: attempts.clone(),
            writes: writes.clone(),
            ..MockConnector::default()
        });

        assert!(!publisher.publish("mic_0", b"on", false));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(writes.lock().unwrap().is_empty());
        assert!(!publisher.is_connected());
    }

    #[test]
    fn third_retry_still_delivers() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let writes = Writes::default();
        let publisher = publisher(MockConnector {
            fail_first: 3,
            attempts: attempts.clone(),
            writes: writes.clone(),
            ..MockConnector::default()
        });

        assert!(publisher.publish("mic_0", b"on", false));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(writes.lock().unwrap().len(), 1);
    }

    #[test]
    fn connection_is_reused() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let writes = Writes::default();
        let publisher = publisher(MockConnector {
            attempts: attempts.clone(),
            writes: writes.clone(),
            ..MockConnector::default()
        });

        let event = DetectionEvent {
            source_id: "vban_10.0.0.5".to_string(),
            score: 0.9,
            label: "Clapping".to_string(),
            timestamp_ms: 0,
        };
        assert!(publisher.publish_detection(&event));
        assert!(publisher.publish_detection(&event));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], ("vban_10.0.0.5".to_string(), b"on".to_vec(), false));
    }

    #[test]
    fn concurrent_first_callers_share_one_connection() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let writes = Writes::default();
        let publisher = Arc::new(publisher(MockConnector {
            connect_delay: Some(Duration::from_millis(50)),
            attempts: attempts.clone(),
            writes: writes.clone(),
            ..MockConnector::default()
        }));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let publisher = publisher.clone();
                std::thread::spawn(move || publisher.publish(&format!("mic_{i}"), b"on", false))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(writes.lock().unwrap().len(), 8);
    }

    #[test]
    fn discovery_twice_writes_identical_retained_state() -> Result<()> {
        let writes = Writes::default();
        let publisher = publisher(MockConnector {
            writes: writes.clone(),
            ..MockConnector::default()
        });

        assert!(publisher.announce_discovery("rtsp_rtsp://cam/audio", 2.0));
        assert!(publisher.announce_discovery("rtsp_rtsp://cam/audio", 2.0));

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], writes[1]);
        assert_eq!(writes[0].0, DISCOVERY_TOPIC);
        assert!(writes[0].2, "discovery must be retained");

        let descriptor: serde_json::Value = serde_json::from_slice(&writes[0].1)?;
        assert_eq!(descriptor["state_topic"], "rtsp_rtsp://cam/audio");
        assert_eq!(descriptor["name"], "Clapper");
        Ok(())
    }

    struct BusyLink {
        busy_left: AtomicUsize,
        writes: Writes,
        disconnects: Arc<AtomicUsize>,
    }

    impl BusLink for BusyLink {
        fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
            let left = self.busy_left.load(Ordering::SeqCst);
            if left > 0 {
                self.busy_left.store(left - 1, Ordering::SeqCst);
                return Err(LinkBusy.into());
            }
            self.writes
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec(), retain));
            Ok(())
        }

        fn disconnect(&self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BusyConnector {
        busy_first: usize,
        attempts: Arc<AtomicUsize>,
        writes: Writes,
        disconnects: Arc<AtomicUsize>,
    }

    impl BusConnector for BusyConnector {
        fn connect(&self) -> Result<Arc<dyn BusLink>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(BusyLink {
                busy_left: AtomicUsize::new(self.busy_first),
                writes: self.writes.clone(),
                disconnects: self.disconnects.clone(),
            }))
        }
    }

    #[test]
    fn full_outgoing_queue_keeps_the_link() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let writes = Writes::default();
        let publisher = EventPublisher::new(
            Box::new(BusyConnector {
                busy_first: 2,
                attempts: attempts.clone(),
                writes: writes.clone(),
                disconnects: disconnects.clone(),
            }),
            MqttSettings::default(),
        );

        assert!(publisher.publish("mic_0", b"on", false));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
        assert!(publisher.is_connected());
        assert_eq!(writes.lock().unwrap().len(), 1);
    }

    #[test]
    fn queue_hands_messages_to_the_worker() -> Result<()> {
        let writes = Writes::default();
        let publisher = Arc::new(publisher(MockConnector {
            writes: writes.clone(),
            ..MockConnector::default()
        }));
        let queue = PublishQueue::spawn(publisher, QUEUE_CAPACITY)?;

        assert!(queue.discovery("mic_0", 2.0));
        assert!(queue.detection(&DetectionEvent {
            source_id: "mic_0".to_string(),
            score: 0.8,
            label: "Clapping".to_string(),
            timestamp_ms: 0,
        }));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while writes.lock().unwrap().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].0, DISCOVERY_TOPIC);
        assert_eq!(writes[1], ("mic_0".to_string(), b"on".to_vec(), false));
        Ok(())
    }

    #[test]
    fn full_queue_drops_without_blocking() -> Result<()> {
        let publisher = Arc::new(publisher(MockConnector {
            fail_first: usize::MAX,
            connect_delay: Some(Duration::from_millis(200)),
            ..MockConnector::default()
        }));
        let queue = PublishQueue::spawn(publisher, 1)?;
        let event = DetectionEvent {
            source_id: "mic_0".to_string(),
            score: 0.8,
            label: "Clapping".to_string(),
            timestamp_ms: 0,
        };

        let started = std::time::Instant::now();
        let accepted = (0..10).filter(|_| queue.detection(&event)).count();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(accepted < 10, "a saturated queue must drop messages");
        Ok(())
    }

    #[test]
    fn disconnect_is_idempotent() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let publisher = publisher(MockConnector {
            disconnects: disconnects.clone(),
            ..MockConnector::default()
        });

        publisher.disconnect();
        assert!(publisher.publish("mic_0", b"on", false));
        publisher.disconnect();
        publisher.disconnect();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(!publisher.is_connected());
    }
}
