//! ClapTrap
//!
//! An always-on acoustic event detector. Audio is read from exactly one
//! source at a time, scored by a classifier, and every recognized clap is
//! published to an MQTT broker as an `on` message on the source's topic.
//!
//! # Architecture
//!
//! Data flows in one direction:
//!
//! 1. **Settings**: a JSON snapshot, optionally overridden from the environment.
//! 2. **Source selection**: microphone, else the first enabled RTSP stream,
//!    else the first enabled VBAN source.
//! 3. **Adapter**: source-specific I/O that pumps mono f32 blocks.
//! 4. **Classifier**: a black box that reports detections through callbacks.
//! 5. **Publisher**: a lazily connected, retrying MQTT client.
//!
//! The orchestrator supervises the session thread and relaunches it,
//! without backoff, whenever it dies while detection is still requested.
//!
//! # Module Structure
//!
//! - `config`: Settings file and environment overrides
//! - `source`: Source descriptors and selection priority
//! - `detect`: Classifier trait and the built-in energy backend
//! - `ingest`: Microphone, RTSP and VBAN adapters
//! - `orchestrator`: Start/stop, supervision and teardown
//! - `transport`: MQTT endpoint, discovery and the event publisher

pub mod config;
pub mod detect;
pub mod ingest;
pub mod orchestrator;
pub mod source;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{MqttSettings, Settings};
pub use detect::{Classifier, ClassifierFactory, DetectionEvent, EnergyBackendFactory};
pub use ingest::{AdapterFactory, AudioAdapter, DefaultAdapters, VbanFeed, VbanReceiver};
pub use orchestrator::{DetectionOrchestrator, DetectionRequest, DetectionState};
pub use source::{select_source, SourceDescriptor};
pub use transport::{BusConnector, BusLink, EventPublisher};
