//! Audio ingestion adapters.
//!
//! This module turns a configured [`SourceDescriptor`] into a stream of mono
//! f32 sample blocks forwarded to the classifier:
//! - Microphone (blocking callback capture, feature: mic-cpal)
//! - RTSP streams (ffmpeg subprocess piping raw PCM)
//! - VBAN (gated pull from a shared network receiver)
//!
//! Adapters MUST:
//! - Check the session's run flag at least every 100 ms in their inner loop
//! - Release their stream, subprocess or callback on every exit path
//! - Tag every forwarded block with the session's source id

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ToolSettings;
use crate::detect::SharedClassifier;
use crate::orchestrator::{DetectionSession, RunFlag};
use crate::source::SourceDescriptor;

pub mod microphone;
pub mod rtsp;
pub mod vban;

pub use microphone::MicrophoneAdapter;
pub use rtsp::{RtspAdapter, RtspConfig};
pub use vban::{VbanAdapter, VbanAudioCallback, VbanFeed, VbanReceiver};

/// Sample rate for sources that do not report one.
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Granularity at which adapters observe the run flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Source-specific I/O strategy driven by one detection session.
pub trait AudioAdapter: Send {
    /// Resolve the sample rate for this session. Called once, before `run`.
    /// Lookups that can take a while give up when `run_flag` clears.
    fn resolve_sample_rate(&mut self, run_flag: &RunFlag) -> u32;

    /// Pump audio into the classifier until the session's run flag clears
    /// (returns `Ok`) or the source fails or ends.
    fn run(&mut self, session: &DetectionSession, classifier: &SharedClassifier) -> Result<()>;
}

/// Opens the adapter for a selected source.
pub trait AdapterFactory: Send + Sync {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn AudioAdapter>>;
}

/// Production adapters.
pub struct DefaultAdapters {
    tools: ToolSettings,
    vban: Arc<dyn VbanReceiver>,
}

impl DefaultAdapters {
    pub fn new(tools: ToolSettings, vban: Arc<dyn VbanReceiver>) -> Self {
        Self { tools, vban }
    }
}

impl AdapterFactory for DefaultAdapters {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn AudioAdapter>> {
        let adapter: Box<dyn AudioAdapter> = match descriptor {
            SourceDescriptor::Microphone { device_index } => {
                Box::new(MicrophoneAdapter::new(*device_index))
            }
            SourceDescriptor::Rtsp { url, .. } => {
                Box::new(RtspAdapter::new(RtspConfig::new(url.clone(), &self.tools)))
            }
            SourceDescriptor::Vban { ip, .. } => {
                Box::new(VbanAdapter::new(ip.clone(), self.vban.clone()))
            }
        };
        Ok(adapter)
    }
}

/// Forward one block to the classifier under `source_id`.
pub(crate) fn forward_samples(
    classifier: &SharedClassifier,
    samples: &[f32],
    source_id: &str,
) -> Result<()> {
    let mut guard = classifier
        .lock()
        .map_err(|_| anyhow!("classifier lock poisoned"))?;
    guard.process_audio(samples, source_id)
}

/// Sleep up to `total`, waking early once the session stops running.
pub(crate) fn sleep_while_running(session: &DetectionSession, total: Duration) {
    let deadline = Instant::now() + total;
    while session.is_running() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingClassifier;

    #[test]
    fn forward_tags_blocks_with_source_id() -> Result<()> {
        let (classifier, calls) = RecordingClassifier::shared();
        forward_samples(&classifier, &[0.0; 160], "mic_3")?;
        let calls = calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[("mic_3".to_string(), 160)]);
        Ok(())
    }

    #[test]
    fn sleep_returns_early_when_stopped() {
        let session = DetectionSession::new("vban_x", 16_000, RunFlag::new(false));
        let started = Instant::now();
        sleep_while_running(&session, Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn default_adapters_open_every_source_kind() -> Result<()> {
        let adapters = DefaultAdapters::new(ToolSettings::default(), Arc::new(VbanFeed::new()));
        for descriptor in [
            SourceDescriptor::Microphone { device_index: 0 },
            SourceDescriptor::Vban {
                ip: "10.0.0.5".to_string(),
                name: String::new(),
            },
        ] {
            let mut adapter = adapters.open(&descriptor)?;
            assert_eq!(adapter.resolve_sample_rate(&RunFlag::new(true)), DEFAULT_SAMPLE_RATE);
        }
        Ok(())
    }
}
