//! VBAN audio source.
//!
//! The VBAN receiver (UDP demultiplexing into per-IP sources) lives outside
//! this crate. The adapter only registers a gated callback on it and polls
//! the receiver's active-source set for liveness.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use super::{forward_samples, sleep_while_running, AudioAdapter, DEFAULT_SAMPLE_RATE, POLL_INTERVAL};
use crate::detect::SharedClassifier;
use crate::orchestrator::{DetectionSession, RunFlag};

/// Receives decoded VBAN samples with a millisecond timestamp.
pub type VbanAudioCallback = Arc<dyn Fn(&[f32], u64) + Send + Sync>;

/// Extra wait before re-checking a source that dropped out of the active set.
pub const LIVENESS_BACKOFF: Duration = Duration::from_secs(1);

/// Contract required from the external VBAN receiver.
pub trait VbanReceiver: Send + Sync {
    /// IPs currently streaming to the receiver.
    fn active_sources(&self) -> HashSet<String>;

    /// Replace the shared audio callback.
    fn set_audio_callback(&self, callback: VbanAudioCallback);

    /// Detach the current callback.
    fn clear_audio_callback(&self) {
        self.set_audio_callback(Arc::new(|_: &[f32], _: u64| {}));
    }
}

/// In-process VBAN receiver handle.
///
/// A network demultiplexer pushes liveness with `mark_active`/`mark_inactive`
/// and audio with `dispatch`; the detector consumes it through
/// [`VbanReceiver`].
#[derive(Default)]
pub struct VbanFeed {
    active: Mutex<HashSet<String>>,
    callback: RwLock<Option<VbanAudioCallback>>,
}

impl VbanFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_active(&self, ip: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.insert(ip.to_string());
        }
    }

    pub fn mark_inactive(&self, ip: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(ip);
        }
    }

    /// Deliver samples to the registered callback, if any.
    pub fn dispatch(&self, samples: &[f32], timestamp_ms: u64) {
        let callback = match self.callback.read() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        if let Some(callback) = callback {
            callback(samples, timestamp_ms);
        }
    }
}

impl VbanReceiver for VbanFeed {
    fn active_sources(&self) -> HashSet<String> {
        self.active
            .lock()
            .map(|active| active.clone())
            .unwrap_or_default()
    }

    fn set_audio_callback(&self, callback: VbanAudioCallback) {
        if let Ok(mut slot) = self.callback.write() {
            *slot = Some(callback);
        }
    }

    fn clear_audio_callback(&self) {
        if let Ok(mut slot) = self.callback.write() {
            *slot = None;
        }
    }
}

/// Gated pull from the shared VBAN feed for one source IP.
pub struct VbanAdapter {
    ip: String,
    receiver: Arc<dyn VbanReceiver>,
    backoff: Duration,
}

impl VbanAdapter {
    pub fn new(ip: impl Into<String>, receiver: Arc<dyn VbanReceiver>) -> Self {
        Self {
            ip: ip.into(),
            receiver,
            backoff: LIVENESS_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn is_live(&self) -> bool {
        self.receiver.active_sources().contains(&self.ip)
    }
}

/// Detaches the adapter's callback on every exit path.
struct CallbackRegistration<'a> {
    receiver: &'a dyn VbanReceiver,
}

impl Drop for CallbackRegistration<'_> {
    fn drop(&mut self) {
        self.receiver.clear_audio_callback();
    }
}

impl AudioAdapter for VbanAdapter {
    fn resolve_sample_rate(&mut self, _run_flag: &RunFlag) -> u32 {
        DEFAULT_SAMPLE_RATE
    }

    fn run(&mut self, session: &DetectionSession, classifier: &SharedClassifier) -> Result<()> {
        let run_flag = session.run_flag();
        let ip = self.ip.clone();
        let source_id = session.source_id.clone();
        let shared = classifier.clone();
        let receiver: Weak<dyn VbanReceiver> = Arc::downgrade(&self.receiver);

        self.receiver
            .set_audio_callback(Arc::new(move |samples: &[f32], _timestamp_ms: u64| {
                if !run_flag.is_set() {
                    return;
                }
                let Some(receiver) = receiver.upgrade() else {
                    return;
                };
                if !receiver.active_sources().contains(&ip) {
                    return;
                }
                if let Err(e) = forward_samples(&shared, samples, &source_id) {
                    log::warn!("VBAN frame for {} rejected: {}", source_id, e);
                }
            }));
        let _registration = CallbackRegistration {
            receiver: self.receiver.as_ref(),
        };
        log::info!("detection started for VBAN source {}", session.source_id);

        while session.is_running() {
            std::thread::sleep(POLL_INTERVAL);
            if !self.is_live() {
                log::warn!("VBAN source {} not found among active sources", self.ip);
                sleep_while_running(session, self.backoff);
            }
        }

        log::info!("VBAN detection for {} finished", session.source_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingClassifier;
    use std::time::Instant;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn frames_are_gated_by_liveness_and_run_flag() -> Result<()> {
        let feed = Arc::new(VbanFeed::new());
        let (classifier, calls) = RecordingClassifier::shared();
        let run_flag = RunFlag::new(true);
        let session = DetectionSession::new("vban_10.0.0.5", 16_000, run_flag.clone());

        let receiver: Arc<dyn VbanReceiver> = feed.clone();
        let mut adapter =
            VbanAdapter::new("10.0.0.5", receiver).with_backoff(Duration::from_millis(50));
        let worker_classifier = classifier.clone();
        let worker = std::thread::spawn(move || adapter.run(&session, &worker_classifier));

        // Nothing registered yet, or source not live: dropped.
        assert!(wait_for(|| {
            feed.dispatch(&[0.1; 4], 0);
            feed.callback.read().map(|c| c.is_some()).unwrap_or(false)
        }));
        feed.dispatch(&[0.1; 4], 0);
        assert_eq!(calls.lock().unwrap().len(), 0);

        feed.mark_active("10.0.0.5");
        feed.dispatch(&[0.2; 4], 1);
        {
            let calls = calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].0, "vban_10.0.0.5");
            assert_eq!(calls[0].1, 4);
        }

        feed.mark_active("10.0.0.9");
        feed.mark_inactive("10.0.0.5");
        feed.dispatch(&[0.3; 4], 2);
        assert_eq!(calls.lock().unwrap().len(), 1);

        run_flag.clear();
        worker.join().expect("adapter thread")?;

        // Callback detached on exit.
        feed.mark_active("10.0.0.5");
        feed.dispatch(&[0.4; 4], 3);
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(feed.callback.read().unwrap().is_none());
        Ok(())
    }

    #[test]
    fn stop_is_observed_during_liveness_backoff() -> Result<()> {
        let feed: Arc<dyn VbanReceiver> = Arc::new(VbanFeed::new());
        let (classifier, _) = RecordingClassifier::shared();
        let run_flag = RunFlag::new(true);
        let session = DetectionSession::new("vban_10.0.0.5", 16_000, run_flag.clone());
        let mut adapter = VbanAdapter::new("10.0.0.5", feed).with_backoff(Duration::from_secs(30));

        let worker = std::thread::spawn(move || adapter.run(&session, &classifier));
        std::thread::sleep(Duration::from_millis(250));
        let stopped_at = Instant::now();
        run_flag.clear();
        worker.join().expect("adapter thread")?;
        assert!(stopped_at.elapsed() < Duration::from_secs(2));
        Ok(())
    }
}
