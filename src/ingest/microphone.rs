//! Local microphone source.
//!
//! Opens a blocking input stream with 100 ms blocks and forwards every block
//! to the classifier from the capture callback. The stream is dropped (and
//! therefore closed) when `run` returns, on both normal and error paths.

use anyhow::Result;

use super::{AudioAdapter, DEFAULT_SAMPLE_RATE};
use crate::detect::SharedClassifier;
use crate::orchestrator::{DetectionSession, RunFlag};

/// Microphone capture by input device index.
pub struct MicrophoneAdapter {
    device_index: usize,
}

impl MicrophoneAdapter {
    pub fn new(device_index: usize) -> Self {
        Self { device_index }
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }
}

impl AudioAdapter for MicrophoneAdapter {
    fn resolve_sample_rate(&mut self, _run_flag: &RunFlag) -> u32 {
        log::info!("using default sample rate {} Hz for microphone", DEFAULT_SAMPLE_RATE);
        DEFAULT_SAMPLE_RATE
    }

    fn run(&mut self, session: &DetectionSession, classifier: &SharedClassifier) -> Result<()> {
        #[cfg(feature = "mic-cpal")]
        {
            capture::run(self.device_index, session, classifier)
        }
        #[cfg(not(feature = "mic-cpal"))]
        {
            let _ = (session, classifier);
            anyhow::bail!(
                "microphone #{} requires the mic-cpal feature",
                self.device_index
            )
        }
    }
}

#[cfg(feature = "mic-cpal")]
mod capture {
    use anyhow::{anyhow, Result};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use crate::detect::SharedClassifier;
    use crate::ingest::{forward_samples, POLL_INTERVAL};
    use crate::orchestrator::{DetectionSession, RunFlag};

    pub(super) fn run(
        device_index: usize,
        session: &DetectionSession,
        classifier: &SharedClassifier,
    ) -> Result<()> {
        let host = cpal::default_host();
        let device = host
            .input_devices()
            .map_err(|e| anyhow!("failed to enumerate input devices: {}", e))?
            .nth(device_index)
            .ok_or_else(|| anyhow!("input device index {} not found", device_index))?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(session.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(session.block_size() as u32),
        };

        let failed = Arc::new(AtomicBool::new(false));
        let stream_failed = failed.clone();
        let run_flag = session.run_flag();
        let source_id = session.source_id.clone();
        let shared = classifier.clone();

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !run_flag.is_set() {
                        return;
                    }
                    if let Err(e) = forward_samples(&shared, data, &source_id) {
                        log::warn!("microphone block for {} rejected: {}", source_id, e);
                    }
                },
                move |err| {
                    log::error!("microphone stream error: {}", err);
                    stream_failed.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| anyhow!("failed to open input stream on {}: {}", device_name, e))?;
        stream
            .play()
            .map_err(|e| anyhow!("failed to start input stream on {}: {}", device_name, e))?;
        log::info!(
            "microphone stream started on {} ({} Hz, {} samples per block)",
            device_name,
            session.sample_rate,
            session.block_size()
        );

        while session.is_running() {
            if failed.load(Ordering::SeqCst) {
                return Err(anyhow!("microphone stream on {} failed", device_name));
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        drop(stream);
        log::info!("microphone stream on {} closed", device_name);
        Ok(())
    }
}
