//! Shared fixtures for unit tests.

use anyhow::Result;
use std::sync::{Arc, Mutex};

use crate::detect::{Classifier, DetectionHandler, LabelsHandler, SharedClassifier};

/// (source id, block length) for every `process_audio` call.
pub(crate) type AudioCalls = Arc<Mutex<Vec<(String, usize)>>>;

/// Classifier that records the blocks it receives.
pub(crate) struct RecordingClassifier {
    calls: AudioCalls,
}

impl RecordingClassifier {
    pub(crate) fn shared() -> (SharedClassifier, AudioCalls) {
        let calls: AudioCalls = Arc::new(Mutex::new(Vec::new()));
        let classifier: Box<dyn Classifier> = Box::new(Self {
            calls: calls.clone(),
        });
        (Arc::new(Mutex::new(classifier)), calls)
    }
}

impl Classifier for RecordingClassifier {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn add_source(
        &mut self,
        _source_id: &str,
        _on_detection: DetectionHandler,
        _on_labels: LabelsHandler,
    ) -> Result<()> {
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn process_audio(&mut self, samples: &[f32], source_id: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((source_id.to_string(), samples.len()));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}
