use anyhow::Result;
use std::sync::{Arc, Mutex};

use super::result::{DetectionHandler, LabelsHandler};

/// Parameters a classifier is built with, resolved once per session.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifierParams {
    pub sample_rate: u32,
    pub score_threshold: f64,
    pub overlap_factor: f64,
    /// Minimum seconds between two detections on the same source.
    pub delay: f64,
    pub chunk_duration: f64,
    pub buffer_duration: f64,
}

/// Classifier backend trait.
///
/// The acoustic model behind this trait is a black box. The orchestrator only
/// relies on the call order `initialize`, `add_source`, `start`,
/// `process_audio`*, `stop`, and on `on_detection` being safe to invoke from
/// the adapter's I/O thread.
pub trait Classifier: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn initialize(&mut self) -> Result<()>;

    /// Register a named source and its callbacks.
    fn add_source(
        &mut self,
        source_id: &str,
        on_detection: DetectionHandler,
        on_labels: LabelsHandler,
    ) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Feed mono f32 samples for a registered source.
    fn process_audio(&mut self, samples: &[f32], source_id: &str) -> Result<()>;

    fn stop(&mut self) -> Result<()>;
}

/// Classifier handle shared between the session thread and I/O callbacks.
pub type SharedClassifier = Arc<Mutex<Box<dyn Classifier>>>;

/// Builds a fresh classifier for every detection session.
pub trait ClassifierFactory: Send + Sync {
    fn create(&self, params: &ClassifierParams) -> Result<Box<dyn Classifier>>;
}

impl<F> ClassifierFactory for F
where
    F: Fn(&ClassifierParams) -> Result<Box<dyn Classifier>> + Send + Sync,
{
    fn create(&self, params: &ClassifierParams) -> Result<Box<dyn Classifier>> {
        self(params)
    }
}
