use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A recognized target sound on one source.
///
/// Consumed immediately by the publisher and never persisted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub source_id: String,
    /// Classifier score in 0..=1.
    pub score: f32,
    pub label: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

/// One class score from a classifier window.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LabelScore {
    pub label: String,
    pub score: f32,
}

/// Called on the adapter's I/O thread for every detection.
pub type DetectionHandler = Arc<dyn Fn(&DetectionEvent) + Send + Sync>;

/// Called with the full label list of every evaluated window.
pub type LabelsHandler = Arc<dyn Fn(&str, &[LabelScore]) + Send + Sync>;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
