mod backend;
mod backends;
mod result;

pub use backend::{Classifier, ClassifierFactory, ClassifierParams, SharedClassifier};
pub use backends::{EnergyBackend, EnergyBackendFactory};
pub use result::{DetectionEvent, DetectionHandler, LabelScore, LabelsHandler};
