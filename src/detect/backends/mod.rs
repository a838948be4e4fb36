mod energy;

pub use energy::{EnergyBackend, EnergyBackendFactory};
