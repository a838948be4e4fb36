use anyhow::{anyhow, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::detect::SharedClassifier;

/// Lifecycle of the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionState {
    Idle,
    Running,
    Restarting,
    Stopped,
}

impl fmt::Display for DetectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Restarting => write!(f, "restarting"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Cooperative cancellation flag shared by the supervisor, the session thread
/// and any I/O callbacks an adapter registers.
#[derive(Clone, Debug, Default)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new(set: bool) -> Self {
        Self(Arc::new(AtomicBool::new(set)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Set the flag if it is clear. Returns false when it was already set.
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Runtime view of one detection attempt, handed to the active adapter.
#[derive(Clone, Debug)]
pub struct DetectionSession {
    pub source_id: String,
    /// Resolved once when the session starts.
    pub sample_rate: u32,
    run_flag: RunFlag,
}

impl DetectionSession {
    pub fn new(source_id: impl Into<String>, sample_rate: u32, run_flag: RunFlag) -> Self {
        Self {
            source_id: source_id.into(),
            sample_rate,
            run_flag,
        }
    }

    pub fn is_running(&self) -> bool {
        self.run_flag.is_set()
    }

    /// Clone of the flag for callbacks that outlive a borrow of the session.
    pub fn run_flag(&self) -> RunFlag {
        self.run_flag.clone()
    }

    /// Samples in one 100 ms block at the session's sample rate.
    pub fn block_size(&self) -> usize {
        ((self.sample_rate / 10) as usize).max(1)
    }
}

/// State shared between the orchestrator front end and its supervisor thread.
///
/// Writes to the run flag only happen in `start`/`stop`.
pub(crate) struct SessionControl {
    pub(crate) run_flag: RunFlag,
    state: Mutex<DetectionState>,
    active_source: Mutex<Option<String>>,
    classifier: Mutex<Option<SharedClassifier>>,
    launches: AtomicU64,
}

impl SessionControl {
    pub(crate) fn new() -> Self {
        Self {
            run_flag: RunFlag::new(false),
            state: Mutex::new(DetectionState::Idle),
            active_source: Mutex::new(None),
            classifier: Mutex::new(None),
            launches: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> DetectionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(DetectionState::Stopped)
    }

    pub(crate) fn set_state(&self, next: DetectionState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                log::debug!("detection state {} -> {}", *state, next);
                *state = next;
            }
        }
    }

    pub(crate) fn active_source(&self) -> Option<String> {
        self.active_source.lock().ok().and_then(|s| s.clone())
    }

    pub(crate) fn set_active_source(&self, source_id: Option<String>) {
        if let Ok(mut active) = self.active_source.lock() {
            *active = source_id;
        }
    }

    pub(crate) fn record_launch(&self) -> u64 {
        self.launches.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn launches(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    pub(crate) fn hold_classifier(&self, classifier: SharedClassifier) -> Result<()> {
        let mut slot = self
            .classifier
            .lock()
            .map_err(|_| anyhow!("classifier slot lock poisoned"))?;
        *slot = Some(classifier);
        Ok(())
    }

    /// Take and stop the held classifier. The slot is emptied before the
    /// handle is closed, so concurrent callers close it at most once.
    pub(crate) fn release_classifier(&self) -> Result<bool> {
        let taken = self
            .classifier
            .lock()
            .map_err(|_| anyhow!("classifier slot lock poisoned"))?
            .take();
        let Some(classifier) = taken else {
            return Ok(false);
        };
        let mut guard = classifier
            .lock()
            .map_err(|_| anyhow!("classifier lock poisoned"))?;
        guard.stop()?;
        log::debug!("classifier '{}' released", guard.name());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_until_cleared() {
        let flag = RunFlag::new(false);
        assert!(flag.claim());
        assert!(!flag.claim());
        flag.clear();
        assert!(flag.claim());
    }

    #[test]
    fn block_size_is_100ms_of_audio() {
        let session = DetectionSession::new("mic_0", 16_000, RunFlag::new(true));
        assert_eq!(session.block_size(), 1600);
        let session = DetectionSession::new("rtsp_x", 44_100, RunFlag::new(true));
        assert_eq!(session.block_size(), 4410);
    }

    #[test]
    fn releasing_an_empty_slot_is_a_no_op() -> Result<()> {
        let control = SessionControl::new();
        assert!(!control.release_classifier()?);
        Ok(())
    }
}
