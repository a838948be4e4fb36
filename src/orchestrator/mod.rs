//! Detection orchestrator.
//!
//! Owns the single detection pipeline of the process:
//! - Validates a start request and selects the audio source
//! - Runs each detection session on its own thread
//! - Supervises that thread and relaunches it while the run flag is set
//! - Releases the classifier exactly once on stop
//!
//! Only one session is ever active. `start` is rejected while the run flag is
//! set or while a previous supervisor is still tearing down.

use anyhow::{anyhow, bail, Result};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

mod session;

pub use session::{DetectionSession, DetectionState, RunFlag};
use session::SessionControl;

use crate::config::{GlobalSettings, Settings};
use crate::detect::{
    ClassifierFactory, ClassifierParams, DetectionEvent, DetectionHandler, LabelScore,
    LabelsHandler, SharedClassifier,
};
use crate::ingest::{AdapterFactory, POLL_INTERVAL};
use crate::source::{select_source, SourceDescriptor};
use crate::transport::{EventPublisher, PublishQueue, QUEUE_CAPACITY};

const WAIT_POLL: Duration = Duration::from_millis(20);

/// Numeric parameters validated by `start`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionRequest {
    /// Window overlap, exclusive (0, 1).
    pub overlap_factor: f64,
    /// Detection score threshold, inclusive [0, 1].
    pub score_threshold: f64,
}

impl DetectionRequest {
    pub fn from_settings(global: &GlobalSettings) -> Self {
        Self {
            overlap_factor: global.overlap_factor,
            score_threshold: global.threshold,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.overlap_factor > 0.0 && self.overlap_factor < 1.0) {
            bail!(
                "overlap factor {} must be strictly between 0 and 1",
                self.overlap_factor
            );
        }
        if !(0.0..=1.0).contains(&self.score_threshold) {
            bail!(
                "score threshold {} must be within [0, 1]",
                self.score_threshold
            );
        }
        Ok(())
    }
}

pub struct DetectionOrchestrator {
    settings: RwLock<Settings>,
    publisher: Arc<EventPublisher>,
    classifiers: Arc<dyn ClassifierFactory>,
    adapters: Arc<dyn AdapterFactory>,
    control: Arc<SessionControl>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    announce_discovery: bool,
}

impl DetectionOrchestrator {
    pub fn new(
        settings: Settings,
        publisher: Arc<EventPublisher>,
        classifiers: Arc<dyn ClassifierFactory>,
        adapters: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            settings: RwLock::new(settings),
            publisher,
            classifiers,
            adapters,
            control: Arc::new(SessionControl::new()),
            supervisor: Mutex::new(None),
            announce_discovery: true,
        }
    }

    /// Skip the Home Assistant discovery announcement at session start.
    pub fn without_discovery(mut self) -> Self {
        self.announce_discovery = false;
        self
    }

    /// Start detection. Returns false (and logs why) when the request is
    /// rejected; never panics.
    pub fn start(&self, request: DetectionRequest) -> bool {
        match self.try_start(request) {
            Ok(()) => true,
            Err(e) => {
                log::error!("detection start rejected: {:#}", e);
                false
            }
        }
    }

    pub fn try_start(&self, request: DetectionRequest) -> Result<()> {
        request.validate()?;

        let mut supervisor = self
            .supervisor
            .lock()
            .map_err(|_| anyhow!("supervisor lock poisoned"))?;
        if let Some(handle) = supervisor.take() {
            if !handle.is_finished() {
                *supervisor = Some(handle);
                bail!("detection is already running or still shutting down");
            }
            let _ = handle.join();
        }

        let (descriptor, params) = {
            let settings = self
                .settings
                .read()
                .map_err(|_| anyhow!("settings lock poisoned"))?;
            let descriptor = select_source(&settings)
                .ok_or_else(|| anyhow!("no audio source configured"))?;
            let global = &settings.global;
            global.validate()?;
            let params = ClassifierParams {
                sample_rate: 0,
                score_threshold: request.score_threshold,
                overlap_factor: request.overlap_factor,
                delay: global.delay,
                chunk_duration: global.chunk_duration,
                buffer_duration: global.buffer_duration,
            };
            (descriptor, params)
        };

        if !self.control.run_flag.claim() {
            bail!("detection is already running");
        }
        self.control.set_active_source(Some(descriptor.source_id()));
        self.control.set_state(DetectionState::Running);

        let plan = SessionPlan {
            descriptor,
            params,
            announce_discovery: self.announce_discovery,
            publisher: self.publisher.clone(),
            classifiers: self.classifiers.clone(),
            adapters: self.adapters.clone(),
            control: self.control.clone(),
        };
        log::info!("starting detection on {}", plan.descriptor);

        let spawned = std::thread::Builder::new()
            .name("claptrap-supervisor".to_string())
            .spawn(move || plan.supervise());
        match spawned {
            Ok(handle) => {
                *supervisor = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.control.run_flag.clear();
                self.control.set_active_source(None);
                self.control.set_state(DetectionState::Idle);
                Err(anyhow!("failed to spawn supervisor thread: {}", e))
            }
        }
    }

    /// Stop detection. Stopping an idle orchestrator succeeds.
    pub fn stop(&self) -> bool {
        match self.try_stop() {
            Ok(()) => true,
            Err(e) => {
                log::error!("detection stop failed: {:#}", e);
                false
            }
        }
    }

    pub fn try_stop(&self) -> Result<()> {
        let was_running = self.control.run_flag.is_set();
        self.control.run_flag.clear();
        if was_running {
            log::info!("stopping detection");
        }

        let released = self.control.release_classifier();
        if !self.supervisor_alive() {
            self.control.set_state(DetectionState::Stopped);
        }
        released.map(|_| ())
    }

    /// Block until the supervisor has exited or `timeout` elapses. Returns
    /// true when no supervisor remains.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.supervisor_alive() {
                if let Ok(mut supervisor) = self.supervisor.lock() {
                    if let Some(handle) = supervisor.take() {
                        let _ = handle.join();
                    }
                }
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    pub fn state(&self) -> DetectionState {
        self.control.state()
    }

    /// Sessions launched since construction, relaunches included.
    pub fn launches(&self) -> u64 {
        self.control.launches()
    }

    pub fn active_source(&self) -> Option<String> {
        self.control.active_source()
    }

    pub fn is_running(&self) -> bool {
        self.control.run_flag.is_set()
    }

    /// Replace the settings snapshot. Takes effect at the next start.
    pub fn update_settings(&self, settings: Settings) {
        match self.settings.write() {
            Ok(mut current) => *current = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }

    pub fn settings(&self) -> Option<Settings> {
        self.settings.read().ok().map(|s| s.clone())
    }

    fn supervisor_alive(&self) -> bool {
        self.supervisor
            .lock()
            .map(|s| s.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for DetectionOrchestrator {
    fn drop(&mut self) {
        self.control.run_flag.clear();
    }
}

/// Everything a relaunch needs. Cloned into every session thread so all
/// launches of one start use the same source and parameters.
#[derive(Clone)]
struct SessionPlan {
    descriptor: SourceDescriptor,
    params: ClassifierParams,
    announce_discovery: bool,
    publisher: Arc<EventPublisher>,
    classifiers: Arc<dyn ClassifierFactory>,
    adapters: Arc<dyn AdapterFactory>,
    control: Arc<SessionControl>,
}

impl SessionPlan {
    fn supervise(self) {
        while self.control.run_flag.is_set() {
            let launch = self.control.record_launch();
            if launch > 1 {
                log::warn!(
                    "detection loop on {} exited unexpectedly, relaunching (launch #{})",
                    self.descriptor,
                    launch
                );
            }
            self.control.set_state(DetectionState::Running);

            let plan = self.clone();
            let spawned = std::thread::Builder::new()
                .name("claptrap-session".to_string())
                .spawn(move || plan.run_session());
            match spawned {
                Ok(handle) => {
                    loop {
                        std::thread::sleep(POLL_INTERVAL);
                        if handle.is_finished() {
                            break;
                        }
                    }
                    match handle.join() {
                        Ok(Ok(())) => log::debug!("session on {} ended", self.descriptor),
                        Ok(Err(e)) => log::warn!("session on {} failed: {:#}", self.descriptor, e),
                        Err(_) => log::error!("session thread on {} panicked", self.descriptor),
                    }
                }
                Err(e) => {
                    log::error!("failed to spawn session thread: {}", e);
                    std::thread::sleep(POLL_INTERVAL);
                }
            }

            if self.control.run_flag.is_set() {
                self.control.set_state(DetectionState::Restarting);
            }
        }

        if let Err(e) = self.control.release_classifier() {
            log::warn!("classifier teardown failed: {:#}", e);
        }
        self.control.set_active_source(None);
        self.control.set_state(DetectionState::Stopped);
        log::info!("detection on {} stopped", self.descriptor);
    }

    fn run_session(self) -> Result<()> {
        let mut adapter = self.adapters.open(&self.descriptor)?;
        let sample_rate = adapter.resolve_sample_rate(&self.control.run_flag);
        let session = DetectionSession::new(
            self.descriptor.source_id(),
            sample_rate,
            self.control.run_flag.clone(),
        );
        let params = ClassifierParams {
            sample_rate,
            ..self.params.clone()
        };

        let mut classifier = self.classifiers.create(&params)?;
        classifier.initialize()?;
        let queue = PublishQueue::spawn(self.publisher.clone(), QUEUE_CAPACITY)?;
        let detections = queue.clone();
        let on_detection: DetectionHandler = Arc::new(move |event: &DetectionEvent| {
            detections.detection(event);
        });
        let on_labels: LabelsHandler = Arc::new(log_labels);
        classifier.add_source(&session.source_id, on_detection, on_labels)?;
        classifier.start()?;
        log::info!(
            "detection session started on {} with '{}' ({} Hz, threshold {})",
            session.source_id,
            classifier.name(),
            sample_rate,
            params.score_threshold
        );

        let shared: SharedClassifier = Arc::new(Mutex::new(classifier));
        self.control.hold_classifier(shared.clone())?;

        if self.announce_discovery {
            queue.discovery(&session.source_id, params.delay);
        }
        drop(queue);

        let result = adapter.run(&session, &shared);
        if let Err(e) = self.control.release_classifier() {
            log::warn!("classifier teardown failed: {:#}", e);
        }
        result
    }
}

fn log_labels(source_id: &str, labels: &[LabelScore]) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let top: Vec<String> = labels
        .iter()
        .take(3)
        .map(|l| format!("{}={:.2}", l.label, l.score))
        .collect();
    log::debug!("{}: {}", source_id, top.join(", "));
}
