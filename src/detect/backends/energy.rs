use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::{MAX_DELAY_SECS, MAX_DURATION_SECS};
use crate::detect::backend::{Classifier, ClassifierFactory, ClassifierParams};
use crate::detect::result::{now_ms, DetectionEvent, DetectionHandler, LabelScore, LabelsHandler};

const TARGET_LABEL: &str = "Clapping";
const BACKGROUND_LABEL: &str = "Background";
/// Crest factor of a pure sine; anything at or below scores zero.
const SINE_CREST: f32 = std::f32::consts::SQRT_2;
/// Crest factor at which the score saturates at 1.0.
const SATURATION_CREST: f32 = 8.0;
/// Windows quieter than this peak amplitude never score.
const MIN_PEAK: f32 = 0.05;

/// Transient-energy classifier.
///
/// Scores sliding windows by crest factor (peak over RMS), which is high for
/// short percussive sounds such as claps and low for speech, music and hum.
/// Stands in for a full acoustic model when none is deployed.
pub struct EnergyBackend {
    params: ClassifierParams,
    window_len: usize,
    hop_len: usize,
    sources: HashMap<String, SourceState>,
    initialized: bool,
    started: bool,
}

struct SourceState {
    on_detection: DetectionHandler,
    on_labels: LabelsHandler,
    window: Vec<f32>,
    last_detection: Option<Instant>,
}

impl EnergyBackend {
    pub fn new(params: ClassifierParams) -> Self {
        let window_secs = params.buffer_duration.clamp(0.0, MAX_DURATION_SECS);
        let window_len = ((window_secs * params.sample_rate as f64).round() as usize).max(1);
        let hop_len = ((window_len as f64 * (1.0 - params.overlap_factor)).round() as usize)
            .clamp(1, window_len);
        Self {
            params,
            window_len,
            hop_len,
            sources: HashMap::new(),
            initialized: false,
            started: false,
        }
    }

    fn debounce(&self) -> Duration {
        Duration::try_from_secs_f64(self.params.delay.max(0.0)).unwrap_or(Duration::MAX)
    }
}

impl Classifier for EnergyBackend {
    fn name(&self) -> &'static str {
        "energy"
    }

    fn initialize(&mut self) -> Result<()> {
        self.initialized = true;
        log::debug!(
            "energy classifier: window={} hop={} samples at {} Hz",
            self.window_len,
            self.hop_len,
            self.params.sample_rate
        );
        Ok(())
    }

    fn add_source(
        &mut self,
        source_id: &str,
        on_detection: DetectionHandler,
        on_labels: LabelsHandler,
    ) -> Result<()> {
        if !self.initialized {
            return Err(anyhow!("classifier must be initialized before adding sources"));
        }
        self.sources.insert(
            source_id.to_string(),
            SourceState {
                on_detection,
                on_labels,
                window: Vec::with_capacity(self.window_len.saturating_add(self.hop_len)),
                last_detection: None,
            },
        );
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(anyhow!("classifier must be initialized before start"));
        }
        self.started = true;
        Ok(())
    }

    fn process_audio(&mut self, samples: &[f32], source_id: &str) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        let debounce = self.debounce();
        let threshold = self.params.score_threshold as f32;
        let (window_len, hop_len) = (self.window_len, self.hop_len);
        let state = self
            .sources
            .get_mut(source_id)
            .ok_or_else(|| anyhow!("unknown source '{}'", source_id))?;

        state.window.extend_from_slice(samples);
        while state.window.len() >= window_len {
            let score = transient_score(&state.window[..window_len]);
            let labels = [
                LabelScore {
                    label: TARGET_LABEL.to_string(),
                    score,
                },
                LabelScore {
                    label: BACKGROUND_LABEL.to_string(),
                    score: 1.0 - score,
                },
            ];
            (state.on_labels)(source_id, &labels);

            let cooled_down = state
                .last_detection
                .map(|at| at.elapsed() >= debounce)
                .unwrap_or(true);
            if score > 0.0 && score >= threshold && cooled_down {
                state.last_detection = Some(Instant::now());
                let event = DetectionEvent {
                    source_id: source_id.to_string(),
                    score,
                    label: TARGET_LABEL.to_string(),
                    timestamp_ms: now_ms(),
                };
                (state.on_detection)(&event);
            }

            state.window.drain(..hop_len);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        for state in self.sources.values_mut() {
            state.window.clear();
        }
        Ok(())
    }
}

/// Factory producing an [`EnergyBackend`] per session.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnergyBackendFactory;

impl ClassifierFactory for EnergyBackendFactory {
    fn create(&self, params: &ClassifierParams) -> Result<Box<dyn Classifier>> {
        check_params(params)?;
        Ok(Box::new(EnergyBackend::new(params.clone())))
    }
}

fn check_params(params: &ClassifierParams) -> Result<()> {
    if params.sample_rate == 0 {
        return Err(anyhow!("sample rate must be positive"));
    }
    if !(params.buffer_duration > 0.0 && params.buffer_duration <= MAX_DURATION_SECS) {
        return Err(anyhow!(
            "buffer duration {}s must be within (0, {}]",
            params.buffer_duration,
            MAX_DURATION_SECS
        ));
    }
    if !(0.0..=MAX_DELAY_SECS).contains(&params.delay) {
        return Err(anyhow!(
            "delay {}s must be within [0, {}]",
            params.delay,
            MAX_DELAY_SECS
        ));
    }
    Ok(())
}

fn transient_score(window: &[f32]) -> f32 {
    let peak = window.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak < MIN_PEAK {
        return 0.0;
    }
    let mean_square = window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32;
    let rms = mean_square.sqrt();
    if rms <= f32::EPSILON {
        return 0.0;
    }
    let crest = peak / rms;
    ((crest - SINE_CREST) / (SATURATION_CREST - SINE_CREST)).clamp(0.0, 1.0)
}
