//! Deterministic scriptable backend for tests and `--dry-run`.
//!
//! Produces a quiet sine tone whose length is proportional to the text, and
//! fails on demand for texts matching a rule.

use std::f32::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::{BackendError, GenerationDiagnostics, RawWaveform, SynthesisBackend};
use crate::audio::{AudioBuffer, SAMPLE_RATE};
use crate::config::ModelPreset;
use crate::device::Accelerator;
use crate::generation::SamplingParams;
use crate::reference::ReferenceVoice;
use crate::text::Language;

/// What the mock does for a matching text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockBehavior {
    /// Return audio containing a NaN sample
    NonFiniteSamples,
    /// Return a numeric-instability error
    Unstable,
    /// Return a numeric-instability error N times, then succeed
    UnstableThenSuccess { remaining_errors: usize },
    /// Return valid audio but flag NaN logits in the diagnostics
    NonFiniteLogits,
    /// Return zero samples
    Empty,
    /// Return a non-retryable error
    Fatal { message: String },
    /// Return audio at a different sample rate
    SampleRate { rate: u32 },
}

#[derive(Debug, Clone)]
struct MockRule {
    pattern: String,
    behavior: MockBehavior,
}

/// One recorded `synthesize` call
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub text: String,
    pub language: Language,
    pub temperature: f64,
    pub seed: Option<u64>,
    pub accelerator: Accelerator,
}

#[derive(Debug)]
struct MockState {
    rules: Vec<MockRule>,
    accelerator_available: bool,
    samples_per_char: usize,
    sample_rate: u32,
    calls: Vec<MockCall>,
    prepared: Vec<String>,
    accelerator_checks: usize,
}

/// Mock backend for testing. Clones share state, so a test can keep one
/// handle for inspection after moving another into the pipeline.
#[derive(Debug, Clone)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                rules: Vec::new(),
                accelerator_available: true,
                samples_per_char: 100,
                sample_rate: SAMPLE_RATE,
                calls: Vec::new(),
                prepared: Vec::new(),
                accelerator_checks: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Apply `behavior` to every text containing `pattern`. Earlier rules win.
    pub fn with_rule(self, pattern: impl Into<String>, behavior: MockBehavior) -> Self {
        self.state().rules.push(MockRule {
            pattern: pattern.into(),
            behavior,
        });
        self
    }

    pub fn with_samples_per_char(self, samples_per_char: usize) -> Self {
        self.state().samples_per_char = samples_per_char;
        self
    }

    pub fn set_accelerator_available(&self, available: bool) {
        self.state().accelerator_available = available;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn synthesize_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Calls whose text contained `pattern`.
    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.text.contains(pattern))
            .count()
    }

    pub fn prepared_models(&self) -> Vec<String> {
        self.state().prepared.clone()
    }

    pub fn accelerator_checks(&self) -> usize {
        self.state().accelerator_checks
    }

    /// Samples the mock returns for `text` on success.
    pub fn expected_len(&self, text: &str) -> usize {
        self.state().samples_per_char * text.chars().count()
    }

    fn tone(len: usize, rate: u32) -> Vec<f32> {
        (0..len)
            .map(|i| 0.1 * (2.0 * PI * 220.0 * i as f32 / rate as f32).sin())
            .collect()
    }
}

impl SynthesisBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn ensure_accelerator(&mut self, accelerator: Accelerator) -> Result<(), BackendError> {
        let mut state = self.state();
        state.accelerator_checks += 1;
        if state.accelerator_available {
            Ok(())
        } else {
            Err(BackendError::DeviceUnavailable(format!(
                "{accelerator} is not available (mock)"
            )))
        }
    }

    fn prepare(&mut self, model: &ModelPreset, _accelerator: Accelerator) -> Result<(), BackendError> {
        self.state().prepared.push(model.model_id().to_string());
        Ok(())
    }

    fn synthesize(
        &mut self,
        _reference: &ReferenceVoice,
        text: &str,
        language: Language,
        params: &SamplingParams,
        accelerator: Accelerator,
    ) -> Result<RawWaveform, BackendError> {
        let mut state = self.state();
        state.calls.push(MockCall {
            text: text.to_string(),
            language,
            temperature: params.temperature,
            seed: params.seed,
            accelerator,
        });

        let len = state.samples_per_char * text.chars().count();
        let rate = state.sample_rate;

        let rule = state
            .rules
            .iter_mut()
            .find(|r| text.contains(&r.pattern))
            .map(|r| &mut r.behavior);

        let mut raw = RawWaveform::new(AudioBuffer::new(Self::tone(len, rate), rate));
        match rule {
            None => {}
            Some(MockBehavior::NonFiniteSamples) => {
                if let Some(s) = raw.audio.samples.get_mut(len / 2) {
                    *s = f32::NAN;
                } else {
                    raw.audio.samples.push(f32::NAN);
                }
            }
            Some(MockBehavior::Unstable) => {
                return Err(BackendError::NumericInstability(
                    "probability tensor contains either `inf`, `nan` or element < 0".into(),
                ))
            }
            Some(MockBehavior::UnstableThenSuccess { remaining_errors }) => {
                if *remaining_errors > 0 {
                    *remaining_errors -= 1;
                    return Err(BackendError::NumericInstability("nan logits".into()));
                }
            }
            Some(MockBehavior::NonFiniteLogits) => {
                raw.diagnostics = GenerationDiagnostics {
                    non_finite_logits: true,
                    frames: None,
                };
            }
            Some(MockBehavior::Empty) => raw.audio.samples.clear(),
            Some(MockBehavior::Fatal { message }) => return Err(BackendError::Failed(message.clone())),
            Some(MockBehavior::SampleRate { rate }) => {
                raw.audio = AudioBuffer::new(Self::tone(len, *rate), *rate);
            }
        }
        Ok(raw)
    }
}
