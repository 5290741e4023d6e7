//! The model boundary.
//!
//! The voice-cloning model is opaque to this crate: it is reached through a
//! [`SynthesisBackend`]. [`InferenceInvoker`] owns the backend behind a mutex
//! so one request at a time drives it, and checks the accelerator before every
//! call.

mod mock;
mod process;

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

pub use mock::{MockBackend, MockBehavior, MockCall};
pub use process::{ProcessBackend, WorkerCommand};

use crate::audio::AudioBuffer;
use crate::config::ModelPreset;
use crate::device::Accelerator;
use crate::generation::SamplingParams;
use crate::reference::ReferenceVoice;
use crate::text::Language;

/// Failure reported by a backend for one call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// NaN/Inf logits or an invalid probability tensor. Worth retrying.
    #[error("numerically unstable generation: {0}")]
    NumericInstability(String),

    #[error("accelerator unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("{0}")]
    Failed(String),
}

impl BackendError {
    /// Classify a free-form runtime error message.
    ///
    /// Sampling from a distribution with NaN/Inf entries surfaces as
    /// "probability tensor contains either `inf`, `nan` or element < 0";
    /// any message mentioning a `nan` or `inf` token is treated the same way.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();

        if lowered.contains("probability tensor contains") {
            return BackendError::NumericInstability(message);
        }
        let numeric_token = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|tok| tok == "nan" || tok == "inf");
        if numeric_token {
            return BackendError::NumericInstability(message);
        }

        let device_markers = [
            "no cuda gpus are available",
            "cuda is not available",
            "mps backend is not available",
            "mps is not available",
            "torch not compiled with cuda",
        ];
        if device_markers.iter().any(|m| lowered.contains(m)) {
            return BackendError::DeviceUnavailable(message);
        }

        BackendError::Failed(message)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::NumericInstability(_))
    }
}

/// Side information a backend may report alongside the waveform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationDiagnostics {
    /// The model saw NaN/Inf logits at some step even though it returned audio
    pub non_finite_logits: bool,
    /// Codec frames generated, when known
    pub frames: Option<usize>,
}

/// Unvalidated model output for one call.
#[derive(Debug, Clone)]
pub struct RawWaveform {
    pub audio: AudioBuffer,
    pub diagnostics: GenerationDiagnostics,
}

impl RawWaveform {
    pub fn new(audio: AudioBuffer) -> Self {
        Self {
            audio,
            diagnostics: GenerationDiagnostics::default(),
        }
    }
}

/// A voice-cloning model.
///
/// `synthesize` blocks until the model returns audio or fails. Backends are
/// driven from one thread at a time through [`InferenceInvoker`].
pub trait SynthesisBackend: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Report whether `accelerator` can run inference right now.
    ///
    /// The default opens the device through candle.
    fn ensure_accelerator(&mut self, accelerator: Accelerator) -> Result<(), BackendError> {
        accelerator
            .open()
            .map(|_| ())
            .map_err(|e| BackendError::DeviceUnavailable(e.to_string()))
    }

    /// Load (or switch to) a model on `accelerator`. Called once per request
    /// before the first chunk; implementations should make repeat calls cheap.
    fn prepare(&mut self, _model: &ModelPreset, _accelerator: Accelerator) -> Result<(), BackendError> {
        Ok(())
    }

    /// Synthesize `text` in the voice of `reference`.
    fn synthesize(
        &mut self,
        reference: &ReferenceVoice,
        text: &str,
        language: Language,
        params: &SamplingParams,
        accelerator: Accelerator,
    ) -> Result<RawWaveform, BackendError>;
}

/// Exclusive owner of a backend.
///
/// Clones share the same backend; [`lock`](Self::lock) blocks until any other
/// request holding it has finished its chunk loop.
pub struct InferenceInvoker<B> {
    backend: Arc<Mutex<B>>,
}

impl<B> Clone for InferenceInvoker<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: SynthesisBackend> InferenceInvoker<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
        }
    }

    /// Acquire the model for one request.
    pub fn lock(&self, accelerator: Accelerator) -> ModelSession<'_, B> {
        let backend = self.backend.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Model lock was poisoned by a panicked request; continuing");
            poisoned.into_inner()
        });
        ModelSession {
            backend,
            accelerator,
        }
    }
}

/// A held model lock. Dropping it lets the next request in.
pub struct ModelSession<'a, B> {
    backend: MutexGuard<'a, B>,
    accelerator: Accelerator,
}

impl<B: SynthesisBackend> ModelSession<'_, B> {
    pub fn accelerator(&self) -> Accelerator {
        self.accelerator
    }

    pub fn backend_name(&self) -> String {
        self.backend.name().to_string()
    }

    pub fn ensure_accelerator(&mut self) -> Result<(), BackendError> {
        self.backend.ensure_accelerator(self.accelerator)
    }

    pub fn prepare(&mut self, model: &ModelPreset) -> Result<(), BackendError> {
        self.backend.prepare(model, self.accelerator)
    }

    /// One model call, preceded by an accelerator check.
    pub fn invoke(
        &mut self,
        reference: &ReferenceVoice,
        text: &str,
        language: Language,
        params: &SamplingParams,
    ) -> Result<RawWaveform, BackendError> {
        self.backend.ensure_accelerator(self.accelerator)?;
        self.backend
            .synthesize(reference, text, language, params, self.accelerator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_probability_tensor() {
        let err = BackendError::classify(
            "RuntimeError: probability tensor contains either `inf`, `nan` or element < 0",
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_nan_token() {
        assert!(BackendError::classify("logits became NaN at step 40").is_retryable());
        assert!(BackendError::classify("value is inf").is_retryable());
        assert!(!BackendError::classify("failed to infer shape").is_retryable());
        assert!(!BackendError::classify("information missing").is_retryable());
    }

    #[test]
    fn test_classify_device() {
        assert!(matches!(
            BackendError::classify("RuntimeError: No CUDA GPUs are available"),
            BackendError::DeviceUnavailable(_)
        ));
        assert!(matches!(
            BackendError::classify("out of memory"),
            BackendError::Failed(_)
        ));
    }

    #[test]
    fn test_invoker_checks_accelerator_first() {
        let mock = MockBackend::new();
        mock.set_accelerator_available(false);
        let invoker = InferenceInvoker::new(mock.clone());
        let reference = ReferenceVoice::for_tests();

        let mut session = invoker.lock(Accelerator::Cuda(0));
        let err = session
            .invoke(&reference, "hello", Language::English, &SamplingParams::default())
            .unwrap_err();
        assert!(matches!(err, BackendError::DeviceUnavailable(_)));
        assert_eq!(mock.synthesize_count(), 0);
    }

    #[test]
    fn test_invoker_clones_share_backend() {
        let mock = MockBackend::new();
        let invoker = InferenceInvoker::new(mock.clone());
        let other = invoker.clone();
        let reference = ReferenceVoice::for_tests();

        {
            let mut session = invoker.lock(Accelerator::Metal);
            session
                .invoke(&reference, "one", Language::English, &SamplingParams::default())
                .unwrap();
        }
        let mut session = other.lock(Accelerator::Metal);
        session
            .invoke(&reference, "two", Language::English, &SamplingParams::default())
            .unwrap();
        assert_eq!(mock.synthesize_count(), 2);
    }
}
