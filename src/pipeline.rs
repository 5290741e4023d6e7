//! End-to-end orchestration of one voice-clone request.
//!
//! validate → accelerator check → segment → model load → per-chunk guarded
//! inference → assemble → write.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::assembler::{AudioSegment, SegmentAssembler};
use crate::backend::{BackendError, InferenceInvoker, SynthesisBackend};
use crate::config::{ModelPreset, PipelineConfig};
use crate::device::{Accelerator, DevicePolicy};
use crate::error::{Result, VoiceCloneError};
use crate::generation::{ChunkOutcome, GuardError, StabilityGuard};
use crate::output::OutputWriter;
use crate::reference::ReferenceVoice;
use crate::text::{Language, TextSegmenter};

/// Where the finished WAV goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// A directory; the file gets a timestamped name
    Directory(PathBuf),
    /// An exact file path
    File(PathBuf),
}

/// Everything needed for one synthesis.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub reference: ReferenceVoice,
    pub full_text: String,
    pub output: OutputTarget,
    pub model: ModelPreset,
    pub language: Language,
    pub device_policy: DevicePolicy,
}

impl SynthesisRequest {
    /// Request with the default model, language and device, writing into `output_dir`.
    pub fn new(reference: ReferenceVoice, full_text: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            reference,
            full_text: full_text.into(),
            output: OutputTarget::Directory(output_dir.into()),
            model: ModelPreset::default(),
            language: Language::default(),
            device_policy: DevicePolicy::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.full_text.trim().is_empty() {
            problems.push("target text is empty".to_string());
        }
        if self.model.model_id().trim().is_empty() {
            problems.push("model id is empty".to_string());
        }
        let output_path = match &self.output {
            OutputTarget::Directory(p) | OutputTarget::File(p) => p,
        };
        if output_path.as_os_str().is_empty() {
            problems.push("output path is empty".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(VoiceCloneError::InvalidInput(problems.join("; ")))
        }
    }
}

/// Outcome of a completed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisResult {
    pub output_path: PathBuf,
    pub duration_secs: f32,
    pub sample_rate: u32,
    pub chunk_count: usize,
    /// Chunks that exhausted recovery and are missing from the output
    pub failed_chunk_indices: BTreeSet<usize>,
    /// Model calls made, retries and splits included
    pub attempts: usize,
    pub model_id: String,
    pub device: String,
}

impl SynthesisResult {
    pub fn is_partial(&self) -> bool {
        !self.failed_chunk_indices.is_empty()
    }
}

/// Progress notifications, emitted synchronously from the pipeline thread.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started {
        chunk_count: usize,
    },
    ChunkStarted {
        index: usize,
        chunk_count: usize,
        chars: usize,
    },
    AttemptFailed {
        index: usize,
        attempt_number: usize,
        depth: usize,
        reason: String,
    },
    ChunkFinished {
        index: usize,
        chunk_count: usize,
        attempts: usize,
        failed: bool,
    },
    Assembled {
        duration_secs: f32,
        gaps: usize,
    },
    Written {
        path: PathBuf,
    },
}

/// Shared cancellation flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The voice-clone pipeline.
///
/// Holds the model through an [`InferenceInvoker`]; clones of the invoker may
/// be shared by several pipelines, in which case requests run one at a time.
pub struct VoiceClonePipeline<B> {
    invoker: InferenceInvoker<B>,
    config: PipelineConfig,
    writer: OutputWriter,
}

impl<B: SynthesisBackend> VoiceClonePipeline<B> {
    pub fn new(backend: B, config: PipelineConfig) -> Result<Self> {
        Self::with_invoker(InferenceInvoker::new(backend), config)
    }

    pub fn with_invoker(invoker: InferenceInvoker<B>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            invoker,
            config,
            writer: OutputWriter::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn invoker(&self) -> &InferenceInvoker<B> {
        &self.invoker
    }

    /// Run a request without progress reporting or cancellation.
    pub fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResult> {
        self.run(request, &mut |_| {}, None)
    }

    /// Run a request.
    ///
    /// Chunk-level instability is absorbed and reported in
    /// [`SynthesisResult::failed_chunk_indices`]; the request only fails when
    /// every chunk does, or on a non-recoverable error.
    pub fn run(
        &self,
        request: &SynthesisRequest,
        progress: &mut dyn FnMut(ProgressEvent),
        cancel: Option<&CancelFlag>,
    ) -> Result<SynthesisResult> {
        let accelerator = request.device_policy.accelerator;
        let span = tracing::info_span!(
            "voice_clone",
            model = %request.model,
            device = %accelerator,
            language = %request.language
        );
        let _enter = span.enter();

        request.validate()?;

        let mut session = self.invoker.lock(accelerator);
        session
            .ensure_accelerator()
            .map_err(|e| fatal_error(e, accelerator, 0))?;

        let chunks = TextSegmenter::new(self.config.segmenter.clone(), request.language)
            .segment(&request.full_text)?;
        let chunk_count = chunks.len();

        session.prepare(&request.model).map_err(|e| match e {
            BackendError::DeviceUnavailable(_) => fatal_error(e, accelerator, 0),
            other => VoiceCloneError::ModelLoad(other.to_string()),
        })?;

        tracing::info!(
            "Synthesizing {} chunk(s) with {} on {} via {}",
            chunk_count,
            request.model.model_id(),
            accelerator,
            session.backend_name()
        );
        progress(ProgressEvent::Started { chunk_count });

        let guard = StabilityGuard::new(
            self.config.stability.clone(),
            self.config.sampling.clone(),
            request.language,
        );
        let mut segments = Vec::with_capacity(chunk_count);
        let mut failed = BTreeSet::new();
        let mut attempts = 0;

        for chunk in &chunks {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                tracing::info!("Cancelled before chunk {}", chunk.index);
                return Err(VoiceCloneError::Cancelled {
                    completed: chunk.index,
                });
            }

            let chunk_span = tracing::info_span!("chunk", index = chunk.index);
            let _chunk_enter = chunk_span.enter();

            progress(ProgressEvent::ChunkStarted {
                index: chunk.index,
                chunk_count,
                chars: chunk.char_len(),
            });

            let outcome = guard
                .run_chunk(
                    chunk,
                    |attempt| {
                        session.invoke(
                            &request.reference,
                            &attempt.text,
                            request.language,
                            &attempt.params,
                        )
                    },
                    &mut |attempt, failure| {
                        progress(ProgressEvent::AttemptFailed {
                            index: attempt.chunk_index,
                            attempt_number: attempt.attempt_number,
                            depth: attempt.depth,
                            reason: failure.to_string(),
                        })
                    },
                )
                .map_err(|e| match e {
                    GuardError::Backend(e) => fatal_error(e, accelerator, chunk.index),
                    incompatible @ GuardError::IncompatiblePieces { .. } => {
                        VoiceCloneError::IncompatibleSegments(incompatible.to_string())
                    }
                })?;

            let chunk_attempts = outcome.attempts();
            attempts += chunk_attempts;
            let chunk_failed = outcome.is_failed();
            match outcome {
                ChunkOutcome::Synthesized { audio, .. } => segments.push(AudioSegment {
                    index: chunk.index,
                    audio,
                }),
                ChunkOutcome::Failed { .. } => {
                    failed.insert(chunk.index);
                }
            }

            progress(ProgressEvent::ChunkFinished {
                index: chunk.index,
                chunk_count,
                attempts: chunk_attempts,
                failed: chunk_failed,
            });
        }
        drop(session);

        if failed.len() == chunk_count {
            return Err(VoiceCloneError::AllChunksFailed { chunk_count });
        }

        let assembled =
            SegmentAssembler::new(self.config.assembly.clone()).assemble(segments, chunk_count)?;
        progress(ProgressEvent::Assembled {
            duration_secs: assembled.audio.duration(),
            gaps: assembled.gaps.len(),
        });

        let output_path = match &request.output {
            OutputTarget::Directory(dir) => self.writer.write(&assembled.audio, dir)?,
            OutputTarget::File(path) => {
                self.writer.write_to(&assembled.audio, path)?;
                path.clone()
            }
        };
        progress(ProgressEvent::Written {
            path: output_path.clone(),
        });

        if !failed.is_empty() {
            tracing::warn!(
                "{} of {} chunk(s) failed and are missing from {}: {:?}",
                failed.len(),
                chunk_count,
                output_path.display(),
                failed
            );
        }

        Ok(SynthesisResult {
            output_path,
            duration_secs: assembled.audio.duration(),
            sample_rate: assembled.audio.sample_rate,
            chunk_count,
            failed_chunk_indices: failed,
            attempts,
            model_id: request.model.model_id().to_string(),
            device: accelerator.to_string(),
        })
    }
}

fn fatal_error(error: BackendError, accelerator: Accelerator, chunk_index: usize) -> VoiceCloneError {
    match error {
        BackendError::DeviceUnavailable(msg) => VoiceCloneError::DeviceUnavailable {
            device: accelerator.to_string(),
            guidance: format!("{msg}. {}", accelerator.guidance()),
        },
        BackendError::NumericInstability(message) | BackendError::Failed(message) => {
            VoiceCloneError::Inference {
                chunk_index,
                message,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockBehavior};
    use tempfile::tempdir;

    fn request(text: &str, dir: &std::path::Path) -> SynthesisRequest {
        let mut req = SynthesisRequest::new(ReferenceVoice::for_tests(), text, dir);
        req.language = Language::English;
        req.device_policy = DevicePolicy::new(Accelerator::Cuda(0));
        req
    }

    #[test]
    fn test_single_chunk_request() {
        let dir = tempdir().unwrap();
        let mock = MockBackend::new();
        let pipeline = VoiceClonePipeline::new(mock.clone(), PipelineConfig::default()).unwrap();

        let result = pipeline
            .synthesize(&request("This is a test. It has two sentences.", dir.path()))
            .unwrap();
        assert_eq!(result.chunk_count, 1);
        assert_eq!(result.attempts, 1);
        assert_eq!(mock.synthesize_count(), 1);
        assert!(result.output_path.exists());
        assert_eq!(mock.prepared_models(), vec!["Qwen/Qwen3-TTS-12Hz-1.7B-Base"]);
    }

    #[test]
    fn test_empty_text_fails_before_any_backend_call() {
        let dir = tempdir().unwrap();
        let mock = MockBackend::new();
        let pipeline = VoiceClonePipeline::new(mock.clone(), PipelineConfig::default()).unwrap();
        let err = pipeline.synthesize(&request("   ", dir.path())).unwrap_err();
        assert!(matches!(err, VoiceCloneError::InvalidInput(_)));
        assert_eq!(mock.accelerator_checks(), 0);
    }

    #[test]
    fn test_model_load_failure() {
        struct NoLoad;
        impl SynthesisBackend for NoLoad {
            fn name(&self) -> &str {
                "no-load"
            }
            fn ensure_accelerator(&mut self, _: Accelerator) -> std::result::Result<(), BackendError> {
                Ok(())
            }
            fn prepare(&mut self, _: &ModelPreset, _: Accelerator) -> std::result::Result<(), BackendError> {
                Err(BackendError::Failed("weights not found".into()))
            }
            fn synthesize(
                &mut self,
                _: &ReferenceVoice,
                _: &str,
                _: Language,
                _: &crate::generation::SamplingParams,
                _: Accelerator,
            ) -> std::result::Result<crate::backend::RawWaveform, BackendError> {
                unreachable!("synthesize must not run without a model")
            }
        }

        let dir = tempdir().unwrap();
        let pipeline = VoiceClonePipeline::new(NoLoad, PipelineConfig::default()).unwrap();
        let err = pipeline.synthesize(&request("hello", dir.path())).unwrap_err();
        assert!(matches!(err, VoiceCloneError::ModelLoad(_)));
    }

    #[test]
    fn test_fatal_backend_error_names_chunk() {
        let dir = tempdir().unwrap();
        let mock = MockBackend::new().with_rule(
            "second",
            MockBehavior::Fatal {
                message: "worker crashed".into(),
            },
        );
        let mut config = PipelineConfig::default();
        config.segmenter.max_chunk_chars = 15;
        let pipeline = VoiceClonePipeline::new(mock, config).unwrap();

        let err = pipeline
            .synthesize(&request("First one. The second one.", dir.path()))
            .unwrap_err();
        match err {
            VoiceCloneError::Inference { chunk_index, message } => {
                assert_eq!(chunk_index, 1);
                assert!(message.contains("worker crashed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_cancel_between_chunks() {
        let dir = tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.segmenter.max_chunk_chars = 10;
        let pipeline = VoiceClonePipeline::new(MockBackend::new(), config).unwrap();
        let cancel = CancelFlag::new();
        let flag = cancel.clone();

        let err = pipeline
            .run(
                &request("One two. Three four. Five six.", dir.path()),
                &mut |event| {
                    if let ProgressEvent::ChunkFinished { index: 0, .. } = event {
                        flag.cancel();
                    }
                },
                Some(&cancel),
            )
            .unwrap_err();
        assert!(matches!(err, VoiceCloneError::Cancelled { completed: 1 }));
    }

    #[test]
    fn test_explicit_output_file() {
        let dir = tempdir().unwrap();
        let pipeline = VoiceClonePipeline::new(MockBackend::new(), PipelineConfig::default()).unwrap();
        let mut req = request("hello", dir.path());
        let target = dir.path().join("out").join("line_001.wav");
        req.output = OutputTarget::File(target.clone());

        let result = pipeline.synthesize(&req).unwrap();
        assert_eq!(result.output_path, target);
        assert!(target.exists());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.stability.max_attempts = 0;
        assert!(VoiceClonePipeline::new(MockBackend::new(), config).is_err());
    }
}
