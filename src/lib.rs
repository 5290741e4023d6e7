//! # Qwen3 Voice Clone
//!
//! Long-form voice cloning on top of the
//! [Qwen3-TTS](https://github.com/QwenLM/Qwen3-TTS) Base models: give it a
//! reference clip, the transcript of that clip and any amount of text, and it
//! writes one WAV of the reference voice reading the text.
//!
//! The model itself is opaque. It is reached through a [`SynthesisBackend`],
//! normally a [`ProcessBackend`] talking to a worker process that hosts the
//! checkpoint on the GPU. This crate does everything around the model:
//!
//! - **Segmentation**: text is cut into chunks of bounded length along
//!   sentence, clause and word boundaries ([`text`])
//! - **Stability**: NaN/Inf output is detected per chunk and recovered by
//!   retrying with cooler sampling and by halving the chunk ([`generation`])
//! - **Assembly**: chunk audio is joined in text order, with optional silence
//!   ([`assembler`]), and written under a timestamped name ([`output`])
//! - **Accelerator-only execution**: CUDA or Metal; a missing accelerator is
//!   an error, never a silent CPU fallback ([`device`])
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use qwen3_voiceclone::{
//!     PipelineConfig, ProcessBackend, ReferenceLoader, SynthesisRequest,
//!     VoiceClonePipeline, WorkerCommand,
//! };
//!
//! let backend = ProcessBackend::new(WorkerCommand::new("python3").arg("worker.py"));
//! let pipeline = VoiceClonePipeline::new(backend, PipelineConfig::default())?;
//!
//! let reference = ReferenceLoader::default().load("me.m4a".as_ref(), "Hello there")?;
//! let request = SynthesisRequest::new(reference, std::fs::read_to_string("book.txt")?, "outputs");
//! let result = pipeline.synthesize(&request)?;
//! println!("{} ({:.1}s)", result.output_path.display(), result.duration_secs);
//! ```
//!
//! ## Sample Rate
//!
//! References are normalized to 24kHz mono, the native rate of the 12Hz
//! codec. Output keeps whatever rate the backend returns.

pub mod assembler;
pub mod audio;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod generation;
pub mod output;
pub mod pipeline;
pub mod preflight;
pub mod profiling;
pub mod reference;
pub mod text;

pub use assembler::{AssembledAudio, AudioSegment, SegmentAssembler};
pub use audio::AudioBuffer;
pub use backend::{
    BackendError, InferenceInvoker, MockBackend, ProcessBackend, RawWaveform, SynthesisBackend,
    WorkerCommand,
};
pub use config::{
    AssemblyConfig, GapPolicy, ModelPreset, PipelineConfig, RecoveryOrder, ReferenceConfig,
    StabilityConfig,
};
pub use device::{Accelerator, DevicePolicy, RuntimeParams};
pub use error::{Result, VoiceCloneError};
pub use generation::{SamplingParams, StabilityGuard, SynthesisAttempt};
pub use output::OutputWriter;
pub use pipeline::{
    CancelFlag, OutputTarget, ProgressEvent, SynthesisRequest, SynthesisResult,
    VoiceClonePipeline,
};
pub use reference::{ReferenceLoader, ReferenceVoice};
pub use text::{Language, SegmenterConfig, TextChunk, TextSegmenter};
