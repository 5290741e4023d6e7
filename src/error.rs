//! Error types for the voice-clone pipeline.
//!
//! Chunk-level numerical instability never reaches this type. The stability
//! guard absorbs it and reports it through
//! [`SynthesisResult::failed_chunk_indices`](crate::SynthesisResult). Only
//! request-level failures become a [`VoiceCloneError`].

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, VoiceCloneError>;

#[derive(Error, Debug)]
pub enum VoiceCloneError {
    /// Empty or malformed text, reference audio, transcript or option value.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The configured accelerator is absent. Never downgraded to another backend.
    #[error("accelerator '{device}' is unavailable: {guidance}")]
    DeviceUnavailable { device: String, guidance: String },

    /// Per-chunk segments disagree on sample rate or channel layout.
    #[error("incompatible segments: {0}")]
    IncompatibleSegments(String),

    /// Every chunk exhausted its recovery budget.
    #[error("all {chunk_count} chunk(s) failed to synthesize")]
    AllChunksFailed { chunk_count: usize },

    /// The backend could not load the requested model.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// Non-recoverable model failure.
    #[error("inference failed on chunk {chunk_index}: {message}")]
    Inference { chunk_index: usize, message: String },

    #[error("audio decode failed: {0}")]
    Decode(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("WAV error for {}: {source}", path.display())]
    Wav {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    /// Request abandoned between chunks.
    #[error("synthesis cancelled after {completed} chunk(s)")]
    Cancelled { completed: usize },
}

impl VoiceCloneError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn wav(path: impl Into<PathBuf>, source: hound::Error) -> Self {
        Self::Wav {
            path: path.into(),
            source,
        }
    }

    /// Short stage label, used by front-ends to tell the user where a request died.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) | Self::Config(_) => "validation",
            Self::DeviceUnavailable { .. } => "device",
            Self::ModelLoad(_) => "model",
            Self::Inference { .. } | Self::AllChunksFailed { .. } => "inference",
            Self::IncompatibleSegments(_) => "assembly",
            Self::Decode(_) => "reference",
            Self::Io { .. } | Self::Wav { .. } => "io",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}
