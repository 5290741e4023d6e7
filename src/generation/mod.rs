//! Per-chunk generation control
//!
//! This module provides:
//! - Sampling parameters and their cooling schedule
//! - The stability guard: waveform validation, retries and re-segmentation

pub mod guard;
mod sampling;

pub use guard::{
    check_waveform, AttemptFailure, ChunkOutcome, GuardError, StabilityGuard, SynthesisAttempt,
};
pub use sampling::SamplingParams;
