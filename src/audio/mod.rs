//! Audio utilities for the voice-clone pipeline
//!
//! This module provides:
//! - WAV file I/O and the interleaved [`AudioBuffer`]
//! - Reference decoding through ffmpeg
//! - Resampling

mod decode;
mod io;
pub mod resample;

pub use decode::Decoder;
pub use io::{load_wav, save_wav, AudioBuffer};
pub use resample::{resample, ResampleQuality, Resampler};

/// Native output rate of the Qwen3-TTS 12Hz decoder
pub const SAMPLE_RATE: u32 = 24000;
