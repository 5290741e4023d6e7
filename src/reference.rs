//! Reference voice loading and validation.

use std::path::Path;

use crate::audio::{AudioBuffer, Decoder, Resampler};
use crate::config::ReferenceConfig;
use crate::error::{Result, VoiceCloneError};

/// The voice to imitate: a waveform plus what is said in it.
///
/// Construction validates the invariants; the value is immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceVoice {
    pub audio: AudioBuffer,
    pub transcript: String,
}

impl ReferenceVoice {
    /// Validate and wrap an already-decoded reference.
    ///
    /// Every problem found is reported in one [`VoiceCloneError::InvalidInput`].
    pub fn new(audio: AudioBuffer, transcript: impl Into<String>) -> Result<Self> {
        let transcript = transcript.into().trim().to_string();
        let mut problems = Vec::new();

        if transcript.is_empty() {
            problems.push("reference transcript is empty".to_string());
        }
        if audio.is_empty() {
            problems.push("reference audio has no samples".to_string());
        }
        if audio.channels == 0 || !audio.is_frame_aligned() {
            problems.push(format!(
                "reference audio has {} samples, not a whole number of {}-channel frames",
                audio.len(),
                audio.channels
            ));
        }
        if let Some(idx) = audio.first_non_finite() {
            problems.push(format!("reference audio has a non-finite sample at {idx}"));
        }
        if audio.sample_rate == 0 {
            problems.push("reference audio has a zero sample rate".to_string());
        }

        if !problems.is_empty() {
            return Err(VoiceCloneError::InvalidInput(problems.join("; ")));
        }
        Ok(Self { audio, transcript })
    }

    pub fn duration(&self) -> f32 {
        self.audio.duration()
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            audio: AudioBuffer::new(vec![0.1; 2400], crate::audio::SAMPLE_RATE),
            transcript: "Hello there".to_string(),
        }
    }
}

/// Decodes and normalizes reference audio to mono at the model rate.
#[derive(Debug, Clone)]
pub struct ReferenceLoader {
    config: ReferenceConfig,
    decoder: Decoder,
    resampler_quality: crate::audio::ResampleQuality,
}

impl ReferenceLoader {
    pub fn new(config: ReferenceConfig) -> Self {
        let decoder = Decoder::new(config.ffmpeg_path.clone());
        Self {
            config,
            decoder,
            resampler_quality: Default::default(),
        }
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Load `path` (any container ffmpeg understands) with its transcript.
    ///
    /// A blank transcript is an [`VoiceCloneError::InvalidInput`] that also
    /// names a missing file. A missing or unreadable file on its own is an
    /// [`VoiceCloneError::Io`] carrying the path.
    pub fn load(&self, path: &Path, transcript: &str) -> Result<ReferenceVoice> {
        if transcript.trim().is_empty() {
            let mut problems = vec!["reference transcript is empty".to_string()];
            if !path.exists() {
                problems.push(format!("reference audio {} does not exist", path.display()));
            }
            return Err(VoiceCloneError::InvalidInput(problems.join("; ")));
        }
        std::fs::metadata(path).map_err(|e| VoiceCloneError::io(path, e))?;

        let decoded = self.decoder.decode(path, self.config.target_sample_rate)?;
        self.normalize(decoded, transcript)
    }

    /// Downmix, resample and validate an in-memory reference.
    pub fn normalize(&self, audio: AudioBuffer, transcript: &str) -> Result<ReferenceVoice> {
        if audio.channels == 0 || !audio.is_frame_aligned() {
            return ReferenceVoice::new(audio, transcript);
        }
        let mono = audio.to_mono();
        let audio = Resampler::new(self.resampler_quality)
            .resample(&mono, self.config.target_sample_rate)?;

        let voice = ReferenceVoice::new(audio, transcript)?;
        let secs = voice.duration();
        if secs > self.config.warn_duration_secs {
            tracing::warn!(
                "Reference audio is {:.1}s; clips longer than {:.0}s slow down every chunk",
                secs,
                self.config.warn_duration_secs
            );
        }
        tracing::info!(
            "Reference voice: {:.2}s @ {} Hz, transcript {} chars",
            secs,
            voice.audio.sample_rate,
            voice.transcript.chars().count()
        );
        Ok(voice)
    }
}

impl Default for ReferenceLoader {
    fn default() -> Self {
        Self::new(ReferenceConfig::default())
    }
}
