//! Reference-audio resampling using rubato
//!
//! Operates on mono buffers; the reference loader downmixes before calling in.

use rubato::{
    FastFixedIn, PolynomialDegree, Resampler as RubatoResampler, SincFixedIn,
    SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::AudioBuffer;
use crate::error::{Result, VoiceCloneError};

const CHUNK_SIZE: usize = 1024;

/// Resampling quality preset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResampleQuality {
    /// Cubic polynomial interpolation
    Fast,
    #[default]
    Normal,
    /// Longer sinc filters, slower
    High,
}

/// Mono resampler
pub struct Resampler {
    quality: ResampleQuality,
}

impl Resampler {
    pub fn new(quality: ResampleQuality) -> Self {
        Self { quality }
    }

    /// Resample a mono buffer to `target_rate`.
    ///
    /// The result is delay-compensated and trimmed to `len * ratio` samples, so
    /// durations survive the conversion.
    pub fn resample(&self, audio: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
        if audio.channels != 1 {
            return Err(VoiceCloneError::Decode(format!(
                "resampler expects mono input, got {} channels",
                audio.channels
            )));
        }
        if audio.sample_rate == target_rate || audio.is_empty() {
            return Ok(AudioBuffer::new(audio.samples.clone(), target_rate));
        }

        let ratio = target_rate as f64 / audio.sample_rate as f64;
        let expected = (audio.samples.len() as f64 * ratio).round() as usize;

        let samples = if self.quality == ResampleQuality::Fast {
            let mut resampler =
                FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, CHUNK_SIZE, 1)
                    .map_err(|e| VoiceCloneError::Decode(format!("fast resampler: {e}")))?;
            Self::process_chunks(&mut resampler, &audio.samples, expected)?
        } else {
            let high = self.quality == ResampleQuality::High;
            let params = SincInterpolationParameters {
                sinc_len: if high { 256 } else { 128 },
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: if high { 256 } else { 128 },
                window: WindowFunction::BlackmanHarris2,
            };
            let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, CHUNK_SIZE, 1)
                .map_err(|e| VoiceCloneError::Decode(format!("sinc resampler: {e}")))?;
            Self::process_chunks(&mut resampler, &audio.samples, expected)?
        };

        Ok(AudioBuffer::new(samples, target_rate))
    }

    /// Feed fixed-size chunks (zero-padding the tail) until the delayed output
    /// covers `expected` samples.
    fn process_chunks<R: RubatoResampler<f32>>(
        resampler: &mut R,
        samples: &[f32],
        expected: usize,
    ) -> Result<Vec<f32>> {
        let delay = resampler.output_delay();
        let mut output = Vec::with_capacity(expected + delay + CHUNK_SIZE);
        let mut pos = 0;

        while output.len() < expected + delay {
            let mut chunk = vec![0.0f32; CHUNK_SIZE];
            if pos < samples.len() {
                let end = (pos + CHUNK_SIZE).min(samples.len());
                chunk[..end - pos].copy_from_slice(&samples[pos..end]);
            }
            pos += CHUNK_SIZE;

            let waves_in = vec![chunk];
            let result = resampler
                .process(&waves_in, None)
                .map_err(|e| VoiceCloneError::Decode(format!("resampling failed: {e}")))?;
            output.extend_from_slice(&result[0]);
        }

        Ok(output[delay..delay + expected].to_vec())
    }
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new(ResampleQuality::Normal)
    }
}

/// Resample with the default quality
pub fn resample(audio: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
    Resampler::default().resample(audio, target_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn test_no_resample_needed() {
        let audio = AudioBuffer::new(vec![0.0; 1000], 24000);
        let result = resample(&audio, 24000).unwrap();
        assert_eq!(result.sample_rate, 24000);
        assert_eq!(result.len(), audio.len());
    }

    #[test]
    fn test_downsample_keeps_duration() {
        let audio = AudioBuffer::new(vec![0.0; 4800], 48000);
        let result = resample(&audio, 24000).unwrap();
        assert_eq!(result.sample_rate, 24000);
        assert_eq!(result.len(), 2400);
    }

    #[test]
    fn test_upsample_keeps_duration() {
        let audio = AudioBuffer::new(vec![0.0; 16000], 16000);
        let result = resample(&audio, 24000).unwrap();
        assert_eq!(result.len(), 24000);
        assert!((result.duration() - audio.duration()).abs() < 1e-3);
    }

    #[test]
    fn test_fast_and_high_quality() {
        let audio = AudioBuffer::new(vec![0.0; 2048], 48000);
        for quality in [ResampleQuality::Fast, ResampleQuality::High] {
            let result = Resampler::new(quality).resample(&audio, 24000).unwrap();
            assert_eq!(result.sample_rate, 24000);
            assert_eq!(result.len(), 1024);
        }
    }

    #[test]
    fn test_resample_preserves_sine_wave() {
        let freq = 100.0;
        let audio = AudioBuffer::new(
            (0..4800)
                .map(|i| (2.0 * PI * freq * i as f32 / 48000.0).sin())
                .collect(),
            48000,
        );

        let result = resample(&audio, 24000).unwrap();
        let max_val = result
            .samples
            .iter()
            .map(|s| s.abs())
            .fold(0.0f32, f32::max);
        assert!(max_val > 0.5);
    }

    #[test]
    fn test_resample_empty_audio() {
        let audio = AudioBuffer::new(vec![], 24000);
        let result = resample(&audio, 48000).unwrap();
        assert_eq!(result.sample_rate, 48000);
        assert!(result.is_empty());
    }

    #[test]
    fn test_rejects_stereo() {
        let audio = AudioBuffer::with_channels(vec![0.0; 8], 48000, 2);
        assert!(resample(&audio, 24000).is_err());
    }
}
