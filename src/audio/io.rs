//! WAV I/O and the interleaved sample buffer shared by every pipeline stage.

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

use crate::error::{Result, VoiceCloneError};

/// Interleaved audio samples with their format.
///
/// Samples are 32-bit floats nominally in \[-1.0, 1.0\]. With `channels > 1`
/// the layout is frame-interleaved (`L R L R ...`).
///
/// # Example
///
/// ```rust,ignore
/// let audio = AudioBuffer::load("reference.wav")?;
/// println!("{:.2}s at {} Hz", audio.duration(), audio.sample_rate);
/// audio.save("copy.wav")?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    /// Create a mono buffer
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::with_channels(samples, sample_rate, 1)
    }

    /// Create a buffer of interleaved samples
    pub fn with_channels(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Digital silence of the given length.
    pub fn silence(secs: f32, sample_rate: u32, channels: u16) -> Self {
        let frames = (secs.max(0.0) * sample_rate as f32).round() as usize;
        Self::with_channels(
            vec![0.0; frames * channels.max(1) as usize],
            sample_rate,
            channels,
        )
    }

    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f32 / self.sample_rate as f32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Index of the first NaN or infinite sample, if any.
    pub fn first_non_finite(&self) -> Option<usize> {
        self.samples.iter().position(|s| !s.is_finite())
    }

    /// True when the interleaved layout is whole frames.
    pub fn is_frame_aligned(&self) -> bool {
        self.samples.len() % self.channels as usize == 0
    }

    /// Average interleaved channels down to mono.
    pub fn to_mono(&self) -> AudioBuffer {
        if self.channels == 1 {
            return self.clone();
        }
        let channels = self.channels as usize;
        let samples = self
            .samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        AudioBuffer::new(samples, self.sample_rate)
    }

    /// Append another buffer with the same format.
    pub fn extend_from(&mut self, other: &AudioBuffer) -> Result<()> {
        if other.sample_rate != self.sample_rate || other.channels != self.channels {
            return Err(VoiceCloneError::IncompatibleSegments(format!(
                "cannot append {} Hz/{}ch audio to {} Hz/{}ch audio",
                other.sample_rate, other.channels, self.sample_rate, self.channels
            )));
        }
        self.samples.extend_from_slice(&other.samples);
        Ok(())
    }

    /// Save as 16-bit PCM WAV
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_wav(path, &self.samples, self.sample_rate, self.channels)
    }

    /// Load from WAV file, keeping the channel layout
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_wav(path)
    }
}

/// Load a WAV file into an interleaved [`AudioBuffer`].
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path).map_err(|e| VoiceCloneError::wav(path, e))?;

    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| VoiceCloneError::wav(path, e))?,
        SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| VoiceCloneError::wav(path, e))?
        }
    };

    Ok(AudioBuffer::with_channels(
        samples,
        spec.sample_rate,
        spec.channels,
    ))
}

/// Write interleaved samples as a 16-bit PCM WAV file.
pub fn save_wav<P: AsRef<Path>>(
    path: P,
    samples: &[f32],
    sample_rate: u32,
    channels: u16,
) -> Result<()> {
    let path = path.as_ref();
    let spec = WavSpec {
        channels: channels.max(1),
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec).map_err(|e| VoiceCloneError::wav(path, e))?;
    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        writer
            .write_sample(scaled)
            .map_err(|e| VoiceCloneError::wav(path, e))?;
    }
    writer.finalize().map_err(|e| VoiceCloneError::wav(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_audio_buffer_duration() {
        let buffer = AudioBuffer::new(vec![0.0; 24000], 24000);
        assert!((buffer.duration() - 1.0).abs() < 1e-6);

        let stereo = AudioBuffer::with_channels(vec![0.0; 48000], 24000, 2);
        assert_eq!(stereo.frames(), 24000);
        assert!((stereo.duration() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_silence_length() {
        let silence = AudioBuffer::silence(0.25, 24000, 1);
        assert_eq!(silence.len(), 6000);
        assert!(silence.samples.iter().all(|s| *s == 0.0));

        let stereo = AudioBuffer::silence(0.5, 16000, 2);
        assert_eq!(stereo.frames(), 8000);
        assert_eq!(stereo.len(), 16000);
    }

    #[test]
    fn test_first_non_finite() {
        let clean = AudioBuffer::new(vec![0.1, -0.2, 0.3], 24000);
        assert_eq!(clean.first_non_finite(), None);

        let nan = AudioBuffer::new(vec![0.1, f32::NAN, 0.3], 24000);
        assert_eq!(nan.first_non_finite(), Some(1));

        let inf = AudioBuffer::new(vec![f32::NEG_INFINITY], 24000);
        assert_eq!(inf.first_non_finite(), Some(0));
    }

    #[test]
    fn test_to_mono_averages_frames() {
        let stereo = AudioBuffer::with_channels(vec![1.0, 0.0, 0.5, 0.5], 24000, 2);
        let mono = stereo.to_mono();
        assert_eq!(mono.channels, 1);
        assert_eq!(mono.samples, vec![0.5, 0.5]);
    }

    #[test]
    fn test_extend_from_rejects_mismatch() {
        let mut a = AudioBuffer::new(vec![0.0; 10], 24000);
        let b = AudioBuffer::new(vec![0.0; 10], 16000);
        assert!(matches!(
            a.extend_from(&b),
            Err(VoiceCloneError::IncompatibleSegments(_))
        ));

        let c = AudioBuffer::new(vec![0.5; 5], 24000);
        a.extend_from(&c).unwrap();
        assert_eq!(a.len(), 15);
    }

    #[test]
    fn test_save_and_load_wav() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wav");

        let original = AudioBuffer::new(vec![0.1, 0.2, -0.3, 0.4, -0.5], 24000);
        original.save(&path).unwrap();

        let loaded = AudioBuffer::load(&path).unwrap();
        assert_eq!(loaded.sample_rate, 24000);
        assert_eq!(loaded.channels, 1);
        for (a, b) in original.samples.iter().zip(loaded.samples.iter()) {
            assert!((a - b).abs() < 1e-4, "sample mismatch: {a} vs {b}");
        }
    }

    #[test]
    fn test_save_and_load_stereo() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stereo.wav");

        let original = AudioBuffer::with_channels(vec![0.1, -0.1, 0.2, -0.2], 22050, 2);
        original.save(&path).unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.channels, 2);
        assert_eq!(loaded.frames(), 2);
        assert_eq!(loaded.sample_rate, 22050);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let err = load_wav("/nonexistent/path/to/file.wav").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/path/to/file.wav"));
    }
}
