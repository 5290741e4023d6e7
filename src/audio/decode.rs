//! Decoding arbitrary audio containers through an external `ffmpeg` process.
//!
//! WAV files are read directly with hound; anything else (mp3, m4a, mp4, ...)
//! is converted by ffmpeg into a temporary mono WAV first.

use std::path::Path;
use std::process::Command;

use super::{load_wav, AudioBuffer};
use crate::error::{Result, VoiceCloneError};

/// Decoder settings
#[derive(Debug, Clone)]
pub struct Decoder {
    /// ffmpeg executable name or path
    pub ffmpeg_path: String,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl Decoder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Decode `path` into an interleaved buffer.
    ///
    /// `.wav` files go through hound first and only fall back to ffmpeg when
    /// hound rejects the encoding (e.g. ADPCM or 24-bit packed variants).
    /// A file that cannot be read at all is an [`VoiceCloneError::Io`].
    pub fn decode(&self, path: &Path, target_rate: u32) -> Result<AudioBuffer> {
        if is_wav(path) {
            match load_wav(path) {
                Ok(audio) => return Ok(audio),
                Err(VoiceCloneError::Wav {
                    source: hound::Error::IoError(e),
                    ..
                }) => return Err(VoiceCloneError::io(path, e)),
                Err(e) => {
                    tracing::debug!("hound could not read {}: {e}; trying ffmpeg", path.display())
                }
            }
        }
        self.decode_with_ffmpeg(path, target_rate)
    }

    /// Run `ffmpeg -i <path> -vn -ac 1 -ar <rate> -f wav <tmp>` and load the result.
    pub fn decode_with_ffmpeg(&self, path: &Path, target_rate: u32) -> Result<AudioBuffer> {
        let wav_file = tempfile::Builder::new()
            .prefix("voiceclone-ref-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| VoiceCloneError::io(std::env::temp_dir(), e))?;

        tracing::info!(
            "Decoding {} with {} ({} Hz mono)",
            path.display(),
            self.ffmpeg_path,
            target_rate
        );

        let output = Command::new(&self.ffmpeg_path)
            .arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(path)
            .arg("-vn")
            .arg("-ac")
            .arg("1")
            .arg("-ar")
            .arg(target_rate.to_string())
            .arg("-f")
            .arg("wav")
            .arg(wav_file.path())
            .output()
            .map_err(|e| {
                VoiceCloneError::Decode(format!(
                    "failed to run '{}': {e}. Install ffmpeg or convert the reference to WAV",
                    self.ffmpeg_path
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("unknown error");
            return Err(VoiceCloneError::Decode(format!(
                "ffmpeg could not convert {}: {detail}",
                path.display()
            )));
        }

        load_wav(wav_file.path())
    }

    /// True when the ffmpeg binary answers `-version`.
    pub fn is_available(&self) -> bool {
        Command::new(&self.ffmpeg_path)
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav") || e.eq_ignore_ascii_case("wave"))
        .unwrap_or(false)
}
