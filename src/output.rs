//! Persisting assembled audio under timestamped names.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::audio::AudioBuffer;
use crate::error::{Result, VoiceCloneError};

const FILE_PREFIX: &str = "voiceclone";

/// `voiceclone_<YYYYmmdd>_<HHMMSS>.wav`
pub fn timestamped_name(at: &DateTime<Local>) -> String {
    format!("{FILE_PREFIX}_{}.wav", at.format("%Y%m%d_%H%M%S"))
}

/// Writes 16-bit PCM WAV files.
///
/// [`write`](Self::write) and [`write_at`](Self::write_at) never overwrite an
/// existing file. [`write_to`](Self::write_to) replaces whatever is at its path.
#[derive(Debug, Clone, Default)]
pub struct OutputWriter;

impl OutputWriter {
    pub fn new() -> Self {
        Self
    }

    /// Write into `dir` under a name derived from the current local time.
    pub fn write(&self, audio: &AudioBuffer, dir: &Path) -> Result<PathBuf> {
        self.write_at(audio, dir, &Local::now())
    }

    /// Write into `dir` under a name derived from `at`. When that name is
    /// taken, `_2`, `_3`, ... is appended to the stem.
    pub fn write_at(&self, audio: &AudioBuffer, dir: &Path, at: &DateTime<Local>) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).map_err(|e| VoiceCloneError::io(dir, e))?;

        let base = timestamped_name(at);
        let stem = base.trim_end_matches(".wav");
        let mut path = dir.join(&base);
        let mut n = 2;
        while path.exists() {
            path = dir.join(format!("{stem}_{n}.wav"));
            n += 1;
        }

        self.write_to(audio, &path)?;
        Ok(path)
    }

    /// Write to an explicit path, creating parent directories. An existing
    /// file at `path` is replaced.
    pub fn write_to(&self, audio: &AudioBuffer, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| VoiceCloneError::io(parent, e))?;
        }
        audio.save(path)?;
        tracing::info!(
            "Wrote {} ({:.2}s @ {} Hz, {}ch)",
            path.display(),
            audio.duration(),
            audio.sample_rate,
            audio.channels
        );
        Ok(())
    }
}
