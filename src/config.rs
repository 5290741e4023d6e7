//! Pipeline configuration and model presets.
//!
//! Every section deserializes with defaults, so a config file only needs the
//! keys it changes:
//!
//! ```json
//! { "segmenter": { "max_chunk_chars": 120 }, "stability": { "max_attempts": 5 } }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::audio::SAMPLE_RATE;
use crate::error::{Result, VoiceCloneError};
use crate::generation::SamplingParams;
use crate::text::SegmenterConfig;

/// Which pretrained checkpoint the worker loads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModelPreset {
    /// 1.7B Base, best cloning quality
    #[default]
    Quality,
    /// 0.6B Base, faster and lighter
    Speed,
    /// 1.7B CustomVoice
    CustomVoice,
    /// Any other HuggingFace model ID or local directory
    Custom(String),
}

impl ModelPreset {
    pub fn model_id(&self) -> &str {
        match self {
            ModelPreset::Quality => "Qwen/Qwen3-TTS-12Hz-1.7B-Base",
            ModelPreset::Speed => "Qwen/Qwen3-TTS-12Hz-0.6B-Base",
            ModelPreset::CustomVoice => "Qwen/Qwen3-TTS-12Hz-1.7B-CustomVoice",
            ModelPreset::Custom(id) => id,
        }
    }
}

impl fmt::Display for ModelPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelPreset::Quality => f.write_str("quality"),
            ModelPreset::Speed => f.write_str("speed"),
            ModelPreset::CustomVoice => f.write_str("custom-voice"),
            ModelPreset::Custom(id) => f.write_str(id),
        }
    }
}

impl FromStr for ModelPreset {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(ModelPreset::from(s.to_string()))
    }
}

impl From<String> for ModelPreset {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "quality" | "1.7b" | "base" => ModelPreset::Quality,
            "speed" | "0.6b" => ModelPreset::Speed,
            "custom-voice" | "customvoice" | "custom_voice" => ModelPreset::CustomVoice,
            _ => ModelPreset::Custom(s.trim().to_string()),
        }
    }
}

impl From<ModelPreset> for String {
    fn from(preset: ModelPreset) -> Self {
        preset.to_string()
    }
}

/// Order in which the stability guard tries its two recovery strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOrder {
    /// Retry with cooler sampling, split only once retries are exhausted
    #[default]
    RetryThenSplit,
    /// Split on the first failure; retry only pieces too small to split
    SplitThenRetry,
}

/// Bounds on the retry / re-segmentation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Attempts per piece, first try included
    pub max_attempts: usize,
    /// Temperature multiplier applied on each retry
    pub temperature_decay: f64,
    pub min_temperature: f64,
    /// Pieces at or below this many chars are never split
    pub min_split_chars: usize,
    /// Maximum number of nested halvings; 0 disables splitting
    pub max_split_depth: usize,
    pub order: RecoveryOrder,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            temperature_decay: 0.75,
            min_temperature: 0.3,
            min_split_chars: 24,
            max_split_depth: 4,
            order: RecoveryOrder::RetryThenSplit,
        }
    }
}

/// What replaces a chunk that failed permanently.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GapPolicy {
    /// Leave it out; neighbours are joined directly
    #[default]
    Skip,
    /// Insert silence of fixed length
    Silence { secs: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    pub gap_policy: GapPolicy,
    /// Silence inserted between adjacent chunks (0.25 is a good value for per-line scripts)
    pub inter_segment_silence_secs: f32,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            gap_policy: GapPolicy::Skip,
            inter_segment_silence_secs: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    /// Rate the reference is normalized to before it reaches the backend
    pub target_sample_rate: u32,
    pub ffmpeg_path: String,
    /// References longer than this are accepted with a warning
    pub warn_duration_secs: f32,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: SAMPLE_RATE,
            ffmpeg_path: "ffmpeg".to_string(),
            warn_duration_secs: 30.0,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub segmenter: SegmenterConfig,
    pub stability: StabilityConfig,
    pub assembly: AssemblyConfig,
    pub sampling: SamplingParams,
    pub reference: ReferenceConfig,
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segmenter: SegmenterConfig::default(),
            stability: StabilityConfig::default(),
            assembly: AssemblyConfig::default(),
            sampling: SamplingParams::default(),
            reference: ReferenceConfig::default(),
            output_dir: PathBuf::from("outputs"),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| VoiceCloneError::io(path, e))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            VoiceCloneError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.segmenter.max_chunk_chars == 0 {
            problems.push("segmenter.max_chunk_chars must be > 0".to_string());
        }
        if self.stability.max_attempts == 0 {
            problems.push("stability.max_attempts must be >= 1".to_string());
        }
        if !(self.stability.temperature_decay > 0.0 && self.stability.temperature_decay <= 1.0) {
            problems.push(format!(
                "stability.temperature_decay must be in (0, 1] (got {})",
                self.stability.temperature_decay
            ));
        }
        if !(self.stability.min_temperature > 0.0) {
            problems.push("stability.min_temperature must be > 0".to_string());
        }
        if let GapPolicy::Silence { secs } = self.assembly.gap_policy {
            if !(secs.is_finite() && secs >= 0.0) {
                problems.push(format!("assembly.gap_policy.secs must be >= 0 (got {secs})"));
            }
        }
        let pad = self.assembly.inter_segment_silence_secs;
        if !(pad.is_finite() && pad >= 0.0) {
            problems.push(format!(
                "assembly.inter_segment_silence_secs must be >= 0 (got {pad})"
            ));
        }
        if self.reference.target_sample_rate == 0 {
            problems.push("reference.target_sample_rate must be > 0".to_string());
        }
        if let Err(e) = self.sampling.validate() {
            problems.push(format!("sampling: {e}"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(VoiceCloneError::Config(problems.join("; ")))
        }
    }
}
