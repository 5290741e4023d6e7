//! Sampling parameters forwarded to the model for each attempt.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceCloneError};

/// Sampling configuration for one synthesis call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Sampling temperature (1.0 = no change, <1.0 = more focused, >1.0 = more random)
    pub temperature: f64,
    /// Top-k sampling (0 = disabled)
    pub top_k: usize,
    /// Top-p (nucleus) sampling threshold (1.0 = disabled)
    pub top_p: f64,
    /// Repetition penalty (1.0 = no penalty)
    pub repetition_penalty: f64,
    /// Maximum codec frames per call (12.5 frames per second of audio)
    pub max_new_tokens: usize,
    /// Random seed for deterministic generation. `None` = non-deterministic.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            top_k: 50,
            top_p: 0.9,
            repetition_penalty: 1.05,
            max_new_tokens: 2048,
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Parameters for the next retry: temperature scaled by `decay` and
    /// floored at `min_temperature`. A seeded run advances its seed so the
    /// retry does not replay the same token stream.
    pub fn cooled(&self, decay: f64, min_temperature: f64) -> Self {
        Self {
            temperature: (self.temperature * decay).max(min_temperature),
            seed: self.seed.map(|s| s.wrapping_add(1)),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            problems.push(format!("temperature must be > 0 (got {})", self.temperature));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            problems.push(format!("top_p must be in (0, 1] (got {})", self.top_p));
        }
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty > 0.0) {
            problems.push(format!(
                "repetition_penalty must be > 0 (got {})",
                self.repetition_penalty
            ));
        }
        if self.max_new_tokens == 0 {
            problems.push("max_new_tokens must be > 0".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(VoiceCloneError::InvalidInput(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_params_default() {
        let params = SamplingParams::default();
        assert!((params.temperature - 0.9).abs() < 1e-6);
        assert_eq!(params.top_k, 50);
        assert!((params.top_p - 0.9).abs() < 1e-6);
        assert!((params.repetition_penalty - 1.05).abs() < 1e-6);
        assert_eq!(params.max_new_tokens, 2048);
        assert_eq!(params.seed, None);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_cooled_decays_and_floors() {
        let params = SamplingParams {
            temperature: 0.8,
            seed: Some(7),
            ..Default::default()
        };
        let once = params.cooled(0.5, 0.3);
        assert!((once.temperature - 0.4).abs() < 1e-9);
        assert_eq!(once.seed, Some(8));
        assert_eq!(once.top_k, params.top_k);

        let twice = once.cooled(0.5, 0.3);
        assert!((twice.temperature - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_validate_aggregates_problems() {
        let params = SamplingParams {
            temperature: 0.0,
            top_p: 1.5,
            ..Default::default()
        };
        let msg = params.validate().unwrap_err().to_string();
        assert!(msg.contains("temperature"));
        assert!(msg.contains("top_p"));
    }
}
