//! Detection of degenerate model output and bounded per-chunk recovery.
//!
//! A chunk is processed as a worklist of `(piece, depth)` entries, seeded
//! with the whole chunk at depth 0. A piece that keeps failing is retried
//! with cooler sampling and/or halved; halves go to the front of the list so
//! audio stays in text order. Total work per chunk is bounded by
//! `max_attempts * (2^(max_split_depth + 1) - 1)` calls.

use std::collections::VecDeque;
use std::fmt;

use thiserror::Error;

use super::SamplingParams;
use crate::audio::AudioBuffer;
use crate::backend::{BackendError, RawWaveform};
use crate::config::{RecoveryOrder, StabilityConfig};
use crate::text::{split_in_half, Language, TextChunk};

/// One try at synthesizing one piece of a chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisAttempt {
    pub chunk_index: usize,
    /// The piece being attempted: the whole chunk text or a split of it
    pub text: String,
    /// 1-based, per piece
    pub attempt_number: usize,
    pub params: SamplingParams,
    /// Number of halvings that produced this piece
    pub depth: usize,
}

/// Why an attempt's output was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    NonFiniteSample { index: usize },
    NonFiniteLogits,
    EmptyOutput,
    MisalignedChannels,
    Unstable(String),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::NonFiniteSample { index } => write!(f, "non-finite sample at {index}"),
            AttemptFailure::NonFiniteLogits => f.write_str("non-finite logits reported"),
            AttemptFailure::EmptyOutput => f.write_str("empty waveform"),
            AttemptFailure::MisalignedChannels => f.write_str("waveform is not whole frames"),
            AttemptFailure::Unstable(msg) => write!(f, "{msg}"),
        }
    }
}

/// Final state of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Synthesized {
        audio: AudioBuffer,
        attempts: usize,
        splits: usize,
    },
    Failed {
        attempts: usize,
        reason: String,
    },
}

impl ChunkOutcome {
    pub fn attempts(&self) -> usize {
        match self {
            ChunkOutcome::Synthesized { attempts, .. } | ChunkOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ChunkOutcome::Failed { .. })
    }
}

/// Validate a raw waveform.
pub fn check_waveform(raw: RawWaveform) -> Result<AudioBuffer, AttemptFailure> {
    if raw.audio.is_empty() {
        return Err(AttemptFailure::EmptyOutput);
    }
    if raw.diagnostics.non_finite_logits {
        return Err(AttemptFailure::NonFiniteLogits);
    }
    if let Some(index) = raw.audio.first_non_finite() {
        return Err(AttemptFailure::NonFiniteSample { index });
    }
    if !raw.audio.is_frame_aligned() {
        return Err(AttemptFailure::MisalignedChannels);
    }
    Ok(raw.audio)
}

/// Error that ends a chunk's processing and the request with it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuardError {
    /// Non-retryable backend failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Two recovered pieces of one chunk disagree on sample rate or channels
    #[error("chunk {chunk_index}: {detail}")]
    IncompatiblePieces { chunk_index: usize, detail: String },
}

enum PieceResult {
    Done(AudioBuffer),
    Split(String, String),
    GaveUp(String),
}

/// Applies the retry / re-segmentation policy around a model call.
#[derive(Debug, Clone)]
pub struct StabilityGuard {
    config: StabilityConfig,
    base_params: SamplingParams,
    language: Language,
}

impl StabilityGuard {
    pub fn new(config: StabilityConfig, base_params: SamplingParams, language: Language) -> Self {
        Self {
            config,
            base_params,
            language,
        }
    }

    pub fn config(&self) -> &StabilityConfig {
        &self.config
    }

    /// Sampling parameters for the `attempt_number`-th try of a piece.
    pub fn params_for_attempt(&self, attempt_number: usize) -> SamplingParams {
        let mut params = self.base_params.clone();
        for _ in 1..attempt_number {
            params = params.cooled(self.config.temperature_decay, self.config.min_temperature);
        }
        params
    }

    /// Drive one chunk to a final outcome.
    ///
    /// `invoke` performs one model call. `on_failure` observes every rejected
    /// attempt. Numerical instability never escapes. Other backend errors,
    /// and split pieces that cannot be joined, abort the chunk with a
    /// [`GuardError`].
    pub fn run_chunk<F>(
        &self,
        chunk: &TextChunk,
        mut invoke: F,
        on_failure: &mut dyn FnMut(&SynthesisAttempt, &AttemptFailure),
    ) -> Result<ChunkOutcome, GuardError>
    where
        F: FnMut(&SynthesisAttempt) -> Result<RawWaveform, BackendError>,
    {
        let mut work: VecDeque<(String, usize)> = VecDeque::new();
        work.push_back((chunk.text.clone(), 0));

        let mut assembled: Option<AudioBuffer> = None;
        let mut attempts = 0;
        let mut splits = 0;

        while let Some((piece, depth)) = work.pop_front() {
            let result = self.run_piece(
                chunk.index,
                &piece,
                depth,
                &mut attempts,
                &mut invoke,
                on_failure,
            )?;

            match result {
                PieceResult::Done(audio) => match assembled.as_mut() {
                    None => assembled = Some(audio),
                    Some(acc) => {
                        if acc.sample_rate != audio.sample_rate || acc.channels != audio.channels {
                            return Err(GuardError::IncompatiblePieces {
                                chunk_index: chunk.index,
                                detail: format!(
                                    "split piece is {} Hz/{}ch but earlier pieces are {} Hz/{}ch",
                                    audio.sample_rate, audio.channels, acc.sample_rate, acc.channels
                                ),
                            });
                        }
                        acc.samples.extend_from_slice(&audio.samples);
                    }
                },
                PieceResult::Split(left, right) => {
                    splits += 1;
                    tracing::debug!(
                        "Chunk {} split at depth {}: {} + {} chars",
                        chunk.index,
                        depth,
                        left.chars().count(),
                        right.chars().count()
                    );
                    work.push_front((right, depth + 1));
                    work.push_front((left, depth + 1));
                }
                PieceResult::GaveUp(reason) => {
                    tracing::warn!(
                        "Chunk {} failed after {} attempt(s): {}",
                        chunk.index,
                        attempts,
                        reason
                    );
                    return Ok(ChunkOutcome::Failed { attempts, reason });
                }
            }
        }

        match assembled {
            Some(audio) => {
                if attempts > 1 {
                    tracing::info!(
                        "Chunk {} recovered after {} attempt(s), {} split(s)",
                        chunk.index,
                        attempts,
                        splits
                    );
                }
                Ok(ChunkOutcome::Synthesized {
                    audio,
                    attempts,
                    splits,
                })
            }
            None => Ok(ChunkOutcome::Failed {
                attempts,
                reason: "no audio produced".to_string(),
            }),
        }
    }

    fn can_split(&self, piece: &str, depth: usize) -> bool {
        depth < self.config.max_split_depth
            && piece.chars().count() > self.config.min_split_chars
    }

    fn split(&self, piece: &str, depth: usize) -> Option<(String, String)> {
        if !self.can_split(piece, depth) {
            return None;
        }
        split_in_half(piece, self.language)
    }

    fn run_piece<F>(
        &self,
        chunk_index: usize,
        piece: &str,
        depth: usize,
        attempts: &mut usize,
        invoke: &mut F,
        on_failure: &mut dyn FnMut(&SynthesisAttempt, &AttemptFailure),
    ) -> Result<PieceResult, BackendError>
    where
        F: FnMut(&SynthesisAttempt) -> Result<RawWaveform, BackendError>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_failure = String::new();

        for attempt_number in 1..=max_attempts {
            let attempt = SynthesisAttempt {
                chunk_index,
                text: piece.to_string(),
                attempt_number,
                params: self.params_for_attempt(attempt_number),
                depth,
            };
            *attempts += 1;
            tracing::debug!(
                "Chunk {} attempt {} (depth {}, temperature {:.3})",
                chunk_index,
                attempt_number,
                depth,
                attempt.params.temperature
            );

            let failure = match invoke(&attempt) {
                Ok(raw) => match check_waveform(raw) {
                    Ok(audio) => return Ok(PieceResult::Done(audio)),
                    Err(f) => f,
                },
                Err(BackendError::NumericInstability(msg)) => AttemptFailure::Unstable(msg),
                Err(fatal) => return Err(fatal),
            };

            tracing::warn!(
                "Chunk {} attempt {} rejected: {}",
                chunk_index,
                attempt_number,
                failure
            );
            on_failure(&attempt, &failure);
            last_failure = failure.to_string();

            if self.config.order == RecoveryOrder::SplitThenRetry {
                if let Some((left, right)) = self.split(piece, depth) {
                    return Ok(PieceResult::Split(left, right));
                }
            }
        }

        if self.config.order == RecoveryOrder::RetryThenSplit {
            if let Some((left, right)) = self.split(piece, depth) {
                return Ok(PieceResult::Split(left, right));
            }
        }
        Ok(PieceResult::GaveUp(last_failure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GenerationDiagnostics;

    fn chunk(text: &str) -> TextChunk {
        TextChunk {
            index: 0,
            text: text.to_string(),
        }
    }

    fn ok_audio(text: &str) -> Result<RawWaveform, BackendError> {
        Ok(RawWaveform::new(AudioBuffer::new(
            vec![0.1; text.chars().count()],
            24000,
        )))
    }

    fn nan_audio() -> Result<RawWaveform, BackendError> {
        Ok(RawWaveform::new(AudioBuffer::new(vec![0.1, f32::NAN], 24000)))
    }

    fn no_split() -> StabilityConfig {
        StabilityConfig {
            max_split_depth: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_chunk_takes_one_attempt() {
        let guard = StabilityGuard::new(StabilityConfig::default(), SamplingParams::default(), Language::English);
        let outcome = guard
            .run_chunk(&chunk("hello world"), |a| ok_audio(&a.text), &mut |_, _| {})
            .unwrap();
        assert_eq!(outcome.attempts(), 1);
        match outcome {
            ChunkOutcome::Synthesized { audio, splits, .. } => {
                assert_eq!(audio.len(), 11);
                assert_eq!(splits, 0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_always_failing_without_split_uses_exact_budget() {
        for max_attempts in [1, 3, 5] {
            let guard = StabilityGuard::new(
                StabilityConfig {
                    max_attempts,
                    ..no_split()
                },
                SamplingParams::default(),
                Language::English,
            );
            let mut calls = 0;
            let mut observed = 0;
            let outcome = guard
                .run_chunk(
                    &chunk("this chunk always produces nan output"),
                    |_| {
                        calls += 1;
                        nan_audio()
                    },
                    &mut |_, _| observed += 1,
                )
                .unwrap();
            assert!(outcome.is_failed());
            assert_eq!(calls, max_attempts);
            assert_eq!(observed, max_attempts);
            assert_eq!(outcome.attempts(), max_attempts);
        }
    }

    #[test]
    fn test_retry_cools_temperature() {
        let guard = StabilityGuard::new(StabilityConfig::default(), SamplingParams::default(), Language::English);
        let mut temps = Vec::new();
        let outcome = guard
            .run_chunk(
                &chunk("flaky"),
                |a| {
                    temps.push(a.params.temperature);
                    if a.attempt_number < 3 {
                        Err(BackendError::NumericInstability("nan".into()))
                    } else {
                        ok_audio(&a.text)
                    }
                },
                &mut |_, _| {},
            )
            .unwrap();
        assert!(!outcome.is_failed());
        assert_eq!(temps.len(), 3);
        assert!((temps[0] - 0.9).abs() < 1e-9);
        assert!((temps[1] - 0.675).abs() < 1e-9);
        assert!((temps[2] - 0.50625).abs() < 1e-9);
    }

    #[test]
    fn test_split_recovers_long_chunk() {
        let guard = StabilityGuard::new(
            StabilityConfig {
                min_split_chars: 10,
                ..Default::default()
            },
            SamplingParams::default(),
            Language::English,
        );
        let text = "alpha beta gamma delta epsilon zeta eta";
        let outcome = guard
            .run_chunk(
                &chunk(text),
                |a| {
                    if a.text.chars().count() > 25 {
                        nan_audio()
                    } else {
                        ok_audio(&a.text)
                    }
                },
                &mut |_, _| {},
            )
            .unwrap();

        match outcome {
            ChunkOutcome::Synthesized {
                audio,
                attempts,
                splits,
            } => {
                assert_eq!(splits, 1);
                assert_eq!(attempts, 3 + 2);
                let (l, r) = split_in_half(text, Language::English).unwrap();
                assert_eq!(audio.len(), l.chars().count() + r.chars().count());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_split_then_retry_splits_first() {
        let guard = StabilityGuard::new(
            StabilityConfig {
                min_split_chars: 10,
                order: RecoveryOrder::SplitThenRetry,
                ..Default::default()
            },
            SamplingParams::default(),
            Language::English,
        );
        let mut seen = Vec::new();
        let outcome = guard
            .run_chunk(
                &chunk("alpha beta gamma delta epsilon zeta eta"),
                |a| {
                    seen.push(a.text.clone());
                    if a.depth == 0 {
                        nan_audio()
                    } else {
                        ok_audio(&a.text)
                    }
                },
                &mut |_, _| {},
            )
            .unwrap();
        assert!(!outcome.is_failed());
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1], "alpha beta gamma");
    }

    #[test]
    fn test_failed_half_discards_whole_chunk() {
        let guard = StabilityGuard::new(
            StabilityConfig {
                max_attempts: 2,
                min_split_chars: 10,
                max_split_depth: 1,
                ..Default::default()
            },
            SamplingParams::default(),
            Language::English,
        );
        let mut calls = 0;
        let outcome = guard
            .run_chunk(
                &chunk("fine words here and BAD words there"),
                |a| {
                    calls += 1;
                    if a.text.contains("BAD") {
                        nan_audio()
                    } else {
                        ok_audio(&a.text)
                    }
                },
                &mut |_, _| {},
            )
            .unwrap();
        assert!(outcome.is_failed());
        // 2 on the whole chunk, 1 on the clean left half, 2 on the failing right half.
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_fatal_error_propagates() {
        let guard = StabilityGuard::new(StabilityConfig::default(), SamplingParams::default(), Language::English);
        let err = guard
            .run_chunk(
                &chunk("hello"),
                |_| Err(BackendError::Failed("worker died".into())),
                &mut |_, _| {},
            )
            .unwrap_err();
        assert_eq!(err, GuardError::Backend(BackendError::Failed("worker died".into())));
    }

    #[test]
    fn test_mismatched_split_pieces_abort_chunk() {
        let guard = StabilityGuard::new(
            StabilityConfig {
                max_attempts: 1,
                min_split_chars: 10,
                ..Default::default()
            },
            SamplingParams::default(),
            Language::English,
        );
        let err = guard
            .run_chunk(
                &TextChunk {
                    index: 4,
                    text: "steady words on the left and DRIFT words on the right".to_string(),
                },
                |a| {
                    if a.depth == 0 {
                        nan_audio()
                    } else if a.text.contains("DRIFT") {
                        Ok(RawWaveform::new(AudioBuffer::new(vec![0.1; 8], 16000)))
                    } else {
                        ok_audio(&a.text)
                    }
                },
                &mut |_, _| {},
            )
            .unwrap_err();
        match err {
            GuardError::IncompatiblePieces { chunk_index, detail } => {
                assert_eq!(chunk_index, 4);
                assert!(detail.contains("16000 Hz"), "{detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_check_waveform() {
        assert_eq!(
            check_waveform(RawWaveform::new(AudioBuffer::new(vec![], 24000))),
            Err(AttemptFailure::EmptyOutput)
        );
        let flagged = RawWaveform {
            audio: AudioBuffer::new(vec![0.1], 24000),
            diagnostics: GenerationDiagnostics {
                non_finite_logits: true,
                frames: None,
            },
        };
        assert_eq!(check_waveform(flagged), Err(AttemptFailure::NonFiniteLogits));
        assert_eq!(
            check_waveform(RawWaveform::new(AudioBuffer::new(vec![0.0, f32::INFINITY], 24000))),
            Err(AttemptFailure::NonFiniteSample { index: 1 })
        );
    }
}
